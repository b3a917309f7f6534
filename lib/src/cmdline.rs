//! Kernel command-line token helpers.

pub fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value == "1"
    {
        Some(true)
    } else if value.eq_ignore_ascii_case("off")
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
        || value == "0"
    {
        Some(false)
    } else {
        None
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_u32(value: &str) -> Option<u32> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse::<u32>().ok(),
    }
}

/// Whitespace tokens, each split into `(key, Option<value>)` at the first `=`.
pub fn tokens(cmdline: &str) -> impl Iterator<Item = (&str, Option<&str>)> {
    cmdline.split_whitespace().map(|token| match token.split_once('=') {
        Some((key, value)) => (key, Some(value)),
        None => (token, None),
    })
}
