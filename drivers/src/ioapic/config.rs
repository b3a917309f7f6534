//! Routing options from the kernel command line.
//!
//! Recognized tokens:
//!
//! | token                           | effect                                     |
//! |---------------------------------|--------------------------------------------|
//! | `noapic`                        | refuse controller registration             |
//! | `no_timer_check`                | timer probe always reports success         |
//! | `disable_timer_pin_1`           | clear the direct timer pin after stage 1   |
//! | `ioapic.strict=<bool>`          | allocations require a firmware source      |
//! | `ioapic.mask_sync=<bool>`       | flush mask writes with a dummy read        |
//! | `ioapic.reinit_limit=<n>`       | resume re-restore attempts before failing  |
//! | `ioapic.timer_probe_ticks=<n>`  | ticks a working timer must produce         |
//! | `ioapic.hz=<n>`                 | expected timer frequency                   |

use pinroute_lib::cmdline::{parse_bool, parse_u32, tokens};
use pinroute_lib::klog_warn;

const DEFAULT_REINIT_LIMIT: u32 = 3;
const DEFAULT_TIMER_PROBE_TICKS: u64 = 4;
const DEFAULT_HZ: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoutingConfig {
    pub noapic: bool,
    pub no_timer_check: bool,
    pub disable_timer_pin_1: bool,
    pub strict: bool,
    pub mask_sync: bool,
    pub reinit_limit: u32,
    pub timer_probe_ticks: u64,
    pub hz: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            noapic: false,
            no_timer_check: false,
            disable_timer_pin_1: false,
            strict: false,
            mask_sync: true,
            reinit_limit: DEFAULT_REINIT_LIMIT,
            timer_probe_ticks: DEFAULT_TIMER_PROBE_TICKS,
            hz: DEFAULT_HZ,
        }
    }
}

impl RoutingConfig {
    pub fn from_cmdline(cmdline: Option<&str>) -> Self {
        let mut cfg = Self::default();
        let Some(cmdline) = cmdline else {
            return cfg;
        };
        for (key, value) in tokens(cmdline) {
            match (key, value) {
                ("noapic", None) => cfg.noapic = true,
                ("no_timer_check", None) => cfg.no_timer_check = true,
                ("disable_timer_pin_1", None) => cfg.disable_timer_pin_1 = true,
                ("ioapic.strict", Some(v)) => set_bool(&mut cfg.strict, key, v),
                ("ioapic.mask_sync", Some(v)) => set_bool(&mut cfg.mask_sync, key, v),
                ("ioapic.reinit_limit", Some(v)) => match parse_u32(v) {
                    Some(n) => cfg.reinit_limit = n,
                    None => warn_bad(key, v),
                },
                ("ioapic.timer_probe_ticks", Some(v)) => match parse_u32(v) {
                    Some(n) => cfg.timer_probe_ticks = n as u64,
                    None => warn_bad(key, v),
                },
                ("ioapic.hz", Some(v)) => match parse_u32(v) {
                    Some(n) if n > 0 => cfg.hz = n,
                    _ => warn_bad(key, v),
                },
                _ => {}
            }
        }
        cfg
    }

    /// TSC budget for one timer probe: 40e9 / HZ cycles.
    pub fn probe_cycle_budget(&self) -> u64 {
        40_000_000_000 / self.hz as u64
    }
}

fn set_bool(slot: &mut bool, key: &str, value: &str) {
    match parse_bool(value) {
        Some(b) => *slot = b,
        None => warn_bad(key, value),
    }
}

fn warn_bad(key: &str, value: &str) {
    klog_warn!("IOAPIC: ignoring {}={} (bad value)", key, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_cmdline() {
        assert_eq!(RoutingConfig::from_cmdline(None), RoutingConfig::default());
    }

    #[test]
    fn test_tokens_parsed() {
        let cfg = RoutingConfig::from_cmdline(Some(
            "root=/dev/sda no_timer_check ioapic.strict=on ioapic.reinit_limit=5 ioapic.hz=250",
        ));
        assert!(cfg.no_timer_check);
        assert!(cfg.strict);
        assert!(!cfg.noapic);
        assert_eq!(cfg.reinit_limit, 5);
        assert_eq!(cfg.hz, 250);
        assert_eq!(cfg.probe_cycle_budget(), 160_000_000);
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let cfg = RoutingConfig::from_cmdline(Some("ioapic.hz=0 ioapic.mask_sync=perhaps"));
        assert_eq!(cfg.hz, DEFAULT_HZ);
        assert!(cfg.mask_sync);
    }
}
