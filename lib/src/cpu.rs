//! Interrupt flag management: sti, cli, irqsave/irqrestore.
//!
//! Only a freestanding x86_64 build touches RFLAGS. Hosted builds (unit
//! tests) keep the same API with a software flag so lock guards still
//! balance.

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
use core::sync::atomic::{AtomicBool, Ordering};

const RFLAGS_IF: u64 = 1 << 9;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
static HOSTED_IF: AtomicBool = AtomicBool::new(true);

/// Enable interrupts (STI).
#[inline(always)]
pub fn enable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::interrupts::enable();
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    HOSTED_IF.store(true, Ordering::Relaxed);
}

/// Disable interrupts (CLI).
#[inline(always)]
pub fn disable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::interrupts::disable();
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    HOSTED_IF.store(false, Ordering::Relaxed);
}

/// Returns true if interrupts are currently enabled (IF bit set).
#[inline(always)]
pub fn are_interrupts_enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::instructions::interrupts::are_enabled()
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        HOSTED_IF.load(Ordering::Relaxed)
    }
}

/// Save the interrupt flag and disable interrupts (irqsave pattern).
/// Returns an RFLAGS-shaped value; only the IF bit is meaningful.
#[inline(always)]
pub fn save_flags_cli() -> u64 {
    let flags = if are_interrupts_enabled() { RFLAGS_IF } else { 0 };
    disable_interrupts();
    flags
}

/// Restore interrupt flag from saved flags (irqrestore pattern).
/// Only re-enables interrupts if they were enabled in the saved flags.
#[inline(always)]
pub fn restore_flags(flags: u64) {
    if flags & RFLAGS_IF != 0 {
        enable_interrupts();
    }
}

/// Halt the CPU forever with interrupts off.
pub fn halt_loop() -> ! {
    disable_interrupts();
    loop {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        x86_64::instructions::hlt();
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_flags_only_carry_if() {
        let flags = save_flags_cli();
        assert_eq!(flags & !RFLAGS_IF, 0);
        restore_flags(flags);
    }
}
