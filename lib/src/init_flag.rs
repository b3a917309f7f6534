use core::sync::atomic::{AtomicBool, Ordering};

/// One-shot flag: the first `init_once` wins, later callers see `false`.
pub struct InitFlag(AtomicBool);

impl InitFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    #[inline]
    pub fn init_once(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for InitFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-entrancy guard for multi-step sequences.
pub struct StateFlag(AtomicBool);

impl StateFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns `false` if the sequence is already running.
    #[inline]
    pub fn enter(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn leave(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for StateFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_once_only_first() {
        let flag = InitFlag::new();
        assert!(flag.init_once());
        assert!(!flag.init_once());
        flag.reset();
        assert!(flag.init_once());
    }

    #[test]
    fn test_state_flag_reentry() {
        let flag = StateFlag::new();
        assert!(flag.enter());
        assert!(!flag.enter());
        flag.leave();
        assert!(!flag.is_active());
    }
}
