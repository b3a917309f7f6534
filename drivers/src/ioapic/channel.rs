//! Logical interrupt channels.
//!
//! Bookkeeping (`ChannelMeta`) lives under the allocation lock; the state the
//! interrupt paths need (`Line`) lives under the hardware lock.

use core::fmt;

use pinroute_firmware::IrqAttrs;
use smallvec::SmallVec;

use super::domain::DeliveryMessage;
use super::entry::RouteEntry;
use super::pins::{PinBinding, PinList};

/// Channels below this number are the ISA IRQs.
pub const NR_LEGACY_CHANNELS: u32 = 16;
/// ISA IRQ wired to the slave 8259; never routable.
pub const CASCADE_ISA_IRQ: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u32);

impl ChannelId {
    pub fn legacy_irq(&self) -> Option<u8> {
        if self.0 < NR_LEGACY_CHANNELS {
            Some(self.0 as u8)
        } else {
            None
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returned by `allocate`; names the pin this user claimed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelHandle {
    pub channel: ChannelId,
    pub binding: PinBinding,
}

#[derive(Clone, Debug)]
pub struct ChannelMeta {
    pub attrs: IrqAttrs,
    /// GSI of the first pin bound.
    pub gsi: u32,
    /// ISA channels are never torn down.
    pub isa: bool,
    /// Set up at boot with guessed attributes; the first real claimant may
    /// correct them once.
    pub preprovisioned: bool,
    /// Claims per pin; the reference count is their sum.
    pub users: SmallVec<[(PinBinding, u32); 2]>,
    pub releasing: bool,
}

impl ChannelMeta {
    pub fn new(attrs: IrqAttrs, gsi: u32, isa: bool) -> Self {
        Self {
            attrs,
            gsi,
            isa,
            preprovisioned: false,
            users: SmallVec::new(),
            releasing: false,
        }
    }

    pub fn count(&self) -> u32 {
        self.users.iter().map(|(_, n)| n).sum()
    }

    pub fn add_user(&mut self, binding: PinBinding) {
        match self.users.iter_mut().find(|(b, _)| *b == binding) {
            Some((_, n)) => *n += 1,
            None => self.users.push((binding, 1)),
        }
    }

    /// Drop one claim on `binding`. Returns `Some(true)` when that was the
    /// pin's last user, `None` if the pin had no claims.
    pub fn drop_user(&mut self, binding: PinBinding) -> Option<bool> {
        let idx = self.users.iter().position(|(b, _)| *b == binding)?;
        self.users[idx].1 -= 1;
        if self.users[idx].1 == 0 {
            self.users.remove(idx);
            Some(true)
        } else {
            Some(false)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineState {
    Active,
    /// Released while remote IRR was set; waiting for the EOI.
    TeardownPending,
    /// EOI seen after release; safe to tear down.
    Quiesced,
}

#[derive(Clone, Debug)]
pub struct Line {
    pub pins: PinList,
    /// Last entry written to every pin.
    pub entry: RouteEntry,
    pub state: LineState,
    pub pending_move: Option<DeliveryMessage>,
    /// The line was masked by a deferred move, not by a caller.
    pub masked_for_move: bool,
}

impl Line {
    pub fn new(entry: RouteEntry) -> Self {
        Self {
            pins: PinList::new(),
            entry,
            state: LineState::Active,
            pending_move: None,
            masked_for_move: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// ISA channel, or other users remain on this pin.
    Retained,
    /// The pin was unbound; other pins keep the channel alive.
    Unbound,
    Released,
    /// Remote IRR was set; teardown completes after the EOI.
    Deferred,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveOutcome {
    Applied,
    /// Retried on the next acknowledgment.
    Deferred,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_counts() {
        let a = PinBinding::new(0, 9);
        let b = PinBinding::new(0, 20);
        let mut meta = ChannelMeta::new(IrqAttrs::LEVEL_LOW, 9, false);
        meta.add_user(a);
        meta.add_user(a);
        meta.add_user(b);
        assert_eq!(meta.count(), 3);
        assert_eq!(meta.drop_user(a), Some(false));
        assert_eq!(meta.drop_user(a), Some(true));
        assert_eq!(meta.drop_user(a), None);
        assert_eq!(meta.count(), 1);
    }

    #[test]
    fn test_legacy_irq_range() {
        assert_eq!(ChannelId(15).legacy_irq(), Some(15));
        assert_eq!(ChannelId(16).legacy_irq(), None);
    }
}
