//! Pin ↔ channel bindings.
//!
//! Each channel keeps a short ordered list of the pins that feed it; the
//! reverse index answers "who owns this pin" and enforces that a pin feeds
//! at most one channel.

use alloc::collections::BTreeMap;
use core::fmt;

use smallvec::SmallVec;

use super::channel::ChannelId;
use super::error::{IoapicError, IoapicResult};

/// A pin of a registered controller (`controller` is the registry slot).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PinBinding {
    pub controller: usize,
    pub pin: u32,
}

impl PinBinding {
    pub const fn new(controller: usize, pin: u32) -> Self {
        Self { controller, pin }
    }
}

impl fmt::Display for PinBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.controller, self.pin)
    }
}

/// Pins of one channel, in binding order. Almost always one or two.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PinList(SmallVec<[PinBinding; 2]>);

impl PinList {
    pub const fn new() -> Self {
        Self(SmallVec::new_const())
    }

    pub fn contains(&self, binding: PinBinding) -> bool {
        self.0.contains(&binding)
    }

    /// Append unless already present. Returns whether it was added.
    pub fn push(&mut self, binding: PinBinding) -> IoapicResult<bool> {
        if self.contains(binding) {
            return Ok(false);
        }
        self.0.try_reserve(1).map_err(|_| IoapicError::NoMemory)?;
        self.0.push(binding);
        Ok(true)
    }

    pub fn remove(&mut self, binding: PinBinding) -> bool {
        match self.0.iter().position(|b| *b == binding) {
            Some(idx) => {
                self.0.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Swap `old` for `new` in place, keeping the list order.
    pub fn replace(&mut self, old: PinBinding, new: PinBinding) -> bool {
        if self.contains(new) {
            return self.remove(old);
        }
        match self.0.iter_mut().find(|b| **b == old) {
            Some(slot) => {
                *slot = new;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = PinBinding> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Reverse index: which channel a pin feeds.
#[derive(Default)]
pub struct PinOwners(BTreeMap<PinBinding, ChannelId>);

impl PinOwners {
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn owner(&self, binding: PinBinding) -> Option<ChannelId> {
        self.0.get(&binding).copied()
    }

    /// Record `binding` as feeding `channel`. Returns `false` if it already
    /// did.
    pub fn bind(&mut self, channel: ChannelId, binding: PinBinding) -> IoapicResult<bool> {
        match self.owner(binding) {
            Some(owner) if owner == channel => Ok(false),
            Some(owner) => Err(IoapicError::AlreadyBound { binding, owner }),
            None => {
                self.0.insert(binding, channel);
                Ok(true)
            }
        }
    }

    pub fn unbind(&mut self, channel: ChannelId, binding: PinBinding) -> bool {
        if self.owner(binding) == Some(channel) {
            self.0.remove(&binding);
            true
        } else {
            false
        }
    }

    pub fn reassign(
        &mut self,
        channel: ChannelId,
        old: PinBinding,
        new: PinBinding,
    ) -> IoapicResult<()> {
        if let Some(owner) = self.owner(new) {
            if owner != channel {
                return Err(IoapicError::AlreadyBound {
                    binding: new,
                    owner,
                });
            }
        }
        self.unbind(channel, old);
        self.0.insert(new, channel);
        Ok(())
    }

    pub fn in_use_on(&self, controller: usize) -> bool {
        self.0.keys().any(|b| b.controller == controller)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PinBinding, ChannelId)> + '_ {
        self.0.iter().map(|(b, c)| (*b, *c))
    }
}
