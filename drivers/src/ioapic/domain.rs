//! Collaborators outside the router: the parent vector domain, the legacy
//! 8259 cascade, the local APIC, and the CMOS RTC.

use super::channel::ChannelId;
use super::entry::{DeliveryMode, DestMode, RouteEntry};
use super::error::IoapicResult;

pub const APIC_LVT_MASKED: u32 = 1 << 16;
pub const APIC_DM_FIXED: u32 = 0x000;
pub const APIC_DM_EXTINT: u32 = 0x700;

/// Where and how the parent domain wants a channel delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryMessage {
    pub vector: u8,
    pub delivery_mode: DeliveryMode,
    pub dest_mode: DestMode,
    pub destination: u16,
}

impl DeliveryMessage {
    pub const fn fixed(vector: u8, destination: u16) -> Self {
        Self {
            vector,
            delivery_mode: DeliveryMode::Fixed,
            dest_mode: DestMode::Physical,
            destination,
        }
    }

    /// `entry` retargeted to this message; attributes and mask untouched.
    pub fn apply(&self, entry: RouteEntry) -> RouteEntry {
        RouteEntry {
            vector: self.vector,
            delivery_mode: self.delivery_mode,
            dest_mode: self.dest_mode,
            destination: self.destination,
            ..entry
        }
    }
}

/// Vector allocation and message composition.
pub trait ParentDomain: Send + Sync {
    fn compose_delivery_message(&self, channel: ChannelId) -> IoapicResult<DeliveryMessage>;

    fn retarget(&self, channel: ChannelId, destination: u16) -> IoapicResult<DeliveryMessage>;

    /// The channel was torn down; its vector may be reused.
    fn release(&self, _channel: ChannelId) {}
}

/// The 8259 pair the IO-APIC cascades from.
pub trait CascadeController: Send {
    /// Reinitialize; `auto_eoi` selects automatic end-of-interrupt mode.
    fn init(&mut self, auto_eoi: bool);
    fn mask(&mut self, irq: u8);
    fn unmask(&mut self, irq: u8);
    fn is_pending(&mut self, irq: u8) -> bool;
}

pub trait LocalApic {
    fn write_lvt0(&mut self, value: u32);
    fn apic_id(&self) -> u32;
}

pub trait RtcPeriodic {
    fn read(&mut self, reg: u8) -> u8;
    fn write(&mut self, reg: u8, value: u8);
}
