//! Error type for the interrupt router.
//!
//! Variants fall into four classes: configuration mistakes by the caller or
//! firmware, resource exhaustion, hardware that did not behave as
//! programmed, and boot failures the kernel cannot continue past. Only the
//! last class is fatal; see [`IoapicError::is_fatal`].

use core::fmt;

use pinroute_firmware::SourceError;

use super::channel::ChannelId;
use super::pins::PinBinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoapicError {
    // -- configuration --
    /// Routing disabled on the command line.
    Disabled,
    InvalidAddress,
    AlreadyRegistered { address: u64 },
    NotRegistered { gsi_base: u32 },
    GsiOverlap { gsi_base: u32, gsi_end: u32, other: usize },
    GsiOutOfRange { gsi_base: u32, pins: u32 },
    NoController { gsi: u32 },
    NoSourceEntry { gsi: u32 },
    /// The legacy cascade line (ISA IRQ 2) cannot be routed.
    Reserved { isa_irq: u8 },
    /// Channel exists with different trigger/polarity.
    Busy { channel: ChannelId },
    AlreadyBound { binding: PinBinding, owner: ChannelId },
    NotMapped { gsi: u32 },
    UnknownChannel(ChannelId),
    NoSuchController { index: usize },
    /// Controller still has pins in use.
    InUse { controller: usize },
    Firmware(SourceError),

    // -- resources --
    NoSpace,
    NoMemory,
    VectorUnavailable { channel: ChannelId },

    // -- hardware --
    ControllerAbsent { address: u64 },
    /// More pins than the register window can address.
    TooManyPins { address: u64, pins: u32 },
    RemotePendingStuck { controller: usize, pin: u32 },
    ReadbackMismatch { controller: usize, pin: u32 },

    // -- fatal --
    TimerUnroutable,
    ReinitLimit { attempts: u32 },
}

impl IoapicError {
    /// Hardware state may settle; the operation can be tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RemotePendingStuck { .. } | Self::ReadbackMismatch { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TimerUnroutable | Self::ReinitLimit { .. })
    }
}

impl From<SourceError> for IoapicError {
    fn from(err: SourceError) -> Self {
        Self::Firmware(err)
    }
}

impl fmt::Display for IoapicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "IO-APIC routing disabled"),
            Self::InvalidAddress => write!(f, "controller address is zero"),
            Self::AlreadyRegistered { address } => {
                write!(f, "controller at {:#x} already registered", address)
            }
            Self::NotRegistered { gsi_base } => {
                write!(f, "no controller registered at GSI base {}", gsi_base)
            }
            Self::GsiOverlap {
                gsi_base,
                gsi_end,
                other,
            } => write!(
                f,
                "GSI range {}-{} overlaps controller {}",
                gsi_base, gsi_end, other
            ),
            Self::GsiOutOfRange { gsi_base, pins } => {
                write!(f, "GSI base {} with {} pins is out of range", gsi_base, pins)
            }
            Self::NoController { gsi } => write!(f, "no controller serves GSI {}", gsi),
            Self::NoSourceEntry { gsi } => write!(f, "firmware has no source for GSI {}", gsi),
            Self::Reserved { isa_irq } => write!(f, "ISA IRQ {} is reserved", isa_irq),
            Self::Busy { channel } => {
                write!(f, "channel {} in use with different attributes", channel)
            }
            Self::AlreadyBound { binding, owner } => {
                write!(f, "{} already bound to channel {}", binding, owner)
            }
            Self::NotMapped { gsi } => write!(f, "GSI {} has no channel", gsi),
            Self::UnknownChannel(channel) => write!(f, "unknown channel {}", channel),
            Self::NoSuchController { index } => write!(f, "no controller in slot {}", index),
            Self::InUse { controller } => write!(f, "controller {} has pins in use", controller),
            Self::Firmware(err) => write!(f, "firmware: {}", err),
            Self::NoSpace => write!(f, "controller table full"),
            Self::NoMemory => write!(f, "out of memory"),
            Self::VectorUnavailable { channel } => {
                write!(f, "parent domain has no vector for channel {}", channel)
            }
            Self::ControllerAbsent { address } => {
                write!(f, "no controller responds at {:#x}", address)
            }
            Self::TooManyPins { address, pins } => {
                write!(f, "controller at {:#x} reports {} pins", address, pins)
            }
            Self::RemotePendingStuck { controller, pin } => {
                write!(f, "remote IRR stuck on controller {} pin {}", controller, pin)
            }
            Self::ReadbackMismatch { controller, pin } => write!(
                f,
                "entry readback mismatch on controller {} pin {}",
                controller, pin
            ),
            Self::TimerUnroutable => write!(f, "timer interrupt not routable"),
            Self::ReinitLimit { attempts } => {
                write!(f, "controller reinitialized {} times without settling", attempts)
            }
        }
    }
}

pub type IoapicResult<T = ()> = Result<T, IoapicError>;
