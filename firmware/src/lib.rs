//! Firmware interrupt-source facts consumed by the interrupt router.
//!
//! Table parsing (MADT, MP tables) happens elsewhere; this crate holds the
//! already-decoded source entries and the per-bus attribute defaults, and
//! answers the questions the router asks of them.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod bus;
pub mod source;
pub mod table;

pub use bus::{BusDefault, BusDefaults, DefaultTrigger, ElcrLookup};
pub use source::{
    BusKind, FlagPolarity, FlagTrigger, IrqAttrs, Polarity, SourceError, SourceKind, SourceRoute,
    Trigger,
};
pub use table::{SourceRouting, SourceTable};
