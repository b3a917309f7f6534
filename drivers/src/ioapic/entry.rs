//! Redirection table entry codec.
//!
//! [`RouteEntry`] is the structured form; [`RawEntry`] is the two 32-bit
//! words the hardware holds. Conversion is pure and driven by an
//! [`RteLayout`] table.

use core::fmt;

use pinroute_firmware::{IrqAttrs, Polarity, Trigger};

use super::regs::{RteField, RteLayout};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawEntry {
    pub low: u32,
    pub high: u32,
}

impl RawEntry {
    pub const fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }

    pub fn is_masked(&self, layout: &RteLayout) -> bool {
        layout.mask.get(self.low, self.high) != 0
    }

    pub fn remote_irr(&self, layout: &RteLayout) -> bool {
        layout.remote_irr.get(self.low, self.high) != 0
    }

    /// The entry with read-only and reserved bits cleared, for comparing
    /// what was programmed against what reads back.
    pub fn writable_bits(&self, layout: &RteLayout) -> Self {
        Self {
            low: self.low & layout.writable_low(),
            high: self.high & layout.writable_high(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    Fixed,
    LowestPriority,
    Smi,
    Nmi,
    Init,
    ExtInt,
    /// Encodings 3 and 6.
    Reserved(u8),
}

impl DeliveryMode {
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x7 {
            0 => Self::Fixed,
            1 => Self::LowestPriority,
            2 => Self::Smi,
            4 => Self::Nmi,
            5 => Self::Init,
            7 => Self::ExtInt,
            other => Self::Reserved(other),
        }
    }

    pub const fn bits(self) -> u8 {
        match self {
            Self::Fixed => 0,
            Self::LowestPriority => 1,
            Self::Smi => 2,
            Self::Nmi => 4,
            Self::Init => 5,
            Self::ExtInt => 7,
            Self::Reserved(bits) => bits & 0x7,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestMode {
    Physical,
    Logical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteEntry {
    pub vector: u8,
    pub delivery_mode: DeliveryMode,
    pub dest_mode: DestMode,
    pub polarity: Polarity,
    pub trigger: Trigger,
    pub masked: bool,
    pub destination: u16,
    /// Read-only; ignored by `encode`.
    pub delivery_pending: bool,
    /// Read-only; ignored by `encode`.
    pub remote_irr: bool,
}

impl RouteEntry {
    /// All fields zero except the mask bit: what a cleared pin holds.
    pub const MASKED: Self = Self {
        vector: 0,
        delivery_mode: DeliveryMode::Fixed,
        dest_mode: DestMode::Physical,
        polarity: Polarity::ActiveHigh,
        trigger: Trigger::Edge,
        masked: true,
        destination: 0,
        delivery_pending: false,
        remote_irr: false,
    };

    pub fn attrs(&self) -> IrqAttrs {
        IrqAttrs::new(self.trigger, self.polarity)
    }

    pub fn with_attrs(mut self, attrs: IrqAttrs) -> Self {
        self.trigger = attrs.trigger;
        self.polarity = attrs.polarity;
        self
    }

    pub fn is_level(&self) -> bool {
        self.trigger == Trigger::Level
    }

    pub fn encode(&self, layout: &RteLayout) -> RawEntry {
        let (mut low, mut high) = (0u32, 0u32);
        layout.vector.set(&mut low, &mut high, self.vector as u32);
        layout
            .delivery_mode
            .set(&mut low, &mut high, self.delivery_mode.bits() as u32);
        layout.dest_mode.set(
            &mut low,
            &mut high,
            (self.dest_mode == DestMode::Logical) as u32,
        );
        layout.polarity.set(
            &mut low,
            &mut high,
            (self.polarity == Polarity::ActiveLow) as u32,
        );
        layout
            .trigger
            .set(&mut low, &mut high, (self.trigger == Trigger::Level) as u32);
        layout.mask.set(&mut low, &mut high, self.masked as u32);

        let dest = self.destination as u32;
        layout.destination.set(&mut low, &mut high, dest);
        if let Some(ext) = layout.ext_destination {
            ext.set(&mut low, &mut high, dest >> layout.destination.width);
        }
        RawEntry { low, high }
    }

    pub fn decode(raw: RawEntry, layout: &RteLayout) -> Self {
        let get = |field: RteField| field.get(raw.low, raw.high);
        let mut destination = get(layout.destination);
        if let Some(ext) = layout.ext_destination {
            destination |= get(ext) << layout.destination.width;
        }
        Self {
            vector: get(layout.vector) as u8,
            delivery_mode: DeliveryMode::from_bits(get(layout.delivery_mode) as u8),
            dest_mode: if get(layout.dest_mode) != 0 {
                DestMode::Logical
            } else {
                DestMode::Physical
            },
            polarity: if get(layout.polarity) != 0 {
                Polarity::ActiveLow
            } else {
                Polarity::ActiveHigh
            },
            trigger: if get(layout.trigger) != 0 {
                Trigger::Level
            } else {
                Trigger::Edge
            },
            masked: get(layout.mask) != 0,
            destination: destination as u16,
            delivery_pending: get(layout.delivery_status) != 0,
            remote_irr: get(layout.remote_irr) != 0,
        }
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vec 0x{:02x} {:?} {:?} dest 0x{:x} {} {}{}",
            self.vector,
            self.delivery_mode,
            self.dest_mode,
            self.destination,
            self.attrs(),
            if self.masked { "masked" } else { "live" },
            if self.remote_irr { " IRR" } else { "" },
        )
    }
}
