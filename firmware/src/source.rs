use core::fmt;

/// Polarity field of an MPS/MADT interrupt flags word (bits 0-1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagPolarity {
    BusDefault,
    ActiveHigh,
    Reserved,
    ActiveLow,
}

/// Trigger field of an MPS/MADT interrupt flags word (bits 2-3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagTrigger {
    BusDefault,
    Edge,
    Reserved,
    Level,
}

impl FlagPolarity {
    pub const fn from_flags(flags: u16) -> Self {
        match flags & 0x3 {
            0 => Self::BusDefault,
            1 => Self::ActiveHigh,
            2 => Self::Reserved,
            _ => Self::ActiveLow,
        }
    }
}

impl FlagTrigger {
    pub const fn from_flags(flags: u16) -> Self {
        match (flags >> 2) & 0x3 {
            0 => Self::BusDefault,
            1 => Self::Edge,
            2 => Self::Reserved,
            _ => Self::Level,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    Edge,
    Level,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

/// Resolved electrical attributes of an interrupt line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqAttrs {
    pub trigger: Trigger,
    pub polarity: Polarity,
}

impl IrqAttrs {
    pub const fn new(trigger: Trigger, polarity: Polarity) -> Self {
        Self { trigger, polarity }
    }

    /// Edge/active-high: the ISA convention.
    pub const EDGE_HIGH: Self = Self::new(Trigger::Edge, Polarity::ActiveHigh);
    /// Level/active-low: the PCI convention and the router's fallback.
    pub const LEVEL_LOW: Self = Self::new(Trigger::Level, Polarity::ActiveLow);

    #[inline]
    pub fn is_level(&self) -> bool {
        self.trigger == Trigger::Level
    }

    #[inline]
    pub fn is_active_low(&self) -> bool {
        self.polarity == Polarity::ActiveLow
    }
}

impl fmt::Display for IrqAttrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trigger = match self.trigger {
            Trigger::Edge => "edge",
            Trigger::Level => "level",
        };
        let polarity = match self.polarity {
            Polarity::ActiveHigh => "high",
            Polarity::ActiveLow => "low",
        };
        write!(f, "{}/{}", trigger, polarity)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Int,
    Nmi,
    Smi,
    ExtInt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusKind {
    Isa,
    Eisa,
    Pci,
    Other(u8),
}

impl BusKind {
    /// ISA and EISA IRQ numbers share the legacy 0-15 space.
    pub fn is_legacy(&self) -> bool {
        matches!(self, BusKind::Isa | BusKind::Eisa)
    }
}

/// One firmware-described connection from a bus interrupt to a controller
/// pin. `controller_id` is the hardware id of the destination controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceRoute {
    pub kind: SourceKind,
    pub bus: BusKind,
    pub bus_irq: u8,
    pub controller_id: u8,
    pub pin: u32,
    pub flags: u16,
}

impl SourceRoute {
    pub const fn isa(irq: u8, controller_id: u8, pin: u32, flags: u16) -> Self {
        Self {
            kind: SourceKind::Int,
            bus: BusKind::Isa,
            bus_irq: irq,
            controller_id,
            pin,
            flags,
        }
    }

    pub const fn pci(bus_irq: u8, controller_id: u8, pin: u32) -> Self {
        Self {
            kind: SourceKind::Int,
            bus: BusKind::Pci,
            bus_irq,
            controller_id,
            pin,
            flags: 0,
        }
    }

    pub const fn with_kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn polarity_flag(&self) -> FlagPolarity {
        FlagPolarity::from_flags(self.flags)
    }

    pub fn trigger_flag(&self) -> FlagTrigger {
        FlagTrigger::from_flags(self.flags)
    }

    /// Legacy ISA IRQ number carried by this entry, if any.
    pub fn isa_irq(&self) -> Option<u8> {
        if self.bus.is_legacy() && self.bus_irq < 16 {
            Some(self.bus_irq)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceError {
    /// No default row for this bus kind; the attributes cannot be inferred.
    UnspecifiedBusDefault(BusKind),
    /// The default requires the edge/level control register and none exists.
    NoElcr,
    TableFull,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::UnspecifiedBusDefault(bus) => {
                write!(f, "no attribute default for bus {:?}", bus)
            }
            SourceError::NoElcr => write!(f, "bus default needs ELCR, none present"),
            SourceError::TableFull => write!(f, "source table full"),
        }
    }
}
