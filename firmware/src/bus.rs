//! Per-bus attribute defaults.
//!
//! A source entry whose flags say "conforms to bus" takes its trigger and
//! polarity from this table. The table is data so a platform can adjust it;
//! a bus with no row is reported, never guessed.

use alloc::vec::Vec;

use pinroute_lib::klog_warn;

use crate::source::{
    BusKind, FlagPolarity, FlagTrigger, IrqAttrs, Polarity, SourceError, SourceRoute, Trigger,
};

/// Edge/level control register lookup for legacy IRQs 0-15.
pub trait ElcrLookup {
    fn is_level(&self, irq: u8) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefaultTrigger {
    Edge,
    Level,
    /// Read from the edge/level control register.
    Elcr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusDefault {
    pub bus: BusKind,
    pub trigger: DefaultTrigger,
    pub polarity: Polarity,
}

#[derive(Clone, Debug)]
pub struct BusDefaults {
    rows: Vec<BusDefault>,
}

impl BusDefaults {
    pub const fn empty() -> Self {
        Self { rows: Vec::new() }
    }

    /// ISA edge/high, EISA per-ELCR/high, PCI level/low.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.set(BusDefault {
            bus: BusKind::Isa,
            trigger: DefaultTrigger::Edge,
            polarity: Polarity::ActiveHigh,
        });
        table.set(BusDefault {
            bus: BusKind::Eisa,
            trigger: DefaultTrigger::Elcr,
            polarity: Polarity::ActiveHigh,
        });
        table.set(BusDefault {
            bus: BusKind::Pci,
            trigger: DefaultTrigger::Level,
            polarity: Polarity::ActiveLow,
        });
        table
    }

    /// Insert or replace the row for `row.bus`.
    pub fn set(&mut self, row: BusDefault) {
        match self.rows.iter_mut().find(|r| r.bus == row.bus) {
            Some(existing) => *existing = row,
            None => self.rows.push(row),
        }
    }

    pub fn row(&self, bus: BusKind) -> Result<BusDefault, SourceError> {
        self.rows
            .iter()
            .copied()
            .find(|r| r.bus == bus)
            .ok_or(SourceError::UnspecifiedBusDefault(bus))
    }

    pub fn legacy_bus_has_elcr_semantics(&self, bus: BusKind) -> bool {
        matches!(self.row(bus), Ok(BusDefault { trigger: DefaultTrigger::Elcr, .. }))
    }

    pub fn polarity_for(&self, route: &SourceRoute) -> Result<Polarity, SourceError> {
        match route.polarity_flag() {
            FlagPolarity::BusDefault => Ok(self.row(route.bus)?.polarity),
            FlagPolarity::ActiveHigh => Ok(Polarity::ActiveHigh),
            FlagPolarity::ActiveLow => Ok(Polarity::ActiveLow),
            FlagPolarity::Reserved => {
                klog_warn!(
                    "FIRMWARE: reserved polarity for bus irq {} (pin {}), using active low",
                    route.bus_irq,
                    route.pin
                );
                Ok(Polarity::ActiveLow)
            }
        }
    }

    pub fn trigger_for(
        &self,
        route: &SourceRoute,
        elcr: Option<&dyn ElcrLookup>,
    ) -> Result<Trigger, SourceError> {
        match route.trigger_flag() {
            FlagTrigger::BusDefault => match self.row(route.bus)?.trigger {
                DefaultTrigger::Edge => Ok(Trigger::Edge),
                DefaultTrigger::Level => Ok(Trigger::Level),
                DefaultTrigger::Elcr => {
                    let elcr = elcr.ok_or(SourceError::NoElcr)?;
                    if route.bus_irq >= 16 {
                        return Err(SourceError::UnspecifiedBusDefault(route.bus));
                    }
                    Ok(if elcr.is_level(route.bus_irq) {
                        Trigger::Level
                    } else {
                        Trigger::Edge
                    })
                }
            },
            FlagTrigger::Edge => Ok(Trigger::Edge),
            FlagTrigger::Level => Ok(Trigger::Level),
            FlagTrigger::Reserved => {
                klog_warn!(
                    "FIRMWARE: reserved trigger mode for bus irq {} (pin {}), using level",
                    route.bus_irq,
                    route.pin
                );
                Ok(Trigger::Level)
            }
        }
    }

    pub fn resolve(
        &self,
        route: &SourceRoute,
        elcr: Option<&dyn ElcrLookup>,
    ) -> Result<IrqAttrs, SourceError> {
        Ok(IrqAttrs {
            trigger: self.trigger_for(route, elcr)?,
            polarity: self.polarity_for(route)?,
        })
    }
}

impl Default for BusDefaults {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LevelAbove8;

    impl ElcrLookup for LevelAbove8 {
        fn is_level(&self, irq: u8) -> bool {
            irq >= 8
        }
    }

    #[test]
    fn test_bus_defaults_apply() {
        let table = BusDefaults::standard();
        assert_eq!(
            table.resolve(&SourceRoute::isa(4, 0, 4, 0), None),
            Ok(IrqAttrs::EDGE_HIGH)
        );
        assert_eq!(
            table.resolve(&SourceRoute::pci(0x10, 0, 16), None),
            Ok(IrqAttrs::LEVEL_LOW)
        );
    }

    #[test]
    fn test_explicit_flags_override_bus() {
        let table = BusDefaults::standard();
        // SCI override: level, active low on an ISA IRQ.
        let route = SourceRoute::isa(9, 0, 9, 0xD);
        assert_eq!(table.resolve(&route, None), Ok(IrqAttrs::LEVEL_LOW));
    }

    #[test]
    fn test_eisa_consults_elcr() {
        let table = BusDefaults::standard();
        let mut route = SourceRoute::isa(10, 0, 10, 0);
        route.bus = BusKind::Eisa;
        assert_eq!(table.trigger_for(&route, Some(&LevelAbove8)), Ok(Trigger::Level));
        route.bus_irq = 3;
        assert_eq!(table.trigger_for(&route, Some(&LevelAbove8)), Ok(Trigger::Edge));
        assert_eq!(table.trigger_for(&route, None), Err(SourceError::NoElcr));
        assert!(table.legacy_bus_has_elcr_semantics(BusKind::Eisa));
        assert!(!table.legacy_bus_has_elcr_semantics(BusKind::Isa));
    }

    #[test]
    fn test_unknown_bus_is_unspecified() {
        let table = BusDefaults::standard();
        let mut route = SourceRoute::pci(1, 0, 20);
        route.bus = BusKind::Other(7);
        assert_eq!(
            table.resolve(&route, None),
            Err(SourceError::UnspecifiedBusDefault(BusKind::Other(7)))
        );
        // Fully explicit flags never need the table.
        route.flags = 0x5;
        assert_eq!(table.resolve(&route, None), Ok(IrqAttrs::EDGE_HIGH));
    }

    #[test]
    fn test_reserved_encodings_fall_back_low_level() {
        let table = BusDefaults::standard();
        let route = SourceRoute::isa(5, 0, 5, 0xA);
        assert_eq!(table.resolve(&route, None), Ok(IrqAttrs::LEVEL_LOW));
    }
}
