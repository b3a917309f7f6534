use alloc::vec::Vec;

use crate::bus::BusDefaults;
use crate::source::{SourceError, SourceKind, SourceRoute};

/// Queries the interrupt router makes of firmware.
pub trait SourceRouting: Send + Sync {
    /// The `Int` source wired to `pin` of controller `controller_id`.
    fn lookup_source_routing(&self, controller_id: u8, pin: u32) -> Option<SourceRoute> {
        self.find_entry(controller_id, pin, SourceKind::Int)
    }

    fn find_entry(&self, controller_id: u8, pin: u32, kind: SourceKind) -> Option<SourceRoute>;

    /// `(controller_id, pin)` of the first legacy source with `isa_irq`.
    fn find_isa_pin(&self, isa_irq: u8, kind: SourceKind) -> Option<(u8, u32)>;

    fn bus_defaults(&self) -> &BusDefaults;

    /// Every entry naming `controller_id`, in table order.
    fn entries_for(&self, controller_id: u8) -> Vec<SourceRoute>;
}

/// Flat in-memory source table, filled by whoever parsed the firmware.
pub struct SourceTable {
    entries: Vec<SourceRoute>,
    capacity: usize,
    defaults: BusDefaults,
}

impl SourceTable {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            defaults: BusDefaults::standard(),
        }
    }

    pub fn with_defaults(mut self, defaults: BusDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Append an entry. Exact duplicates are dropped silently.
    pub fn save(&mut self, route: SourceRoute) -> Result<(), SourceError> {
        if self.entries.contains(&route) {
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            return Err(SourceError::TableFull);
        }
        self.entries.push(route);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceRoute> {
        self.entries.iter()
    }
}

impl Default for SourceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRouting for SourceTable {
    fn find_entry(&self, controller_id: u8, pin: u32, kind: SourceKind) -> Option<SourceRoute> {
        self.entries
            .iter()
            .copied()
            .find(|e| e.kind == kind && e.controller_id == controller_id && e.pin == pin)
    }

    fn find_isa_pin(&self, isa_irq: u8, kind: SourceKind) -> Option<(u8, u32)> {
        self.entries
            .iter()
            .find(|e| e.kind == kind && e.bus.is_legacy() && e.bus_irq == isa_irq)
            .map(|e| (e.controller_id, e.pin))
    }

    fn bus_defaults(&self) -> &BusDefaults {
        &self.defaults
    }

    fn entries_for(&self, controller_id: u8) -> Vec<SourceRoute> {
        self.entries
            .iter()
            .copied()
            .filter(|e| e.controller_id == controller_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_dedups_and_limits() {
        let mut table = SourceTable::with_capacity(2);
        let a = SourceRoute::isa(1, 0, 1, 0);
        assert_eq!(table.save(a), Ok(()));
        assert_eq!(table.save(a), Ok(()));
        assert_eq!(table.len(), 1);
        assert_eq!(table.save(SourceRoute::isa(3, 0, 3, 0)), Ok(()));
        assert_eq!(
            table.save(SourceRoute::isa(4, 0, 4, 0)),
            Err(SourceError::TableFull)
        );
    }

    #[test]
    fn test_lookups_filter_by_kind() {
        let mut table = SourceTable::new();
        table
            .save(SourceRoute::isa(0, 0, 0, 0).with_kind(SourceKind::ExtInt))
            .unwrap();
        table.save(SourceRoute::isa(0, 0, 2, 0)).unwrap();
        assert_eq!(table.find_isa_pin(0, SourceKind::Int), Some((0, 2)));
        assert_eq!(table.find_isa_pin(0, SourceKind::ExtInt), Some((0, 0)));
        assert!(table.lookup_source_routing(0, 0).is_none());
        assert_eq!(table.lookup_source_routing(0, 2).map(|e| e.bus_irq), Some(0));
        assert_eq!(table.entries_for(0).len(), 2);
        assert!(table.entries_for(1).is_empty());
    }
}
