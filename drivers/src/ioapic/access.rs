//! Indirect register access.
//!
//! The controller exposes a select register and a data window; every
//! access is a select followed by a data read or write, so a bank must be
//! used by one CPU at a time. Callers hold the router's hardware lock.

use alloc::boxed::Box;
use core::ptr::{NonNull, read_volatile, write_volatile};

use super::entry::RawEntry;
use super::regs::{
    IOAPIC_REGION_SIZE, IOAPIC_WINDOW_DATA, IOAPIC_WINDOW_EOI, IOAPIC_WINDOW_INDEX, redir_high,
    redir_low,
};

/// The three registers of a controller's MMIO window.
pub trait RegisterWindow: Send {
    fn select(&mut self, index: u8);
    fn read_data(&mut self) -> u32;
    fn write_data(&mut self, value: u32);
    /// Directed EOI; only meaningful on controllers that have it.
    fn write_eoi(&mut self, vector: u8);
}

/// Volatile access to a mapped controller window.
pub struct MmioWindow {
    base: NonNull<u8>,
}

// SAFETY: the window is device memory; exclusive use is enforced by the
// router's lock, not by thread affinity.
unsafe impl Send for MmioWindow {}

impl MmioWindow {
    /// # Safety
    /// `base` must map at least `IOAPIC_REGION_SIZE` bytes of a controller's
    /// register window as uncached memory for the lifetime of the window.
    pub unsafe fn new(base: NonNull<u8>) -> Self {
        Self { base }
    }

    #[inline]
    fn reg(&self, offset: usize) -> *mut u32 {
        debug_assert!(offset + 4 <= IOAPIC_REGION_SIZE);
        unsafe { self.base.as_ptr().add(offset) as *mut u32 }
    }
}

impl RegisterWindow for MmioWindow {
    #[inline]
    fn select(&mut self, index: u8) {
        unsafe { write_volatile(self.reg(IOAPIC_WINDOW_INDEX), index as u32) }
    }

    #[inline]
    fn read_data(&mut self) -> u32 {
        unsafe { read_volatile(self.reg(IOAPIC_WINDOW_DATA)) }
    }

    #[inline]
    fn write_data(&mut self, value: u32) {
        unsafe { write_volatile(self.reg(IOAPIC_WINDOW_DATA), value) }
    }

    #[inline]
    fn write_eoi(&mut self, vector: u8) {
        unsafe { write_volatile(self.reg(IOAPIC_WINDOW_EOI), vector as u32) }
    }
}

/// Register-level operations over one window.
pub struct RegisterBank {
    window: Box<dyn RegisterWindow>,
}

impl RegisterBank {
    pub fn new(window: Box<dyn RegisterWindow>) -> Self {
        Self { window }
    }

    #[inline]
    pub fn read(&mut self, reg: u8) -> u32 {
        self.window.select(reg);
        self.window.read_data()
    }

    #[inline]
    pub fn write(&mut self, reg: u8, value: u32) {
        self.window.select(reg);
        self.window.write_data(value);
    }

    #[inline]
    pub fn acknowledge(&mut self, vector: u8) {
        self.window.write_eoi(vector);
    }

    /// Dummy read of the data window to push posted writes to the device.
    #[inline]
    pub fn sync(&mut self) {
        let _ = self.window.read_data();
    }

    pub fn read_entry(&mut self, pin: u32) -> RawEntry {
        let low = self.read(redir_low(pin));
        let high = self.read(redir_high(pin));
        RawEntry { low, high }
    }

    /// Program an entry: destination word first, so the entry is never live
    /// with a stale destination.
    pub fn write_entry(&mut self, pin: u32, raw: RawEntry) {
        self.write(redir_high(pin), raw.high);
        self.write(redir_low(pin), raw.low);
    }

    /// Retire an entry: low word (with the mask bit) first.
    pub fn write_entry_masking(&mut self, pin: u32, raw: RawEntry) {
        self.write(redir_low(pin), raw.low);
        self.write(redir_high(pin), raw.high);
    }

    pub fn write_low(&mut self, pin: u32, low: u32) {
        self.write(redir_low(pin), low);
    }
}
