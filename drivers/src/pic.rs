//! Legacy 8259A pair and the ELCR trigger registers.
//!
//! The IO-APIC router keeps the 8259 around as the cascade behind the
//! ExtINT pin: the timer check falls back to it and legacy lines are
//! masked there once the IO-APIC owns them.

use pinroute_firmware::ElcrLookup;
use pinroute_lib::ports::{ELCR1, ELCR2, PIC1_COMMAND, PIC1_DATA, PIC2_COMMAND, PIC2_DATA, io_wait};
use pinroute_lib::{cpu, klog_debug};

use crate::ioapic::CascadeController;

const PIC_EOI: u8 = 0x20;
/// ICW1: edge triggered, cascade, ICW4 follows.
const ICW1_INIT: u8 = 0x11;
const ICW4_8086: u8 = 0x01;
const ICW4_AUTO_EOI: u8 = 0x02;
/// OCW3: next command-port read returns IRR.
const OCW3_READ_IRR: u8 = 0x0A;

pub const PIC1_VECTOR_BASE: u8 = 0x20;
pub const PIC2_VECTOR_BASE: u8 = 0x28;
/// Master input the slave hangs off.
pub const PIC_CASCADE_IRQ: u8 = 2;

const fn icw4_master(auto_eoi: bool) -> u8 {
    if auto_eoi {
        ICW4_8086 | ICW4_AUTO_EOI
    } else {
        ICW4_8086
    }
}

const fn with_irq(mask: u16, irq: u8, masked: bool) -> u16 {
    let bit = 1u16 << (irq & 0xF);
    if masked { mask | bit } else { mask & !bit }
}

/// Mask all 8259 inputs and drop anything in service.
pub fn pic_quiesce_disable() {
    unsafe {
        PIC1_DATA.write(0xFF);
        PIC2_DATA.write(0xFF);
        PIC1_COMMAND.write(PIC_EOI);
        PIC2_COMMAND.write(PIC_EOI);
    }
}

/// The master/slave pair, with the mask registers cached.
pub struct I8259 {
    cached_mask: u16,
}

impl I8259 {
    /// Starts with every input masked.
    pub const fn new() -> Self {
        Self {
            cached_mask: 0xFFFF,
        }
    }

    pub fn cached_mask(&self) -> u16 {
        self.cached_mask
    }

    fn write_mask(&self) {
        unsafe {
            PIC1_DATA.write(self.cached_mask as u8);
            PIC2_DATA.write((self.cached_mask >> 8) as u8);
        }
    }
}

impl Default for I8259 {
    fn default() -> Self {
        Self::new()
    }
}

impl CascadeController for I8259 {
    fn init(&mut self, auto_eoi: bool) {
        let flags = cpu::save_flags_cli();
        unsafe {
            PIC1_DATA.write(0xFF);
            PIC2_DATA.write(0xFF);

            PIC1_COMMAND.write(ICW1_INIT);
            io_wait();
            PIC1_DATA.write(PIC1_VECTOR_BASE);
            io_wait();
            PIC1_DATA.write(1 << PIC_CASCADE_IRQ);
            io_wait();
            PIC1_DATA.write(icw4_master(auto_eoi));
            io_wait();

            PIC2_COMMAND.write(ICW1_INIT);
            io_wait();
            PIC2_DATA.write(PIC2_VECTOR_BASE);
            io_wait();
            PIC2_DATA.write(PIC_CASCADE_IRQ);
            io_wait();
            // The slave never runs in auto-EOI.
            PIC2_DATA.write(ICW4_8086);
            io_wait();
        }
        self.write_mask();
        cpu::restore_flags(flags);
        klog_debug!("PIC: initialized, auto EOI {}", auto_eoi);
    }

    fn mask(&mut self, irq: u8) {
        self.cached_mask = with_irq(self.cached_mask, irq, true);
        self.write_mask();
    }

    fn unmask(&mut self, irq: u8) {
        self.cached_mask = with_irq(self.cached_mask, irq, false);
        self.write_mask();
    }

    fn is_pending(&mut self, irq: u8) -> bool {
        let flags = cpu::save_flags_cli();
        let irr = unsafe {
            if irq < 8 {
                PIC1_COMMAND.write(OCW3_READ_IRR);
                PIC1_COMMAND.read() & (1 << irq)
            } else {
                PIC2_COMMAND.write(OCW3_READ_IRR);
                PIC2_COMMAND.read() & (1 << (irq - 8))
            }
        };
        cpu::restore_flags(flags);
        irr != 0
    }
}

/// Edge/level control registers at 0x4D0/0x4D1, one bit per ISA IRQ.
pub struct Elcr;

impl Elcr {
    pub fn read() -> u16 {
        unsafe { ELCR1.read() as u16 | ((ELCR2.read() as u16) << 8) }
    }
}

impl ElcrLookup for Elcr {
    fn is_level(&self, irq: u8) -> bool {
        irq < 16 && Self::read() & (1 << irq) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icw4_auto_eoi() {
        assert_eq!(icw4_master(false), 0x01);
        assert_eq!(icw4_master(true), 0x03);
    }

    #[test]
    fn test_mask_cache_bits() {
        let mut pic = I8259::new();
        pic.unmask(0);
        pic.unmask(9);
        assert_eq!(pic.cached_mask(), 0xFFFF & !(1 | (1 << 9)));
        pic.mask(9);
        assert_eq!(pic.cached_mask(), 0xFFFE);
    }

    #[test]
    fn test_with_irq_ignores_high_bits() {
        assert_eq!(with_irq(0, 0x13, true), 1 << 3);
    }
}
