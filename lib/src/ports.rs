use crate::io::Port;

pub const COM1: Port<u8> = Port::new(0x3F8);

pub const PIC1_COMMAND: Port<u8> = Port::new(0x20);
pub const PIC1_DATA: Port<u8> = Port::new(0x21);
pub const PIC2_COMMAND: Port<u8> = Port::new(0xA0);
pub const PIC2_DATA: Port<u8> = Port::new(0xA1);

/// Edge/Level Control Registers (EISA and most later chipsets).
pub const ELCR1: Port<u8> = Port::new(0x4D0);
pub const ELCR2: Port<u8> = Port::new(0x4D1);

pub const CMOS_ADDRESS: Port<u8> = Port::new(0x70);
pub const CMOS_DATA: Port<u8> = Port::new(0x71);

pub const IO_DELAY: Port<u8> = Port::new(0x80);

pub const UART_REG_THR: u16 = 0;
pub const UART_REG_LSR: u16 = 5;
pub const UART_LSR_TX_EMPTY: u8 = 0x20;

// ---------------------------------------------------------------------------
// Low-level serial I/O primitives
// ---------------------------------------------------------------------------
//
// Lock-free: callers serialise (cli/sti, IrqMutex, ...) as suits the context.

/// Write one byte to a UART, polling the Line Status Register until the
/// transmit holding register is empty.
///
/// # Safety
///
/// Port I/O. Caller must ensure `base` refers to a valid, initialised UART.
pub unsafe fn serial_putc(base: Port<u8>, byte: u8) {
    let lsr = base.offset(UART_REG_LSR);
    let mut spins = 0u32;
    while unsafe { lsr.read() } & UART_LSR_TX_EMPTY == 0 && spins < 100_000 {
        core::hint::spin_loop();
        spins += 1;
    }
    unsafe { base.offset(UART_REG_THR).write(byte) };
}

/// Write a byte slice to a UART, expanding `\n` to `\r\n`.
///
/// # Safety
///
/// Same as [`serial_putc`].
pub unsafe fn serial_write_bytes(base: Port<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == b'\n' {
            unsafe { serial_putc(base, b'\r') };
        }
        unsafe { serial_putc(base, b) };
    }
}

/// Short delay for slow ISA devices (a write to the POST port).
#[inline(always)]
pub fn io_wait() {
    unsafe { IO_DELAY.write(0) };
}
