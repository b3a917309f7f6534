//! Simulated controller for the router's tests.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::access::RegisterWindow;
use super::entry::{RawEntry, RouteEntry};
use super::regs::{
    IOAPIC_ID_MASK, IOAPIC_ID_SHIFT, IOAPIC_REG_ARB, IOAPIC_REG_ID, IOAPIC_REG_REDIR_BASE,
    IOAPIC_REG_VER, RteLayout, layout_for_version,
};

const RO_LOW_BITS: u32 = (1 << 12) | (1 << 14);
const REMOTE_IRR: u32 = 1 << 14;
const LEVEL: u32 = 1 << 15;
const MASKED: u32 = 1 << 16;

/// Register traffic seen by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Write(u8, u32),
    Eoi(u8),
}

struct SimState {
    id: u8,
    version: u8,
    entries: Vec<RawEntry>,
    selected: u8,
    log: Vec<Access>,
    absent: bool,
    frozen: Vec<u32>,
}

impl SimState {
    fn read(&self, reg: u8) -> u32 {
        if self.absent {
            return u32::MAX;
        }
        match reg {
            IOAPIC_REG_ID => (self.id as u32) << IOAPIC_ID_SHIFT,
            IOAPIC_REG_VER => {
                self.version as u32 | ((self.entries.len() as u32 - 1) << 16)
            }
            IOAPIC_REG_ARB => 0,
            r if r >= IOAPIC_REG_REDIR_BASE => {
                let idx = (r - IOAPIC_REG_REDIR_BASE) as usize;
                match self.entries.get(idx / 2) {
                    Some(e) if idx % 2 == 0 => e.low,
                    Some(e) => e.high,
                    None => 0,
                }
            }
            _ => 0,
        }
    }

    fn write(&mut self, reg: u8, value: u32) {
        self.log.push(Access::Write(reg, value));
        if self.absent {
            return;
        }
        match reg {
            IOAPIC_REG_ID => self.id = ((value & IOAPIC_ID_MASK) >> IOAPIC_ID_SHIFT) as u8,
            r if r >= IOAPIC_REG_REDIR_BASE => {
                let idx = (r - IOAPIC_REG_REDIR_BASE) as usize;
                let pin = (idx / 2) as u32;
                if self.frozen.contains(&pin) {
                    return;
                }
                let Some(e) = self.entries.get_mut(idx / 2) else {
                    return;
                };
                if idx % 2 == 0 {
                    let mut low = (value & !RO_LOW_BITS) | (e.low & RO_LOW_BITS);
                    if low & LEVEL == 0 {
                        low &= !REMOTE_IRR;
                    }
                    e.low = low;
                } else {
                    e.high = value;
                }
            }
            _ => {}
        }
    }

    fn eoi(&mut self, vector: u8) {
        self.log.push(Access::Eoi(vector));
        for (pin, e) in self.entries.iter_mut().enumerate() {
            if self.frozen.contains(&(pin as u32)) {
                continue;
            }
            if e.low & LEVEL != 0 && (e.low & 0xFF) as u8 == vector {
                e.low &= !REMOTE_IRR;
            }
        }
    }
}

/// Handle to a simulated controller; clones share state.
#[derive(Clone)]
pub struct SimIoapic(Arc<Mutex<SimState>>);

impl SimIoapic {
    /// A controller with `pins` entries, all masked.
    pub fn new(id: u8, version: u8, pins: usize) -> Self {
        Self(Arc::new(Mutex::new(SimState {
            id,
            version,
            entries: vec![RawEntry::new(MASKED, 0); pins],
            selected: 0,
            log: Vec::new(),
            absent: false,
            frozen: Vec::new(),
        })))
    }

    /// Nothing decodes the window; every read returns all ones.
    pub fn absent() -> Self {
        let sim = Self::new(0, 0x11, 24);
        sim.0.lock().absent = true;
        sim
    }

    pub fn window(&self) -> Box<dyn RegisterWindow> {
        Box::new(SimWindow(self.clone()))
    }

    pub fn layout(&self) -> &'static RteLayout {
        layout_for_version(self.0.lock().version)
    }

    pub fn id(&self) -> u8 {
        self.0.lock().id
    }

    pub fn set_id(&self, id: u8) {
        self.0.lock().id = id;
    }

    pub fn take_log(&self) -> Vec<Access> {
        core::mem::take(&mut self.0.lock().log)
    }

    pub fn entry(&self, pin: u32) -> RawEntry {
        self.0.lock().entries[pin as usize]
    }

    pub fn decoded(&self, pin: u32) -> RouteEntry {
        RouteEntry::decode(self.entry(pin), self.layout())
    }

    /// Overwrite an entry, read-only bits included, as firmware would.
    pub fn set_entry(&self, pin: u32, raw: RawEntry) {
        self.0.lock().entries[pin as usize] = raw;
    }

    /// Assert the pin's input. A level entry that is unmasked latches
    /// remote IRR. Returns whether an interrupt was delivered.
    pub fn raise(&self, pin: u32) -> bool {
        let mut st = self.0.lock();
        let e = &mut st.entries[pin as usize];
        if e.low & MASKED != 0 {
            return false;
        }
        if e.low & LEVEL != 0 {
            e.low |= REMOTE_IRR;
        }
        true
    }

    /// The pin ignores every write from now on.
    pub fn freeze_pin(&self, pin: u32) {
        self.0.lock().frozen.push(pin);
    }
}

struct SimWindow(SimIoapic);

impl RegisterWindow for SimWindow {
    fn select(&mut self, index: u8) {
        (self.0).0.lock().selected = index;
    }

    fn read_data(&mut self) -> u32 {
        let st = (self.0).0.lock();
        st.read(st.selected)
    }

    fn write_data(&mut self, value: u32) {
        let mut st = (self.0).0.lock();
        let reg = st.selected;
        st.write(reg, value);
    }

    fn write_eoi(&mut self, vector: u8) {
        (self.0).0.lock().eoi(vector);
    }
}
