//! Controller registration and the per-controller descriptors.

use alloc::boxed::Box;
use alloc::vec::Vec;

use pinroute_lib::{klog_debug, klog_info, klog_warn};

use super::access::{RegisterBank, RegisterWindow};
use super::channel::NR_LEGACY_CHANNELS;
use super::entry::RawEntry;
use super::error::{IoapicError, IoapicResult};
use super::regs::{
    IOAPIC_ID_MASK, IOAPIC_ID_SHIFT, IOAPIC_ID_SPACE, IOAPIC_MAX_CONTROLLERS, IOAPIC_MAX_PINS,
    IOAPIC_REG_ARB,
    IOAPIC_REG_ID, IOAPIC_REG_VER, IOAPIC_VERSION_DIRECTED_EOI, RteLayout, entries_from_reg,
    id_from_reg, layout_for_version, version_from_reg,
};
use super::{Ioapic, RoutingState};

/// How a controller's pins are numbered as channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainKind {
    /// ISA IRQs keep their legacy numbers, other pins use their GSI.
    Legacy,
    /// Channel number equals GSI.
    Strict,
    /// Channel numbers come from the dynamic range above all identity-mapped
    /// GSIs.
    Dynamic,
}

#[derive(Clone, Copy, Debug)]
pub struct ControllerConfig {
    pub address: u64,
    /// Firmware-assigned id; `None` trusts the id register.
    pub requested_id: Option<u8>,
    pub gsi_base: u32,
    pub domain: DomainKind,
}

/// How level-triggered interrupts are completed at the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Directed EOI register.
    Native,
    /// No EOI register: flip the entry to masked edge and back, which
    /// clears remote IRR.
    Emulated,
}

impl Completion {
    pub fn for_version(version: u8) -> Self {
        if version >= IOAPIC_VERSION_DIRECTED_EOI {
            Completion::Native
        } else {
            Completion::Emulated
        }
    }
}

pub trait EoiMethod {
    fn complete(&self, bank: &mut RegisterBank, layout: &RteLayout, pin: u32, vector: u8);
}

impl EoiMethod for Completion {
    fn complete(&self, bank: &mut RegisterBank, layout: &RteLayout, pin: u32, vector: u8) {
        match self {
            Completion::Native => bank.acknowledge(vector),
            Completion::Emulated => {
                let orig = bank.read_entry(pin).writable_bits(layout);
                let mut edge = orig;
                layout.mask.set(&mut edge.low, &mut edge.high, 1);
                layout.trigger.set(&mut edge.low, &mut edge.high, 0);
                bank.write_entry_masking(pin, edge);
                bank.write_entry(pin, orig);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerDesc {
    /// Registry slot.
    pub index: usize,
    pub id: u8,
    pub version: u8,
    pub address: u64,
    pub gsi_base: u32,
    pub pin_count: u32,
    pub domain: DomainKind,
    pub completion: Completion,
}

impl ControllerDesc {
    pub fn gsi_end(&self) -> u32 {
        self.gsi_base + self.pin_count - 1
    }

    pub fn contains(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi <= self.gsi_end()
    }

    pub fn pin_for(&self, gsi: u32) -> u32 {
        gsi - self.gsi_base
    }

    pub fn gsi_for(&self, pin: u32) -> u32 {
        self.gsi_base + pin
    }

    fn overlaps(&self, base: u32, end: u32) -> bool {
        base <= self.gsi_end() && self.gsi_base <= end
    }
}

pub(crate) struct ControllerHw {
    pub(crate) bank: RegisterBank,
    pub(crate) layout: &'static RteLayout,
    pub(crate) completion: Completion,
    pub(crate) pin_count: u32,
    pub(crate) hw_id: u8,
    /// Suspend snapshot, one entry per pin.
    pub(crate) saved: Vec<RawEntry>,
}

impl ControllerHw {
    pub(crate) fn eoi_pin(&mut self, pin: u32, vector: u8) {
        self.completion
            .complete(&mut self.bank, self.layout, pin, vector);
    }
}

impl RoutingState {
    pub(crate) fn find_controller_for(&self, gsi: u32) -> IoapicResult<ControllerDesc> {
        self.registered()
            .copied()
            .find(|c| c.contains(gsi))
            .ok_or(IoapicError::NoController { gsi })
    }

    fn unique_id(&self, index: usize, wanted: u8) -> u8 {
        let mut used = [false; IOAPIC_ID_SPACE];
        for c in self.registered() {
            used[c.id as usize] = true;
        }
        if !used[wanted as usize] {
            return wanted;
        }
        match used.iter().position(|u| !u) {
            Some(free) => {
                klog_warn!(
                    "IOAPIC[{}]: id {} already in use, using {}",
                    index,
                    wanted,
                    free
                );
                free as u8
            }
            None => wanted,
        }
    }

    fn recompute_bounds(&mut self) {
        self.gsi_top = self
            .registered()
            .map(|c| c.gsi_end() + 1)
            .max()
            .unwrap_or(0);
        self.dynirq_base = self
            .registered()
            .filter(|c| c.domain != DomainKind::Dynamic)
            .map(|c| c.gsi_end() + 1)
            .max()
            .unwrap_or(0)
            .max(NR_LEGACY_CHANNELS);
    }
}

impl Ioapic {
    /// Probe and register a controller. Returns its registry slot.
    pub fn register_controller(
        &self,
        cfg: ControllerConfig,
        window: Box<dyn RegisterWindow>,
    ) -> IoapicResult<usize> {
        if self.config.noapic {
            return Err(IoapicError::Disabled);
        }
        if cfg.address == 0 {
            klog_warn!("IOAPIC: refusing controller at address 0");
            return Err(IoapicError::InvalidAddress);
        }

        let mut st = self.state.lock();
        if st.registered().any(|c| c.address == cfg.address) {
            return Err(IoapicError::AlreadyRegistered {
                address: cfg.address,
            });
        }
        let index = match st.controllers.iter().position(Option::is_none) {
            Some(free) => free,
            None if st.controllers.len() < IOAPIC_MAX_CONTROLLERS => st.controllers.len(),
            None => {
                klog_warn!("IOAPIC: max controllers ({}) reached", IOAPIC_MAX_CONTROLLERS);
                return Err(IoapicError::NoSpace);
            }
        };

        let mut bank = RegisterBank::new(window);
        let reg0 = bank.read(IOAPIC_REG_ID);
        let reg1 = bank.read(IOAPIC_REG_VER);
        let reg2 = bank.read(IOAPIC_REG_ARB);
        if reg0 == u32::MAX && reg1 == u32::MAX && reg2 == u32::MAX {
            klog_warn!("IOAPIC: no controller responds at 0x{:x}", cfg.address);
            return Err(IoapicError::ControllerAbsent {
                address: cfg.address,
            });
        }

        let version = version_from_reg(reg1);
        let pin_count = entries_from_reg(reg1);
        if pin_count > IOAPIC_MAX_PINS {
            klog_warn!(
                "IOAPIC[{}]: {} pins reported, at most {} are addressable",
                index,
                pin_count,
                IOAPIC_MAX_PINS
            );
            return Err(IoapicError::TooManyPins {
                address: cfg.address,
                pins: pin_count,
            });
        }
        // One past the last GSI must fit too.
        let Some(gsi_end) = cfg
            .gsi_base
            .checked_add(pin_count)
            .map(|limit| limit - 1)
        else {
            klog_warn!(
                "IOAPIC[{}]: GSI base {} + {} pins overflows",
                index,
                cfg.gsi_base,
                pin_count
            );
            return Err(IoapicError::GsiOutOfRange {
                gsi_base: cfg.gsi_base,
                pins: pin_count,
            });
        };
        if let Some(other) = st.registered().find(|c| c.overlaps(cfg.gsi_base, gsi_end)) {
            klog_warn!(
                "IOAPIC[{}]: GSI {}-{} overlaps controller {} (GSI {}-{})",
                index,
                cfg.gsi_base,
                gsi_end,
                other.index,
                other.gsi_base,
                other.gsi_end()
            );
            return Err(IoapicError::GsiOverlap {
                gsi_base: cfg.gsi_base,
                gsi_end,
                other: other.index,
            });
        }

        let reg_id = id_from_reg(reg0);
        let id = st.unique_id(index, cfg.requested_id.unwrap_or(reg_id));
        if id != reg_id {
            klog_debug!("IOAPIC[{}]: writing id {} (was {})", index, id, reg_id);
            bank.write(
                IOAPIC_REG_ID,
                (reg0 & !IOAPIC_ID_MASK) | ((id as u32) << IOAPIC_ID_SHIFT),
            );
        }

        let mut saved = Vec::new();
        saved
            .try_reserve_exact(pin_count as usize)
            .map_err(|_| IoapicError::NoMemory)?;
        saved.resize(pin_count as usize, RawEntry::default());

        let completion = Completion::for_version(version);
        let desc = ControllerDesc {
            index,
            id,
            version,
            address: cfg.address,
            gsi_base: cfg.gsi_base,
            pin_count,
            domain: cfg.domain,
            completion,
        };
        let hw_ctl = ControllerHw {
            bank,
            layout: layout_for_version(version),
            completion,
            pin_count,
            hw_id: id,
            saved,
        };

        if index == st.controllers.len() {
            st.controllers.push(Some(desc));
        } else {
            st.controllers[index] = Some(desc);
        }
        st.recompute_bounds();

        {
            let mut hw = self.hw.lock();
            let banks = &mut hw.banks.0;
            if banks.len() <= index {
                banks.resize_with(index + 1, || None);
            }
            banks[index] = Some(hw_ctl);
        }

        klog_info!(
            "IOAPIC[{}]: id 0x{:x}, version 0x{:x}, address 0x{:x}, GSI {}-{}, {:?} EOI",
            index,
            id,
            version,
            cfg.address,
            cfg.gsi_base,
            gsi_end,
            completion
        );
        Ok(index)
    }

    /// Remove the controller whose GSI range starts at `gsi_base`. Refused
    /// while any of its pins feeds a channel.
    pub fn unregister_controller(&self, gsi_base: u32) -> IoapicResult<()> {
        let mut st = self.state.lock();
        let desc = st
            .registered()
            .copied()
            .find(|c| c.gsi_base == gsi_base)
            .ok_or(IoapicError::NotRegistered { gsi_base })?;
        if st.owners.in_use_on(desc.index) {
            klog_warn!(
                "IOAPIC[{}]: pins still in use, cannot unregister",
                desc.index
            );
            return Err(IoapicError::InUse {
                controller: desc.index,
            });
        }

        st.controllers[desc.index] = None;
        st.recompute_bounds();
        {
            let mut hw = self.hw.lock();
            if let Some(slot) = hw.banks.0.get_mut(desc.index) {
                *slot = None;
            }
            if hw.cascade_pin.is_some_and(|b| b.controller == desc.index) {
                hw.cascade_pin = None;
            }
        }
        klog_info!("IOAPIC[{}]: unregistered (GSI base {})", desc.index, gsi_base);
        Ok(())
    }

    pub fn controller_registered(&self, gsi_base: u32) -> bool {
        self.state
            .lock()
            .registered()
            .any(|c| c.gsi_base == gsi_base)
    }

    /// `(controller slot, pin)` serving `gsi`.
    pub fn find_controller_for(&self, gsi: u32) -> IoapicResult<(usize, u32)> {
        let desc = self.state.lock().find_controller_for(gsi)?;
        Ok((desc.index, desc.pin_for(gsi)))
    }

    pub fn controllers(&self) -> Vec<ControllerDesc> {
        self.state.lock().registered().copied().collect()
    }

    pub fn gsi_top(&self) -> u32 {
        self.state.lock().gsi_top
    }

    pub fn dynirq_base(&self) -> u32 {
        self.state.lock().dynirq_base
    }
}
