//! Suspend and resume.
//!
//! Entries are snapshotted raw, one per pin, and written back in
//! programming order on resume. Firmware may have reset the id register
//! across the sleep, so it is checked and rewritten first.

use pinroute_lib::{klog_debug, klog_error, klog_info, klog_warn};

use super::controller::ControllerHw;
use super::entry::RawEntry;
use super::error::{IoapicError, IoapicResult};
use super::regs::{IOAPIC_ID_MASK, IOAPIC_ID_SHIFT, IOAPIC_REG_ID, id_from_reg};
use super::{HwState, Ioapic};

/// Fails on the first pin whose writable bits differ from the snapshot.
fn verify_controller(index: usize, ctl: &mut ControllerHw) -> IoapicResult<()> {
    let layout = ctl.layout;
    let stale = (0..ctl.pin_count).find(|&pin| {
        let want = ctl.saved[pin as usize].writable_bits(layout);
        ctl.bank.read_entry(pin).writable_bits(layout) != want
    });
    match stale {
        Some(pin) => Err(IoapicError::ReadbackMismatch {
            controller: index,
            pin,
        }),
        None => Ok(()),
    }
}

fn fix_id(index: usize, ctl: &mut ControllerHw) {
    let reg0 = ctl.bank.read(IOAPIC_REG_ID);
    let found = id_from_reg(reg0);
    if found != ctl.hw_id {
        klog_warn!(
            "IOAPIC[{}]: id {} after resume, restoring {}",
            index,
            found,
            ctl.hw_id
        );
        ctl.bank.write(
            IOAPIC_REG_ID,
            (reg0 & !IOAPIC_ID_MASK) | ((ctl.hw_id as u32) << IOAPIC_ID_SHIFT),
        );
    }
}

fn restore_controller(ctl: &mut ControllerHw) {
    let layout = ctl.layout;
    for pin in 0..ctl.pin_count {
        let raw = ctl.saved[pin as usize];
        if raw.is_masked(layout) {
            ctl.bank.write_entry_masking(pin, raw);
        } else {
            ctl.bank.write_entry(pin, raw);
        }
    }
}

impl Ioapic {
    /// Snapshot every pin of every controller.
    pub fn save_entries(&self) {
        let mut hw = self.hw.lock();
        for ctl in hw.banks.0.iter_mut().flatten() {
            for pin in 0..ctl.pin_count {
                let raw = ctl.bank.read_entry(pin);
                ctl.saved[pin as usize] = raw;
            }
        }
    }

    /// Mask every pin whose snapshot is unmasked. Needs a prior
    /// `save_entries`.
    pub fn mask_all_entries(&self) {
        let mut hw = self.hw.lock();
        for ctl in hw.banks.0.iter_mut().flatten() {
            let layout = ctl.layout;
            for pin in 0..ctl.pin_count {
                let mut raw: RawEntry = ctl.saved[pin as usize];
                if raw.is_masked(layout) {
                    continue;
                }
                layout.mask.set(&mut raw.low, &mut raw.high, 1);
                ctl.bank.write_entry_masking(pin, raw);
            }
        }
    }

    /// Write the snapshot back verbatim.
    pub fn restore_entries(&self) {
        let mut hw = self.hw.lock();
        for ctl in hw.banks.0.iter_mut().flatten() {
            restore_controller(ctl);
        }
    }

    pub fn suspend(&self) {
        self.save_entries();
        self.mask_all_entries();
        klog_debug!("IOAPIC: entries saved and masked");
    }

    /// Restore controllers in reverse registration order, re-restoring a
    /// controller whose entries do not read back as saved. Gives up after
    /// `reinit_limit` attempts on one controller.
    pub fn resume(&self) -> IoapicResult<()> {
        let limit = self.config.reinit_limit.max(1);
        let mut guard = self.hw.lock();
        let hw: &mut HwState = &mut guard;

        for (index, slot) in hw.banks.0.iter_mut().enumerate().rev() {
            let Some(ctl) = slot.as_mut() else {
                continue;
            };
            fix_id(index, ctl);

            let mut attempts = 0;
            loop {
                restore_controller(ctl);
                attempts += 1;
                let err = match verify_controller(index, ctl) {
                    Ok(()) => break,
                    Err(err) => err,
                };
                if attempts >= limit {
                    klog_error!("IOAPIC[{}]: {} after {} restores", index, err, attempts);
                    return Err(IoapicError::ReinitLimit { attempts });
                }
                klog_warn!("IOAPIC[{}]: {}, restoring again", index, err);
            }
        }
        klog_info!("IOAPIC: resumed");
        Ok(())
    }

    /// [`Ioapic::resume`], but a controller that will not take its entries
    /// back is fatal: dump the routing state and halt.
    pub fn resume_or_halt(&self) {
        if let Err(err) = self.resume() {
            self.diagnostics().log();
            panic!("IO-APIC resume failed ({})", err);
        }
    }
}
