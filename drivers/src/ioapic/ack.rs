//! Runtime interrupt-path operations: mask, unmask, startup, acknowledge
//! and affinity changes.
//!
//! Everything here takes only the hardware lock, so it is safe from
//! interrupt context.

use pinroute_lib::{klog_debug, klog_trace};

use super::channel::{ChannelId, LineState, MoveOutcome};
use super::error::{IoapicError, IoapicResult};
use super::{HwState, Ioapic};

impl Ioapic {
    /// Set the mask bit on every pin. Only the low word is written.
    pub fn mask(&self, channel: ChannelId) -> IoapicResult<()> {
        let mut guard = self.hw.lock();
        let hw: &mut HwState = &mut guard;
        let line = hw
            .lines
            .get_mut(&channel)
            .ok_or(IoapicError::UnknownChannel(channel))?;
        line.entry.masked = true;
        line.masked_for_move = false;
        hw.banks
            .write_low(&line.pins, &line.entry, self.config.mask_sync);
        Ok(())
    }

    pub fn unmask(&self, channel: ChannelId) -> IoapicResult<()> {
        let mut guard = self.hw.lock();
        Self::unmask_locked(&mut guard, channel)
    }

    fn unmask_locked(hw: &mut HwState, channel: ChannelId) -> IoapicResult<()> {
        // The same source may also reach the 8259; keep it quiet there.
        if let (Some(irq), Some(cascade)) = (channel.legacy_irq(), hw.cascade.as_mut()) {
            cascade.mask(irq);
        }
        let line = hw
            .lines
            .get_mut(&channel)
            .ok_or(IoapicError::UnknownChannel(channel))?;
        line.entry.masked = false;
        line.masked_for_move = false;
        hw.banks.program(&line.pins, &line.entry);
        Ok(())
    }

    /// Unmask a channel for the first time. Returns whether the 8259 had
    /// the line pending, in which case the caller should replay it.
    pub fn startup(&self, channel: ChannelId) -> IoapicResult<bool> {
        let mut guard = self.hw.lock();
        let hw: &mut HwState = &mut guard;
        let mut was_pending = false;
        if let (Some(irq), Some(cascade)) = (channel.legacy_irq(), hw.cascade.as_mut()) {
            cascade.mask(irq);
            was_pending = cascade.is_pending(irq);
        }
        Self::unmask_locked(hw, channel)?;
        Ok(was_pending)
    }

    /// Complete a level-triggered interrupt at the controller. Edge
    /// channels need nothing here.
    ///
    /// Also finishes a deferred migration and marks a pending teardown
    /// quiesced once remote IRR has cleared.
    pub fn acknowledge(&self, channel: ChannelId) -> IoapicResult<()> {
        let mut guard = self.hw.lock();
        let hw: &mut HwState = &mut guard;
        let line = hw
            .lines
            .get_mut(&channel)
            .ok_or(IoapicError::UnknownChannel(channel))?;
        if !line.entry.is_level() {
            return Ok(());
        }

        // A level line never moves while live.
        if line.pending_move.is_some() && !line.entry.masked {
            line.entry.masked = true;
            line.masked_for_move = true;
            hw.banks.write_low(&line.pins, &line.entry, true);
        }

        hw.banks.eoi(&line.pins, line.entry.vector);

        if line.pending_move.is_some() || line.state == LineState::TeardownPending {
            let pending = hw.banks.remote_pending(&line.pins);
            if !pending {
                if let Some(msg) = line.pending_move.take() {
                    line.entry = msg.apply(line.entry);
                    if line.masked_for_move {
                        line.entry.masked = false;
                        line.masked_for_move = false;
                    }
                    hw.banks.program(&line.pins, &line.entry);
                    klog_debug!(
                        "IOAPIC: channel {} moved to dest 0x{:x} vector 0x{:x}",
                        channel,
                        msg.destination,
                        msg.vector
                    );
                }
                if line.state == LineState::TeardownPending {
                    line.state = LineState::Quiesced;
                }
            } else {
                klog_trace!("IOAPIC: channel {} remote IRR still set after EOI", channel);
            }
        }
        Ok(())
    }

    /// Retarget a channel. Edge channels move at once; level channels move
    /// only while remote IRR is clear, otherwise the move waits for the next
    /// acknowledgment with the line masked.
    pub fn set_affinity(&self, channel: ChannelId, destination: u16) -> IoapicResult<MoveOutcome> {
        let msg = self.parent.retarget(channel, destination)?;

        let mut guard = self.hw.lock();
        let hw: &mut HwState = &mut guard;
        let line = hw
            .lines
            .get_mut(&channel)
            .ok_or(IoapicError::UnknownChannel(channel))?;

        if !line.entry.is_level() {
            line.entry = msg.apply(line.entry);
            line.pending_move = None;
            hw.banks.program(&line.pins, &line.entry);
            return Ok(MoveOutcome::Applied);
        }

        let was_masked = line.entry.masked;
        if !was_masked {
            line.entry.masked = true;
            hw.banks.write_low(&line.pins, &line.entry, true);
        }

        if hw.banks.remote_pending(&line.pins) {
            line.pending_move = Some(msg);
            line.masked_for_move |= !was_masked;
            klog_debug!("IOAPIC: channel {} move deferred, remote IRR set", channel);
            return Ok(MoveOutcome::Deferred);
        }

        line.entry = msg.apply(line.entry);
        line.entry.masked = was_masked && !line.masked_for_move;
        line.masked_for_move = false;
        line.pending_move = None;
        hw.banks.program(&line.pins, &line.entry);
        Ok(MoveOutcome::Applied)
    }

    /// True while any pin of a level channel has remote IRR set.
    pub fn query_remote_pending(&self, channel: ChannelId) -> IoapicResult<bool> {
        let mut guard = self.hw.lock();
        let hw: &mut HwState = &mut guard;
        let line = hw
            .lines
            .get(&channel)
            .ok_or(IoapicError::UnknownChannel(channel))?;
        Ok(line
            .pins
            .iter()
            .filter_map(|b| hw.banks.read(b))
            .any(|e| e.remote_irr && e.is_level()))
    }
}
