//! GSI → channel resolution and the channel lifecycle.

use alloc::vec::Vec;

use bitflags::bitflags;
use pinroute_firmware::IrqAttrs;
use pinroute_lib::{klog_debug, klog_info};

use super::channel::{
    CASCADE_ISA_IRQ, ChannelHandle, ChannelId, ChannelMeta, Line, LineState, ReleaseOutcome,
};
use super::controller::DomainKind;
use super::entry::RouteEntry;
use super::error::{IoapicError, IoapicResult};
use super::pins::PinBinding;
use super::{HwState, Ioapic, RoutingState};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Create the channel if the pin has none.
        const ALLOC = 1 << 0;
        /// Require a firmware source entry for the pin.
        const CHECK = 1 << 1;
    }
}

impl Ioapic {
    fn default_alloc_flags(&self) -> AllocFlags {
        if self.config.strict {
            AllocFlags::ALLOC | AllocFlags::CHECK
        } else {
            AllocFlags::ALLOC
        }
    }

    /// Map `gsi` to a channel, creating it if needed. `attrs` overrides the
    /// firmware's trigger/polarity for the pin.
    pub fn allocate(&self, gsi: u32, attrs: Option<IrqAttrs>) -> IoapicResult<ChannelHandle> {
        self.resolve_channel(gsi, self.default_alloc_flags(), attrs)
    }

    pub fn free(&self, handle: ChannelHandle) -> IoapicResult<ReleaseOutcome> {
        self.release_channel(handle.channel, handle.binding)
    }

    pub fn resolve_channel(
        &self,
        gsi: u32,
        flags: AllocFlags,
        hint: Option<IrqAttrs>,
    ) -> IoapicResult<ChannelHandle> {
        self.complete_deferred_releases();

        let mut st = self.state.lock();
        let desc = st.find_controller_for(gsi)?;
        let pin = desc.pin_for(gsi);
        let binding = PinBinding::new(desc.index, pin);

        let source = self.firmware.lookup_source_routing(desc.id, pin);
        if source.is_none() && flags.contains(AllocFlags::CHECK) {
            return Err(IoapicError::NoSourceEntry { gsi });
        }
        let isa_irq = source.and_then(|s| s.isa_irq());
        if isa_irq == Some(CASCADE_ISA_IRQ) {
            return Err(IoapicError::Reserved {
                isa_irq: CASCADE_ISA_IRQ,
            });
        }

        let existing = match isa_irq {
            Some(irq) => {
                let ch = ChannelId(irq as u32);
                st.channels.contains_key(&ch).then_some(ch)
            }
            None => st.owners.owner(binding),
        };

        if !flags.contains(AllocFlags::ALLOC) {
            return existing
                .map(|channel| ChannelHandle { channel, binding })
                .ok_or(IoapicError::NotMapped { gsi });
        }

        let attrs = match (hint, source) {
            (Some(attrs), _) => attrs,
            (None, Some(src)) => self.firmware.bus_defaults().resolve(&src, self.elcr())?,
            (None, None) => IrqAttrs::LEVEL_LOW,
        };

        let channel = match existing {
            Some(ch) => {
                self.claim_existing(&mut st, ch, binding, attrs)?;
                ch
            }
            None => {
                let ch = match isa_irq {
                    Some(irq) => ChannelId(irq as u32),
                    None => pick_channel_number(&st, desc.domain, gsi),
                };
                self.create_channel(&mut st, ch, binding, attrs, gsi, isa_irq.is_some())?;
                ch
            }
        };
        Ok(ChannelHandle { channel, binding })
    }

    fn claim_existing(
        &self,
        st: &mut RoutingState,
        ch: ChannelId,
        binding: PinBinding,
        attrs: IrqAttrs,
    ) -> IoapicResult<()> {
        if let Some(owner) = st.owners.owner(binding) {
            if owner != ch {
                return Err(IoapicError::AlreadyBound { binding, owner });
            }
        }
        let meta = st
            .channels
            .get_mut(&ch)
            .ok_or(IoapicError::UnknownChannel(ch))?;
        if meta.releasing {
            return Err(IoapicError::Busy { channel: ch });
        }

        // Boot programmed legacy pins with guessed attributes; the first
        // claimant knows better.
        let mut corrected = false;
        if meta.attrs != attrs {
            if meta.preprovisioned && ch.legacy_irq().is_some() && meta.count() == 1 {
                klog_info!(
                    "IOAPIC: channel {} attributes {} -> {}",
                    ch,
                    meta.attrs,
                    attrs
                );
                meta.attrs = attrs;
                corrected = true;
            } else {
                klog_debug!(
                    "IOAPIC: channel {} is {}, claimant wants {}",
                    ch,
                    meta.attrs,
                    attrs
                );
                return Err(IoapicError::Busy { channel: ch });
            }
        }
        meta.preprovisioned = false;

        let newly_bound = st.owners.bind(ch, binding)?;
        let mut guard = self.hw.lock();
        let hw: &mut HwState = &mut guard;
        let line = hw
            .lines
            .get_mut(&ch)
            .ok_or(IoapicError::UnknownChannel(ch))?;
        if newly_bound {
            if let Err(err) = line.pins.push(binding) {
                st.owners.unbind(ch, binding);
                return Err(err);
            }
        }
        if corrected {
            line.entry = line.entry.with_attrs(attrs);
            if attrs.is_level() {
                line.entry.masked = true;
            }
            hw.banks.program(&line.pins, &line.entry);
        } else if newly_bound {
            hw.banks.program_pin(binding, &line.entry);
        }
        drop(guard);

        if let Some(meta) = st.channels.get_mut(&ch) {
            meta.add_user(binding);
        }
        Ok(())
    }

    pub(crate) fn create_channel(
        &self,
        st: &mut RoutingState,
        ch: ChannelId,
        binding: PinBinding,
        attrs: IrqAttrs,
        gsi: u32,
        isa: bool,
    ) -> IoapicResult<()> {
        let msg = self.parent.compose_delivery_message(ch)?;
        let mut entry = msg.apply(RouteEntry::MASKED).with_attrs(attrs);
        entry.masked = attrs.is_level();

        if let Err(err) = st.owners.bind(ch, binding) {
            self.parent.release(ch);
            return Err(err);
        }
        let mut line = Line::new(entry);
        if let Err(err) = line.pins.push(binding) {
            st.owners.unbind(ch, binding);
            self.parent.release(ch);
            return Err(err);
        }

        {
            let mut hw = self.hw.lock();
            hw.banks.program_pin(binding, &entry);
            hw.lines.insert(ch, line);
        }

        let mut meta = ChannelMeta::new(attrs, gsi, isa);
        meta.add_user(binding);
        st.channels.insert(ch, meta);

        klog_debug!(
            "IOAPIC: GSI {} (pin {}) -> channel {}, vector 0x{:x}, {}",
            gsi,
            binding,
            ch,
            entry.vector,
            attrs
        );
        Ok(())
    }

    /// Drop one claim on `binding`. The channel is torn down when its last
    /// claim goes, unless it is an ISA channel.
    pub fn release_channel(
        &self,
        channel: ChannelId,
        binding: PinBinding,
    ) -> IoapicResult<ReleaseOutcome> {
        self.complete_deferred_releases();

        let mut st_guard = self.state.lock();
        let st: &mut RoutingState = &mut st_guard;
        let meta = st
            .channels
            .get_mut(&channel)
            .ok_or(IoapicError::UnknownChannel(channel))?;
        if meta.isa {
            return Ok(ReleaseOutcome::Retained);
        }
        match meta.drop_user(binding) {
            None => return Err(IoapicError::UnknownChannel(channel)),
            Some(false) => return Ok(ReleaseOutcome::Retained),
            Some(true) => {}
        }

        if meta.count() > 0 {
            st.owners.unbind(channel, binding);
            let mut hw = self.hw.lock();
            if let Some(line) = hw.lines.get_mut(&channel) {
                line.pins.remove(binding);
            }
            hw.banks.clear_entry(binding);
            return Ok(ReleaseOutcome::Unbound);
        }

        meta.releasing = true;
        let mut guard = self.hw.lock();
        let hw: &mut HwState = &mut guard;
        let line = hw
            .lines
            .get_mut(&channel)
            .ok_or(IoapicError::UnknownChannel(channel))?;
        line.entry.masked = true;
        hw.banks.write_low(&line.pins, &line.entry, self.config.mask_sync);
        if line.entry.is_level() && hw.banks.remote_pending(&line.pins) {
            line.state = LineState::TeardownPending;
            klog_debug!("IOAPIC: channel {} release deferred, remote IRR set", channel);
            return Ok(ReleaseOutcome::Deferred);
        }
        self.finish_teardown(st, hw, channel);
        Ok(ReleaseOutcome::Released)
    }

    fn finish_teardown(&self, st: &mut RoutingState, hw: &mut HwState, channel: ChannelId) {
        if let Some(line) = hw.lines.remove(&channel) {
            for b in line.pins.iter() {
                hw.banks.clear_entry(b);
                st.owners.unbind(channel, b);
            }
        }
        st.channels.remove(&channel);
        self.parent.release(channel);
        klog_debug!("IOAPIC: channel {} released", channel);
    }

    /// Finish teardowns whose remote IRR has since cleared. Returns the
    /// channels released.
    pub fn complete_deferred_releases(&self) -> Vec<ChannelId> {
        let mut st = self.state.lock();
        let mut guard = self.hw.lock();
        let hw: &mut HwState = &mut guard;

        let waiting: Vec<ChannelId> = hw
            .lines
            .iter()
            .filter(|(_, l)| l.state != LineState::Active)
            .map(|(ch, _)| *ch)
            .collect();

        let mut done = Vec::new();
        for ch in waiting {
            let ready = match hw.lines.get(&ch) {
                Some(line) => match line.state {
                    LineState::Quiesced => true,
                    LineState::TeardownPending => !hw.banks.remote_pending(&line.pins),
                    LineState::Active => false,
                },
                None => false,
            };
            if ready {
                self.finish_teardown(&mut st, hw, ch);
                done.push(ch);
            }
        }
        done
    }

    /// Recompose the channel's entry from the parent domain and rewrite it
    /// on every pin. The mask state is preserved.
    pub fn reprogram(&self, channel: ChannelId) -> IoapicResult<()> {
        let st = self.state.lock();
        let meta = st
            .channels
            .get(&channel)
            .ok_or(IoapicError::UnknownChannel(channel))?;
        let msg = self.parent.compose_delivery_message(channel)?;

        let mut guard = self.hw.lock();
        let hw: &mut HwState = &mut guard;
        let line = hw
            .lines
            .get_mut(&channel)
            .ok_or(IoapicError::UnknownChannel(channel))?;
        line.entry = msg.apply(line.entry).with_attrs(meta.attrs);
        hw.banks.program(&line.pins, &line.entry);
        Ok(())
    }

    fn check_binding(st: &RoutingState, binding: PinBinding) -> IoapicResult<()> {
        match st.controller(binding.controller) {
            Some(desc) if binding.pin < desc.pin_count => Ok(()),
            Some(desc) => Err(IoapicError::NoController {
                gsi: desc.gsi_for(binding.pin),
            }),
            None => Err(IoapicError::NoSuchController {
                index: binding.controller,
            }),
        }
    }

    /// Add `binding` to `channel`'s pins and program it with the channel's
    /// current entry. A no-op if the pin already feeds this channel.
    pub fn bind_pin(&self, channel: ChannelId, binding: PinBinding) -> IoapicResult<()> {
        let mut st = self.state.lock();
        Self::check_binding(&st, binding)?;
        if !st.channels.contains_key(&channel) {
            return Err(IoapicError::UnknownChannel(channel));
        }
        if !st.owners.bind(channel, binding)? {
            return Ok(());
        }

        let mut guard = self.hw.lock();
        let hw: &mut HwState = &mut guard;
        let Some(line) = hw.lines.get_mut(&channel) else {
            st.owners.unbind(channel, binding);
            return Err(IoapicError::UnknownChannel(channel));
        };
        if let Err(err) = line.pins.push(binding) {
            st.owners.unbind(channel, binding);
            return Err(err);
        }
        hw.banks.program_pin(binding, &line.entry);
        Ok(())
    }

    /// Detach `binding` from `channel` and clear its entry.
    pub fn unbind_pin(&self, channel: ChannelId, binding: PinBinding) -> IoapicResult<()> {
        let mut st = self.state.lock();
        if !st.owners.unbind(channel, binding) {
            return Err(IoapicError::UnknownChannel(channel));
        }
        if let Some(meta) = st.channels.get_mut(&channel) {
            meta.users.retain(|(b, _)| *b != binding);
        }
        let mut hw = self.hw.lock();
        if let Some(line) = hw.lines.get_mut(&channel) {
            line.pins.remove(binding);
        }
        hw.banks.clear_entry(binding);
        Ok(())
    }

    /// Move `channel` from pin `old` to pin `new`, keeping its place in the
    /// pin list. `old` is cleared, `new` gets the current entry.
    pub fn reassign_pin(
        &self,
        channel: ChannelId,
        old: PinBinding,
        new: PinBinding,
    ) -> IoapicResult<()> {
        if old == new {
            return Ok(());
        }
        let mut st = self.state.lock();
        Self::check_binding(&st, new)?;
        st.owners.reassign(channel, old, new)?;
        if let Some(meta) = st.channels.get_mut(&channel) {
            for (b, _) in meta.users.iter_mut() {
                if *b == old {
                    *b = new;
                }
            }
        }

        let mut guard = self.hw.lock();
        let hw: &mut HwState = &mut guard;
        let line = hw
            .lines
            .get_mut(&channel)
            .ok_or(IoapicError::UnknownChannel(channel))?;
        if !line.pins.replace(old, new) {
            line.pins.push(new)?;
        }
        hw.banks.clear_entry(old);
        hw.banks.program_pin(new, &line.entry);
        Ok(())
    }

    /// Visit `channel`'s pins in binding order, under the hardware lock.
    pub fn for_each_pin(
        &self,
        channel: ChannelId,
        mut f: impl FnMut(PinBinding),
    ) -> IoapicResult<()> {
        let hw = self.hw.lock();
        let line = hw
            .lines
            .get(&channel)
            .ok_or(IoapicError::UnknownChannel(channel))?;
        line.pins.iter().for_each(&mut f);
        Ok(())
    }

    pub fn channel_pins(&self, channel: ChannelId) -> Vec<PinBinding> {
        let mut pins = Vec::new();
        let _ = self.for_each_pin(channel, |b| pins.push(b));
        pins
    }

    pub fn channel_attrs(&self, channel: ChannelId) -> Option<IrqAttrs> {
        self.state.lock().channels.get(&channel).map(|m| m.attrs)
    }

    pub fn channel_count(&self, channel: ChannelId) -> Option<u32> {
        self.state.lock().channels.get(&channel).map(|m| m.count())
    }

    /// Cached entry last written for `channel`.
    pub fn channel_entry(&self, channel: ChannelId) -> Option<RouteEntry> {
        self.hw.lock().lines.get(&channel).map(|l| l.entry)
    }

    pub fn channel_for_gsi(&self, gsi: u32) -> Option<ChannelId> {
        let st = self.state.lock();
        let desc = st.find_controller_for(gsi).ok()?;
        st.owners
            .owner(PinBinding::new(desc.index, desc.pin_for(gsi)))
    }
}

/// Channel number for a non-ISA pin.
fn pick_channel_number(st: &RoutingState, domain: DomainKind, gsi: u32) -> ChannelId {
    if domain != DomainKind::Dynamic {
        let identity = ChannelId(gsi);
        if !st.channels.contains_key(&identity) {
            return identity;
        }
    }
    let mut n = st.dynirq_base;
    while st.channels.contains_key(&ChannelId(n)) {
        n += 1;
    }
    ChannelId(n)
}
