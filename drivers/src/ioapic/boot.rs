//! Boot-time bring-up: find the 8259 cascade pin, clear stale entries,
//! pre-provision the legacy channels, and hand the pins back on shutdown.

use alloc::vec::Vec;

use pinroute_firmware::{IrqAttrs, Polarity, SourceKind, Trigger};
use pinroute_lib::{klog_debug, klog_error, klog_info, klog_warn};

use super::channel::ChannelId;
use super::entry::{DeliveryMode, DestMode, RouteEntry};
use super::error::{IoapicError, IoapicResult};
use super::pins::PinBinding;
use super::routing::AllocFlags;
use super::timer::{TimerPlatform, TimerReport};
use super::{HwState, Ioapic};

impl Ioapic {
    /// Locate the pin the 8259 feeds (an unmasked ExtINT entry left by
    /// firmware), check it against the firmware tables, then clear every
    /// pin. Runs once.
    pub fn enable(&self) {
        if !self.enabled.init_once() {
            return;
        }

        {
            let st = self.state.lock();
            let mut guard = self.hw.lock();
            let hw: &mut HwState = &mut guard;

            let mut in_hw = None;
            'scan: for desc in st.registered() {
                for pin in 0..desc.pin_count {
                    let b = PinBinding::new(desc.index, pin);
                    if let Some(e) = hw.banks.read(b) {
                        if !e.masked && e.delivery_mode == DeliveryMode::ExtInt {
                            in_hw = Some(b);
                            break 'scan;
                        }
                    }
                }
            }

            let in_fw = self
                .firmware
                .find_isa_pin(0, SourceKind::ExtInt)
                .and_then(|(id, pin)| st.index_of_hw_id(id).map(|i| PinBinding::new(i, pin)));

            let found = match (in_hw, in_fw) {
                (None, Some(fw)) => {
                    klog_warn!("IOAPIC: ExtINT not set up in hardware but reported by firmware");
                    Some(fw)
                }
                (Some(h), Some(fw)) if h != fw => {
                    klog_warn!("IOAPIC: ExtINT in hardware ({}) and firmware ({}) differ", h, fw);
                    Some(h)
                }
                (h, _) => h,
            };
            if let Some(b) = found {
                klog_info!("IOAPIC: 8259 cascade on pin {}", b);
            }
            hw.cascade_pin = found;
        }

        self.clear_all();
    }

    /// Force a pin back to a masked, idle entry. SMI pins are left alone.
    /// Fails if remote IRR will not clear.
    pub fn clear_pin(&self, binding: PinBinding) -> IoapicResult<()> {
        let mut hw = self.hw.lock();
        let ctl = hw
            .banks
            .get(binding.controller)
            .ok_or(IoapicError::NoSuchController {
                index: binding.controller,
            })?;
        let layout = ctl.layout;
        let pin = binding.pin;

        let mut e = RouteEntry::decode(ctl.bank.read_entry(pin), layout);
        if e.delivery_mode == DeliveryMode::Smi {
            return Ok(());
        }
        if !e.masked {
            e.masked = true;
            ctl.bank.write_entry_masking(pin, e.encode(layout));
            e = RouteEntry::decode(ctl.bank.read_entry(pin), layout);
        }
        if e.remote_irr {
            // Only a level entry accepts the EOI that clears IRR.
            if !e.is_level() {
                e.trigger = Trigger::Level;
                ctl.bank.write_entry_masking(pin, e.encode(layout));
            }
            ctl.eoi_pin(pin, e.vector);
        }

        ctl.bank
            .write_entry_masking(pin, RouteEntry::MASKED.encode(layout));
        let after = RouteEntry::decode(ctl.bank.read_entry(pin), layout);
        if after.remote_irr {
            klog_error!("IOAPIC: unable to reset IRR on pin {}", binding);
            return Err(IoapicError::RemotePendingStuck {
                controller: binding.controller,
                pin,
            });
        }
        Ok(())
    }

    /// `clear_pin` on every pin of every controller.
    pub fn clear_all(&self) {
        let pins: Vec<PinBinding> = self
            .state
            .lock()
            .registered()
            .flat_map(|d| (0..d.pin_count).map(move |p| PinBinding::new(d.index, p)))
            .collect();
        for b in pins {
            // Failures are logged by clear_pin; keep going.
            let _ = self.clear_pin(b);
        }
    }

    /// Pre-provision every firmware-connected pin of the first controller
    /// with default attributes. Returns the number of channels set up.
    pub fn setup_legacy_channels(&self) -> usize {
        let Some(first) = self.controllers().into_iter().next() else {
            return 0;
        };

        let mut count = 0;
        for pin in 0..first.pin_count {
            if self.firmware.lookup_source_routing(first.id, pin).is_none() {
                klog_debug!("IOAPIC[{}]: pin {} not connected", first.index, pin);
                continue;
            }
            let gsi = first.gsi_for(pin);
            match self.resolve_channel(gsi, AllocFlags::ALLOC, None) {
                Ok(handle) => {
                    if handle.channel.legacy_irq().is_some() {
                        if let Some(meta) = self.state.lock().channels.get_mut(&handle.channel) {
                            meta.preprovisioned = true;
                        }
                    }
                    count += 1;
                }
                Err(IoapicError::Reserved { .. }) => {}
                Err(err) => {
                    klog_warn!("IOAPIC: GSI {} not set up: {}", gsi, err);
                }
            }
        }
        klog_info!("IOAPIC: {} legacy channels provisioned", count);
        count
    }

    /// Full boot sequence: enable, provision legacy channels, route the
    /// timer.
    pub fn setup(&self, platform: &mut dyn TimerPlatform) -> IoapicResult<TimerReport> {
        self.enable();
        self.setup_legacy_channels();
        self.check_timer(platform)
    }

    /// Shutdown/kexec: clear everything and put the cascade pin back into
    /// ExtINT virtual-wire mode aimed at `apic_id`.
    pub fn restore_boot_irq_mode(&self, apic_id: u32) {
        self.clear_all();
        let mut hw = self.hw.lock();
        let Some(b) = hw.cascade_pin else {
            return;
        };
        let entry = RouteEntry {
            vector: 0,
            delivery_mode: DeliveryMode::ExtInt,
            dest_mode: DestMode::Physical,
            polarity: Polarity::ActiveHigh,
            trigger: Trigger::Edge,
            masked: false,
            destination: apic_id as u16,
            ..RouteEntry::MASKED
        };
        hw.banks.program_pin(b, &entry);
        klog_info!("IOAPIC: pin {} restored to ExtINT virtual wire", b);
    }

    /// Channel 0 bound to `pin`, created edge/high if it does not exist.
    pub(crate) fn ensure_timer_channel(&self, pin: PinBinding) -> IoapicResult<()> {
        let timer = ChannelId(0);
        if self.channel_attrs(timer).is_some() {
            return self.bind_pin(timer, pin);
        }
        let mut st = self.state.lock();
        let gsi = st
            .controller(pin.controller)
            .map(|d| d.gsi_for(pin.pin))
            .ok_or(IoapicError::NoSuchController {
                index: pin.controller,
            })?;
        self.create_channel(&mut st, timer, pin, IrqAttrs::EDGE_HIGH, gsi, true)
    }
}
