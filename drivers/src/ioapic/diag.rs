//! Routing dump for fatal paths and debugging.

use alloc::vec::Vec;

use pinroute_firmware::IrqAttrs;
use pinroute_lib::klog_info;

use super::channel::ChannelId;
use super::controller::ControllerDesc;
use super::entry::RouteEntry;
use super::pins::PinBinding;
use super::{HwState, Ioapic};

#[derive(Clone, Debug)]
pub struct ControllerDump {
    pub desc: ControllerDesc,
    /// Decoded entry of every pin, read from hardware.
    pub entries: Vec<RouteEntry>,
}

#[derive(Clone, Debug)]
pub struct ChannelDump {
    pub channel: ChannelId,
    pub attrs: IrqAttrs,
    pub pins: Vec<PinBinding>,
}

#[derive(Clone, Debug, Default)]
pub struct DiagSnapshot {
    pub controllers: Vec<ControllerDump>,
    pub channels: Vec<ChannelDump>,
}

impl DiagSnapshot {
    pub fn log(&self) {
        for dump in &self.controllers {
            let d = &dump.desc;
            klog_info!(
                "IOAPIC[{}]: id 0x{:02x} version 0x{:02x} GSI {}-{}",
                d.index,
                d.id,
                d.version,
                d.gsi_base,
                d.gsi_end()
            );
            for (pin, entry) in dump.entries.iter().enumerate() {
                if entry.masked && entry.vector == 0 {
                    continue;
                }
                klog_info!("  pin {:02}: {}", pin, entry);
            }
        }
        klog_info!("IOAPIC: channel -> pins");
        for ch in &self.channels {
            klog_info!("  {:3} {} {:?}", ch.channel.0, ch.attrs, ch.pins);
        }
    }
}

impl Ioapic {
    pub fn diagnostics(&self) -> DiagSnapshot {
        let st = self.state.lock();
        let mut guard = self.hw.lock();
        let hw: &mut HwState = &mut guard;

        let controllers = st
            .registered()
            .map(|desc| ControllerDump {
                desc: *desc,
                entries: (0..desc.pin_count)
                    .filter_map(|pin| hw.banks.read(PinBinding::new(desc.index, pin)))
                    .collect(),
            })
            .collect();

        let channels = st
            .channels
            .iter()
            .map(|(ch, meta)| ChannelDump {
                channel: *ch,
                attrs: meta.attrs,
                pins: hw
                    .lines
                    .get(ch)
                    .map(|l| l.pins.iter().collect())
                    .unwrap_or_default(),
            })
            .collect();

        DiagSnapshot {
            controllers,
            channels,
        }
    }
}
