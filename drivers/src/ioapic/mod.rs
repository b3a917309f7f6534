//! I/O APIC interrupt router.
//!
//! Maps global system interrupts (GSIs) on one or more IO-APICs to logical
//! channels, programs the redirection entries, and services the runtime
//! mask/unmask/ack/affinity operations of those channels.
//!
//! Two locks split the state:
//!
//! - `state` (`spin::Mutex`): controller registry, channel bookkeeping and
//!   the pin-owner index. Taken by allocation and configuration paths.
//! - `hw` (`IrqMutex`): register windows, per-channel lines (pin lists and
//!   cached entries) and the 8259 cascade. Taken by everything that touches
//!   hardware, including interrupt context.
//!
//! `state` is always taken before `hw`. Pin lists change only with both
//! held, so interrupt paths can walk them holding `hw` alone.

pub mod access;
pub mod ack;
pub mod boot;
pub mod channel;
pub mod config;
pub mod controller;
pub mod diag;
pub mod domain;
pub mod entry;
pub mod error;
pub mod pins;
pub mod regs;
pub mod routing;
pub mod suspend;
pub mod timer;

#[cfg(test)]
pub(crate) mod sim;
#[cfg(test)]
mod tests;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use pinroute_firmware::{ElcrLookup, SourceRouting};
use pinroute_lib::{InitFlag, IrqMutex, StateFlag, klog_info};
use spin::{Mutex, Once};

pub use access::{MmioWindow, RegisterBank, RegisterWindow};
pub use channel::{ChannelHandle, ChannelId, MoveOutcome, ReleaseOutcome};
pub use config::RoutingConfig;
pub use controller::{Completion, ControllerConfig, ControllerDesc, DomainKind};
pub use diag::{ChannelDump, ControllerDump, DiagSnapshot};
pub use domain::{CascadeController, DeliveryMessage, LocalApic, ParentDomain, RtcPeriodic};
pub use entry::{DeliveryMode, DestMode, RawEntry, RouteEntry};
pub use error::{IoapicError, IoapicResult};
pub use pins::PinBinding;
pub use routing::AllocFlags;
pub use timer::{TimerPlatform, TimerReport, TimerStage};

use channel::{ChannelMeta, Line};
use controller::ControllerHw;
use pins::{PinList, PinOwners};

pub(crate) struct RoutingState {
    pub(crate) controllers: Vec<Option<ControllerDesc>>,
    pub(crate) channels: BTreeMap<ChannelId, ChannelMeta>,
    pub(crate) owners: PinOwners,
    /// One past the highest GSI of any registered controller.
    pub(crate) gsi_top: u32,
    /// First channel number handed out by dynamic domains.
    pub(crate) dynirq_base: u32,
}

impl RoutingState {
    fn new() -> Self {
        Self {
            controllers: Vec::new(),
            channels: BTreeMap::new(),
            owners: PinOwners::new(),
            gsi_top: 0,
            dynirq_base: channel::NR_LEGACY_CHANNELS,
        }
    }

    pub(crate) fn controller(&self, idx: usize) -> Option<&ControllerDesc> {
        self.controllers.get(idx).and_then(Option::as_ref)
    }

    pub(crate) fn registered(&self) -> impl Iterator<Item = &ControllerDesc> {
        self.controllers.iter().flatten()
    }

    pub(crate) fn index_of_hw_id(&self, hw_id: u8) -> Option<usize> {
        self.registered().find(|c| c.id == hw_id).map(|c| c.index)
    }
}

/// Register windows of all controllers, indexed by registry slot.
pub(crate) struct Banks(pub(crate) Vec<Option<ControllerHw>>);

impl Banks {
    pub(crate) fn get(&mut self, idx: usize) -> Option<&mut ControllerHw> {
        self.0.get_mut(idx).and_then(Option::as_mut)
    }

    /// Write `entry` to each pin. A live entry goes high word first, a
    /// masked one low word first.
    pub(crate) fn program(&mut self, pins: &PinList, entry: &RouteEntry) {
        for b in pins.iter() {
            self.program_pin(b, entry);
        }
    }

    pub(crate) fn program_pin(&mut self, b: PinBinding, entry: &RouteEntry) {
        if let Some(ctl) = self.get(b.controller) {
            let raw = entry.encode(ctl.layout);
            if entry.masked {
                ctl.bank.write_entry_masking(b.pin, raw);
            } else {
                ctl.bank.write_entry(b.pin, raw);
            }
        }
    }

    /// Rewrite only the low word of each pin, with the mask bit from
    /// `entry`.
    pub(crate) fn write_low(&mut self, pins: &PinList, entry: &RouteEntry, sync: bool) {
        for b in pins.iter() {
            if let Some(ctl) = self.get(b.controller) {
                let raw = entry.encode(ctl.layout);
                ctl.bank.write_low(b.pin, raw.low);
                if sync {
                    ctl.bank.sync();
                }
            }
        }
    }

    /// Fully masked, zeroed entry on `b`, low word first.
    pub(crate) fn clear_entry(&mut self, b: PinBinding) {
        if let Some(ctl) = self.get(b.controller) {
            let raw = RouteEntry::MASKED.encode(ctl.layout);
            ctl.bank.write_entry_masking(b.pin, raw);
        }
    }

    pub(crate) fn read(&mut self, b: PinBinding) -> Option<RouteEntry> {
        let ctl = self.get(b.controller)?;
        let raw = ctl.bank.read_entry(b.pin);
        Some(RouteEntry::decode(raw, ctl.layout))
    }

    pub(crate) fn remote_pending(&mut self, pins: &PinList) -> bool {
        pins.iter().any(|b| self.read(b).is_some_and(|e| e.remote_irr))
    }

    pub(crate) fn eoi(&mut self, pins: &PinList, vector: u8) {
        for b in pins.iter() {
            if let Some(ctl) = self.get(b.controller) {
                ctl.eoi_pin(b.pin, vector);
            }
        }
    }
}

pub(crate) struct HwState {
    pub(crate) banks: Banks,
    pub(crate) lines: BTreeMap<ChannelId, Line>,
    pub(crate) cascade: Option<Box<dyn CascadeController>>,
    /// Pin carrying the 8259 ExtINT output, found by `enable`.
    pub(crate) cascade_pin: Option<PinBinding>,
}

impl HwState {
    fn new() -> Self {
        Self {
            banks: Banks(Vec::new()),
            lines: BTreeMap::new(),
            cascade: None,
            cascade_pin: None,
        }
    }
}

/// The interrupt router for every registered IO-APIC.
pub struct Ioapic {
    pub(crate) state: Mutex<RoutingState>,
    pub(crate) hw: IrqMutex<HwState>,
    pub(crate) firmware: Box<dyn SourceRouting>,
    pub(crate) parent: Box<dyn ParentDomain>,
    pub(crate) elcr: Option<Box<dyn ElcrLookup + Send + Sync>>,
    pub(crate) config: RoutingConfig,
    pub(crate) enabled: InitFlag,
    pub(crate) timer_check: StateFlag,
}

impl Ioapic {
    pub fn new(
        firmware: Box<dyn SourceRouting>,
        parent: Box<dyn ParentDomain>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            state: Mutex::new(RoutingState::new()),
            hw: IrqMutex::new(HwState::new()),
            firmware,
            parent,
            elcr: None,
            config,
            enabled: InitFlag::new(),
            timer_check: StateFlag::new(),
        }
    }

    pub fn with_elcr(mut self, elcr: Box<dyn ElcrLookup + Send + Sync>) -> Self {
        self.elcr = Some(elcr);
        self
    }

    pub fn with_cascade(self, cascade: Box<dyn CascadeController>) -> Self {
        self.hw.lock().cascade = Some(cascade);
        self
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Pin carrying the 8259 ExtINT output, once `enable` has found it.
    pub fn cascade_pin(&self) -> Option<PinBinding> {
        self.hw.lock().cascade_pin
    }

    pub(crate) fn elcr(&self) -> Option<&dyn ElcrLookup> {
        self.elcr.as_deref().map(|e| e as &dyn ElcrLookup)
    }

    /// Run `f` on the 8259 cascade, if one was attached.
    pub(crate) fn on_cascade<R>(
        &self,
        f: impl FnOnce(&mut dyn CascadeController) -> R,
    ) -> Option<R> {
        let mut hw = self.hw.lock();
        hw.cascade.as_mut().map(|c| f(c.as_mut()))
    }
}

static IOAPIC: Once<Ioapic> = Once::new();

/// Install the process-wide router. Only the first call takes effect.
pub fn install(ioapic: Ioapic) -> &'static Ioapic {
    let mut fresh = false;
    let installed = IOAPIC.call_once(|| {
        fresh = true;
        ioapic
    });
    if fresh {
        klog_info!("IOAPIC: router installed");
    }
    installed
}

pub fn get() -> Option<&'static Ioapic> {
    IOAPIC.get()
}
