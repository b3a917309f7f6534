//! Router scenarios against simulated controllers.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use pinroute_firmware::{IrqAttrs, SourceKind, SourceRoute, SourceTable, Trigger};
use proptest::prelude::*;
use spin::Mutex;

use super::sim::{Access, SimIoapic};
use super::*;
use crate::rtc::{RTC_CONTROL, RTC_FREQ_SELECT, RTC_INTR_FLAGS, RTC_PF, RTC_PIE};

const BASE: u64 = 0xFEC0_0000;

const fn pin(p: u32) -> PinBinding {
    PinBinding::new(0, p)
}

/// ExtINT on pin 0, IRQ0 overridden to pin 2, other ISA IRQs identity
/// mapped (no IRQ2), PCI on pins 16-19. Pins 20-23 are unconnected.
fn legacy_table() -> SourceTable {
    let mut t = SourceTable::new();
    t.save(SourceRoute::isa(0, 0, 0, 0).with_kind(SourceKind::ExtInt))
        .unwrap();
    t.save(SourceRoute::isa(0, 0, 2, 0)).unwrap();
    for irq in (1..16u8).filter(|&i| i != 2) {
        t.save(SourceRoute::isa(irq, 0, irq as u32, 0)).unwrap();
    }
    for p in 16..20u32 {
        t.save(SourceRoute::pci(p as u8, 0, p)).unwrap();
    }
    t
}

/// Vector 0x30 + channel, destination as asked.
struct FakeParent {
    released: Arc<Mutex<Vec<ChannelId>>>,
}

impl ParentDomain for FakeParent {
    fn compose_delivery_message(&self, channel: ChannelId) -> IoapicResult<DeliveryMessage> {
        Ok(DeliveryMessage::fixed(0x30 + channel.0 as u8, 0))
    }

    fn retarget(&self, channel: ChannelId, destination: u16) -> IoapicResult<DeliveryMessage> {
        Ok(DeliveryMessage::fixed(0x30 + channel.0 as u8, destination))
    }

    fn release(&self, channel: ChannelId) {
        self.released.lock().push(channel);
    }
}

#[derive(Default)]
struct CascadeLog {
    masked: u16,
    pending: u16,
    inits: Vec<bool>,
}

struct FakeCascade(Arc<Mutex<CascadeLog>>);

impl CascadeController for FakeCascade {
    fn init(&mut self, auto_eoi: bool) {
        self.0.lock().inits.push(auto_eoi);
    }

    fn mask(&mut self, irq: u8) {
        self.0.lock().masked |= 1 << irq;
    }

    fn unmask(&mut self, irq: u8) {
        self.0.lock().masked &= !(1 << irq);
    }

    fn is_pending(&mut self, irq: u8) -> bool {
        self.0.lock().pending & (1 << irq) != 0
    }
}

struct Fixture {
    ioapic: Ioapic,
    sim: SimIoapic,
    released: Arc<Mutex<Vec<ChannelId>>>,
    cascade: Arc<Mutex<CascadeLog>>,
}

fn fixture_with(table: SourceTable, config: RoutingConfig, version: u8) -> Fixture {
    let released = Arc::new(Mutex::new(Vec::new()));
    let cascade = Arc::new(Mutex::new(CascadeLog::default()));
    let ioapic = Ioapic::new(
        Box::new(table),
        Box::new(FakeParent {
            released: released.clone(),
        }),
        config,
    )
    .with_cascade(Box::new(FakeCascade(cascade.clone())));
    let sim = SimIoapic::new(0, version, 24);
    ioapic
        .register_controller(controller_at(BASE, 0, DomainKind::Legacy), sim.window())
        .unwrap();
    Fixture {
        ioapic,
        sim,
        released,
        cascade,
    }
}

fn fixture() -> Fixture {
    fixture_with(legacy_table(), RoutingConfig::default(), 0x20)
}

fn controller_at(address: u64, gsi_base: u32, domain: DomainKind) -> ControllerConfig {
    ControllerConfig {
        address,
        requested_id: None,
        gsi_base,
        domain,
    }
}

struct FakeLapic {
    lvt0: Vec<u32>,
}

impl LocalApic for FakeLapic {
    fn write_lvt0(&mut self, value: u32) {
        self.lvt0.push(value);
    }

    fn apic_id(&self) -> u32 {
        0
    }
}

struct FakeRtc {
    regs: [u8; 0x10],
    writes: Vec<(u8, u8)>,
}

impl RtcPeriodic for FakeRtc {
    fn read(&mut self, reg: u8) -> u8 {
        if reg == RTC_INTR_FLAGS {
            return RTC_PF;
        }
        self.regs[reg as usize]
    }

    fn write(&mut self, reg: u8, value: u8) {
        self.writes.push((reg, value));
        self.regs[reg as usize] = value;
    }
}

/// The timer ticks only during probe number `working_probe` (1-based).
struct TestPlatform {
    lapic: FakeLapic,
    rtc: FakeRtc,
    working_probe: Option<u32>,
    probes: u32,
    irqs_on: bool,
    ticks: u64,
    tsc: u64,
    delays: u32,
}

impl TestPlatform {
    fn new(working_probe: Option<u32>) -> Self {
        let mut regs = [0u8; 0x10];
        regs[RTC_FREQ_SELECT as usize] = 0x26;
        regs[RTC_CONTROL as usize] = 0x02;
        Self {
            lapic: FakeLapic { lvt0: Vec::new() },
            rtc: FakeRtc {
                regs,
                writes: Vec::new(),
            },
            working_probe,
            probes: 0,
            irqs_on: false,
            ticks: 0,
            tsc: 0,
            delays: 0,
        }
    }
}

impl TimerPlatform for TestPlatform {
    fn ticks(&mut self) -> u64 {
        if self.irqs_on && self.working_probe == Some(self.probes) {
            self.ticks += 1;
        }
        self.ticks
    }

    fn read_time_base(&mut self) -> Option<u64> {
        self.tsc += 1_000_000;
        Some(self.tsc)
    }

    fn busy_wait(&mut self, _loops: u64) {}

    fn delay_ms(&mut self, _ms: u32) {
        self.delays += 1;
    }

    fn enable_irqs(&mut self) {
        self.probes += 1;
        self.irqs_on = true;
    }

    fn disable_irqs(&mut self) {
        self.irqs_on = false;
    }

    fn lapic(&mut self) -> &mut dyn LocalApic {
        &mut self.lapic
    }

    fn rtc(&mut self) -> &mut dyn RtcPeriodic {
        &mut self.rtc
    }
}

#[test]
fn test_register_rejects_bad_controllers() {
    let f = fixture();
    let other = SimIoapic::new(1, 0x20, 24);

    assert_eq!(
        f.ioapic
            .register_controller(controller_at(0, 24, DomainKind::Strict), other.window()),
        Err(IoapicError::InvalidAddress)
    );
    assert_eq!(
        f.ioapic
            .register_controller(controller_at(BASE, 24, DomainKind::Strict), other.window()),
        Err(IoapicError::AlreadyRegistered { address: BASE })
    );
    assert_eq!(
        f.ioapic.register_controller(
            controller_at(BASE + 0x1000, 10, DomainKind::Strict),
            other.window()
        ),
        Err(IoapicError::GsiOverlap {
            gsi_base: 10,
            gsi_end: 33,
            other: 0
        })
    );
    let absent = SimIoapic::absent();
    assert_eq!(
        f.ioapic.register_controller(
            controller_at(BASE + 0x2000, 24, DomainKind::Strict),
            absent.window()
        ),
        Err(IoapicError::ControllerAbsent {
            address: BASE + 0x2000
        })
    );
    let wide = SimIoapic::new(2, 0x20, 128);
    assert_eq!(
        f.ioapic.register_controller(
            controller_at(BASE + 0x3000, 24, DomainKind::Strict),
            wide.window()
        ),
        Err(IoapicError::TooManyPins {
            address: BASE + 0x3000,
            pins: 128
        })
    );
    let top = SimIoapic::new(3, 0x20, 8);
    assert_eq!(
        f.ioapic.register_controller(
            controller_at(BASE + 0x4000, u32::MAX - 4, DomainKind::Strict),
            top.window()
        ),
        Err(IoapicError::GsiOutOfRange {
            gsi_base: u32::MAX - 4,
            pins: 8
        })
    );
    assert_eq!(f.ioapic.controllers().len(), 1);
}

#[test]
fn test_largest_controller_registers() {
    let f = fixture();
    let widest = SimIoapic::new(1, 0x20, 120);
    f.ioapic
        .register_controller(
            controller_at(BASE + 0x1000, 24, DomainKind::Strict),
            widest.window(),
        )
        .unwrap();
    assert_eq!(f.ioapic.gsi_top(), 144);

    f.ioapic.save_entries();
    f.ioapic.allocate(143, None).unwrap();
    assert_eq!(f.ioapic.channel_pins(ChannelId(143)), vec![PinBinding::new(1, 119)]);
    assert_eq!(widest.decoded(119).vector, (0x30 + 143u32) as u8);
}

/// No vectors left in the parent domain.
struct ExhaustedParent;

impl ParentDomain for ExhaustedParent {
    fn compose_delivery_message(&self, channel: ChannelId) -> IoapicResult<DeliveryMessage> {
        Err(IoapicError::VectorUnavailable { channel })
    }

    fn retarget(&self, channel: ChannelId, _destination: u16) -> IoapicResult<DeliveryMessage> {
        Err(IoapicError::VectorUnavailable { channel })
    }
}

#[test]
fn test_allocate_fails_without_vector() {
    let ioapic = Ioapic::new(
        Box::new(legacy_table()),
        Box::new(ExhaustedParent),
        RoutingConfig::default(),
    );
    let sim = SimIoapic::new(0, 0x20, 24);
    ioapic
        .register_controller(controller_at(BASE, 0, DomainKind::Legacy), sim.window())
        .unwrap();

    assert_eq!(
        ioapic.allocate(16, None),
        Err(IoapicError::VectorUnavailable {
            channel: ChannelId(16)
        })
    );
    assert_eq!(ioapic.channel_for_gsi(16), None);
    assert!(sim.decoded(16).masked);
    assert!(sim.take_log().is_empty());
}

#[test]
fn test_noapic_refuses_registration() {
    let cfg = RoutingConfig::from_cmdline(Some("noapic"));
    let ioapic = Ioapic::new(
        Box::new(legacy_table()),
        Box::new(FakeParent {
            released: Arc::new(Mutex::new(Vec::new())),
        }),
        cfg,
    );
    let sim = SimIoapic::new(0, 0x20, 24);
    assert_eq!(
        ioapic.register_controller(controller_at(BASE, 0, DomainKind::Legacy), sim.window()),
        Err(IoapicError::Disabled)
    );
}

#[test]
fn test_duplicate_hardware_id_is_rewritten() {
    let f = fixture();
    let second = SimIoapic::new(0, 0x20, 16);
    let slot = f
        .ioapic
        .register_controller(
            controller_at(BASE + 0x1000, 24, DomainKind::Strict),
            second.window(),
        )
        .unwrap();
    assert_eq!(slot, 1);
    assert_eq!(second.id(), 1);
    assert_eq!(f.ioapic.controllers()[1].id, 1);

    let third = SimIoapic::new(0, 0x11, 8);
    let cfg = ControllerConfig {
        requested_id: Some(5),
        ..controller_at(BASE + 0x2000, 40, DomainKind::Strict)
    };
    f.ioapic.register_controller(cfg, third.window()).unwrap();
    assert_eq!(third.id(), 5);
    assert_eq!(f.ioapic.controllers()[2].completion, Completion::Emulated);
}

#[test]
fn test_gsi_partition_and_unregister() {
    let f = fixture();
    let second = SimIoapic::new(1, 0x20, 16);
    f.ioapic
        .register_controller(
            controller_at(BASE + 0x1000, 24, DomainKind::Strict),
            second.window(),
        )
        .unwrap();

    assert_eq!(f.ioapic.find_controller_for(30), Ok((1, 6)));
    assert_eq!(f.ioapic.find_controller_for(23), Ok((0, 23)));
    assert_eq!(
        f.ioapic.find_controller_for(40),
        Err(IoapicError::NoController { gsi: 40 })
    );
    assert_eq!(f.ioapic.gsi_top(), 40);
    assert_eq!(f.ioapic.dynirq_base(), 40);

    let handle = f.ioapic.allocate(30, None).unwrap();
    assert_eq!(handle.channel, ChannelId(30));
    assert_eq!(
        f.ioapic.unregister_controller(24),
        Err(IoapicError::InUse { controller: 1 })
    );
    assert_eq!(f.ioapic.free(handle), Ok(ReleaseOutcome::Released));
    assert_eq!(f.ioapic.unregister_controller(24), Ok(()));
    assert!(!f.ioapic.controller_registered(24));
    assert_eq!(f.ioapic.gsi_top(), 24);
    assert_eq!(
        f.ioapic.unregister_controller(99),
        Err(IoapicError::NotRegistered { gsi_base: 99 })
    );
}

#[test]
fn test_allocate_uses_firmware_attributes() {
    let f = fixture();

    let isa = f.ioapic.allocate(1, None).unwrap();
    assert_eq!(isa.channel, ChannelId(1));
    let e = f.sim.decoded(1);
    assert_eq!(e.vector, 0x31);
    assert_eq!(e.trigger, Trigger::Edge);
    assert!(!e.masked);

    let pci = f.ioapic.allocate(16, None).unwrap();
    assert_eq!(pci.channel, ChannelId(16));
    assert_eq!(f.ioapic.channel_attrs(pci.channel), Some(IrqAttrs::LEVEL_LOW));
    // Level lines stay masked until startup.
    assert!(f.sim.decoded(16).masked);

    // The timer's ISA IRQ follows its override to pin 2.
    let timer = f.ioapic.allocate(2, None).unwrap();
    assert_eq!(timer.channel, ChannelId(0));
    assert_eq!(timer.binding, pin(2));
}

#[test]
fn test_cascade_irq_and_lookup_flags() {
    let mut table = SourceTable::new();
    table.save(SourceRoute::isa(2, 0, 2, 0)).unwrap();
    let f = fixture_with(table, RoutingConfig::default(), 0x20);

    assert_eq!(
        f.ioapic.allocate(2, None),
        Err(IoapicError::Reserved { isa_irq: 2 })
    );
    assert_eq!(
        f.ioapic.resolve_channel(20, AllocFlags::ALLOC | AllocFlags::CHECK, None),
        Err(IoapicError::NoSourceEntry { gsi: 20 })
    );
    assert_eq!(
        f.ioapic.resolve_channel(20, AllocFlags::empty(), None),
        Err(IoapicError::NotMapped { gsi: 20 })
    );
    let h = f.ioapic.allocate(20, None).unwrap();
    assert_eq!(
        f.ioapic.resolve_channel(20, AllocFlags::empty(), None),
        Ok(h)
    );
    // Lookup alone takes no reference.
    assert_eq!(f.ioapic.channel_count(h.channel), Some(1));
}

#[test]
fn test_strict_mode_requires_source() {
    let cfg = RoutingConfig::from_cmdline(Some("ioapic.strict=1"));
    let f = fixture_with(legacy_table(), cfg, 0x20);
    assert_eq!(
        f.ioapic.allocate(21, None),
        Err(IoapicError::NoSourceEntry { gsi: 21 })
    );
    assert!(f.ioapic.allocate(17, None).is_ok());
}

#[test]
fn test_register_write_ordering() {
    let f = fixture();
    let h = f.ioapic.allocate(16, None).unwrap();
    f.sim.take_log();

    f.ioapic.unmask(h.channel).unwrap();
    assert_eq!(
        f.sim.take_log(),
        vec![Access::Write(0x31, 0), Access::Write(0x30, 0xA040)]
    );

    f.ioapic.mask(h.channel).unwrap();
    assert_eq!(f.sim.take_log(), vec![Access::Write(0x30, 0x1_A040)]);

    assert_eq!(f.ioapic.free(h), Ok(ReleaseOutcome::Released));
    assert_eq!(
        f.sim.take_log(),
        vec![
            Access::Write(0x30, 0x1_A040),
            Access::Write(0x30, 0x1_0000),
            Access::Write(0x31, 0),
        ]
    );
    assert_eq!(*f.released.lock(), vec![ChannelId(16)]);
}

#[test]
fn test_masking_writes_go_low_word_first() {
    let f = fixture();
    let h = f.ioapic.allocate(16, None).unwrap();
    f.ioapic.unmask(h.channel).unwrap();
    f.sim.take_log();

    // Level move with remote IRR clear: mask, then program high first.
    assert_eq!(f.ioapic.set_affinity(h.channel, 3), Ok(MoveOutcome::Applied));
    assert_eq!(
        f.sim.take_log(),
        vec![
            Access::Write(0x30, 0x1_A040),
            Access::Write(0x31, 0x0300_0000),
            Access::Write(0x30, 0xA040),
        ]
    );

    f.sim.set_entry(5, RawEntry::new(0x35, 0));
    assert_eq!(f.ioapic.clear_pin(pin(5)), Ok(()));
    assert_eq!(
        f.sim.take_log(),
        vec![
            Access::Write(0x1A, 0x1_0035),
            Access::Write(0x1B, 0),
            Access::Write(0x1A, 0x1_0000),
            Access::Write(0x1B, 0),
        ]
    );

    f.ioapic.allocate(1, None).unwrap();
    f.ioapic.suspend();
    f.sim.take_log();
    assert_eq!(f.ioapic.resume(), Ok(()));
    let log = f.sim.take_log();
    assert_eq!(
        log[..4],
        [
            Access::Write(0x10, 0x1_0000),
            Access::Write(0x11, 0),
            Access::Write(0x13, 0),
            Access::Write(0x12, 0x31),
        ]
    );
}

#[test]
fn test_deferred_move_masks_live_line_before_moving() {
    let f = fixture();
    let h = f.ioapic.allocate(16, None).unwrap();
    f.ioapic.unmask(h.channel).unwrap();
    f.sim.raise(16);
    assert_eq!(
        f.ioapic.set_affinity(h.channel, 3),
        Ok(MoveOutcome::Deferred)
    );

    // Unmasked again while the move is still waiting.
    f.ioapic.unmask(h.channel).unwrap();
    assert!(!f.sim.decoded(16).masked);
    f.sim.take_log();

    f.ioapic.acknowledge(h.channel).unwrap();
    assert_eq!(
        f.sim.take_log(),
        vec![
            Access::Write(0x30, 0x1_A040),
            Access::Eoi(0x40),
            Access::Write(0x31, 0x0300_0000),
            Access::Write(0x30, 0xA040),
        ]
    );
    let e = f.sim.decoded(16);
    assert_eq!(e.destination, 3);
    assert!(!e.masked);
}

#[test]
fn test_pin_feeds_one_channel() {
    let f = fixture();
    let a = f.ioapic.allocate(17, None).unwrap();
    let b = f.ioapic.allocate(18, None).unwrap();

    assert_eq!(
        f.ioapic.bind_pin(b.channel, pin(17)),
        Err(IoapicError::AlreadyBound {
            binding: pin(17),
            owner: a.channel
        })
    );
    assert_eq!(f.ioapic.bind_pin(a.channel, pin(17)), Ok(()));
    assert_eq!(f.ioapic.channel_pins(a.channel), vec![pin(17)]);

    f.ioapic.bind_pin(a.channel, pin(21)).unwrap();
    assert_eq!(f.ioapic.channel_pins(a.channel), vec![pin(17), pin(21)]);
    assert_eq!(f.sim.decoded(21).vector, f.sim.decoded(17).vector);
    assert_eq!(f.ioapic.channel_for_gsi(21), Some(a.channel));

    f.ioapic.unbind_pin(a.channel, pin(21)).unwrap();
    assert_eq!(f.ioapic.channel_pins(a.channel), vec![pin(17)]);
    assert!(f.sim.decoded(21).masked);
    assert_eq!(f.ioapic.channel_for_gsi(21), None);
}

#[test]
fn test_conflicting_attributes_are_busy() {
    let f = fixture();
    let first = f.ioapic.allocate(16, None).unwrap();
    assert_eq!(
        f.ioapic.allocate(16, Some(IrqAttrs::EDGE_HIGH)),
        Err(IoapicError::Busy {
            channel: first.channel
        })
    );
    let second = f.ioapic.allocate(16, None).unwrap();
    assert_eq!(second, first);
    assert_eq!(f.ioapic.channel_count(first.channel), Some(2));

    assert_eq!(f.ioapic.free(second), Ok(ReleaseOutcome::Retained));
    assert!(f.released.lock().is_empty());
    assert_eq!(f.ioapic.free(first), Ok(ReleaseOutcome::Released));
    assert_eq!(f.ioapic.channel_attrs(first.channel), None);
    assert_eq!(
        f.ioapic.free(first),
        Err(IoapicError::UnknownChannel(first.channel))
    );
}

#[test]
fn test_preprovisioned_legacy_channel_corrected_once() {
    let f = fixture();
    assert_eq!(f.ioapic.setup_legacy_channels(), 19);
    assert_eq!(
        f.ioapic.channel_attrs(ChannelId(9)),
        Some(IrqAttrs::EDGE_HIGH)
    );

    let h = f.ioapic.allocate(9, Some(IrqAttrs::LEVEL_LOW)).unwrap();
    assert_eq!(h.channel, ChannelId(9));
    assert_eq!(f.ioapic.channel_attrs(h.channel), Some(IrqAttrs::LEVEL_LOW));
    let e = f.sim.decoded(9);
    assert!(e.is_level());
    assert!(e.masked);

    assert_eq!(
        f.ioapic.allocate(9, Some(IrqAttrs::EDGE_HIGH)),
        Err(IoapicError::Busy {
            channel: ChannelId(9)
        })
    );
    // ISA channels outlive their users.
    assert_eq!(f.ioapic.free(h), Ok(ReleaseOutcome::Retained));
    assert!(f.ioapic.channel_attrs(ChannelId(9)).is_some());
}

#[test]
fn test_legacy_channel_shared_across_pins() {
    let mut table = legacy_table();
    // IRQ 9 also reaches pin 21 active-low level and pin 22 with bus defaults.
    table.save(SourceRoute::isa(9, 0, 21, 0xF)).unwrap();
    table.save(SourceRoute::isa(9, 0, 22, 0)).unwrap();
    let f = fixture_with(table, RoutingConfig::default(), 0x20);

    let first = f.ioapic.allocate(9, None).unwrap();
    assert_eq!(first.channel, ChannelId(9));
    assert_eq!(f.ioapic.channel_attrs(first.channel), Some(IrqAttrs::EDGE_HIGH));

    assert_eq!(
        f.ioapic.allocate(21, None),
        Err(IoapicError::Busy {
            channel: ChannelId(9)
        })
    );
    assert_eq!(f.ioapic.channel_pins(ChannelId(9)), vec![pin(9)]);
    assert!(f.sim.decoded(21).masked);

    let shared = f.ioapic.allocate(22, None).unwrap();
    assert_eq!(shared.channel, ChannelId(9));
    assert_eq!(f.ioapic.channel_pins(ChannelId(9)), vec![pin(9), pin(22)]);
    assert_eq!(f.sim.decoded(22).vector, 0x39);
}

#[test]
fn test_level_move_waits_for_remote_irr() {
    let f = fixture();
    let h = f.ioapic.allocate(16, None).unwrap();
    f.ioapic.unmask(h.channel).unwrap();
    assert!(f.sim.raise(16));
    assert_eq!(f.ioapic.query_remote_pending(h.channel), Ok(true));

    assert_eq!(
        f.ioapic.set_affinity(h.channel, 3),
        Ok(MoveOutcome::Deferred)
    );
    let e = f.sim.decoded(16);
    assert!(e.masked);
    assert_eq!(e.destination, 0);

    f.ioapic.acknowledge(h.channel).unwrap();
    let e = f.sim.decoded(16);
    assert!(!e.remote_irr);
    assert!(!e.masked);
    assert_eq!(e.destination, 3);
    assert_eq!(f.ioapic.query_remote_pending(h.channel), Ok(false));
}

#[test]
fn test_edge_move_applies_at_once() {
    let f = fixture();
    let h = f.ioapic.allocate(1, None).unwrap();
    assert_eq!(f.ioapic.set_affinity(h.channel, 5), Ok(MoveOutcome::Applied));
    let e = f.sim.decoded(1);
    assert_eq!(e.destination, 5);
    assert!(!e.masked);
}

#[test]
fn test_release_deferred_until_acknowledged() {
    let f = fixture();
    let h = f.ioapic.allocate(16, None).unwrap();
    f.ioapic.unmask(h.channel).unwrap();
    f.sim.raise(16);

    assert_eq!(f.ioapic.free(h), Ok(ReleaseOutcome::Deferred));
    assert!(f.sim.decoded(16).masked);
    assert!(f.released.lock().is_empty());
    assert_eq!(
        f.ioapic.allocate(16, None),
        Err(IoapicError::Busy {
            channel: h.channel
        })
    );
    assert!(f.ioapic.complete_deferred_releases().is_empty());

    f.ioapic.acknowledge(h.channel).unwrap();
    assert_eq!(f.ioapic.complete_deferred_releases(), vec![h.channel]);
    assert_eq!(*f.released.lock(), vec![h.channel]);
    assert_eq!(f.ioapic.channel_attrs(h.channel), None);
    assert_eq!(f.ioapic.channel_for_gsi(16), None);
}

#[test]
fn test_emulated_eoi_flips_to_edge_and_back() {
    let f = fixture_with(legacy_table(), RoutingConfig::default(), 0x11);
    let h = f.ioapic.allocate(16, None).unwrap();
    f.ioapic.unmask(h.channel).unwrap();
    f.sim.raise(16);
    f.sim.take_log();

    f.ioapic.acknowledge(h.channel).unwrap();
    assert_eq!(
        f.sim.take_log(),
        vec![
            Access::Write(0x30, 0x1_2040),
            Access::Write(0x31, 0),
            Access::Write(0x31, 0),
            Access::Write(0x30, 0xA040),
        ]
    );
    let e = f.sim.decoded(16);
    assert!(!e.remote_irr);
    assert!(e.is_level());
    assert!(!e.masked);
}

#[test]
fn test_startup_reports_cascade_pending() {
    let f = fixture();
    let h = f.ioapic.allocate(1, None).unwrap();
    f.ioapic.mask(h.channel).unwrap();
    f.cascade.lock().pending = 1 << 1;

    assert_eq!(f.ioapic.startup(h.channel), Ok(true));
    assert_ne!(f.cascade.lock().masked & (1 << 1), 0);
    assert!(!f.sim.decoded(1).masked);
}

#[test]
fn test_enable_finds_cascade_and_clears_pins() {
    let f = fixture();
    // Firmware left the 8259 wired through pin 0 and a stale level entry
    // with remote IRR on pin 5.
    f.sim.set_entry(0, RawEntry::new(0x700, 0));
    f.sim.set_entry(5, RawEntry::new(0x35 | (1 << 14) | (1 << 15), 0));

    f.ioapic.enable();
    assert_eq!(f.ioapic.cascade_pin(), Some(pin(0)));
    for p in [0, 5] {
        let e = f.sim.decoded(p);
        assert!(e.masked);
        assert!(!e.remote_irr);
        assert_eq!(e.vector, 0);
    }

    // Runs once.
    f.sim.set_entry(5, RawEntry::new(0x35, 0));
    f.ioapic.enable();
    assert!(!f.sim.decoded(5).masked);
}

#[test]
fn test_clear_pin_reports_stuck_irr() {
    let f = fixture();
    f.sim.set_entry(6, RawEntry::new(0x36 | (1 << 14) | (1 << 15), 0));
    f.sim.freeze_pin(6);
    assert_eq!(
        f.ioapic.clear_pin(pin(6)),
        Err(IoapicError::RemotePendingStuck {
            controller: 0,
            pin: 6
        })
    );
    assert!(
        f.ioapic
            .clear_pin(pin(6))
            .unwrap_err()
            .is_retryable()
    );
}

#[test]
fn test_restore_boot_irq_mode() {
    let f = fixture();
    f.ioapic.enable();
    f.ioapic.allocate(1, None).unwrap();

    f.ioapic.restore_boot_irq_mode(2);
    assert!(f.sim.decoded(1).masked);
    let e = f.sim.decoded(0);
    assert_eq!(e.delivery_mode, DeliveryMode::ExtInt);
    assert_eq!(e.dest_mode, DestMode::Physical);
    assert_eq!(e.destination, 2);
    assert!(!e.masked);
}

#[test]
fn test_timer_falls_back_to_virtual_wire() {
    let f = fixture();
    let mut platform = TestPlatform::new(Some(3));

    let report = f.ioapic.setup(&mut platform).unwrap();
    assert_eq!(report.stage, TimerStage::VirtualWire);
    assert_eq!(report.pin, None);
    assert_eq!(report.attempts, 3);
    assert_eq!(platform.lapic.lvt0.last(), Some(&0x30));

    // Both IO-APIC routes were tried and torn down.
    assert!(f.sim.decoded(2).masked);
    assert!(f.sim.decoded(0).masked);
    assert_eq!(f.ioapic.channel_pins(ChannelId(0)), vec![pin(0)]);

    let cascade = f.cascade.lock();
    assert_eq!(cascade.inits, vec![true]);
    assert_eq!(cascade.masked & 1, 0);
}

#[test]
fn test_timer_direct_route_with_pin_1_disabled() {
    let cfg = RoutingConfig::from_cmdline(Some("disable_timer_pin_1"));
    let f = fixture_with(legacy_table(), cfg, 0x20);
    let mut platform = TestPlatform::new(Some(1));

    let report = f.ioapic.setup(&mut platform).unwrap();
    assert_eq!(report.stage, TimerStage::Direct);
    assert_eq!(report.pin, Some(pin(2)));
    assert_eq!(report.attempts, 1);
    assert!(f.sim.decoded(2).masked);
}

#[test]
fn test_no_timer_check_skips_probe() {
    let cfg = RoutingConfig::from_cmdline(Some("no_timer_check"));
    let f = fixture_with(legacy_table(), cfg, 0x20);
    let mut platform = TestPlatform::new(None);

    let report = f.ioapic.setup(&mut platform).unwrap();
    assert_eq!(report.stage, TimerStage::Direct);
    assert_eq!(platform.probes, 0);
    assert!(!f.sim.decoded(2).masked);
}

#[test]
fn test_timer_extint_unlocks_through_rtc() {
    let f = fixture();
    let mut platform = TestPlatform::new(Some(4));

    let report = f.ioapic.setup(&mut platform).unwrap();
    assert_eq!(report.stage, TimerStage::ExtInt);
    assert_eq!(report.attempts, 4);
    assert_eq!(platform.lapic.lvt0.last(), Some(&0x700));
    assert_eq!(f.cascade.lock().inits, vec![true, false]);

    // Rate 6 with PIE, then the saved values back.
    assert_eq!(
        platform.rtc.writes,
        vec![
            (RTC_FREQ_SELECT, 0x26),
            (RTC_CONTROL, 0x02 | RTC_PIE),
            (RTC_CONTROL, 0x02),
            (RTC_FREQ_SELECT, 0x26),
        ]
    );
    assert!(platform.delays > 0 && platform.delays < 100);

    // The RTC pin carries channel 8 again.
    let e = f.sim.decoded(8);
    assert_eq!(e.vector, 0x38);
    assert_eq!(e.delivery_mode, DeliveryMode::Fixed);
    assert!(!e.masked);
}

#[test]
fn test_timer_unroutable_is_fatal() {
    let f = fixture();
    let mut platform = TestPlatform::new(None);
    let err = f.ioapic.setup(&mut platform).unwrap_err();
    assert_eq!(err, IoapicError::TimerUnroutable);
    assert!(err.is_fatal());
    assert_eq!(platform.probes, 4);
}

#[test]
fn test_suspend_resume_restores_entries_and_id() {
    let f = fixture();
    f.ioapic.allocate(1, None).unwrap();
    let pci = f.ioapic.allocate(16, None).unwrap();
    f.ioapic.unmask(pci.channel).unwrap();
    let before = [f.sim.entry(1), f.sim.entry(16)];

    f.ioapic.suspend();
    assert!(f.sim.decoded(1).masked);
    assert!(f.sim.decoded(16).masked);

    // Firmware reset the chip while asleep.
    f.sim.set_id(7);
    f.sim.set_entry(1, RawEntry::new(0x1_0000, 0));

    assert_eq!(f.ioapic.resume(), Ok(()));
    assert_eq!(f.sim.id(), 0);
    assert_eq!([f.sim.entry(1), f.sim.entry(16)], before);
}

#[test]
fn test_resume_gives_up_on_stuck_pin() {
    let f = fixture();
    f.ioapic.allocate(1, None).unwrap();
    f.ioapic.suspend();
    f.sim.freeze_pin(1);

    assert_eq!(
        f.ioapic.resume(),
        Err(IoapicError::ReinitLimit { attempts: 3 })
    );
}

#[test]
#[should_panic(expected = "IO-APIC resume failed")]
fn test_resume_or_halt_panics_on_stuck_pin() {
    let f = fixture();
    f.ioapic.allocate(1, None).unwrap();
    f.ioapic.suspend();
    f.sim.freeze_pin(1);
    f.ioapic.resume_or_halt();
}

#[test]
fn test_dynamic_domain_numbering() {
    let f = fixture();
    let dynamic = SimIoapic::new(1, 0x20, 8);
    f.ioapic
        .register_controller(
            controller_at(BASE + 0x1000, 24, DomainKind::Dynamic),
            dynamic.window(),
        )
        .unwrap();
    assert_eq!(f.ioapic.dynirq_base(), 24);

    let a = f.ioapic.allocate(26, None).unwrap();
    let b = f.ioapic.allocate(27, None).unwrap();
    assert_eq!(a.channel, ChannelId(24));
    assert_eq!(b.channel, ChannelId(25));
    assert_eq!(a.binding, PinBinding::new(1, 2));
    assert_eq!(f.ioapic.channel_for_gsi(27), Some(ChannelId(25)));
}

#[test]
fn test_diagnostics_snapshot() {
    let f = fixture();
    f.ioapic.allocate(1, None).unwrap();
    let snap = f.ioapic.diagnostics();
    assert_eq!(snap.controllers.len(), 1);
    assert_eq!(snap.controllers[0].entries.len(), 24);
    assert_eq!(snap.controllers[0].entries[1].vector, 0x31);
    assert_eq!(snap.channels.len(), 1);
    assert_eq!(snap.channels[0].pins, vec![pin(1)]);
    snap.log();
}

#[test]
fn test_install_once() {
    let f = fixture();
    let first = install(f.ioapic);
    assert!(core::ptr::eq(get().unwrap(), first));

    let other = fixture();
    let second = install(other.ioapic);
    assert!(core::ptr::eq(first, second));
}

proptest! {
    #[test]
    fn shared_pins_track_claims(ops in prop::collection::vec((any::<bool>(), 16u32..24, any::<u8>()), 1..40)) {
        let f = fixture();
        let mut live: Vec<(u32, ChannelHandle)> = Vec::new();
        let mut claims: BTreeMap<u32, u32> = BTreeMap::new();

        for (alloc, gsi, pick) in ops {
            if alloc || live.is_empty() {
                let h = f.ioapic.allocate(gsi, None).unwrap();
                live.push((gsi, h));
                *claims.entry(gsi).or_default() += 1;
            } else {
                let (gsi, h) = live.remove(pick as usize % live.len());
                f.ioapic.free(h).unwrap();
                *claims.entry(gsi).or_default() -= 1;
            }

            for g in 16..24u32 {
                let held = claims.get(&g).copied().unwrap_or(0);
                prop_assert_eq!(f.ioapic.channel_for_gsi(g).is_some(), held > 0);
                if held == 0 {
                    prop_assert!(f.sim.decoded(g).masked);
                }
            }
            for (_, h) in &live {
                prop_assert!(f.ioapic.channel_pins(h.channel).contains(&h.binding));
            }
        }
    }
}
