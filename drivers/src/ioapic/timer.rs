//! Routing the 8254 timer (IRQ0) when firmware cannot be trusted.
//!
//! Four routes are tried in order, each verified by watching the tick
//! counter advance:
//!
//! 1. straight through the IO-APIC pin firmware names for IRQ0;
//! 2. through the IO-APIC pin the 8259 feeds;
//! 3. 8259 output into LINT0 as a fixed-vector virtual wire;
//! 4. 8259 output into LINT0 as ExtINT, after nudging the 8259 with the RTC.
//!
//! If none works the boot cannot continue.

use pinroute_firmware::{SourceKind, Trigger};
use pinroute_lib::{klog_error, klog_info, klog_warn};

use super::channel::ChannelId;
use super::domain::{APIC_DM_EXTINT, APIC_DM_FIXED, APIC_LVT_MASKED, LocalApic, RtcPeriodic};
use super::entry::{DeliveryMode, DestMode, RouteEntry};
use super::error::{IoapicError, IoapicResult};
use super::pins::PinBinding;
use super::Ioapic;
use crate::rtc::{RTC_CONTROL, RTC_FREQ_SELECT, RTC_INTR_FLAGS, RTC_PF, RTC_PIE, RTC_RATE_SELECT};

const TIMER_CHANNEL: ChannelId = ChannelId(0);
/// ISA IRQ of the RTC, used by the ExtINT unlock.
const RTC_ISA_IRQ: u8 = 8;
/// Rate select 6: 1024 Hz periodic interrupt.
const RTC_RATE_1024HZ: u8 = 0x6;
const NO_TSC_MAX_BAND: u32 = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerStage {
    Direct,
    ThroughCascade,
    VirtualWire,
    ExtInt,
}

impl TimerStage {
    pub const FIRST: Self = TimerStage::Direct;

    pub fn next(self) -> Option<Self> {
        match self {
            TimerStage::Direct => Some(TimerStage::ThroughCascade),
            TimerStage::ThroughCascade => Some(TimerStage::VirtualWire),
            TimerStage::VirtualWire => Some(TimerStage::ExtInt),
            TimerStage::ExtInt => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            TimerStage::Direct => "IO-APIC pin",
            TimerStage::ThroughCascade => "IO-APIC pin via 8259A",
            TimerStage::VirtualWire => "Virtual Wire IRQ",
            TimerStage::ExtInt => "ExtINT IRQ",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerReport {
    pub stage: TimerStage,
    /// IO-APIC pin carrying the timer, for the first two stages.
    pub pin: Option<PinBinding>,
    /// Stages tried, including the one that worked.
    pub attempts: u8,
}

/// What the timer check needs from the rest of the machine.
pub trait TimerPlatform {
    /// Timer ticks seen so far.
    fn ticks(&mut self) -> u64;
    /// Free-running cycle counter, if the CPU has one.
    fn read_time_base(&mut self) -> Option<u64>;
    fn busy_wait(&mut self, loops: u64);
    fn delay_ms(&mut self, ms: u32);
    fn enable_irqs(&mut self);
    fn disable_irqs(&mut self);
    fn lapic(&mut self) -> &mut dyn LocalApic;
    fn rtc(&mut self) -> &mut dyn RtcPeriodic;
}

#[derive(Clone, Copy, Debug)]
struct TimerPins {
    pin1: Option<PinBinding>,
    pin2: Option<PinBinding>,
    /// Firmware named no pin for IRQ0; pin1 is borrowed from the cascade.
    no_pin1: bool,
}

impl Ioapic {
    fn isa_pin(&self, irq: u8, kind: SourceKind) -> Option<PinBinding> {
        let (hw_id, pin) = self.firmware.find_isa_pin(irq, kind)?;
        let index = self.state.lock().index_of_hw_id(hw_id)?;
        Some(PinBinding::new(index, pin))
    }

    fn timer_vector(&self) -> IoapicResult<u8> {
        match self.channel_entry(TIMER_CHANNEL) {
            Some(entry) => Ok(entry.vector),
            None => Ok(self.parent.compose_delivery_message(TIMER_CHANNEL)?.vector),
        }
    }

    /// Whether the timer ticks, with interrupts briefly enabled.
    pub fn timer_irq_works(&self, platform: &mut dyn TimerPlatform) -> bool {
        if self.config.no_timer_check {
            return true;
        }
        let limit = platform.ticks() + self.config.timer_probe_ticks;

        platform.enable_irqs();
        match platform.read_time_base() {
            Some(start) => {
                let budget = self.config.probe_cycle_budget();
                loop {
                    core::hint::spin_loop();
                    let elapsed = match platform.read_time_base() {
                        Some(now) => now.wrapping_sub(start),
                        None => budget,
                    };
                    if elapsed >= budget || platform.ticks() > limit {
                        break;
                    }
                }
            }
            None => {
                let hz = self.config.hz as u64;
                let mut band = 1u32;
                loop {
                    platform.busy_wait(((1u64 << band) * 10_000_000) / hz);
                    band += 1;
                    if band >= NO_TSC_MAX_BAND || platform.ticks() > limit {
                        break;
                    }
                }
            }
        }
        platform.disable_irqs();

        platform.ticks() > limit
    }

    /// Some chipsets only pass ExtINT after the 8259 has delivered through
    /// the IO-APIC once. Point the RTC pin at the local APIC as ExtINT,
    /// run the RTC's periodic interrupt for up to a second, then put
    /// everything back.
    pub fn unlock_extint_logic(&self, platform: &mut dyn TimerPlatform) {
        let Some(b) = self.isa_pin(RTC_ISA_IRQ, SourceKind::Int) else {
            klog_warn!("TIMER: no IO-APIC pin for IRQ8, skipping ExtINT unlock");
            return;
        };
        let Some(entry0) = self.hw.lock().banks.read(b) else {
            return;
        };
        let _ = self.clear_pin(b);

        let apic_id = platform.lapic().apic_id();
        let unlock = RouteEntry {
            vector: 0,
            delivery_mode: DeliveryMode::ExtInt,
            dest_mode: DestMode::Logical,
            polarity: entry0.polarity,
            trigger: Trigger::Edge,
            masked: false,
            destination: (apic_id & 0x7FFF) as u16,
            ..RouteEntry::MASKED
        };
        self.hw.lock().banks.program_pin(b, &unlock);

        let rtc = platform.rtc();
        let save_control = rtc.read(RTC_CONTROL);
        let save_freq_select = rtc.read(RTC_FREQ_SELECT);
        rtc.write(
            RTC_FREQ_SELECT,
            (save_freq_select & !RTC_RATE_SELECT) | RTC_RATE_1024HZ,
        );
        rtc.write(RTC_CONTROL, save_control | RTC_PIE);

        let mut budget: i32 = 100;
        while budget > 0 {
            budget -= 1;
            platform.delay_ms(10);
            if platform.rtc().read(RTC_INTR_FLAGS) & RTC_PF == RTC_PF {
                budget -= 10;
            }
        }

        let rtc = platform.rtc();
        rtc.write(RTC_CONTROL, save_control);
        rtc.write(RTC_FREQ_SELECT, save_freq_select);
        let _ = self.clear_pin(b);
        self.hw.lock().banks.program_pin(b, &entry0);
    }

    fn timer_pins(&self) -> TimerPins {
        let pin1 = self.isa_pin(0, SourceKind::Int);
        let pin2 = self.cascade_pin();
        match (pin1, pin2) {
            (None, p2) => TimerPins {
                pin1: p2,
                pin2: p2,
                no_pin1: true,
            },
            (Some(p1), None) => TimerPins {
                pin1: Some(p1),
                pin2: Some(p1),
                no_pin1: false,
            },
            (Some(p1), Some(p2)) => TimerPins {
                pin1: Some(p1),
                pin2: Some(p2),
                no_pin1: false,
            },
        }
    }

    fn try_direct(
        &self,
        platform: &mut dyn TimerPlatform,
        pins: TimerPins,
    ) -> IoapicResult<Option<PinBinding>> {
        let Some(p1) = pins.pin1 else {
            return Ok(None);
        };
        self.ensure_timer_channel(p1)?;
        if self.channel_attrs(TIMER_CHANNEL).is_some_and(|a| a.is_level()) {
            self.unmask(TIMER_CHANNEL)?;
        }
        self.reprogram(TIMER_CHANNEL)?;

        if self.timer_irq_works(platform) {
            if self.config.disable_timer_pin_1 {
                let _ = self.clear_pin(p1);
            }
            return Ok(Some(p1));
        }
        platform.disable_irqs();
        let _ = self.clear_pin(p1);
        if !pins.no_pin1 {
            klog_error!("TIMER: 8254 timer not connected to IO-APIC");
        }
        Ok(None)
    }

    fn try_through_cascade(
        &self,
        platform: &mut dyn TimerPlatform,
        pins: TimerPins,
    ) -> IoapicResult<Option<PinBinding>> {
        let (Some(p1), Some(p2)) = (pins.pin1, pins.pin2) else {
            return Ok(None);
        };
        klog_info!("TIMER: trying IRQ0 through the 8259A on pin {}", p2);
        self.reassign_pin(TIMER_CHANNEL, p1, p2)?;
        self.reprogram(TIMER_CHANNEL)?;
        self.on_cascade(|c| c.unmask(0));

        if self.timer_irq_works(platform) {
            return Ok(Some(p2));
        }
        platform.disable_irqs();
        self.on_cascade(|c| c.mask(0));
        let _ = self.clear_pin(p2);
        Ok(None)
    }

    fn try_virtual_wire(&self, platform: &mut dyn TimerPlatform, vector: u8) -> bool {
        platform.lapic().write_lvt0(APIC_DM_FIXED | vector as u32);
        self.on_cascade(|c| c.unmask(0));
        if self.timer_irq_works(platform) {
            return true;
        }
        platform.disable_irqs();
        self.on_cascade(|c| c.mask(0));
        platform
            .lapic()
            .write_lvt0(APIC_LVT_MASKED | APIC_DM_FIXED | vector as u32);
        false
    }

    fn try_extint(&self, platform: &mut dyn TimerPlatform) -> bool {
        self.on_cascade(|c| c.init(false));
        platform.lapic().write_lvt0(APIC_DM_EXTINT);
        self.on_cascade(|c| c.unmask(0));
        self.unlock_extint_logic(platform);
        if self.timer_irq_works(platform) {
            return true;
        }
        platform.disable_irqs();
        false
    }

    /// Find a working route for the timer interrupt.
    pub fn check_timer(&self, platform: &mut dyn TimerPlatform) -> IoapicResult<TimerReport> {
        if !self.timer_check.enter() {
            klog_warn!("TIMER: check already running");
            return Err(IoapicError::TimerUnroutable);
        }
        let result = self.run_timer_stages(platform);
        self.timer_check.leave();
        result
    }

    fn run_timer_stages(&self, platform: &mut dyn TimerPlatform) -> IoapicResult<TimerReport> {
        platform.disable_irqs();
        self.on_cascade(|c| c.mask(0));
        platform.lapic().write_lvt0(APIC_LVT_MASKED | APIC_DM_EXTINT);
        self.on_cascade(|c| c.init(true));

        let vector = self.timer_vector()?;
        let pins = self.timer_pins();
        klog_info!(
            "TIMER: vector=0x{:02x} pin1={:?} pin2={:?}",
            vector,
            pins.pin1,
            pins.pin2
        );

        let mut stage = TimerStage::FIRST;
        let mut attempts = 0u8;
        loop {
            attempts += 1;
            klog_info!("TIMER: trying {}", stage.describe());
            let routed = match stage {
                TimerStage::Direct => self.try_direct(platform, pins)?.map(Some),
                TimerStage::ThroughCascade => self.try_through_cascade(platform, pins)?.map(Some),
                TimerStage::VirtualWire => self.try_virtual_wire(platform, vector).then_some(None),
                TimerStage::ExtInt => self.try_extint(platform).then_some(None),
            };
            if let Some(pin) = routed {
                klog_info!("TIMER: {} works", stage.describe());
                return Ok(TimerReport {
                    stage,
                    pin,
                    attempts,
                });
            }
            klog_info!("TIMER: {} failed", stage.describe());
            match stage.next() {
                Some(next) => stage = next,
                None => break,
            }
        }

        klog_error!("TIMER: no route for the timer interrupt");
        Err(IoapicError::TimerUnroutable)
    }

    /// `check_timer`, halting the machine with a routing dump on failure.
    pub fn check_timer_or_halt(&self, platform: &mut dyn TimerPlatform) -> TimerReport {
        match self.check_timer(platform) {
            Ok(report) => report,
            Err(err) => {
                self.diagnostics().log();
                panic!(
                    "IO-APIC + timer doesn't work ({}); try booting with 'noapic'",
                    err
                );
            }
        }
    }
}
