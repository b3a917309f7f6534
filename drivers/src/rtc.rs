//! CMOS RTC periodic interrupt, as used to kick the 8259 ExtINT path.

use pinroute_lib::cpu;
use pinroute_lib::ports::{CMOS_ADDRESS, CMOS_DATA};

use crate::ioapic::RtcPeriodic;

pub const RTC_FREQ_SELECT: u8 = 0x0A;
pub const RTC_CONTROL: u8 = 0x0B;
pub const RTC_INTR_FLAGS: u8 = 0x0C;
/// Rate-select bits of register A.
pub const RTC_RATE_SELECT: u8 = 0x0F;
/// Periodic interrupt enable, register B.
pub const RTC_PIE: u8 = 0x40;
/// Periodic interrupt flag, register C.
pub const RTC_PF: u8 = 0x40;
/// Set in the address port to keep NMIs off while the RTC is touched.
const CMOS_NMI_DISABLE: u8 = 0x80;

/// RTC behind the CMOS index/data ports.
pub struct CmosRtc;

impl RtcPeriodic for CmosRtc {
    fn read(&mut self, reg: u8) -> u8 {
        let flags = cpu::save_flags_cli();
        let value = unsafe {
            CMOS_ADDRESS.write(CMOS_NMI_DISABLE | reg);
            CMOS_DATA.read()
        };
        cpu::restore_flags(flags);
        value
    }

    fn write(&mut self, reg: u8, value: u8) {
        let flags = cpu::save_flags_cli();
        unsafe {
            CMOS_ADDRESS.write(CMOS_NMI_DISABLE | reg);
            CMOS_DATA.write(value);
        }
        cpu::restore_flags(flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_bits_do_not_overlap_divider() {
        // Register A: divider in bits 4-6, rate in 0-3.
        assert_eq!(RTC_RATE_SELECT & 0x70, 0);
        assert_eq!((0x26 & !RTC_RATE_SELECT) | 0x6, 0x26);
    }
}
