//! I/O APIC hardware definitions.
//!
//! Window offsets, indirect register numbers, and the redirection entry bit
//! layouts. Entry fields are described by tables rather than shift constants
//! so a controller generation with a different layout only needs a new table.

// =============================================================================
// Size and Capacity Limits
// =============================================================================

pub const IOAPIC_MAX_CONTROLLERS: usize = 128;
/// Redirection registers run 0x10..=0xFF, two per pin.
pub const IOAPIC_MAX_PINS: u32 = 120;
/// Hardware ids are 8 bits wide in register 0.
pub const IOAPIC_ID_SPACE: usize = 256;
pub const IOAPIC_REGION_SIZE: usize = 0x44;

// =============================================================================
// Window Offsets (bytes from the MMIO base)
// =============================================================================

pub const IOAPIC_WINDOW_INDEX: usize = 0x00;
pub const IOAPIC_WINDOW_DATA: usize = 0x10;
pub const IOAPIC_WINDOW_EOI: usize = 0x40;

// =============================================================================
// Indirect Registers
// =============================================================================

pub const IOAPIC_REG_ID: u8 = 0x00;
pub const IOAPIC_REG_VER: u8 = 0x01;
pub const IOAPIC_REG_ARB: u8 = 0x02;
pub const IOAPIC_REG_REDIR_BASE: u8 = 0x10;

pub const IOAPIC_ID_SHIFT: u32 = 24;
pub const IOAPIC_ID_MASK: u32 = 0xFF << IOAPIC_ID_SHIFT;
pub const IOAPIC_VER_VERSION_MASK: u32 = 0xFF;
pub const IOAPIC_VER_MAX_REDIR_SHIFT: u32 = 16;

/// First version with a directed EOI register and extended destination bits.
pub const IOAPIC_VERSION_DIRECTED_EOI: u8 = 0x20;

/// `pin` must be below [`IOAPIC_MAX_PINS`].
#[inline]
pub const fn redir_low(pin: u32) -> u8 {
    IOAPIC_REG_REDIR_BASE + (pin as u8) * 2
}

#[inline]
pub const fn redir_high(pin: u32) -> u8 {
    redir_low(pin) + 1
}

#[inline]
pub const fn id_from_reg(reg0: u32) -> u8 {
    ((reg0 & IOAPIC_ID_MASK) >> IOAPIC_ID_SHIFT) as u8
}

#[inline]
pub const fn version_from_reg(reg1: u32) -> u8 {
    (reg1 & IOAPIC_VER_VERSION_MASK) as u8
}

#[inline]
pub const fn entries_from_reg(reg1: u32) -> u32 {
    ((reg1 >> IOAPIC_VER_MAX_REDIR_SHIFT) & 0xFF) + 1
}

// =============================================================================
// Redirection Entry Layout
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RteWord {
    Low,
    High,
}

/// One bit field of a redirection entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RteField {
    pub word: RteWord,
    pub shift: u8,
    pub width: u8,
}

impl RteField {
    pub const fn low(shift: u8, width: u8) -> Self {
        Self {
            word: RteWord::Low,
            shift,
            width,
        }
    }

    pub const fn high(shift: u8, width: u8) -> Self {
        Self {
            word: RteWord::High,
            shift,
            width,
        }
    }

    #[inline]
    pub const fn max(&self) -> u32 {
        if self.width >= 32 {
            u32::MAX
        } else {
            (1u32 << self.width) - 1
        }
    }

    #[inline]
    pub const fn mask(&self) -> u32 {
        self.max() << self.shift
    }

    #[inline]
    pub fn get(&self, low: u32, high: u32) -> u32 {
        let word = match self.word {
            RteWord::Low => low,
            RteWord::High => high,
        };
        (word >> self.shift) & self.max()
    }

    #[inline]
    pub fn set(&self, low: &mut u32, high: &mut u32, value: u32) {
        let word = match self.word {
            RteWord::Low => low,
            RteWord::High => high,
        };
        *word = (*word & !self.mask()) | ((value & self.max()) << self.shift);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RteLayout {
    pub vector: RteField,
    pub delivery_mode: RteField,
    pub dest_mode: RteField,
    pub delivery_status: RteField,
    pub polarity: RteField,
    pub remote_irr: RteField,
    pub trigger: RteField,
    pub mask: RteField,
    pub destination: RteField,
    /// Bits 8-14 of the destination, when the generation has them.
    pub ext_destination: Option<RteField>,
}

impl RteLayout {
    /// Largest destination id this layout can encode.
    pub fn max_destination(&self) -> u16 {
        let ext_width = self.ext_destination.map_or(0, |f| f.width);
        ((1u32 << (self.destination.width + ext_width)) - 1) as u16
    }

    /// Bits software may program; the rest are read-only or reserved.
    pub fn writable_low(&self) -> u32 {
        [
            self.vector,
            self.delivery_mode,
            self.dest_mode,
            self.polarity,
            self.trigger,
            self.mask,
        ]
        .iter()
        .chain(self.ext_destination.iter())
        .filter(|f| f.word == RteWord::Low)
        .fold(0, |acc, f| acc | f.mask())
    }

    pub fn writable_high(&self) -> u32 {
        [self.destination]
            .iter()
            .chain(self.ext_destination.iter())
            .filter(|f| f.word == RteWord::High)
            .fold(0, |acc, f| acc | f.mask())
    }
}

const COMMON_LOW: RteLayout = RteLayout {
    vector: RteField::low(0, 8),
    delivery_mode: RteField::low(8, 3),
    dest_mode: RteField::low(11, 1),
    delivery_status: RteField::low(12, 1),
    polarity: RteField::low(13, 1),
    remote_irr: RteField::low(14, 1),
    trigger: RteField::low(15, 1),
    mask: RteField::low(16, 1),
    destination: RteField::high(24, 8),
    ext_destination: None,
};

/// 82093AA and other pre-0x20 parts: 8-bit destination only.
pub const RTE_LAYOUT_LEGACY: RteLayout = COMMON_LOW;

/// 0x20+ parts: destination bits 8-14 live in high-word bits 17-23.
pub const RTE_LAYOUT_EXTENDED: RteLayout = RteLayout {
    ext_destination: Some(RteField::high(17, 7)),
    ..COMMON_LOW
};

pub fn layout_for_version(version: u8) -> &'static RteLayout {
    if version >= IOAPIC_VERSION_DIRECTED_EOI {
        &RTE_LAYOUT_EXTENDED
    } else {
        &RTE_LAYOUT_LEGACY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redir_indices() {
        assert_eq!(redir_low(0), 0x10);
        assert_eq!(redir_high(0), 0x11);
        assert_eq!(redir_low(23), 0x3E);
        assert_eq!(redir_high(23), 0x3F);
    }

    #[test]
    fn test_version_register_decode() {
        // 24 entries, version 0x20.
        let reg1 = (23 << 16) | 0x20;
        assert_eq!(version_from_reg(reg1), 0x20);
        assert_eq!(entries_from_reg(reg1), 24);
        assert_eq!(id_from_reg(0x0200_0000), 2);
    }

    #[test]
    fn test_layout_selection_by_version() {
        assert!(layout_for_version(0x11).ext_destination.is_none());
        assert_eq!(layout_for_version(0x11).max_destination(), 0xFF);
        assert_eq!(layout_for_version(0x20).max_destination(), 0x7FFF);
    }

    #[test]
    fn test_writable_masks_exclude_status_bits() {
        let layout = &RTE_LAYOUT_EXTENDED;
        let low = layout.writable_low();
        assert_eq!(low & (1 << 12), 0);
        assert_eq!(low & (1 << 14), 0);
        assert_eq!(low, 0x1_FFFF & !((1 << 12) | (1 << 14)));
        assert_eq!(layout.writable_high(), 0xFFFE_0000);
    }

    #[test]
    fn test_field_set_get() {
        let (mut low, mut high) = (0u32, 0u32);
        RTE_LAYOUT_EXTENDED.mask.set(&mut low, &mut high, 1);
        RTE_LAYOUT_EXTENDED.destination.set(&mut low, &mut high, 0x1FF);
        assert_eq!(low, 1 << 16);
        assert_eq!(high, 0xFF00_0000);
        assert_eq!(RTE_LAYOUT_EXTENDED.destination.get(low, high), 0xFF);
    }
}
