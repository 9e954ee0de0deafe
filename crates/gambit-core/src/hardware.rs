use std::ops::{BitOr, BitOrAssign};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
/// Options applied when a ROM is loaded.
///
/// Combine with `|`:
/// `LoadFlags::FORCE_DMG | LoadFlags::MULTICART_COMPAT`.
pub struct LoadFlags(u8);

impl LoadFlags {
    pub const NONE: Self = Self(0);
    /// Run CGB-capable carts on DMG hardware.
    pub const FORCE_DMG: Self = Self(0x01);
    /// Run DMG-only carts on CGB hardware in compatibility mode.
    pub const FORCE_CGB: Self = Self(0x02);
    /// Use the GBA variant of the CGB initial register state.
    pub const GBA_CGB: Self = Self(0x04);
    /// Detect MBC1 multicart wiring from ROM contents.
    pub const MULTICART_COMPAT: Self = Self(0x08);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0x0F)
    }
}

impl BitOr for LoadFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LoadFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
/// Hardware model the console emulates for the loaded cart.
pub enum HardwareMode {
    #[default]
    Dmg,
    Cgb,
    /// CGB hardware running a DMG-only cart.
    CgbDmgCompat,
}

impl HardwareMode {
    /// Picks the hardware model from the header CGB flag and the load flags.
    pub fn select(header_cgb: bool, flags: LoadFlags) -> Self {
        if flags.contains(LoadFlags::FORCE_DMG) {
            Self::Dmg
        } else if header_cgb {
            Self::Cgb
        } else if flags.contains(LoadFlags::FORCE_CGB) {
            Self::CgbDmgCompat
        } else {
            Self::Dmg
        }
    }

    #[inline]
    pub const fn is_cgb(self) -> bool {
        matches!(self, Self::Cgb | Self::CgbDmgCompat)
    }

    #[inline]
    pub const fn is_dmg_compat(self) -> bool {
        matches!(self, Self::CgbDmgCompat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_dmg_wins_over_header() {
        assert_eq!(
            HardwareMode::select(true, LoadFlags::FORCE_DMG | LoadFlags::FORCE_CGB),
            HardwareMode::Dmg
        );
        assert_eq!(HardwareMode::select(true, LoadFlags::NONE), HardwareMode::Cgb);
        assert_eq!(
            HardwareMode::select(false, LoadFlags::FORCE_CGB),
            HardwareMode::CgbDmgCompat
        );
        assert!(!HardwareMode::select(false, LoadFlags::NONE).is_cgb());
    }

    #[test]
    fn flags_combine() {
        let mut flags = LoadFlags::GBA_CGB;
        flags |= LoadFlags::MULTICART_COMPAT;
        assert!(flags.contains(LoadFlags::GBA_CGB));
        assert!(flags.contains(LoadFlags::MULTICART_COMPAT));
        assert!(!flags.contains(LoadFlags::FORCE_DMG));
        assert_eq!(LoadFlags::from_bits_truncate(0xFF).bits(), 0x0F);
    }
}
