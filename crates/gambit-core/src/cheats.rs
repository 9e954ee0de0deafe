//! Game Genie ROM patches and GameShark RAM writes.

use crate::cartridge::{Cartridge, ROM_BANK_SIZE};
use log::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameGenieCode {
    pub value: u8,
    pub addr: u16,
    pub compare: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameSharkCode {
    pub kind: u8,
    pub value: u8,
    pub addr: u16,
}

fn hex_digits(code: &str) -> Option<Vec<u8>> {
    code.chars()
        .filter(|&c| c != '-')
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect()
}

/// Parses `VVA-AAA` or `VVA-AAA-CCC` style codes.
pub fn parse_game_genie(code: &str) -> Option<GameGenieCode> {
    let d = hex_digits(code.trim())?;
    if d.len() != 6 && d.len() != 9 {
        return None;
    }
    let value = d[0] << 4 | d[1];
    let addr = (((d[5] ^ 0x0F) as u16) << 12 | (d[2] as u16) << 8 | (d[3] as u16) << 4 | d[4] as u16)
        & 0x7FFF;
    let compare = (d.len() == 9).then(|| {
        let c = (d[6] << 4 | d[8]) ^ 0xFF;
        c.rotate_right(2) ^ 0x45
    });
    Some(GameGenieCode {
        value,
        addr,
        compare,
    })
}

/// Parses `TTVVLLHH` codes: type, value, then the little-endian address.
pub fn parse_game_shark(code: &str) -> Option<GameSharkCode> {
    let d = hex_digits(code.trim())?;
    if d.len() != 8 {
        return None;
    }
    let byte = |i: usize| d[i] << 4 | d[i + 1];
    Some(GameSharkCode {
        kind: byte(0),
        value: byte(2),
        addr: u16::from_le_bytes([byte(4), byte(6)]),
    })
}

#[derive(Debug, Clone, Default)]
pub struct Cheats {
    undo: Vec<(usize, u8)>,
    shark: Vec<GameSharkCode>,
}

impl Cheats {
    /// Replaces the active Game Genie codes. `codes` is `;`-separated; an
    /// empty string just reverts the previous patches.
    pub fn set_game_genie(&mut self, cart: &mut Cartridge, codes: &str) {
        self.revert(cart);
        for code in codes.split(';').map(str::trim).filter(|c| !c.is_empty()) {
            match parse_game_genie(code) {
                Some(gg) => self.apply_game_genie(cart, gg),
                None => warn!("Ignoring malformed Game Genie code {code:?}"),
            }
        }
    }

    fn apply_game_genie(&mut self, cart: &mut Cartridge, gg: GameGenieCode) {
        let in_bank = gg.addr as usize % ROM_BANK_SIZE;
        let banks = if gg.addr < 0x4000 {
            0..1
        } else {
            1..cart.rom_bank_count()
        };
        for bank in banks {
            let offset = bank * ROM_BANK_SIZE + in_bank;
            let Some(current) = cart.rom_byte(offset) else {
                continue;
            };
            if gg.compare.is_some_and(|cmp| cmp != current) {
                continue;
            }
            if let Some(original) = cart.patch_rom(offset, gg.value) {
                trace!("Game Genie patch {offset:#07X}: {original:02X} -> {:02X}", gg.value);
                self.undo.push((offset, original));
            }
        }
    }

    fn revert(&mut self, cart: &mut Cartridge) {
        while let Some((offset, original)) = self.undo.pop() {
            cart.patch_rom(offset, original);
        }
    }

    /// Replaces the active GameShark codes.
    pub fn set_game_shark(&mut self, codes: &str) {
        self.shark.clear();
        for code in codes.split(';').map(str::trim).filter(|c| !c.is_empty()) {
            match parse_game_shark(code) {
                Some(gs) if gs.kind == 0x01 => self.shark.push(gs),
                Some(gs) => warn!("Ignoring GameShark code {code:?} with type {:02X}", gs.kind),
                None => warn!("Ignoring malformed GameShark code {code:?}"),
            }
        }
    }

    pub fn clear(&mut self, cart: &mut Cartridge) {
        self.revert(cart);
        self.shark.clear();
    }

    /// RAM writes to perform at each VBlank interrupt.
    pub fn vblank_writes(&self) -> impl Iterator<Item = (u16, u8)> + '_ {
        self.shark.iter().map(|gs| (gs.addr, gs.value))
    }

    pub fn has_vblank_writes(&self) -> bool {
        !self.shark.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::LoadFlags;

    fn cart() -> Cartridge {
        let mut rom = vec![0u8; 4 * ROM_BANK_SIZE];
        rom[0x0147] = 0x01;
        rom[0x4123] = 0x3A;
        rom[2 * ROM_BANK_SIZE + 0x0123] = 0x99;
        Cartridge::load(&rom, LoadFlags::NONE).unwrap()
    }

    #[test]
    fn game_genie_code_decodes() {
        // 00A-17B-C49: value 00, address 4A17
        let gg = parse_game_genie("00A-17B-C49").unwrap();
        assert_eq!(gg.value, 0x00);
        assert_eq!(gg.addr, 0x4A17);
        let (c, i) = (0xC, 0x9);
        let expected = (((c << 4 | i) ^ 0xFFu8).rotate_right(2)) ^ 0x45;
        assert_eq!(gg.compare, Some(expected));
        assert_eq!(parse_game_genie("123-456").map(|g| g.compare), Some(None));
        assert!(parse_game_genie("12-34").is_none());
        assert!(parse_game_genie("XYZ-456").is_none());
    }

    #[test]
    fn game_genie_patches_every_switchable_bank_and_reverts() {
        let mut cart = cart();
        let mut cheats = Cheats::default();
        // value 7E, address 4123, no compare
        cheats.set_game_genie(&mut cart, "7E1-23B");
        for bank in 1..4 {
            assert_eq!(cart.rom_byte(bank * ROM_BANK_SIZE + 0x0123), Some(0x7E));
        }
        assert_eq!(cart.rom_byte(0x0123), Some(0x00));
        cheats.clear(&mut cart);
        assert_eq!(cart.rom_byte(0x4123), Some(0x3A));
        assert_eq!(cart.rom_byte(2 * ROM_BANK_SIZE + 0x0123), Some(0x99));
    }

    #[test]
    fn game_genie_compare_limits_patch() {
        let mut cart = cart();
        let mut cheats = Cheats::default();
        let code = GameGenieCode {
            value: 0x42,
            addr: 0x4123,
            compare: Some(0x99),
        };
        cheats.apply_game_genie(&mut cart, code);
        assert_eq!(cart.rom_byte(0x4123), Some(0x3A));
        assert_eq!(cart.rom_byte(2 * ROM_BANK_SIZE + 0x0123), Some(0x42));
    }

    #[test]
    fn game_shark_codes_collect_ram_writes() {
        let mut cheats = Cheats::default();
        cheats.set_game_shark("010238CD; 91FF00D0; bogus");
        assert_eq!(cheats.vblank_writes().collect::<Vec<_>>(), vec![(0xCD38, 0x02)]);
        cheats.set_game_shark("");
        assert!(!cheats.has_vblank_writes());
    }
}
