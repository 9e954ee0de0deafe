use crate::{
    hardware::LoadFlags,
    huc3::Huc3Clock,
    rtc::{Mbc3Rtc, RtcLatch, TimeSource, unix_now},
    savestate::CartState,
};
use log::{debug, warn};
use thiserror::Error;

pub const ROM_BANK_SIZE: usize = 0x4000;
pub const RAM_BANK_SIZE: usize = 0x2000;

/// Backing store for reads from an unmapped or disabled RAM window.
pub static DISABLED_RAM: [u8; RAM_BANK_SIZE] = [0xFF; RAM_BANK_SIZE];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("ROM image is {len} bytes, smaller than one 16 KiB bank")]
    RomTooSmall { len: usize },
    #[error("unsupported mapper {kind} (cartridge type {code:#04X})")]
    UnsupportedMapper { kind: &'static str, code: u8 },
    #[error("unknown cartridge type {0:#04X}")]
    UnknownMapper(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcType {
    Plain,
    Mbc1,
    Mbc1Multicart,
    Mbc2,
    Mbc3,
    Mbc30,
    Mbc5,
    Huc3,
}

/// Bank-select registers shared by every mapper. Each mapper only uses the
/// subset (and width) it implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbcRegisters {
    pub rom_bank: u16,
    pub ram_bank: u8,
    pub ram_enable: bool,
    /// MBC1 banking mode.
    pub mode: bool,
    /// HuC3 mode register (0x0A RAM, 0x0B-0x0E clock/IR).
    pub huc3_mode: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RamWindow {
    Disabled,
    Ram(usize),
    Mbc2,
    Rtc,
    Huc3(u8),
}

#[derive(Debug, Clone)]
pub struct Cartridge {
    rom: Vec<u8>,
    ram: Vec<u8>,
    pub mbc: MbcType,
    pub cgb: bool,
    pub title: String,
    cart_type: u8,
    regs: MbcRegisters,
    rom0_base: usize,
    romn_base: usize,
    ram_window: RamWindow,
    pub rtc: Option<Mbc3Rtc>,
    pub huc3: Option<Huc3Clock>,
    time_source: TimeSource,
}

impl Cartridge {
    pub fn load(data: &[u8], flags: LoadFlags) -> Result<Self, LoadError> {
        Self::load_with_time_source(data, flags, unix_now)
    }

    pub fn load_with_time_source(
        data: &[u8],
        flags: LoadFlags,
        time_source: TimeSource,
    ) -> Result<Self, LoadError> {
        if data.len() < ROM_BANK_SIZE {
            warn!("Rejected ROM: {} bytes is smaller than one bank", data.len());
            return Err(LoadError::RomTooSmall { len: data.len() });
        }

        let header = Header::parse(data);
        let cart_type = header.cart_type();
        let mut mbc = header.mbc_type()?;
        if mbc == MbcType::Mbc1
            && flags.contains(LoadFlags::MULTICART_COMPAT)
            && detect_mbc1_multicart(data)
        {
            mbc = MbcType::Mbc1Multicart;
        }

        let rom_banks = (data.len().div_ceil(ROM_BANK_SIZE)).next_power_of_two();
        let mut rom = vec![0xFF; rom_banks * ROM_BANK_SIZE];
        rom[..data.len()].copy_from_slice(data);

        let ram = vec![0; header.ram_size(mbc)];
        let now = time_source();
        let has_timer = matches!(mbc, MbcType::Mbc3 | MbcType::Mbc30)
            && matches!(cart_type, 0x0F | 0x10);
        let rtc = has_timer.then(|| Mbc3Rtc::new(now));
        let huc3 = (mbc == MbcType::Huc3).then(|| Huc3Clock::new(now));

        let mut cart = Self {
            rom,
            ram,
            mbc,
            cgb: header.cgb_supported(),
            title: header.title(),
            cart_type,
            regs: MbcRegisters {
                rom_bank: 1,
                ..MbcRegisters::default()
            },
            rom0_base: 0,
            romn_base: ROM_BANK_SIZE,
            ram_window: RamWindow::Disabled,
            rtc,
            huc3,
            time_source,
        };
        cart.update_banks();

        debug!(
            "Loaded ROM \"{}\": {:?}, {} ROM banks, {} bytes RAM, CGB flag {}",
            cart.title,
            cart.mbc,
            rom_banks,
            cart.ram.len(),
            cart.cgb
        );
        Ok(cart)
    }

    #[inline]
    pub fn rom_bank_count(&self) -> usize {
        self.rom.len() / ROM_BANK_SIZE
    }

    #[inline]
    pub fn ram_bank_count(&self) -> usize {
        self.ram.len().div_ceil(RAM_BANK_SIZE)
    }

    /// Physical bank currently mapped at 0x4000-0x7FFF.
    pub fn rom_bank(&self) -> usize {
        self.romn_base / ROM_BANK_SIZE
    }

    /// Physical bank currently mapped at 0x0000-0x3FFF.
    pub fn rom0_bank(&self) -> usize {
        self.rom0_base / ROM_BANK_SIZE
    }

    /// Physical RAM bank mapped at 0xA000, if plain RAM is mapped.
    pub fn ram_bank(&self) -> Option<usize> {
        match self.ram_window {
            RamWindow::Ram(base) => Some(base / RAM_BANK_SIZE),
            _ => None,
        }
    }

    pub fn registers(&self) -> MbcRegisters {
        self.regs
    }

    #[inline]
    pub fn read_rom(&self, addr: u16) -> u8 {
        let offset = if addr < 0x4000 {
            self.rom0_base + addr as usize
        } else {
            self.romn_base + (addr as usize & 0x3FFF)
        };
        self.rom.get(offset).copied().unwrap_or(0xFF)
    }

    pub fn read_ram(&self, addr: u16) -> u8 {
        let offset = addr as usize & 0x1FFF;
        match self.ram_window {
            RamWindow::Disabled => DISABLED_RAM[offset],
            RamWindow::Ram(base) => self.ram.get(base + offset).copied().unwrap_or(0xFF),
            // MBC2 has 512x4-bit internal RAM, mirrored across 0xA000-0xBFFF.
            RamWindow::Mbc2 => 0xF0 | (self.ram.get(offset & 0x1FF).copied().unwrap_or(0) & 0x0F),
            RamWindow::Rtc => self.rtc.as_ref().map_or(0xFF, Mbc3Rtc::read),
            RamWindow::Huc3(mode) => self.huc3.as_ref().map_or(0xFF, |h| h.read(mode)),
        }
    }

    pub fn write_ram(&mut self, addr: u16, val: u8) {
        let offset = addr as usize & 0x1FFF;
        match self.ram_window {
            RamWindow::Disabled => {}
            RamWindow::Ram(base) => {
                if let Some(b) = self.ram.get_mut(base + offset) {
                    *b = val;
                }
            }
            RamWindow::Mbc2 => {
                if let Some(b) = self.ram.get_mut(offset & 0x1FF) {
                    *b = val & 0x0F;
                }
            }
            RamWindow::Rtc => {
                let now = (self.time_source)();
                if let Some(rtc) = self.rtc.as_mut() {
                    rtc.write(val, now);
                }
            }
            RamWindow::Huc3(mode) => {
                let now = (self.time_source)();
                if let Some(huc3) = self.huc3.as_mut() {
                    huc3.write(mode, val, now);
                }
            }
        }
    }

    /// Handles a CPU write to 0x0000-0x7FFF.
    pub fn mbc_write(&mut self, addr: u16, val: u8) {
        let regs = &mut self.regs;
        match self.mbc {
            MbcType::Plain => return,
            MbcType::Mbc1 | MbcType::Mbc1Multicart => match addr {
                0x0000..=0x1FFF => regs.ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => regs.rom_bank = (val & 0x1F) as u16,
                0x4000..=0x5FFF => regs.ram_bank = val & 0x03,
                _ => regs.mode = val & 0x01 != 0,
            },
            MbcType::Mbc2 => {
                if addr >= 0x4000 {
                    return;
                }
                // Address bit 8 selects between RAMG and ROMB.
                if addr & 0x0100 == 0 {
                    regs.ram_enable = val & 0x0F == 0x0A;
                } else {
                    regs.rom_bank = (val & 0x0F) as u16;
                }
            }
            MbcType::Mbc3 | MbcType::Mbc30 => match addr {
                0x0000..=0x1FFF => regs.ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x3FFF => {
                    let mask = if self.mbc == MbcType::Mbc30 { 0xFF } else { 0x7F };
                    regs.rom_bank = (val & mask) as u16;
                }
                0x4000..=0x5FFF => regs.ram_bank = val,
                _ => {
                    let now = (self.time_source)();
                    if let Some(rtc) = self.rtc.as_mut() {
                        rtc.latch_write(val, now);
                    }
                    return;
                }
            },
            MbcType::Mbc5 => match addr {
                0x0000..=0x1FFF => regs.ram_enable = val & 0x0F == 0x0A,
                0x2000..=0x2FFF => regs.rom_bank = (regs.rom_bank & 0x100) | val as u16,
                0x3000..=0x3FFF => {
                    regs.rom_bank = (regs.rom_bank & 0xFF) | (((val & 0x01) as u16) << 8)
                }
                0x4000..=0x5FFF => regs.ram_bank = val & 0x0F,
                _ => return,
            },
            MbcType::Huc3 => match addr {
                0x0000..=0x1FFF => {
                    regs.huc3_mode = val & 0x0F;
                    regs.ram_enable = regs.huc3_mode == 0x0A;
                }
                0x2000..=0x3FFF => regs.rom_bank = (val & 0x7F) as u16,
                0x4000..=0x5FFF => regs.ram_bank = val & 0x03,
                _ => return,
            },
        }
        self.update_banks();
    }

    /// Re-derives the mapped bank offsets from the raw registers. Every bank
    /// number is masked into the loaded bank array here.
    fn update_banks(&mut self) {
        let rom_mask = self.rom_bank_count() - 1;
        let regs = self.regs;
        let nonzero = |bank: usize| if bank == 0 { 1 } else { bank };

        let (rom0, romn) = match self.mbc {
            MbcType::Plain => (0, 1),
            MbcType::Mbc1 => {
                let high = (regs.ram_bank as usize & 0x03) << 5;
                let low = nonzero(regs.rom_bank as usize & 0x1F);
                (if regs.mode { high } else { 0 }, high | low)
            }
            MbcType::Mbc1Multicart => {
                let high = (regs.ram_bank as usize & 0x03) << 4;
                let low = nonzero(regs.rom_bank as usize & 0x1F) & 0x0F;
                (if regs.mode { high } else { 0 }, high | low)
            }
            MbcType::Mbc2 => (0, nonzero(regs.rom_bank as usize & 0x0F)),
            MbcType::Mbc3 | MbcType::Mbc30 | MbcType::Huc3 => {
                (0, nonzero(regs.rom_bank as usize))
            }
            MbcType::Mbc5 => (0, regs.rom_bank as usize & 0x1FF),
        };
        self.rom0_base = (rom0 & rom_mask) * ROM_BANK_SIZE;
        self.romn_base = (romn & rom_mask) * ROM_BANK_SIZE;

        let ram_banks = self.ram_bank_count();
        let ram = |bank: usize| {
            if ram_banks == 0 {
                RamWindow::Disabled
            } else {
                RamWindow::Ram((bank & (ram_banks - 1)) * RAM_BANK_SIZE)
            }
        };

        self.ram_window = match self.mbc {
            MbcType::Plain => ram(0),
            MbcType::Huc3 => match regs.huc3_mode {
                0x0A => ram(regs.ram_bank as usize),
                mode @ 0x0B..=0x0E => RamWindow::Huc3(mode),
                _ => RamWindow::Disabled,
            },
            _ if !regs.ram_enable => RamWindow::Disabled,
            MbcType::Mbc1 | MbcType::Mbc1Multicart => {
                ram(if regs.mode { regs.ram_bank as usize & 0x03 } else { 0 })
            }
            MbcType::Mbc2 => RamWindow::Mbc2,
            MbcType::Mbc3 | MbcType::Mbc30 => {
                let max_bank = if self.mbc == MbcType::Mbc30 { 0x07 } else { 0x03 };
                match regs.ram_bank {
                    bank if bank <= max_bank => ram(bank as usize),
                    0x08..=0x0C if self.rtc.is_some() => RamWindow::Rtc,
                    _ => RamWindow::Disabled,
                }
            }
            MbcType::Mbc5 => ram(regs.ram_bank as usize),
        };

        if let Some(rtc) = self.rtc.as_mut() {
            rtc.select((self.ram_window == RamWindow::Rtc).then_some(regs.ram_bank));
        }
    }

    pub fn has_battery(&self) -> bool {
        matches!(
            self.cart_type,
            0x03 | 0x06 | 0x09 | 0x0D | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E | 0xFE | 0xFF
        )
    }

    pub fn has_rtc(&self) -> bool {
        self.rtc.is_some() || self.huc3.is_some()
    }

    /// Battery-backed RAM, or an empty slice for carts without a battery.
    pub fn save_ram(&self) -> &[u8] {
        if self.has_battery() { &self.ram } else { &[] }
    }

    pub fn save_ram_mut(&mut self) -> &mut [u8] {
        if self.has_battery() {
            &mut self.ram
        } else {
            &mut []
        }
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    /// Clock base time in unix seconds, shared by MBC3 RTC and HuC3.
    pub fn rtc_base_time(&self) -> Option<i64> {
        self.rtc
            .as_ref()
            .map(|r| r.base_time)
            .or(self.huc3.as_ref().map(|h| h.base_time))
    }

    pub fn set_rtc_base_time(&mut self, base_time: i64) {
        if let Some(rtc) = self.rtc.as_mut() {
            rtc.base_time = base_time;
        }
        if let Some(huc3) = self.huc3.as_mut() {
            huc3.base_time = base_time;
        }
    }

    pub fn set_time_source(&mut self, time_source: TimeSource) {
        self.time_source = time_source;
    }

    pub fn now(&self) -> i64 {
        (self.time_source)()
    }

    pub fn rom_len(&self) -> usize {
        self.rom.len()
    }

    /// Overwrites a byte of the (padded) ROM image, returning the old value.
    pub fn patch_rom(&mut self, offset: usize, value: u8) -> Option<u8> {
        let b = self.rom.get_mut(offset)?;
        Some(std::mem::replace(b, value))
    }

    pub fn rom_byte(&self, offset: usize) -> Option<u8> {
        self.rom.get(offset).copied()
    }

    /// Maps CPU address `addr` in 0x0000-0x7FFF to its current ROM offset.
    pub fn rom_offset(&self, addr: u16) -> usize {
        if addr < 0x4000 {
            self.rom0_base + addr as usize
        } else {
            self.romn_base + (addr as usize & 0x3FFF)
        }
    }

    pub fn set_registers(&mut self, regs: MbcRegisters) {
        self.regs = regs;
        self.update_banks();
    }

    pub(crate) fn save(&self, st: &mut CartState) {
        st.sram = self.ram.clone();
        st.rom_bank = self.regs.rom_bank;
        st.ram_bank = self.regs.ram_bank;
        st.ram_enable = self.regs.ram_enable;
        st.mode = self.regs.mode;
        st.huc3_mode = self.regs.huc3_mode;
        if let Some(rtc) = &self.rtc {
            st.rtc_base_time = rtc.base_time;
            st.rtc_halt_time = rtc.halt_time;
            st.rtc_day_high = rtc.day_high;
            let l = rtc.latched;
            st.rtc_latched = [l.seconds, l.minutes, l.hours, l.day_low, l.day_high];
        }
        if let Some(huc3) = &self.huc3 {
            st.rtc_base_time = huc3.base_time;
            st.huc3_memory = huc3.memory.to_vec();
            st.huc3_index = huc3.index;
            st.huc3_response = huc3.response;
        }
    }

    pub(crate) fn restore_state(&mut self, st: &CartState) {
        if st.sram.len() == self.ram.len() {
            self.ram.copy_from_slice(&st.sram);
        }
        if let Some(rtc) = self.rtc.as_mut() {
            rtc.base_time = st.rtc_base_time;
            rtc.halt_time = st.rtc_halt_time;
            rtc.day_high = st.rtc_day_high & 0xC1;
            let [seconds, minutes, hours, day_low, day_high] = st.rtc_latched;
            rtc.latched = RtcLatch {
                seconds,
                minutes,
                hours,
                day_low,
                day_high,
            };
        }
        if let Some(huc3) = self.huc3.as_mut() {
            huc3.base_time = st.rtc_base_time;
            if st.huc3_memory.len() == huc3.memory.len() {
                huc3.memory.copy_from_slice(&st.huc3_memory);
            }
            huc3.index = st.huc3_index;
            huc3.response = st.huc3_response;
        }
        self.set_registers(MbcRegisters {
            rom_bank: st.rom_bank,
            ram_bank: st.ram_bank,
            ram_enable: st.ram_enable,
            mode: st.mode,
            huc3_mode: st.huc3_mode,
        });
    }

    /// Restores the power-on mapper state. RAM contents and clock base time
    /// are left alone.
    pub fn reset(&mut self) {
        self.set_registers(MbcRegisters {
            rom_bank: 1,
            ..MbcRegisters::default()
        });
    }
}

fn detect_mbc1_multicart(rom: &[u8]) -> bool {
    // Multicart dumps of the common 8 Mbit wiring carry a copy of the header
    // logo at the start of every 256 KiB game slot.
    let bank_count = rom.len() / ROM_BANK_SIZE;
    if bank_count != 64 {
        return false;
    }

    let logo0 = match rom.get(0x0104..0x0134) {
        Some(s) if !s.iter().all(|&b| b == 0) => s,
        _ => return false,
    };

    (1..4).all(|slot| {
        let start = slot * 0x10 * ROM_BANK_SIZE + 0x0104;
        rom.get(start..start + 0x30) == Some(logo0)
    })
}

struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn title(&self) -> String {
        let mut slice = &self.data[0x0134..0x0143];
        if let Some(pos) = slice.iter().position(|&b| b == 0) {
            slice = &slice[..pos];
        }
        String::from_utf8_lossy(slice).trim().to_string()
    }

    fn cgb_supported(&self) -> bool {
        self.data[0x0143] & 0x80 != 0
    }

    fn cart_type(&self) -> u8 {
        self.data[0x0147]
    }

    fn mbc_type(&self) -> Result<MbcType, LoadError> {
        let code = self.cart_type();
        let unsupported = |kind| {
            warn!("Rejected ROM: {kind} mapper (cartridge type {code:#04X})");
            Err(LoadError::UnsupportedMapper { kind, code })
        };
        match code {
            0x00 | 0x08 | 0x09 => Ok(MbcType::Plain),
            0x01..=0x03 => Ok(MbcType::Mbc1),
            0x05 | 0x06 => Ok(MbcType::Mbc2),
            0x0B..=0x0D => unsupported("MMM01"),
            0x0F..=0x13 if self.data[0x0149] == 0x05 => Ok(MbcType::Mbc30),
            0x0F..=0x13 => Ok(MbcType::Mbc3),
            0x15..=0x17 => unsupported("MBC4"),
            0x19..=0x1E => Ok(MbcType::Mbc5),
            0xFC => unsupported("Pocket Camera"),
            0xFD => unsupported("TAMA5"),
            0xFE => Ok(MbcType::Huc3),
            0xFF => unsupported("HuC1"),
            _ => {
                warn!("Rejected ROM: unknown cartridge type {code:#04X}");
                Err(LoadError::UnknownMapper(code))
            }
        }
    }

    fn ram_size(&self, mbc: MbcType) -> usize {
        if mbc == MbcType::Mbc2 {
            return 0x200;
        }
        match self.data[0x0149] {
            0x00 => 0,
            0x01 | 0x02 => RAM_BANK_SIZE,
            0x03 => 4 * RAM_BANK_SIZE,
            0x04 => 16 * RAM_BANK_SIZE,
            0x05 => 8 * RAM_BANK_SIZE,
            _ => RAM_BANK_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_rom(cart_type: u8, rom_banks: usize, ram_code: u8) -> Vec<u8> {
        let mut rom = vec![0u8; rom_banks * ROM_BANK_SIZE];
        for bank in 0..rom_banks {
            rom[bank * ROM_BANK_SIZE] = bank as u8;
            rom[bank * ROM_BANK_SIZE + 1] = (bank >> 8) as u8;
        }
        rom[0x0147] = cart_type;
        rom[0x0149] = ram_code;
        rom
    }

    fn fixed_time() -> i64 {
        1_000_000
    }

    #[test]
    fn mbc1_switches_rom_bank() {
        let mut cart = Cartridge::load(&make_rom(0x01, 4, 0), LoadFlags::NONE).unwrap();
        assert_eq!(cart.read_rom(0x4000), 1);
        cart.mbc_write(0x2000, 0x02);
        assert_eq!(cart.read_rom(0x4000), 2);
        cart.mbc_write(0x2000, 0x00);
        assert_eq!(cart.read_rom(0x4000), 1);
    }

    #[test]
    fn mbc1_mode1_maps_high_bits_into_bank0_window() {
        let mut cart = Cartridge::load(&make_rom(0x01, 128, 0), LoadFlags::NONE).unwrap();
        cart.mbc_write(0x4000, 0x01);
        assert_eq!(cart.read_rom(0x0000), 0);
        assert_eq!(cart.read_rom(0x4000), 0x21);
        cart.mbc_write(0x6000, 0x01);
        assert_eq!(cart.read_rom(0x0000), 0x20);
    }

    #[test]
    fn mbc1_multicart_uses_four_bit_low_bank() {
        let mut rom = make_rom(0x01, 64, 0);
        for slot in 0..4 {
            let start = slot * 0x10 * ROM_BANK_SIZE + 0x104;
            rom[start..start + 0x30].copy_from_slice(&[0xCE; 0x30]);
        }
        let mut cart = Cartridge::load(&rom, LoadFlags::MULTICART_COMPAT).unwrap();
        assert_eq!(cart.mbc, MbcType::Mbc1Multicart);
        cart.mbc_write(0x4000, 0x01);
        cart.mbc_write(0x2000, 0x12);
        assert_eq!(cart.rom_bank(), 0x12);

        let plain = Cartridge::load(&rom, LoadFlags::NONE).unwrap();
        assert_eq!(plain.mbc, MbcType::Mbc1);
    }

    #[test]
    fn rom_is_padded_to_power_of_two() {
        let cart = Cartridge::load(&make_rom(0x19, 3, 0), LoadFlags::NONE).unwrap();
        assert_eq!(cart.rom_bank_count(), 4);
        assert_eq!(cart.rom_byte(3 * ROM_BANK_SIZE), Some(0xFF));
    }

    #[test]
    fn bank_selection_stays_in_range_for_every_mapper() {
        for (cart_type, ram_code) in [
            (0x00, 0x00),
            (0x03, 0x03),
            (0x06, 0x00),
            (0x13, 0x03),
            (0x10, 0x05),
            (0x1B, 0x04),
            (0xFE, 0x03),
        ] {
            let mut cart = Cartridge::load(&make_rom(cart_type, 8, ram_code), LoadFlags::NONE)
                .unwrap_or_else(|e| panic!("type {cart_type:#04X}: {e}"));
            for addr in (0x0000u16..0x8000).step_by(0x0100) {
                for val in [0x00u8, 0x01, 0x0A, 0x1F, 0x20, 0x7F, 0x80, 0xFF] {
                    cart.mbc_write(addr, val);
                    assert!(cart.rom_bank() < cart.rom_bank_count());
                    assert!(cart.rom0_bank() < cart.rom_bank_count());
                    if let Some(bank) = cart.ram_bank() {
                        assert!(bank < cart.ram_bank_count());
                    }
                    let _ = cart.read_rom(0x7FFF);
                    let _ = cart.read_ram(0xBFFF);
                }
            }
        }
    }

    #[test]
    fn disabled_ram_reads_sentinel() {
        let mut cart = Cartridge::load(&make_rom(0x03, 4, 0x02), LoadFlags::NONE).unwrap();
        cart.write_ram(0xA000, 0x12);
        assert_eq!(cart.read_ram(0xA000), 0xFF);
        cart.mbc_write(0x0000, 0x0A);
        cart.write_ram(0xA000, 0x12);
        assert_eq!(cart.read_ram(0xA000), 0x12);
        cart.mbc_write(0x0000, 0x00);
        assert_eq!(cart.read_ram(0xA000), 0xFF);
        assert_eq!(cart.save_ram()[0], 0x12);
    }

    #[test]
    fn mbc2_ram_is_nibble_wide_and_mirrored() {
        let mut cart = Cartridge::load(&make_rom(0x06, 4, 0), LoadFlags::NONE).unwrap();
        cart.mbc_write(0x0000, 0x0A);
        cart.write_ram(0xA001, 0xAB);
        assert_eq!(cart.read_ram(0xA001), 0xFB);
        assert_eq!(cart.read_ram(0xA201), 0xFB);
        cart.mbc_write(0x0100, 0x03);
        assert_eq!(cart.rom_bank(), 3);
    }

    #[test]
    fn mbc5_allows_bank_zero_and_ninth_bit() {
        let mut cart = Cartridge::load(&make_rom(0x19, 512, 0), LoadFlags::NONE).unwrap();
        cart.mbc_write(0x2000, 0x00);
        assert_eq!(cart.rom_bank(), 0);
        cart.mbc_write(0x3000, 0x01);
        cart.mbc_write(0x2000, 0x05);
        assert_eq!(cart.rom_bank(), 0x105);
        assert_eq!(cart.read_rom(0x4001), 0x01);
    }

    #[test]
    fn mbc3_maps_rtc_registers() {
        let mut cart =
            Cartridge::load_with_time_source(&make_rom(0x10, 4, 0x03), LoadFlags::NONE, fixed_time)
                .unwrap();
        assert!(cart.has_rtc());
        cart.mbc_write(0x0000, 0x0A);
        cart.mbc_write(0x4000, 0x08);
        assert_eq!(cart.ram_bank(), None);
        cart.write_ram(0xA000, 42);
        cart.mbc_write(0x6000, 0x00);
        cart.mbc_write(0x6000, 0x01);
        assert_eq!(cart.read_ram(0xA000), 42);
        cart.mbc_write(0x4000, 0x01);
        assert_eq!(cart.ram_bank(), Some(1));
    }

    #[test]
    fn huc3_mode_register_selects_window() {
        let mut cart =
            Cartridge::load_with_time_source(&make_rom(0xFE, 4, 0x03), LoadFlags::NONE, fixed_time)
                .unwrap();
        cart.mbc_write(0x0000, 0x0A);
        cart.write_ram(0xA000, 0x5A);
        assert_eq!(cart.read_ram(0xA000), 0x5A);
        cart.mbc_write(0x0000, 0x0D);
        assert_eq!(cart.read_ram(0xA000), 0x01);
        cart.mbc_write(0x0000, 0x0E);
        assert_eq!(cart.read_ram(0xA000), 0xC0);
        assert_eq!(cart.rtc_base_time(), Some(fixed_time()));
    }

    #[test]
    fn unsupported_mappers_fail_to_load() {
        for (code, kind) in [
            (0x0B, "MMM01"),
            (0x15, "MBC4"),
            (0xFC, "Pocket Camera"),
            (0xFD, "TAMA5"),
            (0xFF, "HuC1"),
        ] {
            assert_eq!(
                Cartridge::load(&make_rom(code, 2, 0), LoadFlags::NONE).unwrap_err(),
                LoadError::UnsupportedMapper { kind, code }
            );
        }
        assert_eq!(
            Cartridge::load(&make_rom(0x42, 2, 0), LoadFlags::NONE).unwrap_err(),
            LoadError::UnknownMapper(0x42)
        );
        assert_eq!(
            Cartridge::load(&[0; 0x200], LoadFlags::NONE).unwrap_err(),
            LoadError::RomTooSmall { len: 0x200 }
        );
    }

    #[test]
    fn state_restores_banks_and_ram() {
        let mut cart = Cartridge::load(&make_rom(0x1B, 8, 0x03), LoadFlags::NONE).unwrap();
        cart.mbc_write(0x0000, 0x0A);
        cart.mbc_write(0x2000, 0x05);
        cart.mbc_write(0x4000, 0x01);
        cart.write_ram(0xA000, 0x42);
        let mut st = crate::savestate::CartState::default();
        cart.save(&mut st);

        let mut other = Cartridge::load(&make_rom(0x1B, 8, 0x03), LoadFlags::NONE).unwrap();
        other.restore_state(&st);
        assert_eq!(other.rom_bank(), 5);
        assert_eq!(other.read_rom(0x4000), 5);
        assert_eq!(other.read_ram(0xA000), 0x42);
    }

    #[test]
    fn reset_keeps_ram_contents() {
        let mut cart = Cartridge::load(&make_rom(0x1B, 8, 0x03), LoadFlags::NONE).unwrap();
        cart.mbc_write(0x0000, 0x0A);
        cart.mbc_write(0x4000, 0x02);
        cart.write_ram(0xA010, 0x77);
        cart.mbc_write(0x2000, 0x05);
        cart.reset();
        assert_eq!(cart.rom_bank(), 1);
        assert_eq!(cart.read_ram(0xA010), 0xFF);
        assert_eq!(cart.ram()[2 * RAM_BANK_SIZE + 0x10], 0x77);
    }
}
