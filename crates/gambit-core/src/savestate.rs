//! Tagged save-state format.
//!
//! A state is a 2-byte big-endian version followed by records of
//! `{u24 label length, label, u24 value length, value}` sorted by label.
//! Integers are big-endian and fixed width, booleans a single byte. Readers
//! skip labels they do not know and leave fields without a record at their
//! pre-load value, so states survive fields being added or removed.

use crate::scheduler::EVENT_COUNT;
use log::warn;
use thiserror::Error;

pub const STATE_VERSION: u16 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("state buffer is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("state record truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("no ROM loaded")]
    NotLoaded,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuState {
    pub cycle_counter: u64,
    pub pc: u16,
    pub sp: u16,
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub f: u8,
    pub h: u8,
    pub l: u8,
    /// HALT bug: the next opcode fetch does not advance PC.
    pub skip: bool,
    pub locked: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemState {
    pub ioamhram: Vec<u8>,
    pub wram: Vec<u8>,
    pub svbk: u8,
    pub double_speed: bool,
    pub key1_armed: bool,
    pub if_reg: u8,
    pub ie_reg: u8,
    pub ime: bool,
    pub halted: bool,
    pub min_int_time: u64,
    pub event_times: [u64; EVENT_COUNT],
    pub oam_dma_start: u64,
    pub oam_dma_src: u16,
    pub oam_dma_pos: u8,
    pub hdma_src: u16,
    pub hdma_dst: u16,
    pub hdma_len: u8,
    pub hdma_active: bool,
    pub gdma_pending: bool,
    pub joypad_select: u8,
    /// Queue position of a completed frame not yet handed out, or `u32::MAX`.
    pub frame_mark: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimerState {
    pub div_base: u64,
    pub last_update: u64,
    pub reload_time: u64,
    pub reloaded_at: u64,
    pub tima: u8,
    pub tma: u8,
    pub tac: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SerialState {
    pub sb: u8,
    pub sc: u8,
    pub incoming: u8,
    pub transfer_end: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CartState {
    pub sram: Vec<u8>,
    pub rom_bank: u16,
    pub ram_bank: u8,
    pub ram_enable: bool,
    pub mode: bool,
    pub huc3_mode: u8,
    pub rtc_base_time: i64,
    pub rtc_halt_time: i64,
    pub rtc_day_high: u8,
    /// Latched seconds, minutes, hours, day low, day high.
    pub rtc_latched: [u8; 5],
    pub huc3_memory: Vec<u8>,
    pub huc3_index: u8,
    pub huc3_response: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PpuState {
    pub vram: Vec<u8>,
    pub vram_bank: u8,
    /// LCDC, STAT, SCY, SCX, LY, LYC, DMA, BGP, OBP0, OBP1, WY, WX.
    pub regs: [u8; 12],
    pub bgpi: u8,
    pub bgpd: [u8; 64],
    pub obpi: u8,
    pub obpd: [u8; 64],
    pub opri: u8,
    pub line: u8,
    pub line_start: u64,
    pub step: u8,
    pub mode: u8,
    pub mode3_dots: u16,
    /// 0xFFFF while the comparator is between LY values.
    pub compare_ly: u16,
    pub lyc_flag: bool,
    pub stat_line: bool,
    pub first_line: bool,
    pub next_off_frame: u64,
    pub rendered_x: u8,
    pub win_line: u8,
    pub wy_triggered: bool,
    pub window_on_line: bool,
    pub framebuffer: Vec<u32>,
}

impl Default for PpuState {
    fn default() -> Self {
        Self {
            vram: Vec::new(),
            vram_bank: 0,
            regs: [0; 12],
            bgpi: 0,
            bgpd: [0; 64],
            obpi: 0,
            obpd: [0; 64],
            opri: 0,
            line: 0,
            line_start: 0,
            step: 0,
            mode: 0,
            mode3_dots: 0,
            compare_ly: 0xFFFF,
            lyc_flag: false,
            stat_line: false,
            first_line: false,
            next_off_frame: 0,
            rendered_x: 0,
            win_line: 0,
            wy_triggered: false,
            window_on_line: false,
            framebuffer: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApuState {
    pub cycle_counter: u64,
    pub enabled: bool,
    pub regs: [u8; 0x17],
    pub nr50: u8,
    pub nr51: u8,
    pub wave_ram: [u8; 16],
    pub fs_step: u8,
    pub fs_counter: u32,
    pub active: [bool; 4],
    pub length: [u16; 4],
    pub timer: [u32; 4],
    pub duty_pos: [u8; 2],
    pub frequency: [u16; 3],
    pub env_volume: [u8; 3],
    pub env_timer: [u8; 3],
    pub sweep_shadow: u16,
    pub sweep_timer: u8,
    pub sweep_enabled: bool,
    pub sweep_neg_used: bool,
    pub wave_position: u8,
    pub wave_sample: u8,
    pub lfsr: u16,
    /// Samples produced but not yet handed to the host.
    pub pending: Vec<u32>,
}

/// Flat aggregate of the whole machine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SaveState {
    pub cpu: CpuState,
    pub mem: MemState,
    pub timer: TimerState,
    pub serial: SerialState,
    pub cart: CartState,
    pub ppu: PpuState,
    pub apu: ApuState,
}

/// Fixed-width big-endian scalars.
trait Scalar: Copy + Default {
    const SIZE: usize;
    fn put_be(self, out: &mut Vec<u8>);
    fn get_be(data: &[u8]) -> Self;
}

macro_rules! scalar_int {
    ($($t:ty),*) => {$(
        impl Scalar for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn put_be(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_be_bytes());
            }

            fn get_be(data: &[u8]) -> Self {
                let mut bytes = [0u8; std::mem::size_of::<$t>()];
                bytes.copy_from_slice(&data[..Self::SIZE]);
                <$t>::from_be_bytes(bytes)
            }
        }
    )*};
}

scalar_int!(u8, u16, u32, u64, i64);

impl Scalar for bool {
    const SIZE: usize = 1;

    fn put_be(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    fn get_be(data: &[u8]) -> Self {
        data[0] != 0
    }
}

/// A field that can be written to and read back from a record value.
trait StateValue {
    fn put(&self, out: &mut Vec<u8>);
    /// Decodes `data` into `self`. Returns false, leaving `self` untouched,
    /// when the value has the wrong shape.
    fn take(&mut self, data: &[u8]) -> bool;
}

macro_rules! state_scalar {
    ($($t:ty),*) => {$(
        impl StateValue for $t {
            fn put(&self, out: &mut Vec<u8>) {
                self.put_be(out);
            }

            fn take(&mut self, data: &[u8]) -> bool {
                if data.len() != <$t as Scalar>::SIZE {
                    return false;
                }
                *self = <$t as Scalar>::get_be(data);
                true
            }
        }
    )*};
}

state_scalar!(u8, u16, u32, u64, i64, bool);

impl<T: Scalar, const N: usize> StateValue for [T; N] {
    fn put(&self, out: &mut Vec<u8>) {
        for v in self {
            v.put_be(out);
        }
    }

    fn take(&mut self, data: &[u8]) -> bool {
        if data.len() != N * T::SIZE {
            return false;
        }
        for (dst, chunk) in self.iter_mut().zip(data.chunks_exact(T::SIZE)) {
            *dst = T::get_be(chunk);
        }
        true
    }
}

impl<T: Scalar> StateValue for Vec<T> {
    fn put(&self, out: &mut Vec<u8>) {
        for v in self {
            v.put_be(out);
        }
    }

    fn take(&mut self, data: &[u8]) -> bool {
        if data.len() % T::SIZE != 0 {
            return false;
        }
        *self = data.chunks_exact(T::SIZE).map(T::get_be).collect();
        true
    }
}

struct Field {
    label: &'static str,
    save: fn(&SaveState, &mut Vec<u8>),
    load: fn(&mut SaveState, &[u8]) -> bool,
}

macro_rules! fields {
    ($($label:literal => $($path:ident).+;)*) => {
        &[$(Field {
            label: $label,
            save: |s: &SaveState, out: &mut Vec<u8>| s.$($path).+.put(out),
            load: |s: &mut SaveState, data: &[u8]| s.$($path).+.take(data),
        },)*]
    };
}

/// Every persisted field, sorted by label.
const FIELDS: &[Field] = fields! {
    "apu.active" => apu.active;
    "apu.cc" => apu.cycle_counter;
    "apu.dutypos" => apu.duty_pos;
    "apu.enabled" => apu.enabled;
    "apu.envtimer" => apu.env_timer;
    "apu.envvol" => apu.env_volume;
    "apu.freq" => apu.frequency;
    "apu.fscnt" => apu.fs_counter;
    "apu.fsstep" => apu.fs_step;
    "apu.length" => apu.length;
    "apu.lfsr" => apu.lfsr;
    "apu.nr50" => apu.nr50;
    "apu.nr51" => apu.nr51;
    "apu.pending" => apu.pending;
    "apu.regs" => apu.regs;
    "apu.swen" => apu.sweep_enabled;
    "apu.swneg" => apu.sweep_neg_used;
    "apu.swshadow" => apu.sweep_shadow;
    "apu.swtimer" => apu.sweep_timer;
    "apu.timer" => apu.timer;
    "apu.wavepos" => apu.wave_position;
    "apu.waveram" => apu.wave_ram;
    "apu.wavesmp" => apu.wave_sample;
    "cart.huc3idx" => cart.huc3_index;
    "cart.huc3mem" => cart.huc3_memory;
    "cart.huc3mode" => cart.huc3_mode;
    "cart.huc3resp" => cart.huc3_response;
    "cart.mode" => cart.mode;
    "cart.rambank" => cart.ram_bank;
    "cart.ramen" => cart.ram_enable;
    "cart.rombank" => cart.rom_bank;
    "cart.rtcbase" => cart.rtc_base_time;
    "cart.rtcdh" => cart.rtc_day_high;
    "cart.rtchalt" => cart.rtc_halt_time;
    "cart.rtclatch" => cart.rtc_latched;
    "cart.sram" => cart.sram;
    "cpu.a" => cpu.a;
    "cpu.b" => cpu.b;
    "cpu.c" => cpu.c;
    "cpu.cc" => cpu.cycle_counter;
    "cpu.d" => cpu.d;
    "cpu.e" => cpu.e;
    "cpu.f" => cpu.f;
    "cpu.h" => cpu.h;
    "cpu.l" => cpu.l;
    "cpu.locked" => cpu.locked;
    "cpu.pc" => cpu.pc;
    "cpu.skip" => cpu.skip;
    "cpu.sp" => cpu.sp;
    "mem.dblspeed" => mem.double_speed;
    "mem.events" => mem.event_times;
    "mem.framemark" => mem.frame_mark;
    "mem.gdma" => mem.gdma_pending;
    "mem.halted" => mem.halted;
    "mem.hdmaact" => mem.hdma_active;
    "mem.hdmadst" => mem.hdma_dst;
    "mem.hdmalen" => mem.hdma_len;
    "mem.hdmasrc" => mem.hdma_src;
    "mem.ie" => mem.ie_reg;
    "mem.if" => mem.if_reg;
    "mem.ime" => mem.ime;
    "mem.ioamhram" => mem.ioamhram;
    "mem.joysel" => mem.joypad_select;
    "mem.key1" => mem.key1_armed;
    "mem.minint" => mem.min_int_time;
    "mem.oampos" => mem.oam_dma_pos;
    "mem.oamsrc" => mem.oam_dma_src;
    "mem.oamstart" => mem.oam_dma_start;
    "mem.svbk" => mem.svbk;
    "mem.wram" => mem.wram;
    "ppu.bgpd" => ppu.bgpd;
    "ppu.bgpi" => ppu.bgpi;
    "ppu.cmply" => ppu.compare_ly;
    "ppu.fb" => ppu.framebuffer;
    "ppu.firstline" => ppu.first_line;
    "ppu.line" => ppu.line;
    "ppu.linestart" => ppu.line_start;
    "ppu.lycflag" => ppu.lyc_flag;
    "ppu.m3dots" => ppu.mode3_dots;
    "ppu.mode" => ppu.mode;
    "ppu.nextoff" => ppu.next_off_frame;
    "ppu.obpd" => ppu.obpd;
    "ppu.obpi" => ppu.obpi;
    "ppu.opri" => ppu.opri;
    "ppu.regs" => ppu.regs;
    "ppu.renderx" => ppu.rendered_x;
    "ppu.statline" => ppu.stat_line;
    "ppu.step" => ppu.step;
    "ppu.vbank" => ppu.vram_bank;
    "ppu.vram" => ppu.vram;
    "ppu.winline" => ppu.win_line;
    "ppu.winon" => ppu.window_on_line;
    "ppu.wytrig" => ppu.wy_triggered;
    "serial.end" => serial.transfer_end;
    "serial.in" => serial.incoming;
    "serial.sb" => serial.sb;
    "serial.sc" => serial.sc;
    "timer.base" => timer.div_base;
    "timer.last" => timer.last_update;
    "timer.reload" => timer.reload_time;
    "timer.reloaded" => timer.reloaded_at;
    "timer.tac" => timer.tac;
    "timer.tima" => timer.tima;
    "timer.tma" => timer.tma;
};

fn put_u24(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u32).to_be_bytes()[1..]);
}

impl SaveState {
    /// Serializes every field in label order.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = STATE_VERSION.to_be_bytes().to_vec();
        let mut value = Vec::new();
        for field in FIELDS {
            value.clear();
            (field.save)(self, &mut value);
            put_u24(&mut out, field.label.len());
            out.extend_from_slice(field.label.as_bytes());
            put_u24(&mut out, value.len());
            out.extend_from_slice(&value);
        }
        out
    }

    /// Applies the records in `data` on top of `self`.
    ///
    /// The whole buffer is validated before any field changes, so a
    /// truncated state leaves `self` as it was.
    pub fn decode_into(&mut self, data: &[u8]) -> Result<(), StateError> {
        let records = split_records(data)?;
        if let Some(version) = data.get(..2)
            && u16::from_be_bytes([version[0], version[1]]) != STATE_VERSION
        {
            warn!(
                "Loading state version {:#06X}, expected {STATE_VERSION:#06X}",
                u16::from_be_bytes([version[0], version[1]])
            );
        }
        for (label, value) in records {
            match FIELDS.binary_search_by(|f| f.label.as_bytes().cmp(label)) {
                Ok(i) => {
                    if !(FIELDS[i].load)(self, value) {
                        warn!(
                            "Ignoring state field {} with {} value bytes",
                            FIELDS[i].label,
                            value.len()
                        );
                    }
                }
                Err(_) => warn!("Skipping unknown state field {:?}", String::from_utf8_lossy(label)),
            }
        }
        Ok(())
    }
}

fn split_records(data: &[u8]) -> Result<Vec<(&[u8], &[u8])>, StateError> {
    if data.len() < 2 {
        return Err(StateError::Truncated { offset: 0 });
    }
    let mut records = Vec::new();
    let mut pos = 2;
    while pos < data.len() {
        let label = take_chunk(data, &mut pos)?;
        let value = take_chunk(data, &mut pos)?;
        records.push((label, value));
    }
    Ok(records)
}

fn take_chunk<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], StateError> {
    let offset = *pos;
    let header = data
        .get(offset..offset + 3)
        .ok_or(StateError::Truncated { offset })?;
    let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    let body = data
        .get(offset + 3..offset + 3 + len)
        .ok_or(StateError::Truncated { offset })?;
    *pos = offset + 3 + len;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SaveState {
        let mut st = SaveState::default();
        st.cpu.pc = 0x0150;
        st.cpu.cycle_counter = 0x1234_5678_9A;
        st.cpu.skip = true;
        st.mem.wram = vec![0xAB; 0x2000];
        st.mem.event_times = [1, 2, 3, 4, 5, 6, u64::MAX];
        st.cart.rtc_base_time = -5;
        st.ppu.framebuffer = vec![0x00FF_FFFF; 4];
        st.apu.pending = vec![0x8000_7FFF, 1];
        st
    }

    #[test]
    fn labels_are_sorted_and_unique() {
        for pair in FIELDS.windows(2) {
            assert!(pair[0].label < pair[1].label, "{} >= {}", pair[0].label, pair[1].label);
        }
    }

    #[test]
    fn encode_decode_restores_every_field() {
        let st = sample();
        let bytes = st.encode();
        assert_eq!(&bytes[..2], &STATE_VERSION.to_be_bytes());
        let mut back = SaveState::default();
        back.decode_into(&bytes).unwrap();
        assert_eq!(back, st);
    }

    #[test]
    fn values_are_big_endian() {
        let mut st = SaveState::default();
        st.cpu.pc = 0x0150;
        let bytes = st.encode();
        let label = b"cpu.pc";
        let at = bytes
            .windows(label.len())
            .position(|w| w == label)
            .unwrap();
        let value = &bytes[at + label.len()..at + label.len() + 5];
        assert_eq!(value, &[0, 0, 2, 0x01, 0x50]);
    }

    #[test]
    fn unknown_labels_are_skipped_and_missing_keep_value() {
        let mut data = STATE_VERSION.to_be_bytes().to_vec();
        for (label, value) in [(&b"aaa.unknown"[..], &[1u8, 2, 3][..]), (b"cpu.a", &[0x42])] {
            put_u24(&mut data, label.len());
            data.extend_from_slice(label);
            put_u24(&mut data, value.len());
            data.extend_from_slice(value);
        }
        let mut st = sample();
        st.decode_into(&data).unwrap();
        assert_eq!(st.cpu.a, 0x42);
        assert_eq!(st.cpu.pc, 0x0150);
    }

    #[test]
    fn truncated_record_changes_nothing() {
        let bytes = sample().encode();
        let cut = &bytes[..bytes.len() - 1];
        let mut st = SaveState::default();
        let err = st.decode_into(cut).unwrap_err();
        assert!(matches!(err, StateError::Truncated { .. }));
        assert_eq!(st, SaveState::default());
    }

    #[test]
    fn wrong_width_value_is_ignored() {
        let mut data = STATE_VERSION.to_be_bytes().to_vec();
        put_u24(&mut data, 6);
        data.extend_from_slice(b"cpu.pc");
        put_u24(&mut data, 1);
        data.push(0x99);
        let mut st = sample();
        st.decode_into(&data).unwrap();
        assert_eq!(st.cpu.pc, 0x0150);
    }
}
