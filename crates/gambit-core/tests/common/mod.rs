#![allow(dead_code)]

use gambit_core::{GameBoy, LoadFlags, SCREEN_HEIGHT, SCREEN_WIDTH};

pub const BANK_SIZE: usize = 0x4000;
pub const CODE_START: usize = 0x150;
pub const SAMPLES_PER_CALL: usize = 2064;

/// Synthetic cartridge image. Execution starts at 0x100 with a jump to
/// [`CODE_START`].
pub struct RomBuilder {
    rom: Vec<u8>,
    code_len: usize,
}

impl RomBuilder {
    pub fn new(cart_type: u8, banks: usize) -> Self {
        let mut rom = vec![0u8; banks.max(2) * BANK_SIZE];
        rom[0x100..0x104].copy_from_slice(&[0x00, 0xC3, CODE_START as u8, 0x01]);
        rom[0x134..0x13A].copy_from_slice(b"GAMBIT");
        rom[0x147] = cart_type;
        rom[0x148] = (banks.max(2) / 2).trailing_zeros() as u8;
        Self { rom, code_len: 0 }
    }

    pub fn plain() -> Self {
        Self::new(0x00, 2)
    }

    pub fn cgb(mut self) -> Self {
        self.rom[0x143] = 0x80;
        self
    }

    pub fn ram_size(mut self, code: u8) -> Self {
        self.rom[0x149] = code;
        self
    }

    /// Writes `bank` at `offset` inside every bank.
    pub fn tag_banks(mut self, offset: usize) -> Self {
        for (bank, chunk) in self.rom.chunks_mut(BANK_SIZE).enumerate() {
            chunk[offset] = bank as u8;
        }
        self
    }

    pub fn code(mut self, bytes: &[u8]) -> Self {
        let start = CODE_START + self.code_len;
        self.rom[start..start + bytes.len()].copy_from_slice(bytes);
        self.code_len += bytes.len();
        self
    }

    /// Ends the program with `JR -2`.
    pub fn park(self) -> Self {
        self.code(&[0x18, 0xFE])
    }

    pub fn build(self) -> Vec<u8> {
        self.rom
    }
}

/// Powered-on console running `rom`.
pub fn boot(rom: &[u8], flags: LoadFlags) -> GameBoy {
    let mut gb = GameBoy::new();
    gb.load(rom, flags).expect("synthetic ROM should load");
    gb
}

/// Output of a sequence of `run_for` calls.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Capture {
    pub audio: Vec<u32>,
    pub frames: Vec<Vec<u32>>,
}

pub fn run_calls(gb: &mut GameBoy, calls: usize) -> Capture {
    let mut capture = Capture::default();
    let mut video = vec![0u32; SCREEN_WIDTH * SCREEN_HEIGHT];
    let mut audio = vec![0u32; SAMPLES_PER_CALL * 2];
    for _ in 0..calls {
        let mut samples = SAMPLES_PER_CALL;
        let mark = gb.run_for(&mut video, SCREEN_WIDTH, &mut audio, &mut samples);
        capture.audio.extend_from_slice(&audio[..samples]);
        if mark >= 0 {
            capture.frames.push(video.clone());
        }
    }
    capture
}

/// Runs until a frame completes and returns it.
pub fn next_frame(gb: &mut GameBoy) -> Vec<u32> {
    let mut video = vec![0u32; SCREEN_WIDTH * SCREEN_HEIGHT];
    let mut audio = vec![0u32; SAMPLES_PER_CALL * 2];
    for _ in 0..64 {
        let mut samples = SAMPLES_PER_CALL;
        if gb.run_for(&mut video, SCREEN_WIDTH, &mut audio, &mut samples) >= 0 {
            return video;
        }
    }
    panic!("no frame completed within 64 calls");
}
