use crate::{
    cartridge::{Cartridge, LoadError},
    cheats::Cheats,
    cpu::Cpu,
    hardware::{HardwareMode, LoadFlags},
    input::InputGetter,
    mmu::Memory,
    ppu::{ColorCorrection, DMG_DEFAULT_PALETTE, PixelFormat, SCREEN_HEIGHT, SCREEN_WIDTH},
    savestate::{SaveState, StateError},
    serial::SerialIo,
};
use log::{debug, warn};

/// Host-side video settings, kept across loads and resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VideoConfig {
    format: PixelFormat,
    correction: ColorCorrection,
    dmg_palette: [[u32; 4]; 3],
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            format: PixelFormat::default(),
            correction: ColorCorrection::Off,
            dmg_palette: [DMG_DEFAULT_PALETTE; 3],
        }
    }
}

/// A console with a cartridge slot.
///
/// The handle starts unloaded. [`GameBoy::load`] inserts a ROM and powers the
/// machine on in the post-boot state; [`GameBoy::run_for`] then produces
/// audio and video in host-sized chunks.
pub struct GameBoy {
    pub cpu: Cpu,
    pub mem: Memory,
    flags: LoadFlags,
    loaded: bool,
    video: VideoConfig,
}

impl GameBoy {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::default(),
            mem: Memory::new_with_mode(HardwareMode::Dmg),
            flags: LoadFlags::NONE,
            loaded: false,
            video: VideoConfig::default(),
        }
    }

    /// Loads `rom` and powers on. On failure the handle is left unloaded.
    ///
    /// Input getter, serial transport and video settings carry over from
    /// the previous cartridge.
    pub fn load(&mut self, rom: &[u8], flags: LoadFlags) -> Result<(), LoadError> {
        self.loaded = false;
        self.mem.cart = None;
        let cart = Cartridge::load(rom, flags)?;
        self.flags = flags;
        self.power_on(cart, Cheats::default());
        self.loaded = true;
        debug!(
            "Powered on as {:?}{}",
            self.mem.mode(),
            if flags.contains(LoadFlags::GBA_CGB) { " (GBA)" } else { "" }
        );
        Ok(())
    }

    fn power_on(&mut self, cart: Cartridge, cheats: Cheats) {
        let getter = self.mem.joypad.take_getter();
        let io = self.mem.serial.disconnect();
        let mode = HardwareMode::select(cart.cgb, self.flags);
        self.cpu = Cpu::new_with_mode(mode, self.flags.contains(LoadFlags::GBA_CGB));
        self.mem = Memory::new_with_mode(mode);
        self.mem.load_cart(cart);
        self.mem.cheats = cheats;
        self.mem.joypad.set_getter(getter);
        self.mem.serial.connect(io);
        self.apply_video_config();
        self.mem.apply_boot_state(self.cpu.cycles);
    }

    fn apply_video_config(&mut self) {
        let ppu = &mut self.mem.ppu;
        for (p, colors) in self.video.dmg_palette.iter().enumerate() {
            for (c, &rgb) in colors.iter().enumerate() {
                ppu.set_dmg_palette_color(p, c, rgb);
            }
        }
        ppu.set_color_correction_mode(self.video.correction);
        ppu.set_pixel_format(self.video.format);
    }

    /// Power-cycles the loaded cartridge. Battery RAM, the clock base time
    /// and active cheats survive.
    pub fn reset(&mut self) {
        let Some(mut cart) = self.mem.cart.take() else {
            return;
        };
        cart.reset();
        let cheats = std::mem::take(&mut self.mem.cheats);
        self.power_on(cart, cheats);
        debug!("Reset");
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[inline]
    pub fn is_cgb(&self) -> bool {
        self.loaded && self.mem.is_cgb()
    }

    /// Emulates until `*samples` stereo samples are available or a video
    /// frame completes.
    ///
    /// On return `*samples` holds how many samples were written to `audio`,
    /// never more than `audio.len()`. Samples that did not fit stay queued
    /// for the next call. Returns the offset into those samples at which a
    /// frame completed, with the frame copied into `video` (rows `pitch`
    /// pixels apart), or -1.
    pub fn run_for(
        &mut self,
        video: &mut [u32],
        pitch: usize,
        audio: &mut [u32],
        samples: &mut usize,
    ) -> isize {
        if !self.loaded {
            *samples = 0;
            return -1;
        }
        let requested = (*samples).min(audio.len());
        self.mem.poll_serial(self.cpu.cycles);

        let pending = self.mem.apu.pending_samples();
        if !self.mem.frame_pending() && requested > pending {
            let ds = self.mem.double_speed();
            let cycles = ((requested - pending) as u64) << (1 + ds as u32);
            self.cpu.run_for(&mut self.mem, cycles);
            self.mem
                .apu
                .generate_samples(self.cpu.cycles, self.mem.double_speed());
        }

        let (n, frame) = self.mem.drain_samples(audio);
        *samples = n;
        match frame {
            Some(mark) => {
                self.blit(video, pitch);
                mark as isize
            }
            None => -1,
        }
    }

    fn blit(&self, video: &mut [u32], pitch: usize) {
        let pitch = pitch.max(SCREEN_WIDTH);
        let fb = self.mem.ppu.framebuffer();
        for (y, row) in fb.chunks_exact(SCREEN_WIDTH).take(SCREEN_HEIGHT).enumerate() {
            let start = y * pitch;
            let Some(dst) = video.get_mut(start..start + SCREEN_WIDTH) else {
                break;
            };
            dst.copy_from_slice(row);
        }
    }

    // ---- save states ----

    fn snapshot(&self) -> SaveState {
        let mut st = SaveState::default();
        self.cpu.save(&mut st.cpu);
        self.mem.save(&mut st);
        st
    }

    /// Bytes [`GameBoy::save_state`] needs right now. Queued audio is part of
    /// the state, so the size can change as the machine runs.
    pub fn state_size(&self) -> usize {
        if self.loaded {
            self.snapshot().encode().len()
        } else {
            0
        }
    }

    pub fn save_state(&self, buf: &mut [u8]) -> Result<(), StateError> {
        let data = self.save_state_vec()?;
        if buf.len() != data.len() {
            return Err(StateError::SizeMismatch {
                expected: data.len(),
                actual: buf.len(),
            });
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    pub fn save_state_vec(&self) -> Result<Vec<u8>, StateError> {
        if !self.loaded {
            return Err(StateError::NotLoaded);
        }
        Ok(self.snapshot().encode())
    }

    /// Restores a state. Records the state lacks keep their current values.
    /// A malformed state is rejected before anything changes.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        if !self.loaded {
            return Err(StateError::NotLoaded);
        }
        let mut st = self.snapshot();
        if let Err(err) = st.decode_into(data) {
            warn!("Rejected save state: {err}");
            return Err(err);
        }
        self.cpu.load(&st.cpu);
        self.mem.load(&st);
        Ok(())
    }

    // ---- host hooks ----

    pub fn set_input_getter(&mut self, getter: Box<dyn InputGetter>) {
        self.mem.joypad.set_getter(getter);
    }

    pub fn set_serial_io(&mut self, io: Box<dyn SerialIo>) {
        self.mem.serial.connect(io);
    }

    /// Sets one DMG shade. `palette` is 0 for BG, 1 for OBP0, 2 for OBP1;
    /// `color` is the shade index 0-3; `rgb` is 0xRRGGBB.
    pub fn set_dmg_palette_color(&mut self, palette: usize, color: usize, rgb: u32) {
        if palette < 3 && color < 4 {
            self.video.dmg_palette[palette][color] = rgb & 0xFF_FFFF;
            self.mem.ppu.set_dmg_palette_color(palette, color, rgb);
        }
    }

    /// Switches CGB color correction on with the current mode, or off.
    pub fn set_color_correction(&mut self, enabled: bool) {
        self.mem.ppu.set_color_correction(enabled);
        self.video.correction = self.mem.ppu.color_correction();
    }

    pub fn set_color_correction_mode(&mut self, mode: ColorCorrection) {
        self.video.correction = mode;
        self.mem.ppu.set_color_correction_mode(mode);
    }

    pub fn set_pixel_format(&mut self, format: PixelFormat) {
        self.video.format = format;
        self.mem.ppu.set_pixel_format(format);
    }

    // ---- cheats ----

    /// Applies `;`-separated Game Genie codes to the ROM.
    pub fn set_game_genie(&mut self, codes: &str) {
        if let Some(cart) = self.mem.cart.as_mut() {
            self.mem.cheats.set_game_genie(cart, codes);
        }
    }

    /// Installs `;`-separated GameShark codes, applied at every VBlank
    /// interrupt.
    pub fn set_game_shark(&mut self, codes: &str) {
        self.mem.cheats.set_game_shark(codes);
    }

    /// Reverts every ROM patch and drops all RAM codes.
    pub fn clear_cheats(&mut self) {
        if let Some(cart) = self.mem.cart.as_mut() {
            self.mem.cheats.clear(cart);
        }
    }

    // ---- persistent storage ----

    /// Battery-backed RAM, empty without a battery.
    pub fn save_ram(&self) -> &[u8] {
        match &self.mem.cart {
            Some(cart) => cart.save_ram(),
            None => &[],
        }
    }

    pub fn save_ram_mut(&mut self) -> &mut [u8] {
        match self.mem.cart.as_mut() {
            Some(cart) => cart.save_ram_mut(),
            None => &mut [],
        }
    }

    /// Copies a battery file into save RAM. A short file fills the start, a
    /// long one is cut.
    pub fn load_save_ram(&mut self, data: &[u8]) {
        let ram = self.save_ram_mut();
        let n = ram.len().min(data.len());
        if n != ram.len() {
            warn!("Battery file is {} bytes, cartridge has {}", data.len(), ram.len());
        }
        ram[..n].copy_from_slice(&data[..n]);
    }

    pub fn rtc_base_time(&self) -> Option<i64> {
        self.mem.cart.as_ref().and_then(|c| c.rtc_base_time())
    }

    pub fn set_rtc_base_time(&mut self, base_time: i64) {
        if let Some(cart) = self.mem.cart.as_mut() {
            cart.set_rtc_base_time(base_time);
        }
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_rom() -> Vec<u8> {
        let mut rom = vec![0u8; 0x8000];
        // JR -2 at the entry point.
        rom[0x100] = 0x18;
        rom[0x101] = 0xFE;
        rom
    }

    #[test]
    fn handle_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<GameBoy>();
    }

    #[test]
    fn unloaded_handle_produces_nothing() {
        let mut gb = GameBoy::new();
        let mut video = vec![0u32; SCREEN_WIDTH * SCREEN_HEIGHT];
        let mut audio = vec![0u32; 4096];
        let mut samples = 2064;
        assert_eq!(gb.run_for(&mut video, SCREEN_WIDTH, &mut audio, &mut samples), -1);
        assert_eq!(samples, 0);
        assert_eq!(gb.save_state_vec(), Err(StateError::NotLoaded));
        assert_eq!(gb.load_state(&[0, 1]), Err(StateError::NotLoaded));
        assert!(!gb.is_cgb());
    }

    #[test]
    fn failed_load_leaves_handle_unloaded() {
        let mut gb = GameBoy::new();
        gb.load(&plain_rom(), LoadFlags::NONE).unwrap();
        assert!(gb.is_loaded());
        assert!(gb.load(&[0u8; 0x100], LoadFlags::NONE).is_err());
        assert!(!gb.is_loaded());
    }

    #[test]
    fn wrong_size_buffer_is_rejected_untouched() {
        let mut gb = GameBoy::new();
        gb.load(&plain_rom(), LoadFlags::NONE).unwrap();
        let size = gb.state_size();
        let mut buf = vec![0xA5u8; size + 1];
        assert_eq!(
            gb.save_state(&mut buf),
            Err(StateError::SizeMismatch {
                expected: size,
                actual: size + 1
            })
        );
        assert!(buf.iter().all(|&b| b == 0xA5));
        let mut buf = vec![0u8; size];
        gb.save_state(&mut buf).unwrap();
    }

    #[test]
    fn video_settings_survive_reset() {
        let mut gb = GameBoy::new();
        gb.set_pixel_format(PixelFormat::Rgb565);
        gb.load(&plain_rom(), LoadFlags::NONE).unwrap();
        gb.reset();
        assert_eq!(gb.mem.ppu.pixel_format(), PixelFormat::Rgb565);
        assert_eq!((gb.cpu.pc, gb.cpu.cycles), (0x0100, 0));
    }
}
