use crate::{
    hardware::HardwareMode,
    interrupts::{INT_STAT, INT_VBLANK, IrqSink},
    savestate::PpuState,
};

#[cfg(feature = "ppu-trace")]
macro_rules! ppu_trace {
    ($($arg:tt)*) => {
        log::trace!($($arg)*);
    };
}
#[cfg(not(feature = "ppu-trace"))]
macro_rules! ppu_trace {
    ($($arg:tt)*) => {};
}

// Screen resolution used by the Game Boy PPU
pub const SCREEN_WIDTH: usize = 160;
pub const SCREEN_HEIGHT: usize = 144;

// Line timing in dots. A dot is one master cycle, two in double speed.
const LINE_DOTS: u64 = 456;
const LINES_PER_FRAME: u8 = 154;
const MODE2_DOTS: u16 = 80;
const MODE3_BASE_DOTS: u16 = 172;
const SPRITE_PENALTY: u16 = 6;
const WINDOW_PENALTY: u16 = 6;
/// Dot at which the LY=LYC comparison settles after a line change.
const LYC_DOT: u16 = 4;
/// Master cycles per frame at normal speed.
pub const FRAME_CYCLES: u64 = LINE_DOTS * LINES_PER_FRAME as u64;

// Sprite limits
const MAX_SPRITES_PER_LINE: usize = 10;
const MODE3_MAX_DOTS: u16 =
    MODE3_BASE_DOTS + 7 + MAX_SPRITES_PER_LINE as u16 * SPRITE_PENALTY + WINDOW_PENALTY;
const TOTAL_SPRITES: usize = 40;

// Internal memory sizes
const VRAM_BANK_SIZE: usize = 0x2000;
const PAL_RAM_SIZE: usize = 0x40;
const PAL_INDEX_MASK: u8 = 0x3F;
const PAL_UNUSED_BIT: u8 = 0x40;
const PAL_AUTO_INCREMENT_BIT: u8 = 0x80;

// Window X position is clipped if greater than this value
const WINDOW_X_MAX: u8 = 166;

// VRAM layout constants
const BG_MAP_0_BASE: usize = 0x1800;
const BG_MAP_1_BASE: usize = 0x1C00;
const TILE_DATA_0_BASE: usize = 0x0000;
const TILE_DATA_1_BASE: usize = 0x0800;

// LCD modes reported in STAT
const MODE_HBLANK: u8 = 0;
const MODE_VBLANK: u8 = 1;
const MODE_OAM: u8 = 2;
const MODE_TRANSFER: u8 = 3;

/// Default DMG shades, lightest first, as 0xRRGGBB.
pub const DMG_DEFAULT_PALETTE: [u32; 4] = [0xFFFFFF, 0xAAAAAA, 0x555555, 0x000000];

/// Output pixel encoding. 16-bit formats use the low half of each `u32`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    #[default]
    Xrgb8888,
    Rgb565,
    /// Alpha bit set, 5 bits per channel.
    Argb1555,
}

impl PixelFormat {
    pub fn pack(self, r: u8, g: u8, b: u8) -> u32 {
        let (r, g, b) = (r as u32, g as u32, b as u32);
        match self {
            Self::Xrgb8888 => r << 16 | g << 8 | b,
            Self::Rgb565 => (r >> 3) << 11 | (g >> 2) << 5 | b >> 3,
            Self::Argb1555 => 0x8000 | (r >> 3) << 10 | (g >> 3) << 5 | b >> 3,
        }
    }

    fn pack_rgb888(self, rgb: u32) -> u32 {
        self.pack((rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8)
    }
}

/// How CGB 15-bit colors are mapped to the output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorCorrection {
    /// Plain 5 to 8 bit expansion.
    #[default]
    Off,
    /// Integer approximation of the CGB LCD response.
    Fast,
    /// Gamma-correct channel mixing.
    Accurate,
}

impl ColorCorrection {
    /// Converts a 15-bit BGR555 value to 8-bit RGB.
    pub fn convert(self, raw: u16) -> (u8, u8, u8) {
        let r = (raw & 0x1F) as u32;
        let g = ((raw >> 5) & 0x1F) as u32;
        let b = ((raw >> 10) & 0x1F) as u32;
        match self {
            Self::Off => (expand5(r), expand5(g), expand5(b)),
            Self::Fast => (
                ((r * 13 + g * 2 + b) >> 1) as u8,
                ((g * 3 + b) << 1) as u8,
                ((r * 3 + g * 2 + b * 11) >> 1) as u8,
            ),
            Self::Accurate => {
                const GAMMA: f32 = 2.2;
                let lin = |c: u32| (c as f32 / 31.0).powf(GAMMA);
                let (lr, lg, lb) = (lin(r), lin(g), lin(b));
                let mix = |a: f32, b2: f32, c: f32| {
                    let v = (a * lr + b2 * lg + c * lb).clamp(0.0, 1.0);
                    (v.powf(1.0 / GAMMA) * 255.0).round() as u8
                };
                (
                    mix(0.82, 0.24, -0.06),
                    mix(0.125, 0.665, 0.21),
                    mix(0.195, 0.075, 0.73),
                )
            }
        }
    }
}

fn expand5(c: u32) -> u8 {
    (c << 3 | c >> 2) as u8
}

/// Per-line timing boundaries, in the order they occur.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    LineStart,
    LycCheck,
    /// Second comparison on line 153, once LY reads 0.
    LycZero,
    Mode3,
    Mode0,
}

impl Step {
    fn to_u8(self) -> u8 {
        match self {
            Step::LineStart => 0,
            Step::LycCheck => 1,
            Step::LycZero => 2,
            Step::Mode3 => 3,
            Step::Mode0 => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Step::LycCheck,
            2 => Step::LycZero,
            3 => Step::Mode3,
            4 => Step::Mode0,
            _ => Step::LineStart,
        }
    }
}

#[derive(Copy, Clone, Default, Debug)]
struct Sprite {
    x: i16,
    y: i16,
    tile: u8,
    flags: u8,
    oam_index: usize,
}

/// LCD controller.
///
/// Timing is derived from the master cycle counter: [`Ppu::update`] walks
/// every line boundary up to the requested cycle, raising STAT and VBlank
/// interrupts at the cycle they occur, and renders mode-3 pixels up to the
/// current dot.
#[derive(Clone, Debug)]
pub struct Ppu {
    vram: Vec<u8>,
    vram_bank: usize,
    mode_kind: HardwareMode,

    lcdc: u8,
    stat: u8,
    scy: u8,
    scx: u8,
    ly: u8,
    lyc: u8,
    pub dma: u8,
    bgp: u8,
    obp0: u8,
    obp1: u8,
    wy: u8,
    wx: u8,

    bgpi: u8,
    bgpd: [u8; PAL_RAM_SIZE],
    obpi: u8,
    obpd: [u8; PAL_RAM_SIZE],
    /// Object priority mode register (OPRI)
    opri: u8,

    double_speed: bool,
    line: u8,
    line_start: u64,
    step: Step,
    mode: u8,
    mode3_dots: u16,
    /// LY value the comparator sees, or `None` right after LY changed.
    compare_ly: Option<u8>,
    lyc_flag: bool,
    stat_line: bool,
    /// The line following LCD enable starts in mode 0 without OAM scan.
    first_line: bool,
    next_off_frame: u64,

    rendered_x: usize,
    win_line: u8,
    wy_triggered: bool,
    window_on_line: bool,
    line_sprites: [Sprite; MAX_SPRITES_PER_LINE],
    sprite_count: usize,
    /// OBJ height latched by the OAM scan of the current line.
    sprite_height: i16,

    framebuffer: Vec<u32>,
    frame_done: Option<u64>,
    hblank_at: Option<u64>,

    format: PixelFormat,
    correction_enabled: bool,
    correction_mode: ColorCorrection,
    dmg_colors: [[u32; 4]; 3],
    dmg_out: [[u32; 4]; 3],
    bg_out: [u32; 32],
    obj_out: [u32; 32],
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new_with_mode(HardwareMode::Dmg)
    }
}

impl Ppu {
    pub fn new_with_mode(mode_kind: HardwareMode) -> Self {
        let mut ppu = Self {
            vram: vec![0; VRAM_BANK_SIZE * 2],
            vram_bank: 0,
            mode_kind,
            lcdc: 0,
            stat: 0,
            scy: 0,
            scx: 0,
            ly: 0,
            lyc: 0,
            dma: 0xFF,
            bgp: 0,
            obp0: 0,
            obp1: 0,
            wy: 0,
            wx: 0,
            bgpi: PAL_UNUSED_BIT,
            bgpd: [0xFF; PAL_RAM_SIZE],
            obpi: PAL_UNUSED_BIT,
            obpd: [0; PAL_RAM_SIZE],
            opri: if mode_kind.is_dmg_compat() { 1 } else { 0 },
            double_speed: false,
            line: 0,
            line_start: 0,
            step: Step::LineStart,
            mode: MODE_HBLANK,
            mode3_dots: MODE3_BASE_DOTS,
            compare_ly: None,
            lyc_flag: false,
            stat_line: false,
            first_line: false,
            next_off_frame: FRAME_CYCLES,
            rendered_x: 0,
            win_line: 0,
            wy_triggered: false,
            window_on_line: false,
            line_sprites: [Sprite::default(); MAX_SPRITES_PER_LINE],
            sprite_count: 0,
            sprite_height: 8,
            framebuffer: vec![0; SCREEN_WIDTH * SCREEN_HEIGHT],
            frame_done: None,
            hblank_at: None,
            format: PixelFormat::default(),
            correction_enabled: false,
            correction_mode: ColorCorrection::Fast,
            dmg_colors: [DMG_DEFAULT_PALETTE; 3],
            dmg_out: [[0; 4]; 3],
            bg_out: [0; 32],
            obj_out: [0; 32],
        };
        if mode_kind.is_dmg_compat() {
            ppu.apply_dmg_compatibility_palettes();
        }
        ppu.refresh_palettes();
        ppu.blank_framebuffer();
        ppu
    }

    #[inline]
    fn cgb(&self) -> bool {
        self.mode_kind.is_cgb()
    }

    /// CGB features (attributes, palette RAM, bank 1) are live.
    #[inline]
    fn cgb_native(&self) -> bool {
        self.mode_kind == HardwareMode::Cgb
    }

    /// Register state after the boot ROM, with line 0 starting at `cc`.
    pub fn apply_boot_state(&mut self, cc: u64) {
        self.lcdc = 0x91;
        self.stat = 0;
        self.bgp = 0xFC;
        self.dma = 0xFF;
        if self.mode_kind.is_dmg_compat() {
            self.bgp = 0xE4;
            self.obp0 = 0xD0;
            self.obp1 = 0xE0;
        }
        self.line = 0;
        self.line_start = cc;
        self.step = Step::LineStart;
        self.first_line = false;
        self.ly = 0;
        self.mode = MODE_OAM;
        self.compare_ly = None;
        self.lyc_flag = false;
        self.stat_line = false;
        self.win_line = 0;
        self.wy_triggered = false;
    }

    /// Load the default CGB palettes used when running a DMG cartridge in
    /// compatibility mode, matching what the boot ROM installs.
    pub fn apply_dmg_compatibility_palettes(&mut self) {
        const OBJ_PAL: [u16; 4] = [0x7FFF, 0x421F, 0x1CF2, 0x0000];
        const BG_PAL: [u16; 4] = [0x7FFF, 0x1BEF, 0x6180, 0x0000];

        let (obj0, rest) = self.obpd.split_at_mut(8);
        let (obj1, _) = rest.split_at_mut(8);
        Self::write_palette(obj0, OBJ_PAL);
        Self::write_palette(obj1, OBJ_PAL);

        let (bg0, _) = self.bgpd.split_at_mut(8);
        Self::write_palette(bg0, BG_PAL);
        self.refresh_palettes();
    }

    fn write_palette(slice: &mut [u8], pal: [u16; 4]) {
        for (i, &c) in pal.iter().enumerate() {
            slice[i * 2] = (c & 0xFF) as u8;
            slice[i * 2 + 1] = (c >> 8) as u8;
        }
    }

    // ---- configuration ----

    pub fn set_pixel_format(&mut self, format: PixelFormat) {
        self.format = format;
        self.refresh_palettes();
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    pub fn set_color_correction(&mut self, enabled: bool) {
        self.correction_enabled = enabled;
        self.refresh_palettes();
    }

    /// Selects the correction used while correction is enabled.
    pub fn set_color_correction_mode(&mut self, mode: ColorCorrection) {
        match mode {
            ColorCorrection::Off => self.correction_enabled = false,
            m => {
                self.correction_mode = m;
                self.correction_enabled = true;
            }
        }
        self.refresh_palettes();
    }

    pub fn color_correction(&self) -> ColorCorrection {
        if self.correction_enabled {
            self.correction_mode
        } else {
            ColorCorrection::Off
        }
    }

    /// Sets one DMG shade. `palette` is 0 for BG, 1 for OBP0, 2 for OBP1.
    pub fn set_dmg_palette_color(&mut self, palette: usize, color: usize, rgb: u32) {
        if palette < 3 && color < 4 {
            self.dmg_colors[palette][color] = rgb & 0xFF_FFFF;
            self.refresh_palettes();
        }
    }

    fn refresh_palettes(&mut self) {
        for p in 0..3 {
            for c in 0..4 {
                self.dmg_out[p][c] = self.format.pack_rgb888(self.dmg_colors[p][c]);
            }
        }
        for entry in 0..32 {
            self.refresh_cgb_entry(true, entry);
            self.refresh_cgb_entry(false, entry);
        }
    }

    fn refresh_cgb_entry(&mut self, bg: bool, entry: usize) {
        let ram = if bg { &self.bgpd } else { &self.obpd };
        let raw = u16::from_le_bytes([ram[entry * 2], ram[entry * 2 + 1]]);
        let (r, g, b) = self.color_correction().convert(raw);
        let out = self.format.pack(r, g, b);
        if bg {
            self.bg_out[entry] = out;
        } else {
            self.obj_out[entry] = out;
        }
    }

    // ---- frame output ----

    pub fn framebuffer(&self) -> &[u32] {
        &self.framebuffer
    }

    /// Cycle of the last completed frame, once.
    pub fn take_frame_done(&mut self) -> Option<u64> {
        self.frame_done.take()
    }

    /// Cycle at which the last visible-line HBlank began, once.
    pub fn take_hblank(&mut self) -> Option<u64> {
        self.hblank_at.take()
    }

    fn blank_color(&self) -> u32 {
        if self.cgb() {
            self.format.pack(0xFF, 0xFF, 0xFF)
        } else {
            self.dmg_out[0][0]
        }
    }

    fn blank_framebuffer(&mut self) {
        let c = self.blank_color();
        self.framebuffer.fill(c);
    }

    // ---- timing ----

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.lcdc & 0x80 != 0
    }

    #[inline]
    fn dots_to_cc(&self, dots: u64) -> u64 {
        dots << self.double_speed as u32
    }

    fn step_dot(&self) -> u16 {
        match self.step {
            Step::LineStart => 0,
            Step::LycCheck => LYC_DOT,
            Step::LycZero => LYC_DOT * 2,
            Step::Mode3 => MODE2_DOTS,
            Step::Mode0 => MODE2_DOTS + self.mode3_dots,
        }
    }

    /// Cycle of the next LCD boundary (or blank frame while off).
    pub fn next_event_time(&self) -> u64 {
        if !self.is_enabled() {
            return self.next_off_frame;
        }
        self.line_start + self.dots_to_cc(self.step_dot() as u64)
    }

    /// Current dot within the line at `cc`.
    fn dot(&self, cc: u64) -> u64 {
        cc.saturating_sub(self.line_start) >> self.double_speed as u32
    }

    /// Processes every boundary at or before `cc` and renders pixels up to
    /// the dot at `cc`.
    pub fn update(&mut self, cc: u64, oam: &[u8], irq: &mut impl IrqSink) {
        loop {
            let t = self.next_event_time();
            if t > cc {
                break;
            }
            if self.is_enabled() {
                self.process_step(t, oam, irq);
            } else {
                self.next_off_frame = t + self.dots_to_cc(FRAME_CYCLES);
                self.blank_framebuffer();
                self.frame_done = Some(t);
            }
        }
        if self.is_enabled() && self.mode == MODE_TRANSFER {
            let target = self.pixels_due(cc);
            self.render_to(target);
        }
    }

    /// Pixels of the current line that have left the pipeline by `cc`.
    fn pixels_due(&self, cc: u64) -> usize {
        let first_pixel_dot = (MODE2_DOTS + self.mode3_dots) as u64 - SCREEN_WIDTH as u64;
        (self.dot(cc).saturating_sub(first_pixel_dot) as usize).min(SCREEN_WIDTH)
    }

    fn process_step(&mut self, t: u64, oam: &[u8], irq: &mut impl IrqSink) {
        match self.step {
            Step::LineStart => {
                let new_ly = self.line;
                if new_ly != self.ly {
                    self.compare_ly = None;
                    self.lyc_flag = false;
                }
                self.ly = new_ly;
                if self.line == 0 {
                    self.win_line = 0;
                    self.wy_triggered = false;
                }
                if (self.line as usize) < SCREEN_HEIGHT {
                    self.mode = if self.first_line { MODE_HBLANK } else { MODE_OAM };
                    self.eval_stat(t, false, irq);
                } else if self.line as usize == SCREEN_HEIGHT {
                    self.mode = MODE_VBLANK;
                    irq.request_irq(INT_VBLANK, t);
                    self.eval_stat(t, true, irq);
                    self.frame_done = Some(t);
                    ppu_trace!("frame done at {t}");
                } else {
                    self.eval_stat(t, false, irq);
                }
                self.step = Step::LycCheck;
            }
            Step::LycCheck => {
                if self.line == LINES_PER_FRAME - 1 {
                    // LY reads 0 for the rest of line 153 but still compares as 153.
                    self.ly = 0;
                    self.compare_ly = Some(LINES_PER_FRAME - 1);
                    self.lyc_flag = self.lyc == LINES_PER_FRAME - 1;
                    self.eval_stat(t, false, irq);
                    self.step = Step::LycZero;
                } else {
                    self.compare_ly = Some(self.ly);
                    self.lyc_flag = self.lyc == self.ly;
                    self.eval_stat(t, false, irq);
                    if (self.line as usize) < SCREEN_HEIGHT {
                        self.step = Step::Mode3;
                    } else {
                        self.next_line();
                    }
                }
            }
            Step::LycZero => {
                self.compare_ly = Some(0);
                self.lyc_flag = self.lyc == 0;
                self.eval_stat(t, false, irq);
                self.next_line();
            }
            Step::Mode3 => {
                self.start_transfer(oam);
                self.mode = MODE_TRANSFER;
                self.first_line = false;
                self.eval_stat(t, false, irq);
                self.step = Step::Mode0;
            }
            Step::Mode0 => {
                self.render_to(SCREEN_WIDTH);
                if self.window_on_line {
                    self.win_line = self.win_line.wrapping_add(1);
                }
                self.mode = MODE_HBLANK;
                self.hblank_at = Some(t);
                self.eval_stat(t, false, irq);
                self.next_line();
            }
        }
    }

    fn next_line(&mut self) {
        self.line_start += self.dots_to_cc(LINE_DOTS);
        self.line = (self.line + 1) % LINES_PER_FRAME;
        self.step = Step::LineStart;
    }

    fn stat_signal(&self, mode2_flash: bool) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mode_signal = match self.mode {
            MODE_HBLANK => self.stat & 0x08 != 0,
            MODE_VBLANK => self.stat & 0x10 != 0,
            MODE_OAM => self.stat & 0x20 != 0,
            _ => false,
        };
        mode_signal
            || (mode2_flash && self.stat & 0x20 != 0)
            || (self.lyc_flag && self.stat & 0x40 != 0)
    }

    /// Requests STAT on a rising edge of the combined interrupt line.
    fn eval_stat(&mut self, t: u64, mode2_flash: bool, irq: &mut impl IrqSink) {
        let line = self.stat_signal(mode2_flash);
        if line && !self.stat_line {
            ppu_trace!("STAT irq at {t} ly={} mode={}", self.ly, self.mode);
            irq.request_irq(INT_STAT, t);
        }
        self.stat_line = self.stat_signal(false);
    }

    /// OAM scan plus mode-3 length for the current line.
    fn start_transfer(&mut self, oam: &[u8]) {
        self.oam_scan(oam);
        if self.ly == self.wy {
            self.wy_triggered = true;
        }
        self.window_on_line =
            self.window_enabled() && self.wy_triggered && self.wx <= WINDOW_X_MAX;
        let sprites = if self.lcdc & 0x02 != 0 {
            self.sprite_count as u16
        } else {
            0
        };
        self.mode3_dots = MODE3_BASE_DOTS
            + (self.scx & 7) as u16
            + sprites * SPRITE_PENALTY
            + if self.window_on_line { WINDOW_PENALTY } else { 0 };
        self.rendered_x = 0;
    }

    fn window_enabled(&self) -> bool {
        // Without CGB attributes LCDC bit 0 also turns the window off.
        self.lcdc & 0x20 != 0 && (self.cgb_native() || self.lcdc & 0x01 != 0)
    }

    /// Collect up to 10 sprites visible on the current scanline.
    fn oam_scan(&mut self, oam: &[u8]) {
        let sprite_height: i16 = if self.lcdc & 0x04 != 0 { 16 } else { 8 };
        self.sprite_height = sprite_height;
        self.sprite_count = 0;
        for i in 0..TOTAL_SPRITES {
            if self.sprite_count >= MAX_SPRITES_PER_LINE {
                break;
            }
            let base = i * 4;
            let Some(entry) = oam.get(base..base + 4) else {
                break;
            };
            let y = entry[0] as i16 - 16;
            if self.ly as i16 >= y && (self.ly as i16) < y + sprite_height {
                self.line_sprites[self.sprite_count] = Sprite {
                    x: entry[1] as i16 - 8,
                    y,
                    tile: entry[2],
                    flags: entry[3],
                    oam_index: i,
                };
                self.sprite_count += 1;
            }
        }
        if self.cgb() && self.opri & 0x01 == 0 {
            // CGB-style priority: use OAM order only
            self.line_sprites[..self.sprite_count].sort_by_key(|s| s.oam_index);
        } else {
            // DMG-style priority: sort by X position then OAM index
            self.line_sprites[..self.sprite_count].sort_by_key(|s| (s.x, s.oam_index));
        }
    }

    /// Switches the dot length, keeping the position within the line.
    pub fn speed_change(
        &mut self,
        cc: u64,
        double_speed: bool,
        oam: &[u8],
        irq: &mut impl IrqSink,
    ) {
        self.update(cc, oam, irq);
        let dot = self.dot(cc);
        let off_left = self.next_off_frame.saturating_sub(cc) >> self.double_speed as u32;
        self.double_speed = double_speed;
        self.line_start = cc - self.dots_to_cc(dot);
        self.next_off_frame = cc + self.dots_to_cc(off_left);
    }

    pub fn reset_cc(&mut self, dec: u64) {
        self.line_start = self.line_start.saturating_sub(dec);
        self.next_off_frame = self.next_off_frame.saturating_sub(dec);
    }

    // ---- access gates ----

    /// VRAM is locked during mode 3.
    pub fn vram_accessible(&self) -> bool {
        !self.is_enabled() || self.mode != MODE_TRANSFER
    }

    pub fn oam_readable(&self) -> bool {
        !self.is_enabled() || (self.mode != MODE_OAM && self.mode != MODE_TRANSFER)
    }

    pub fn oam_writable(&self) -> bool {
        self.oam_readable()
    }

    pub fn cgbp_accessible(&self) -> bool {
        !self.is_enabled() || self.mode != MODE_TRANSFER
    }

    #[inline]
    pub fn mode(&self) -> u8 {
        if self.is_enabled() { self.mode } else { MODE_HBLANK }
    }

    #[inline]
    pub fn ly(&self) -> u8 {
        self.ly
    }

    // ---- VRAM ----

    pub fn vram_bank(&self) -> usize {
        self.vram_bank
    }

    pub fn set_vram_bank(&mut self, val: u8) {
        if self.cgb_native() {
            self.vram_bank = (val & 0x01) as usize;
        }
    }

    pub fn read_vram(&self, addr: u16) -> u8 {
        self.vram[self.vram_bank * VRAM_BANK_SIZE + (addr as usize & 0x1FFF)]
    }

    pub fn write_vram(&mut self, addr: u16, val: u8) {
        self.vram[self.vram_bank * VRAM_BANK_SIZE + (addr as usize & 0x1FFF)] = val;
    }

    pub fn vram(&self) -> &[u8] {
        &self.vram
    }

    // ---- registers ----

    fn sanitize_palette_index(value: u8) -> u8 {
        (value & (PAL_AUTO_INCREMENT_BIT | PAL_INDEX_MASK)) | PAL_UNUSED_BIT
    }

    fn palette_ram_index(index: u8) -> usize {
        (index & PAL_INDEX_MASK) as usize
    }

    fn step_palette_index(index: &mut u8) {
        let current = *index;
        let idx = current & PAL_INDEX_MASK;
        let next_idx = if current & PAL_AUTO_INCREMENT_BIT != 0 {
            idx.wrapping_add(1) & PAL_INDEX_MASK
        } else {
            idx
        };
        let auto = current & PAL_AUTO_INCREMENT_BIT;
        *index = auto | PAL_UNUSED_BIT | next_idx;
    }

    /// Reads FF40-FF4B and the CGB palette registers. Callers update first.
    pub fn read_reg(&self, addr: u16) -> u8 {
        match addr {
            0xFF40 => self.lcdc,
            0xFF41 => {
                (self.stat & 0x78) | 0x80 | self.mode() | if self.lyc_flag { 0x04 } else { 0 }
            }
            0xFF42 => self.scy,
            0xFF43 => self.scx,
            0xFF44 => self.ly,
            0xFF45 => self.lyc,
            0xFF46 => self.dma,
            0xFF47 => self.bgp,
            0xFF48 => self.obp0,
            0xFF49 => self.obp1,
            0xFF4A => self.wy,
            0xFF4B => self.wx,
            0xFF68 if self.cgb_native() => self.bgpi,
            0xFF69 if self.cgb_native() => {
                if self.cgbp_accessible() {
                    self.bgpd[Self::palette_ram_index(self.bgpi)]
                } else {
                    0xFF
                }
            }
            0xFF6A if self.cgb_native() => self.obpi,
            0xFF6B if self.cgb_native() => {
                if self.cgbp_accessible() {
                    self.obpd[Self::palette_ram_index(self.obpi)]
                } else {
                    0xFF
                }
            }
            0xFF6C if self.cgb() => self.opri | 0xFE,
            _ => 0xFF,
        }
    }

    /// Writes FF40-FF4B and the CGB palette registers. Callers update to
    /// `cc` first so earlier pixels keep the old values.
    pub fn write_reg(&mut self, addr: u16, val: u8, cc: u64, irq: &mut impl IrqSink) {
        match addr {
            0xFF40 => {
                let was_on = self.is_enabled();
                self.lcdc = val;
                if was_on && !self.is_enabled() {
                    self.disable(cc);
                } else if !was_on && self.is_enabled() {
                    self.enable(cc, irq);
                }
            }
            0xFF41 => {
                // DMG raises STAT as if every source were enabled for a cycle.
                if !self.cgb()
                    && self.is_enabled()
                    && !self.stat_line
                    && (self.mode == MODE_HBLANK || self.mode == MODE_VBLANK || self.lyc_flag)
                {
                    irq.request_irq(INT_STAT, cc);
                }
                self.stat = val & 0x78;
                self.eval_stat(cc, false, irq);
            }
            0xFF42 => self.scy = val,
            0xFF43 => self.scx = val,
            0xFF44 => {}
            0xFF45 => {
                self.lyc = val;
                if self.is_enabled() {
                    self.lyc_flag = self.compare_ly == Some(val);
                    self.eval_stat(cc, false, irq);
                }
            }
            0xFF46 => self.dma = val,
            0xFF47 => self.bgp = val,
            0xFF48 => self.obp0 = val,
            0xFF49 => self.obp1 = val,
            0xFF4A => self.wy = val,
            0xFF4B => self.wx = val,
            0xFF68 if self.cgb_native() => self.bgpi = Self::sanitize_palette_index(val),
            0xFF69 if self.cgb_native() => {
                let idx = Self::palette_ram_index(self.bgpi);
                if self.cgbp_accessible() {
                    self.bgpd[idx] = val;
                    self.refresh_cgb_entry(true, idx / 2);
                }
                Self::step_palette_index(&mut self.bgpi);
            }
            0xFF6A if self.cgb_native() => self.obpi = Self::sanitize_palette_index(val),
            0xFF6B if self.cgb_native() => {
                let idx = Self::palette_ram_index(self.obpi);
                if self.cgbp_accessible() {
                    self.obpd[idx] = val;
                    self.refresh_cgb_entry(false, idx / 2);
                }
                Self::step_palette_index(&mut self.obpi);
            }
            0xFF6C if self.cgb_native() => self.opri = val & 0x01,
            _ => {}
        }
    }

    fn enable(&mut self, cc: u64, irq: &mut impl IrqSink) {
        self.line = 0;
        self.line_start = cc;
        self.step = Step::LineStart;
        self.first_line = true;
        self.ly = 0;
        self.mode = MODE_HBLANK;
        self.compare_ly = Some(0);
        self.lyc_flag = self.lyc == 0;
        self.stat_line = false;
        self.win_line = 0;
        self.wy_triggered = false;
        self.eval_stat(cc, false, irq);
        ppu_trace!("LCD on at {cc}");
    }

    fn disable(&mut self, cc: u64) {
        self.ly = 0;
        self.mode = MODE_HBLANK;
        self.stat_line = false;
        self.win_line = 0;
        self.next_off_frame = cc + self.dots_to_cc(FRAME_CYCLES);
        ppu_trace!("LCD off at {cc}");
    }

    // ---- rendering ----

    #[inline(always)]
    fn dmg_shade(palette: u8, color_id: u8) -> usize {
        ((palette >> (color_id * 2)) & 0x03) as usize
    }

    fn render_to(&mut self, target: usize) {
        let line = self.ly as usize;
        if line >= SCREEN_HEIGHT {
            return;
        }
        while self.rendered_x < target {
            let x = self.rendered_x;
            self.framebuffer[line * SCREEN_WIDTH + x] = self.pixel(x);
            self.rendered_x += 1;
        }
    }

    /// Background or window color id, CGB attribute byte.
    fn bg_pixel(&self, x: usize) -> (u8, u8) {
        let cgb = self.cgb_native();
        if !cgb && self.lcdc & 0x01 == 0 {
            return (0, 0);
        }
        let wx = self.wx as usize;
        let (map_base, px, py) = if self.window_on_line && x + 7 >= wx {
            let base = if self.lcdc & 0x40 != 0 {
                BG_MAP_1_BASE
            } else {
                BG_MAP_0_BASE
            };
            (base, x + 7 - wx, self.win_line as usize)
        } else {
            let base = if self.lcdc & 0x08 != 0 {
                BG_MAP_1_BASE
            } else {
                BG_MAP_0_BASE
            };
            (
                base,
                (x + self.scx as usize) & 0xFF,
                (self.ly as usize + self.scy as usize) & 0xFF,
            )
        };
        let map_idx = map_base + (py / 8) * 32 + (px / 8) % 32;
        let tile_index = self.vram[map_idx];
        let attr = if cgb {
            self.vram[VRAM_BANK_SIZE + map_idx]
        } else {
            0
        };
        let mut tile_y = py % 8;
        let mut bit = 7 - px % 8;
        if attr & 0x20 != 0 {
            bit = px % 8;
        }
        if attr & 0x40 != 0 {
            tile_y = 7 - tile_y;
        }
        let addr = if self.lcdc & 0x10 != 0 {
            TILE_DATA_0_BASE + tile_index as usize * 16
        } else {
            TILE_DATA_1_BASE + ((tile_index as i8 as i16 + 128) as usize) * 16
        };
        let bank = if attr & 0x08 != 0 { VRAM_BANK_SIZE } else { 0 };
        let lo = self.vram[bank + addr + tile_y * 2];
        let hi = self.vram[bank + addr + tile_y * 2 + 1];
        (((hi >> bit) & 1) << 1 | ((lo >> bit) & 1), attr)
    }

    /// First opaque sprite pixel covering `x`: color id, flags.
    fn sprite_pixel(&self, x: usize) -> Option<(u8, u8)> {
        if self.lcdc & 0x02 == 0 {
            return None;
        }
        let sprite_height = self.sprite_height;
        let sx = x as i16;
        for s in &self.line_sprites[..self.sprite_count] {
            if sx < s.x || sx >= s.x + 8 {
                continue;
            }
            let px = (sx - s.x) as u8;
            let bit = if s.flags & 0x20 != 0 { px } else { 7 - px };
            let mut line_idx = (self.ly as i16 - s.y) & (sprite_height - 1);
            if s.flags & 0x40 != 0 {
                line_idx = sprite_height - 1 - line_idx;
            }
            let tile = if sprite_height == 16 {
                s.tile & 0xFE
            } else {
                s.tile
            };
            let bank = if self.cgb_native() && s.flags & 0x08 != 0 {
                VRAM_BANK_SIZE
            } else {
                0
            };
            let addr = bank
                + (tile as usize + (line_idx as usize >> 3)) * 16
                + (line_idx as usize & 7) * 2;
            let lo = self.vram[addr];
            let hi = self.vram[addr + 1];
            let color_id = ((hi >> bit) & 1) << 1 | ((lo >> bit) & 1);
            if color_id != 0 {
                return Some((color_id, s.flags));
            }
        }
        None
    }

    fn pixel(&self, x: usize) -> u32 {
        let (bg_id, attr) = self.bg_pixel(x);
        let sprite = self.sprite_pixel(x);
        if self.cgb_native() {
            let master_priority = self.lcdc & 0x01 != 0;
            if let Some((id, flags)) = sprite {
                let bg_wins =
                    master_priority && bg_id != 0 && (attr & 0x80 != 0 || flags & 0x80 != 0);
                if !bg_wins {
                    return self.obj_out[(flags & 0x07) as usize * 4 + id as usize];
                }
            }
            return self.bg_out[(attr & 0x07) as usize * 4 + bg_id as usize];
        }
        let compat = self.mode_kind.is_dmg_compat();
        if let Some((id, flags)) = sprite
            && (flags & 0x80 == 0 || bg_id == 0)
        {
            let obp1 = flags & 0x10 != 0;
            let shade = Self::dmg_shade(if obp1 { self.obp1 } else { self.obp0 }, id);
            return if compat {
                self.obj_out[obp1 as usize * 4 + shade]
            } else {
                self.dmg_out[1 + obp1 as usize][shade]
            };
        }
        let shade = Self::dmg_shade(self.bgp, bg_id);
        if compat {
            self.bg_out[shade]
        } else {
            self.dmg_out[0][shade]
        }
    }

    // ---- save state ----

    pub(crate) fn save(&self, st: &mut PpuState) {
        st.vram = self.vram.clone();
        st.vram_bank = self.vram_bank as u8;
        st.regs = [
            self.lcdc, self.stat, self.scy, self.scx, self.ly, self.lyc, self.dma, self.bgp,
            self.obp0, self.obp1, self.wy, self.wx,
        ];
        st.bgpi = self.bgpi;
        st.bgpd = self.bgpd;
        st.obpi = self.obpi;
        st.obpd = self.obpd;
        st.opri = self.opri;
        st.line = self.line;
        st.line_start = self.line_start;
        st.step = self.step.to_u8();
        st.mode = self.mode;
        st.mode3_dots = self.mode3_dots;
        st.compare_ly = self.compare_ly.map_or(0xFFFF, u16::from);
        st.lyc_flag = self.lyc_flag;
        st.stat_line = self.stat_line;
        st.first_line = self.first_line;
        st.next_off_frame = self.next_off_frame;
        st.rendered_x = self.rendered_x as u8;
        st.win_line = self.win_line;
        st.wy_triggered = self.wy_triggered;
        st.window_on_line = self.window_on_line;
        st.framebuffer = self.framebuffer.clone();
    }

    pub(crate) fn load(&mut self, st: &PpuState, oam: &[u8], double_speed: bool) {
        if st.vram.len() == self.vram.len() {
            self.vram.copy_from_slice(&st.vram);
        }
        self.vram_bank = (st.vram_bank & 1) as usize;
        [
            self.lcdc, self.stat, self.scy, self.scx, self.ly, self.lyc, self.dma, self.bgp,
            self.obp0, self.obp1, self.wy, self.wx,
        ] = st.regs;
        self.stat &= 0x78;
        self.bgpi = Self::sanitize_palette_index(st.bgpi);
        self.bgpd = st.bgpd;
        self.obpi = Self::sanitize_palette_index(st.obpi);
        self.obpd = st.obpd;
        self.opri = st.opri & 1;
        self.double_speed = double_speed;
        self.line = st.line % LINES_PER_FRAME;
        self.line_start = st.line_start;
        self.step = Step::from_u8(st.step);
        self.mode = st.mode & 3;
        self.mode3_dots = st.mode3_dots.clamp(MODE3_BASE_DOTS, MODE3_MAX_DOTS);
        self.compare_ly = u8::try_from(st.compare_ly).ok();
        self.lyc_flag = st.lyc_flag;
        self.stat_line = st.stat_line;
        self.first_line = st.first_line;
        self.next_off_frame = st.next_off_frame;
        self.rendered_x = (st.rendered_x as usize).min(SCREEN_WIDTH);
        self.win_line = st.win_line;
        self.wy_triggered = st.wy_triggered;
        self.window_on_line = st.window_on_line;
        if st.framebuffer.len() == self.framebuffer.len() {
            self.framebuffer.copy_from_slice(&st.framebuffer);
        }
        if self.step == Step::Mode0 {
            // Sprites for the line in progress come from the current OAM.
            self.oam_scan(oam);
        }
        self.frame_done = None;
        self.hblank_at = None;
        self.refresh_palettes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Vec<(u8, u64)>);

    impl IrqSink for Recorder {
        fn request_irq(&mut self, flag: u8, cc: u64) {
            self.0.push((flag, cc));
        }
    }

    impl Recorder {
        fn stat_times(&self) -> Vec<u64> {
            self.0
                .iter()
                .filter(|(f, _)| *f == INT_STAT)
                .map(|&(_, t)| t)
                .collect()
        }
    }

    const OAM: [u8; 0xA0] = [0; 0xA0];

    fn booted(mode: HardwareMode) -> (Ppu, Recorder) {
        let mut ppu = Ppu::new_with_mode(mode);
        ppu.apply_boot_state(0);
        (ppu, Recorder::default())
    }

    fn line(n: u64) -> u64 {
        n * LINE_DOTS
    }

    #[test]
    fn ly_and_mode_follow_the_clock() {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        ppu.update(line(10) + 5, &OAM, &mut irq);
        assert_eq!(ppu.ly(), 10);
        assert_eq!(ppu.read_reg(0xFF41) & 3, MODE_OAM);
        ppu.update(line(10) + 100, &OAM, &mut irq);
        assert_eq!(ppu.read_reg(0xFF41) & 3, MODE_TRANSFER);
        assert!(!ppu.vram_accessible());
        ppu.update(line(10) + 300, &OAM, &mut irq);
        assert_eq!(ppu.read_reg(0xFF41) & 3, MODE_HBLANK);
        ppu.update(line(150), &OAM, &mut irq);
        assert_eq!(ppu.read_reg(0xFF41) & 3, MODE_VBLANK);
        assert_eq!(irq.0, vec![(INT_VBLANK, line(144))]);
    }

    #[test]
    fn lyc_interrupt_trace_dmg() {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        ppu.write_reg(0xFF45, 2, 0, &mut irq);
        ppu.write_reg(0xFF41, 0x40, 0, &mut irq);
        ppu.update(FRAME_CYCLES - 1, &OAM, &mut irq);
        assert_eq!(irq.stat_times(), vec![line(2) + 4]);
    }

    #[test]
    fn lyc_interrupt_trace_cgb_double_speed() {
        let (mut ppu, mut irq) = booted(HardwareMode::Cgb);
        ppu.speed_change(0, true, &OAM, &mut irq);
        ppu.write_reg(0xFF45, 2, 0, &mut irq);
        ppu.write_reg(0xFF41, 0x40, 0, &mut irq);
        ppu.update(2 * FRAME_CYCLES - 1, &OAM, &mut irq);
        assert_eq!(irq.stat_times(), vec![(line(2) + 4) * 2]);
    }

    #[test]
    fn hblank_interrupt_every_visible_line() {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        ppu.write_reg(0xFF41, 0x08, 0, &mut irq);
        ppu.update(FRAME_CYCLES - 1, &OAM, &mut irq);
        let times = irq.stat_times();
        assert_eq!(times.len(), SCREEN_HEIGHT);
        assert_eq!(times[0], 252);
        assert_eq!(times[1], line(1) + 252);
    }

    #[test]
    fn mode2_interrupt_also_fires_at_vblank() {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        ppu.write_reg(0xFF41, 0x20, 0, &mut irq);
        ppu.update(FRAME_CYCLES - 1, &OAM, &mut irq);
        let times = irq.stat_times();
        assert_eq!(times.len(), SCREEN_HEIGHT + 1);
        assert_eq!(times[0], 0);
        assert_eq!(*times.last().unwrap_or(&0), line(144));
    }

    #[test]
    fn line_153_reports_ly_zero_early() {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        ppu.write_reg(0xFF41, 0x40, 0, &mut irq);
        ppu.update(FRAME_CYCLES + line(2), &OAM, &mut irq);
        // LYC=0 matches at dot 4 of line 0 and from dot 8 of line 153, with
        // no second edge when line 0 starts.
        assert_eq!(irq.stat_times(), vec![4, line(153) + 8]);

        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        ppu.write_reg(0xFF45, 153, 0, &mut irq);
        ppu.write_reg(0xFF41, 0x40, 0, &mut irq);
        ppu.update(line(153) + 2, &OAM, &mut irq);
        assert_eq!(ppu.ly(), 153);
        ppu.update(line(153) + 6, &OAM, &mut irq);
        assert_eq!(ppu.ly(), 0);
        assert_eq!(ppu.read_reg(0xFF41) & 0x04, 0x04);
        ppu.update(line(153) + 10, &OAM, &mut irq);
        assert_eq!(ppu.read_reg(0xFF41) & 0x04, 0x00);
        assert_eq!(irq.stat_times(), vec![line(153) + 4]);
    }

    #[test]
    fn stat_write_bug_is_dmg_only() {
        let (mut dmg, mut irq) = booted(HardwareMode::Dmg);
        dmg.update(300, &OAM, &mut irq);
        dmg.write_reg(0xFF41, 0x00, 300, &mut irq);
        assert_eq!(irq.stat_times(), vec![300]);

        let (mut cgb, mut irq) = booted(HardwareMode::Cgb);
        cgb.update(300, &OAM, &mut irq);
        cgb.write_reg(0xFF41, 0x00, 300, &mut irq);
        assert!(irq.stat_times().is_empty());
    }

    #[test]
    fn first_line_after_enable_skips_mode2() {
        let (mut ppu, mut irq) = booted(HardwareMode::Cgb);
        ppu.write_reg(0xFF40, 0x11, 0, &mut irq);
        ppu.write_reg(0xFF41, 0x20, 0, &mut irq);
        ppu.update(1000, &OAM, &mut irq);
        ppu.write_reg(0xFF40, 0x91, 1000, &mut irq);
        ppu.update(1000 + 10, &OAM, &mut irq);
        assert_eq!(ppu.read_reg(0xFF41) & 3, MODE_HBLANK);
        ppu.update(1000 + LINE_DOTS + 10, &OAM, &mut irq);
        assert_eq!(irq.stat_times(), vec![1000 + LINE_DOTS]);
    }

    #[test]
    fn lcd_off_still_completes_blank_frames() {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        ppu.write_reg(0xFF40, 0x11, 100, &mut irq);
        ppu.update(100 + FRAME_CYCLES, &OAM, &mut irq);
        assert_eq!(ppu.take_frame_done(), Some(100 + FRAME_CYCLES));
        assert!(ppu.framebuffer().iter().all(|&p| p == 0xFFFFFF));
        assert_eq!(ppu.next_event_time(), 100 + 2 * FRAME_CYCLES);
    }

    #[test]
    fn background_renders_through_palette() {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        // Tile 0, first row: color 3.
        ppu.write_vram(0x8000, 0xFF);
        ppu.write_vram(0x8001, 0xFF);
        ppu.update(line(144), &OAM, &mut irq);
        assert_eq!(ppu.take_frame_done(), Some(line(144)));
        let fb = ppu.framebuffer();
        assert_eq!(fb[0], 0x000000);
        assert_eq!(fb[SCREEN_WIDTH], 0xFFFFFF);
        assert_eq!(fb[8 * SCREEN_WIDTH + 159], 0x000000);
    }

    #[test]
    fn mid_line_palette_write_splits_line() {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        // First pixel leaves the pipeline at dot 92 when SCX=0 and no sprites.
        let t = line(5) + 92 + 80;
        ppu.update(t, &OAM, &mut irq);
        ppu.write_reg(0xFF47, 0xFF, t, &mut irq);
        ppu.update(line(6), &OAM, &mut irq);
        let row = &ppu.framebuffer()[5 * SCREEN_WIDTH..6 * SCREEN_WIDTH];
        assert_eq!(row[79], 0xFFFFFF);
        assert_eq!(row[80], 0x000000);
        assert_eq!(row[159], 0x000000);
    }

    #[test]
    fn sprites_lengthen_mode3() {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        ppu.write_reg(0xFF40, 0x93, 0, &mut irq);
        ppu.write_reg(0xFF41, 0x08, 0, &mut irq);
        let mut oam = [0u8; 0xA0];
        oam[0] = 16;
        oam[1] = 8;
        oam[4] = 16;
        oam[5] = 40;
        ppu.update(line(1) - 1, &oam, &mut irq);
        assert_eq!(irq.stat_times(), vec![252 + 2 * SPRITE_PENALTY as u64]);
    }

    #[test]
    fn pixel_formats_and_correction() {
        assert_eq!(PixelFormat::Xrgb8888.pack(0xFF, 0x80, 0x00), 0xFF8000);
        assert_eq!(PixelFormat::Rgb565.pack(0xFF, 0xFF, 0xFF), 0xFFFF);
        assert_eq!(PixelFormat::Argb1555.pack(0xFF, 0, 0), 0x8000 | 0x7C00);
        assert_eq!(ColorCorrection::Off.convert(0x7FFF), (0xFF, 0xFF, 0xFF));
        assert_eq!(ColorCorrection::Fast.convert(0x7FFF), (248, 248, 248));
        assert_eq!(ColorCorrection::Fast.convert(0x001F), (201, 0, 46));
        let (r, g, b) = ColorCorrection::Accurate.convert(0x7FFF);
        assert!(r >= 250 && g >= 250 && b >= 250);
        assert_eq!(ColorCorrection::Accurate.convert(0), (0, 0, 0));
    }

    #[test]
    fn dmg_palette_colors_are_configurable() {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        ppu.set_dmg_palette_color(0, 0, 0x123456);
        ppu.set_pixel_format(PixelFormat::Rgb565);
        ppu.update(line(1), &OAM, &mut irq);
        assert_eq!(ppu.framebuffer()[0], PixelFormat::Rgb565.pack(0x12, 0x34, 0x56));
    }

    #[test]
    fn cgb_palette_ram_auto_increments() {
        let (mut ppu, mut irq) = booted(HardwareMode::Cgb);
        ppu.write_reg(0xFF40, 0x11, 0, &mut irq);
        ppu.write_reg(0xFF68, 0x80, 0, &mut irq);
        ppu.write_reg(0xFF69, 0x1F, 0, &mut irq);
        ppu.write_reg(0xFF69, 0x00, 0, &mut irq);
        assert_eq!(ppu.read_reg(0xFF68), 0xC2);
        ppu.write_reg(0xFF68, 0x00, 0, &mut irq);
        assert_eq!(ppu.read_reg(0xFF69), 0x1F);
        assert_eq!(ppu.bg_out[0], 0xFF0000);
    }

    fn tile_row(ppu: &mut Ppu, tile: u16, row: u16, lo: u8, hi: u8) {
        ppu.write_vram(0x8000 + tile * 16 + row * 2, lo);
        ppu.write_vram(0x8000 + tile * 16 + row * 2 + 1, hi);
    }

    fn solid_tile(ppu: &mut Ppu, tile: u16, lo: u8, hi: u8) {
        for row in 0..8 {
            tile_row(ppu, tile, row, lo, hi);
        }
    }

    fn sprite(oam: &mut [u8; 0xA0], i: usize, y: u8, x: u8, tile: u8, flags: u8) {
        oam[i * 4..i * 4 + 4].copy_from_slice(&[y, x, tile, flags]);
    }

    fn px(ppu: &Ppu, x: usize, y: usize) -> u32 {
        ppu.framebuffer()[y * SCREEN_WIDTH + x]
    }

    /// DMG with sprites on and identity BG/OBP0 palettes.
    fn dmg_with_sprites(lcdc: u8) -> (Ppu, Recorder) {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        ppu.write_reg(0xFF40, lcdc, 0, &mut irq);
        ppu.write_reg(0xFF47, 0xE4, 0, &mut irq);
        ppu.write_reg(0xFF48, 0xE4, 0, &mut irq);
        (ppu, irq)
    }

    #[test]
    fn sprite_flips() {
        let (mut ppu, mut irq) = dmg_with_sprites(0x93);
        tile_row(&mut ppu, 1, 0, 0x80, 0x00);
        tile_row(&mut ppu, 2, 7, 0xFF, 0x00);
        let mut oam = [0u8; 0xA0];
        sprite(&mut oam, 0, 16, 8, 1, 0x00);
        sprite(&mut oam, 1, 24, 8, 1, 0x20);
        sprite(&mut oam, 2, 40, 8, 2, 0x40);
        ppu.update(line(144), &oam, &mut irq);

        assert_eq!(px(&ppu, 0, 0), 0xAAAAAA);
        assert_eq!(px(&ppu, 7, 0), 0xFFFFFF);
        assert_eq!(px(&ppu, 0, 8), 0xFFFFFF);
        assert_eq!(px(&ppu, 7, 8), 0xAAAAAA);
        assert_eq!(px(&ppu, 3, 24), 0xAAAAAA);
        assert_eq!(px(&ppu, 3, 31), 0xFFFFFF);
    }

    #[test]
    fn tall_sprites_pair_even_and_odd_tiles() {
        let (mut ppu, mut irq) = dmg_with_sprites(0x97);
        tile_row(&mut ppu, 5, 0, 0xFF, 0xFF);
        tile_row(&mut ppu, 5, 7, 0xFF, 0x00);
        let mut oam = [0u8; 0xA0];
        sprite(&mut oam, 0, 16, 8, 5, 0x00);
        sprite(&mut oam, 1, 16, 40, 5, 0x40);
        ppu.update(line(144), &oam, &mut irq);

        // Upper half comes from tile 4, lower half from tile 5.
        assert_eq!(px(&ppu, 0, 0), 0xFFFFFF);
        assert_eq!(px(&ppu, 0, 8), 0x000000);
        assert_eq!(px(&ppu, 0, 15), 0xAAAAAA);
        // Flipped, the last row of tile 5 lands on the first line.
        assert_eq!(px(&ppu, 32, 0), 0xAAAAAA);
        assert_eq!(px(&ppu, 32, 7), 0x000000);
        assert_eq!(px(&ppu, 32, 8), 0xFFFFFF);
    }

    #[test]
    fn sprite_height_is_latched_for_the_line() {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        ppu.write_reg(0xFF40, 0x97, 0, &mut irq);
        ppu.write_reg(0xFF48, 0xE4, 0, &mut irq);
        tile_row(&mut ppu, 0, 7, 0xFF, 0x00);
        let mut oam = [0u8; 0xA0];
        sprite(&mut oam, 0, 18, 16, 0, 0x40);
        let t = line(10) + 90;
        ppu.update(t, &oam, &mut irq);
        ppu.write_reg(0xFF40, 0x93, t, &mut irq);
        ppu.update(line(10) + 300, &oam, &mut irq);

        // Row 8 of a flipped 8x16 sprite is row 7 of its upper tile.
        assert_eq!(px(&ppu, 8, 10), 0xAAAAAA);
        assert_eq!(px(&ppu, 15, 10), 0xAAAAAA);
        assert_eq!(px(&ppu, 16, 10), 0xFFFFFF);
    }

    #[test]
    fn only_ten_sprites_per_line() {
        let (mut ppu, mut irq) = dmg_with_sprites(0x93);
        solid_tile(&mut ppu, 3, 0xFF, 0xFF);
        let mut oam = [0u8; 0xA0];
        for i in 0..11 {
            sprite(&mut oam, i, 16, 8 + 8 * i as u8, 3, 0x00);
        }
        ppu.update(line(144), &oam, &mut irq);
        assert_eq!(px(&ppu, 0, 0), 0x000000);
        assert_eq!(px(&ppu, 79, 0), 0x000000);
        assert_eq!(px(&ppu, 80, 0), 0xFFFFFF);
        assert_eq!(px(&ppu, 87, 0), 0xFFFFFF);
    }

    fn overlapping_sprites(oam: &mut [u8; 0xA0]) {
        sprite(oam, 20, 56, 12, 6, 0x00);
        sprite(oam, 21, 56, 8, 3, 0x00);
    }

    #[test]
    fn dmg_sprite_priority_follows_x() {
        let (mut ppu, mut irq) = dmg_with_sprites(0x93);
        solid_tile(&mut ppu, 3, 0xFF, 0xFF);
        solid_tile(&mut ppu, 6, 0xFF, 0x00);
        let mut oam = [0u8; 0xA0];
        overlapping_sprites(&mut oam);
        ppu.update(line(144), &oam, &mut irq);
        assert_eq!(px(&ppu, 4, 40), 0x000000);
        assert_eq!(px(&ppu, 8, 40), 0xAAAAAA);
    }

    /// CGB with OBJ palette 0 = red, -, -, blue and BG palette 0 color 1 green.
    fn cgb_with_palettes(lcdc: u8) -> (Ppu, Recorder) {
        let (mut ppu, mut irq) = booted(HardwareMode::Cgb);
        ppu.write_reg(0xFF40, lcdc, 0, &mut irq);
        ppu.write_reg(0xFF68, 0x82, 0, &mut irq);
        for b in [0xE0, 0x03] {
            ppu.write_reg(0xFF69, b, 0, &mut irq);
        }
        ppu.write_reg(0xFF6A, 0x82, 0, &mut irq);
        for b in [0x1F, 0x00, 0x00, 0x00, 0x00, 0x7C] {
            ppu.write_reg(0xFF6B, b, 0, &mut irq);
        }
        (ppu, irq)
    }

    #[test]
    fn cgb_sprite_priority_follows_oam_order() {
        let (mut ppu, mut irq) = cgb_with_palettes(0x93);
        solid_tile(&mut ppu, 3, 0xFF, 0xFF);
        solid_tile(&mut ppu, 6, 0xFF, 0x00);
        let mut oam = [0u8; 0xA0];
        overlapping_sprites(&mut oam);
        ppu.update(line(144), &oam, &mut irq);
        assert_eq!(px(&ppu, 4, 40), 0xFF0000);
        assert_eq!(px(&ppu, 0, 40), 0x0000FF);
    }

    #[test]
    fn dmg_sprite_behind_background() {
        let (mut ppu, mut irq) = dmg_with_sprites(0x93);
        solid_tile(&mut ppu, 3, 0xFF, 0xFF);
        solid_tile(&mut ppu, 7, 0xF0, 0x00);
        ppu.write_vram(0x9840, 7);
        let mut oam = [0u8; 0xA0];
        sprite(&mut oam, 0, 32, 8, 3, 0x80);
        ppu.update(line(144), &oam, &mut irq);
        assert_eq!(px(&ppu, 0, 16), 0xAAAAAA);
        assert_eq!(px(&ppu, 3, 16), 0xAAAAAA);
        assert_eq!(px(&ppu, 4, 16), 0x000000);
    }

    /// Line 16: BG color 1 under x 0-3, a solid blue sprite over x 0-7.
    fn cgb_priority_row(lcdc: u8, obj_flags: u8, bg_attr: u8) -> Vec<u32> {
        let (mut ppu, mut irq) = cgb_with_palettes(lcdc);
        solid_tile(&mut ppu, 3, 0xFF, 0xFF);
        solid_tile(&mut ppu, 7, 0xF0, 0x00);
        ppu.write_vram(0x9840, 7);
        ppu.set_vram_bank(1);
        ppu.write_vram(0x9840, bg_attr);
        ppu.set_vram_bank(0);
        let mut oam = [0u8; 0xA0];
        sprite(&mut oam, 0, 32, 8, 3, obj_flags);
        ppu.update(line(144), &oam, &mut irq);
        ppu.framebuffer()[16 * SCREEN_WIDTH..16 * SCREEN_WIDTH + 8].to_vec()
    }

    #[test]
    fn cgb_background_priority_rules() {
        let obj_behind = cgb_priority_row(0x93, 0x80, 0x00);
        assert_eq!(obj_behind[0], 0x00FF00);
        assert_eq!(obj_behind[4], 0x0000FF);

        let bg_attr_priority = cgb_priority_row(0x93, 0x00, 0x80);
        assert_eq!(bg_attr_priority[0], 0x00FF00);
        assert_eq!(bg_attr_priority[4], 0x0000FF);

        // LCDC bit 0 clear puts every sprite on top.
        let master_off = cgb_priority_row(0x92, 0x80, 0x80);
        assert_eq!(master_off[0], 0x0000FF);
        assert_eq!(master_off[4], 0x0000FF);

        let obj_front = cgb_priority_row(0x93, 0x00, 0x00);
        assert_eq!(obj_front[0], 0x0000FF);
    }

    #[test]
    fn window_line_counter_pauses_while_hidden() {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        ppu.write_reg(0xFF40, 0xF1, 0, &mut irq);
        ppu.write_reg(0xFF47, 0xE4, 0, &mut irq);
        ppu.write_reg(0xFF4A, 2, 0, &mut irq);
        ppu.write_reg(0xFF4B, 87, 0, &mut irq);
        tile_row(&mut ppu, 8, 0, 0xFF, 0xFF);
        tile_row(&mut ppu, 8, 1, 0xFF, 0x00);
        ppu.write_vram(0x9C00, 8);

        ppu.update(line(3), &OAM, &mut irq);
        ppu.write_reg(0xFF40, 0xD1, line(3), &mut irq);
        ppu.update(line(10), &OAM, &mut irq);
        ppu.write_reg(0xFF40, 0xF1, line(10), &mut irq);
        ppu.update(line(144), &OAM, &mut irq);

        assert_eq!(px(&ppu, 80, 1), 0xFFFFFF);
        assert_eq!(px(&ppu, 79, 2), 0xFFFFFF);
        assert_eq!(px(&ppu, 80, 2), 0x000000);
        assert_eq!(px(&ppu, 80, 5), 0xFFFFFF);
        // Second window row, not the row at LY - WY.
        assert_eq!(px(&ppu, 80, 10), 0xAAAAAA);
        assert_eq!(px(&ppu, 80, 11), 0xFFFFFF);
    }

    #[test]
    fn loaded_mode3_length_is_clamped() {
        let (mut ppu, mut irq) = booted(HardwareMode::Dmg);
        ppu.update(line(10) + 90, &OAM, &mut irq);
        let mut st = crate::savestate::PpuState::default();
        ppu.save(&mut st);
        st.mode3_dots = 40;

        let (mut restored, mut irq) = booted(HardwareMode::Dmg);
        restored.load(&st, &OAM, false);
        restored.update(line(10) + 95, &OAM, &mut irq);
        restored.update(line(11) + 10, &OAM, &mut irq);
        assert_eq!(restored.ly(), 11);
        assert_eq!(restored.read_reg(0xFF41) & 3, MODE_OAM);
    }
}
