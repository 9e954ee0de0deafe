//! Four-channel PSG rendered lazily at one stereo sample per 2 MHz tick.

use crate::savestate::ApuState;

/// Native output rate in stereo samples per second.
pub const SAMPLE_RATE: u32 = 2_097_152;
/// Frame sequencer period in samples (512 Hz).
const FRAME_SEQUENCER_PERIOD: u32 = 4096;
const VOLUME_FACTOR: i32 = 64;

// FF10-FF26 after the boot ROM has run.
const POWER_ON_REGS: [u8; 0x17] = [
    0x80, 0xBF, 0xF3, 0xFF, 0xBF, 0xFF, 0x3F, 0x00, 0xFF, 0xBF, 0x7F, 0xFF, 0x9F, 0xFF, 0xBF, 0xFF,
    0xFF, 0x00, 0x00, 0xBF, 0x77, 0xF3, 0xF1,
];

// Duty table for pulse channels (CH1, CH2), indexed by NRx1 bits 6-7:
// 0 -> 00000001 (12.5%)
// 1 -> 10000001 (25%)
// 2 -> 10000111 (50%)
// 3 -> 01111110 (75%)
const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 0, 0, 0, 0, 0, 0, 1],
    [1, 0, 0, 0, 0, 0, 0, 1],
    [1, 0, 0, 0, 0, 1, 1, 1],
    [0, 1, 1, 1, 1, 1, 1, 0],
];

const WAVE_RAM_DEFAULT_DMG: [u8; 0x10] = [
    0x84, 0x40, 0x43, 0xAA, 0x2D, 0x78, 0x92, 0x3C, 0x60, 0x59, 0x59, 0xB0, 0x34, 0xB8, 0x2E, 0xDA,
];
const WAVE_RAM_DEFAULT_CGB: [u8; 0x10] = [
    0x00, 0xFF, 0x00, 0xFF, 0x00, 0xFF, 0x00, 0xFF, 0x00, 0xFF, 0x00, 0xFF, 0x00, 0xFF, 0x00, 0xFF,
];

#[derive(Default, Clone, Copy, Debug)]
struct Envelope {
    initial: u8,
    period: u8,
    add: bool,
    volume: u8,
    timer: u8,
}

impl Envelope {
    fn clock(&mut self) {
        if self.period == 0 {
            return;
        }
        if self.timer > 1 {
            self.timer -= 1;
            return;
        }
        self.timer = self.period;
        if self.add && self.volume < 15 {
            self.volume += 1;
        } else if !self.add && self.volume > 0 {
            self.volume -= 1;
        }
    }

    fn set_params(&mut self, val: u8) {
        self.initial = val >> 4;
        self.period = val & 0x07;
        self.add = val & 0x08 != 0;
    }

    fn trigger(&mut self) {
        self.volume = self.initial;
        self.timer = if self.period == 0 { 8 } else { self.period };
    }

    /// The DAC is powered while any of NRx2 bits 3-7 is set.
    fn dac_enabled(val: u8) -> bool {
        val & 0xF8 != 0
    }
}

#[derive(Default, Clone, Copy, Debug)]
struct Sweep {
    period: u8,
    negate: bool,
    shift: u8,
    timer: u8,
    shadow: u16,
    enabled: bool,
    /// A subtraction has been computed since the last trigger.
    neg_used: bool,
}

impl Sweep {
    fn calculate(&mut self) -> u16 {
        let delta = self.shadow >> self.shift;
        if self.negate {
            self.neg_used = true;
            self.shadow.wrapping_sub(delta)
        } else {
            self.shadow + delta
        }
    }

    /// Returns true when the write must disable the channel: clearing the
    /// negate bit after a subtraction was used.
    fn set_params(&mut self, val: u8) -> bool {
        let old_negate = self.negate;
        self.period = (val >> 4) & 0x07;
        self.negate = val & 0x08 != 0;
        self.shift = val & 0x07;
        old_negate && !self.negate && self.neg_used
    }

    fn reload(&mut self, freq: u16) {
        self.shadow = freq;
        self.timer = if self.period == 0 { 8 } else { self.period };
        self.enabled = self.period != 0 || self.shift != 0;
        self.neg_used = false;
    }
}

#[derive(Default, Clone, Debug)]
struct SquareChannel {
    active: bool,
    dac_enabled: bool,
    length: u16,
    length_enable: bool,
    duty: u8,
    duty_pos: u8,
    frequency: u16,
    /// 2 MHz ticks until the next duty step.
    timer: u32,
    envelope: Envelope,
    sweep: Option<Sweep>,
}

impl SquareChannel {
    fn new(with_sweep: bool) -> Self {
        Self {
            sweep: with_sweep.then(Sweep::default),
            ..Default::default()
        }
    }

    fn period(&self) -> u32 {
        (2048 - self.frequency as u32) * 2
    }

    #[inline]
    fn tick(&mut self) {
        if self.timer > 1 {
            self.timer -= 1;
        } else {
            self.timer = self.period();
            self.duty_pos = (self.duty_pos + 1) & 7;
        }
    }

    fn output(&self) -> u8 {
        if !self.active {
            return 0;
        }
        DUTY_TABLE[self.duty as usize][self.duty_pos as usize] * self.envelope.volume
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.active = false;
            }
        }
    }

    fn clock_sweep(&mut self) {
        let Some(sweep) = self.sweep.as_mut() else {
            return;
        };
        if sweep.timer > 1 {
            sweep.timer -= 1;
            return;
        }
        sweep.timer = if sweep.period == 0 { 8 } else { sweep.period };
        if !sweep.enabled || sweep.period == 0 {
            return;
        }
        let new_freq = sweep.calculate();
        if new_freq > 2047 {
            self.active = false;
        } else if sweep.shift != 0 {
            sweep.shadow = new_freq;
            self.frequency = new_freq;
            if sweep.calculate() > 2047 {
                self.active = false;
            }
        }
    }
}

#[derive(Default, Clone, Debug)]
struct WaveChannel {
    active: bool,
    dac_enabled: bool,
    length: u16,
    length_enable: bool,
    volume_code: u8,
    position: u8,
    sample: u8,
    frequency: u16,
    timer: u32,
}

impl WaveChannel {
    fn period(&self) -> u32 {
        2048 - self.frequency as u32
    }

    #[inline]
    fn tick(&mut self, wave_ram: &[u8; 0x10]) {
        if self.timer > 1 {
            self.timer -= 1;
            return;
        }
        self.timer = self.period();
        self.position = (self.position + 1) & 0x1F;
        let byte = wave_ram[(self.position / 2) as usize];
        self.sample = if self.position & 1 == 0 {
            byte >> 4
        } else {
            byte & 0x0F
        };
    }

    fn output(&self) -> u8 {
        if !self.active {
            return 0;
        }
        match self.volume_code {
            1 => self.sample,
            2 => self.sample >> 1,
            3 => self.sample >> 2,
            _ => 0,
        }
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.active = false;
            }
        }
    }
}

#[derive(Default, Clone, Debug)]
struct NoiseChannel {
    active: bool,
    dac_enabled: bool,
    length: u16,
    length_enable: bool,
    envelope: Envelope,
    clock_shift: u8,
    divisor: u8,
    width7: bool,
    lfsr: u16,
    timer: u32,
}

impl NoiseChannel {
    /// LFSR period in 2 MHz ticks.
    fn period(&self) -> u32 {
        let r = match self.divisor {
            0 => 4,
            d => d as u32 * 8,
        };
        r << self.clock_shift
    }

    #[inline]
    fn tick(&mut self) {
        if self.timer > 1 {
            self.timer -= 1;
            return;
        }
        self.timer = self.period();
        // Shifts 14 and 15 receive no clocks.
        if self.clock_shift >= 14 {
            return;
        }
        let bit = (self.lfsr ^ (self.lfsr >> 1)) & 1;
        self.lfsr = (self.lfsr >> 1) | (bit << 14);
        if self.width7 {
            self.lfsr = (self.lfsr & !0x40) | (bit << 6);
        }
    }

    fn output(&self) -> u8 {
        if !self.active || self.lfsr & 1 != 0 {
            return 0;
        }
        self.envelope.volume
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.active = false;
            }
        }
    }
}

/// Audio processing unit.
///
/// Nothing runs until [`Apu::generate_samples`] is called with a cycle
/// count; the memory layer does that before every register access, at
/// speed switches and before handing samples to the host.
#[derive(Clone, Debug)]
pub struct Apu {
    ch1: SquareChannel,
    ch2: SquareChannel,
    ch3: WaveChannel,
    ch4: NoiseChannel,
    wave_ram: [u8; 0x10],
    /// Raw FF10-FF26 as last written.
    regs: [u8; 0x17],
    nr50: u8,
    nr51: u8,
    enabled: bool,
    /// Next frame sequencer step to execute.
    fs_step: u8,
    /// Samples until that step.
    fs_counter: u32,
    /// Master cycle up to which samples have been produced.
    last_cc: u64,
    samples: Vec<u32>,
    cgb_mode: bool,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new_with_mode(false)
    }
}

impl Apu {
    pub fn new_with_mode(cgb: bool) -> Self {
        let mut apu = Self {
            ch1: SquareChannel::new(true),
            ch2: SquareChannel::new(false),
            ch3: WaveChannel::default(),
            ch4: NoiseChannel::default(),
            wave_ram: if cgb {
                WAVE_RAM_DEFAULT_CGB
            } else {
                WAVE_RAM_DEFAULT_DMG
            },
            regs: [0; 0x17],
            nr50: 0,
            nr51: 0,
            enabled: true,
            fs_step: 0,
            fs_counter: FRAME_SEQUENCER_PERIOD,
            last_cc: 0,
            samples: Vec::new(),
            cgb_mode: cgb,
        };
        for (i, &val) in POWER_ON_REGS.iter().enumerate().take(0x16) {
            let addr = 0xFF10 + i as u16;
            // Register writes here must not trigger channels.
            apu.write_reg(addr, if i % 5 == 4 { val & 0x7F } else { val });
        }
        apu
    }

    pub fn is_cgb(&self) -> bool {
        self.cgb_mode
    }

    fn read_mask(addr: u16) -> u8 {
        match addr {
            0xFF10 => 0x80,
            0xFF11 | 0xFF16 => 0x3F,
            0xFF14 | 0xFF19 | 0xFF1E | 0xFF23 => 0xBF,
            0xFF1A => 0x7F,
            0xFF1C => 0x9F,
            0xFF12 | 0xFF17 | 0xFF21 | 0xFF22 | 0xFF24 | 0xFF25 => 0x00,
            0xFF26 => 0x70,
            _ => 0xFF,
        }
    }

    /// Produces every sample due at or before `cc`.
    pub fn generate_samples(&mut self, cc: u64, double_speed: bool) {
        let shift = 1 + double_speed as u32;
        if cc <= self.last_cc {
            return;
        }
        let n = (cc - self.last_cc) >> shift;
        self.last_cc += n << shift;
        self.samples.reserve(n as usize);
        for _ in 0..n {
            self.step_sample();
        }
    }

    fn step_sample(&mut self) {
        if self.enabled {
            self.fs_counter -= 1;
            if self.fs_counter == 0 {
                self.fs_counter = FRAME_SEQUENCER_PERIOD;
                self.clock_frame_sequencer();
            }
            self.ch1.tick();
            self.ch2.tick();
            self.ch3.tick(&self.wave_ram);
            self.ch4.tick();
        }
        let (left, right) = self.mix();
        self.samples
            .push((left as u16 as u32) | ((right as u16 as u32) << 16));
    }

    fn clock_frame_sequencer(&mut self) {
        let step = self.fs_step;
        self.fs_step = (self.fs_step + 1) & 7;
        if step & 1 == 0 {
            self.ch1.clock_length();
            self.ch2.clock_length();
            self.ch3.clock_length();
            self.ch4.clock_length();
        }
        if step == 2 || step == 6 {
            self.ch1.clock_sweep();
        }
        if step == 7 {
            if self.ch1.active {
                self.ch1.envelope.clock();
            }
            if self.ch2.active {
                self.ch2.envelope.clock();
            }
            if self.ch4.active {
                self.ch4.envelope.clock();
            }
        }
    }

    fn mix(&self) -> (i16, i16) {
        if !self.enabled {
            return (0, 0);
        }
        let outputs = [
            self.ch1.output(),
            self.ch2.output(),
            self.ch3.output(),
            self.ch4.output(),
        ];
        let mut left = 0i32;
        let mut right = 0i32;
        for (i, &out) in outputs.iter().enumerate() {
            if self.nr51 & (0x10 << i) != 0 {
                left += out as i32;
            }
            if self.nr51 & (0x01 << i) != 0 {
                right += out as i32;
            }
        }
        let left_vol = ((self.nr50 >> 4) & 0x07) as i32 + 1;
        let right_vol = (self.nr50 & 0x07) as i32 + 1;
        (
            (left * left_vol * VOLUME_FACTOR) as i16,
            (right * right_vol * VOLUME_FACTOR) as i16,
        )
    }

    /// Number of produced samples not yet handed out.
    pub fn pending_samples(&self) -> usize {
        self.samples.len()
    }

    /// Moves up to `out.len()` samples into `out`, oldest first. Samples that
    /// do not fit stay queued.
    pub fn take_samples(&mut self, out: &mut [u32]) -> usize {
        let n = out.len().min(self.samples.len());
        out[..n].copy_from_slice(&self.samples[..n]);
        self.samples.drain(..n);
        n
    }

    /// Rebases the sample clock together with the master cycle counter.
    pub fn reset_counter(&mut self, dec: u64) {
        self.last_cc = self.last_cc.saturating_sub(dec);
    }

    /// Length counter of `channel` (1-4).
    pub fn length_counter(&self, channel: u8) -> u16 {
        match channel {
            1 => self.ch1.length,
            2 => self.ch2.length,
            3 => self.ch3.length,
            4 => self.ch4.length,
            _ => 0,
        }
    }

    fn status_bits(&self) -> u8 {
        (self.ch1.active as u8)
            | (self.ch2.active as u8) << 1
            | (self.ch3.active as u8) << 2
            | (self.ch4.active as u8) << 3
    }

    /// Reads FF10-FF3F. Callers bring samples up to date first.
    pub fn read_reg(&self, addr: u16) -> u8 {
        match addr {
            0xFF26 => Self::read_mask(addr) | (self.enabled as u8) << 7 | self.status_bits(),
            0xFF24 => self.nr50,
            0xFF25 => self.nr51,
            0xFF10..=0xFF25 => self.regs[(addr - 0xFF10) as usize] | Self::read_mask(addr),
            0xFF30..=0xFF3F => self.wave_ram[(addr - 0xFF30) as usize],
            _ => 0xFF,
        }
    }

    fn power_off(&mut self) {
        let lengths = [
            self.ch1.length,
            self.ch2.length,
            self.ch3.length,
            self.ch4.length,
        ];
        self.ch1 = SquareChannel::new(true);
        self.ch2 = SquareChannel::new(false);
        self.ch3 = WaveChannel::default();
        self.ch4 = NoiseChannel::default();
        self.regs = [0; 0x17];
        self.nr50 = 0;
        self.nr51 = 0;
        if !self.cgb_mode {
            self.ch1.length = lengths[0];
            self.ch2.length = lengths[1];
            self.ch3.length = lengths[2];
            self.ch4.length = lengths[3];
        }
    }

    fn power_on(&mut self) {
        self.fs_step = 0;
        self.fs_counter = FRAME_SEQUENCER_PERIOD;
        self.ch1.duty_pos = 0;
        self.ch2.duty_pos = 0;
        self.ch3.sample = 0;
    }

    /// Applies a write to FF10-FF3F. Callers bring samples up to date first.
    pub fn write_reg(&mut self, addr: u16, val: u8) {
        if (0xFF30..=0xFF3F).contains(&addr) {
            self.wave_ram[(addr - 0xFF30) as usize] = val;
            return;
        }
        if addr == 0xFF26 {
            let on = val & 0x80 != 0;
            if self.enabled && !on {
                self.power_off();
            } else if !self.enabled && on {
                self.power_on();
            }
            self.enabled = on;
            return;
        }
        if !(0xFF10..=0xFF25).contains(&addr) {
            return;
        }
        if !self.enabled {
            // DMG keeps accepting length loads while powered off.
            if !self.cgb_mode {
                match addr {
                    0xFF11 => self.ch1.length = 64 - (val & 0x3F) as u16,
                    0xFF16 => self.ch2.length = 64 - (val & 0x3F) as u16,
                    0xFF1B => self.ch3.length = 256 - val as u16,
                    0xFF20 => self.ch4.length = 64 - (val & 0x3F) as u16,
                    _ => {}
                }
            }
            return;
        }
        self.regs[(addr - 0xFF10) as usize] = val;
        let length_step = self.fs_step & 1 == 1;
        match addr {
            0xFF10 => {
                if let Some(sweep) = self.ch1.sweep.as_mut()
                    && sweep.set_params(val)
                {
                    self.ch1.active = false;
                }
            }
            0xFF11 => {
                self.ch1.duty = val >> 6;
                self.ch1.length = 64 - (val & 0x3F) as u16;
            }
            0xFF12 => {
                self.ch1.envelope.set_params(val);
                self.ch1.dac_enabled = Envelope::dac_enabled(val);
                if !self.ch1.dac_enabled {
                    self.ch1.active = false;
                }
            }
            0xFF13 => self.ch1.frequency = (self.ch1.frequency & 0x700) | val as u16,
            0xFF14 => {
                self.ch1.frequency = (self.ch1.frequency & 0xFF) | ((val as u16 & 0x07) << 8);
                write_length_enable(
                    &mut self.ch1.length_enable,
                    &mut self.ch1.length,
                    &mut self.ch1.active,
                    val,
                    length_step,
                );
                if val & 0x80 != 0 {
                    self.trigger_square(1);
                }
            }
            0xFF16 => {
                self.ch2.duty = val >> 6;
                self.ch2.length = 64 - (val & 0x3F) as u16;
            }
            0xFF17 => {
                self.ch2.envelope.set_params(val);
                self.ch2.dac_enabled = Envelope::dac_enabled(val);
                if !self.ch2.dac_enabled {
                    self.ch2.active = false;
                }
            }
            0xFF18 => self.ch2.frequency = (self.ch2.frequency & 0x700) | val as u16,
            0xFF19 => {
                self.ch2.frequency = (self.ch2.frequency & 0xFF) | ((val as u16 & 0x07) << 8);
                write_length_enable(
                    &mut self.ch2.length_enable,
                    &mut self.ch2.length,
                    &mut self.ch2.active,
                    val,
                    length_step,
                );
                if val & 0x80 != 0 {
                    self.trigger_square(2);
                }
            }
            0xFF1A => {
                self.ch3.dac_enabled = val & 0x80 != 0;
                if !self.ch3.dac_enabled {
                    self.ch3.active = false;
                }
            }
            0xFF1B => self.ch3.length = 256 - val as u16,
            0xFF1C => self.ch3.volume_code = (val >> 5) & 0x03,
            0xFF1D => self.ch3.frequency = (self.ch3.frequency & 0x700) | val as u16,
            0xFF1E => {
                self.ch3.frequency = (self.ch3.frequency & 0xFF) | ((val as u16 & 0x07) << 8);
                write_length_enable(
                    &mut self.ch3.length_enable,
                    &mut self.ch3.length,
                    &mut self.ch3.active,
                    val,
                    length_step,
                );
                if val & 0x80 != 0 {
                    self.trigger_wave();
                }
            }
            0xFF20 => self.ch4.length = 64 - (val & 0x3F) as u16,
            0xFF21 => {
                self.ch4.envelope.set_params(val);
                self.ch4.dac_enabled = Envelope::dac_enabled(val);
                if !self.ch4.dac_enabled {
                    self.ch4.active = false;
                }
            }
            0xFF22 => {
                self.ch4.clock_shift = val >> 4;
                self.ch4.width7 = val & 0x08 != 0;
                self.ch4.divisor = val & 0x07;
            }
            0xFF23 => {
                write_length_enable(
                    &mut self.ch4.length_enable,
                    &mut self.ch4.length,
                    &mut self.ch4.active,
                    val,
                    length_step,
                );
                if val & 0x80 != 0 {
                    self.trigger_noise();
                }
            }
            0xFF24 => self.nr50 = val,
            0xFF25 => self.nr51 = val,
            _ => {}
        }
    }

    fn trigger_square(&mut self, idx: u8) {
        let length_step = self.fs_step & 1 == 1;
        let ch = if idx == 1 {
            &mut self.ch1
        } else {
            &mut self.ch2
        };
        ch.active = ch.dac_enabled;
        reload_length(&mut ch.length, 64, ch.length_enable, length_step);
        ch.timer = ch.period();
        ch.envelope.trigger();
        if self.fs_step == 7 {
            ch.envelope.timer += 1;
        }
        if let Some(sweep) = ch.sweep.as_mut() {
            sweep.reload(ch.frequency);
            if sweep.shift != 0 && sweep.calculate() > 2047 {
                ch.active = false;
            }
        }
    }

    fn trigger_wave(&mut self) {
        let length_step = self.fs_step & 1 == 1;
        let ch = &mut self.ch3;
        ch.active = ch.dac_enabled;
        reload_length(&mut ch.length, 256, ch.length_enable, length_step);
        ch.position = 0;
        // The first sample is fetched one tick late.
        ch.timer = ch.period() + 3;
    }

    fn trigger_noise(&mut self) {
        let length_step = self.fs_step & 1 == 1;
        let ch = &mut self.ch4;
        ch.active = ch.dac_enabled;
        reload_length(&mut ch.length, 64, ch.length_enable, length_step);
        ch.lfsr = 0x7FFF;
        ch.timer = ch.period();
        ch.envelope.trigger();
        if self.fs_step == 7 {
            ch.envelope.timer += 1;
        }
    }

    pub(crate) fn save(&self, st: &mut ApuState) {
        st.cycle_counter = self.last_cc;
        st.enabled = self.enabled;
        st.regs = self.regs;
        st.nr50 = self.nr50;
        st.nr51 = self.nr51;
        st.wave_ram = self.wave_ram;
        st.fs_step = self.fs_step;
        st.fs_counter = self.fs_counter;
        st.active = [
            self.ch1.active,
            self.ch2.active,
            self.ch3.active,
            self.ch4.active,
        ];
        st.length = [
            self.ch1.length,
            self.ch2.length,
            self.ch3.length,
            self.ch4.length,
        ];
        st.timer = [
            self.ch1.timer,
            self.ch2.timer,
            self.ch3.timer,
            self.ch4.timer,
        ];
        st.duty_pos = [self.ch1.duty_pos, self.ch2.duty_pos];
        st.frequency = [self.ch1.frequency, self.ch2.frequency, self.ch3.frequency];
        st.env_volume = [
            self.ch1.envelope.volume,
            self.ch2.envelope.volume,
            self.ch4.envelope.volume,
        ];
        st.env_timer = [
            self.ch1.envelope.timer,
            self.ch2.envelope.timer,
            self.ch4.envelope.timer,
        ];
        let sweep = self.ch1.sweep.unwrap_or_default();
        st.sweep_shadow = sweep.shadow;
        st.sweep_timer = sweep.timer;
        st.sweep_enabled = sweep.enabled;
        st.sweep_neg_used = sweep.neg_used;
        st.wave_position = self.ch3.position;
        st.wave_sample = self.ch3.sample;
        st.lfsr = self.ch4.lfsr;
        st.pending = self.samples.clone();
    }

    pub(crate) fn load(&mut self, st: &ApuState) {
        let cgb = self.cgb_mode;
        *self = Self::new_with_mode(cgb);
        // Decode channel parameters from the raw registers without triggers.
        for (i, &val) in st.regs.iter().enumerate().take(0x16) {
            let addr = 0xFF10 + i as u16;
            self.write_reg(addr, if i % 5 == 4 { val & 0x7F } else { val });
        }
        self.regs = st.regs;
        self.nr50 = st.nr50;
        self.nr51 = st.nr51;
        self.wave_ram = st.wave_ram;
        self.enabled = st.enabled;
        self.fs_step = st.fs_step & 7;
        self.fs_counter = st.fs_counter.clamp(1, FRAME_SEQUENCER_PERIOD);
        self.last_cc = st.cycle_counter;

        self.ch1.active = st.active[0];
        self.ch2.active = st.active[1];
        self.ch3.active = st.active[2];
        self.ch4.active = st.active[3];
        self.ch1.length = st.length[0];
        self.ch2.length = st.length[1];
        self.ch3.length = st.length[2];
        self.ch4.length = st.length[3];
        self.ch1.timer = st.timer[0].max(1);
        self.ch2.timer = st.timer[1].max(1);
        self.ch3.timer = st.timer[2].max(1);
        self.ch4.timer = st.timer[3].max(1);
        self.ch1.duty_pos = st.duty_pos[0] & 7;
        self.ch2.duty_pos = st.duty_pos[1] & 7;
        self.ch1.frequency = st.frequency[0] & 0x7FF;
        self.ch2.frequency = st.frequency[1] & 0x7FF;
        self.ch3.frequency = st.frequency[2] & 0x7FF;
        self.ch1.envelope.volume = st.env_volume[0] & 0x0F;
        self.ch2.envelope.volume = st.env_volume[1] & 0x0F;
        self.ch4.envelope.volume = st.env_volume[2] & 0x0F;
        self.ch1.envelope.timer = st.env_timer[0];
        self.ch2.envelope.timer = st.env_timer[1];
        self.ch4.envelope.timer = st.env_timer[2];
        if let Some(sweep) = self.ch1.sweep.as_mut() {
            sweep.shadow = st.sweep_shadow;
            sweep.timer = st.sweep_timer;
            sweep.enabled = st.sweep_enabled;
            sweep.neg_used = st.sweep_neg_used;
        }
        self.ch3.position = st.wave_position & 0x1F;
        self.ch3.sample = st.wave_sample & 0x0F;
        self.ch4.lfsr = st.lfsr & 0x7FFF;
        self.samples = st.pending.clone();
    }
}

/// NRx4 bit 6 handling, including the extra length clock when length is
/// enabled during a frame sequencer step that does not clock length.
fn write_length_enable(
    enable: &mut bool,
    length: &mut u16,
    active: &mut bool,
    val: u8,
    odd_step: bool,
) {
    let was_enabled = *enable;
    *enable = val & 0x40 != 0;
    if !was_enabled && *enable && odd_step && *length > 0 {
        *length -= 1;
        if *length == 0 && val & 0x80 == 0 {
            *active = false;
        }
    }
}

fn reload_length(length: &mut u16, max: u16, enabled: bool, odd_step: bool) {
    if *length == 0 {
        *length = if enabled && odd_step { max - 1 } else { max };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cycles per frame sequencer step at normal speed.
    const FS_CYCLES: u64 = FRAME_SEQUENCER_PERIOD as u64 * 2;

    fn powered(cgb: bool) -> Apu {
        let mut apu = Apu::new_with_mode(cgb);
        apu.write_reg(0xFF26, 0x00);
        apu.write_reg(0xFF26, 0x80);
        apu
    }

    #[test]
    fn samples_are_generated_lazily_per_two_cycles() {
        let mut apu = Apu::new_with_mode(false);
        apu.generate_samples(101, false);
        assert_eq!(apu.pending_samples(), 50);
        apu.generate_samples(103, false);
        assert_eq!(apu.pending_samples(), 51);
        apu.generate_samples(115, true);
        assert_eq!(apu.pending_samples(), 54);
    }

    #[test]
    fn take_samples_keeps_overflow() {
        let mut apu = Apu::new_with_mode(false);
        apu.generate_samples(20, false);
        let mut out = [0u32; 4];
        assert_eq!(apu.take_samples(&mut out), 4);
        assert_eq!(apu.pending_samples(), 6);
        let mut rest = [0u32; 16];
        assert_eq!(apu.take_samples(&mut rest), 6);
        assert_eq!(apu.pending_samples(), 0);
    }

    #[test]
    fn read_masks_apply() {
        let apu = powered(false);
        assert_eq!(apu.read_reg(0xFF10), 0x80);
        assert_eq!(apu.read_reg(0xFF11), 0x3F);
        assert_eq!(apu.read_reg(0xFF13), 0xFF);
        assert_eq!(apu.read_reg(0xFF15), 0xFF);
        assert_eq!(apu.read_reg(0xFF1A), 0x7F);
        assert_eq!(apu.read_reg(0xFF26), 0xF0);
    }

    #[test]
    fn power_off_clears_registers() {
        let mut apu = Apu::new_with_mode(false);
        apu.write_reg(0xFF24, 0x77);
        apu.write_reg(0xFF12, 0xF0);
        apu.write_reg(0xFF26, 0x00);
        assert_eq!(apu.read_reg(0xFF24), 0x00);
        assert_eq!(apu.read_reg(0xFF12), 0x00);
        assert_eq!(apu.read_reg(0xFF26), 0x70);
        // Ignored while off.
        apu.write_reg(0xFF24, 0x77);
        assert_eq!(apu.read_reg(0xFF24), 0x00);
        // Wave RAM stays reachable.
        apu.write_reg(0xFF30, 0x5A);
        assert_eq!(apu.read_reg(0xFF30), 0x5A);
    }

    #[test]
    fn dmg_keeps_length_across_power_cycle() {
        let mut apu = powered(false);
        apu.write_reg(0xFF11, 0x20);
        assert_eq!(apu.length_counter(1), 32);
        apu.write_reg(0xFF26, 0x00);
        apu.write_reg(0xFF26, 0x80);
        assert_eq!(apu.length_counter(1), 32);

        apu.write_reg(0xFF26, 0x00);
        apu.write_reg(0xFF20, 0x3E);
        apu.write_reg(0xFF26, 0x80);
        assert_eq!(apu.length_counter(4), 2);
    }

    #[test]
    fn cgb_resets_length_on_power_off() {
        let mut apu = powered(true);
        apu.write_reg(0xFF11, 0x20);
        assert_eq!(apu.length_counter(1), 32);
        apu.write_reg(0xFF26, 0x00);
        apu.write_reg(0xFF20, 0x3E);
        apu.write_reg(0xFF26, 0x80);
        assert_eq!(apu.length_counter(1), 0);
        assert_eq!(apu.length_counter(4), 0);
    }

    #[test]
    fn length_counter_silences_channel() {
        let mut apu = powered(false);
        apu.write_reg(0xFF12, 0xF0);
        apu.write_reg(0xFF11, 0x3E);
        apu.write_reg(0xFF14, 0xC0);
        assert_eq!(apu.read_reg(0xFF26) & 0x01, 0x01);
        // Two length clocks: steps 0 and 2.
        apu.generate_samples(3 * FS_CYCLES, false);
        assert_eq!(apu.read_reg(0xFF26) & 0x01, 0x00);
    }

    #[test]
    fn enabling_length_on_odd_step_clocks_once() {
        let mut apu = powered(false);
        apu.write_reg(0xFF12, 0xF0);
        apu.write_reg(0xFF11, 0x3F);
        apu.write_reg(0xFF14, 0x80);
        // After step 0 the next step (1) does not clock length.
        apu.generate_samples(FS_CYCLES, false);
        assert_eq!(apu.fs_step, 1);
        apu.write_reg(0xFF14, 0x40);
        assert_eq!(apu.length_counter(1), 0);
        assert_eq!(apu.read_reg(0xFF26) & 0x01, 0x00);
    }

    #[test]
    fn dac_off_disables_channel() {
        let mut apu = powered(false);
        apu.write_reg(0xFF17, 0xF0);
        apu.write_reg(0xFF19, 0x80);
        assert_eq!(apu.read_reg(0xFF26) & 0x02, 0x02);
        apu.write_reg(0xFF17, 0x07);
        assert_eq!(apu.read_reg(0xFF26) & 0x02, 0x00);
    }

    #[test]
    fn sweep_overflow_disables_on_trigger() {
        let mut apu = powered(false);
        apu.write_reg(0xFF12, 0xF0);
        apu.write_reg(0xFF10, 0x11);
        apu.write_reg(0xFF13, 0xFF);
        apu.write_reg(0xFF14, 0x87);
        assert_eq!(apu.read_reg(0xFF26) & 0x01, 0x00);
    }

    #[test]
    fn mixer_packs_left_low_right_high() {
        let mut apu = powered(false);
        apu.write_reg(0xFF24, 0x70);
        apu.write_reg(0xFF25, 0x10);
        apu.write_reg(0xFF12, 0xF0);
        apu.write_reg(0xFF11, 0xC0);
        apu.write_reg(0xFF14, 0x87);
        apu.generate_samples(2000, false);
        let mut out = [0u32; 1000];
        let n = apu.take_samples(&mut out);
        assert!(out[..n].iter().all(|s| s >> 16 == 0));
        assert!(out[..n].iter().any(|s| s & 0xFFFF == (15 * 8 * VOLUME_FACTOR) as u32));
    }

    #[test]
    fn state_round_trip_preserves_output() {
        let mut apu = powered(false);
        apu.write_reg(0xFF24, 0x77);
        apu.write_reg(0xFF25, 0xFF);
        apu.write_reg(0xFF21, 0xF3);
        apu.write_reg(0xFF22, 0x21);
        apu.write_reg(0xFF23, 0x80);
        apu.generate_samples(10_000, false);
        let mut queued = vec![0u32; apu.pending_samples()];
        apu.take_samples(&mut queued);

        let mut st = ApuState::default();
        apu.save(&mut st);
        let mut copy = Apu::new_with_mode(false);
        copy.load(&st);

        apu.generate_samples(50_000, false);
        copy.generate_samples(50_000, false);
        let mut a = vec![0u32; 20_000];
        let mut b = vec![0u32; 20_000];
        assert_eq!(apu.take_samples(&mut a), copy.take_samples(&mut b));
        assert_eq!(a, b);
    }
}
