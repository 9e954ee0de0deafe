use crate::{
    apu::Apu,
    cartridge::Cartridge,
    cheats::Cheats,
    hardware::HardwareMode,
    input::Joypad,
    interrupts::{INT_VBLANK, InterruptRequester, vector},
    ppu::Ppu,
    savestate::SaveState,
    scheduler::{DISABLED, EVENT_COUNT, Event},
    serial::Serial,
    timer::Timer,
};
use log::{debug, trace};

const WRAM_BANK_SIZE: usize = 0x1000;
const OAM_SIZE: usize = 0xA0;

// OAM DMA copies one byte per M-cycle after a one M-cycle setup delay.
const OAM_DMA_DELAY: u64 = 4;
const OAM_DMA_BYTE_CYCLES: u64 = 4;
const OAM_DMA_CYCLES: u64 = OAM_SIZE as u64 * OAM_DMA_BYTE_CYCLES;

/// CPU stall per 16-byte HDMA/GDMA block in normal speed.
const DMA_BLOCK_CYCLES: u64 = 32;
const SPEED_SWITCH_STALL: u64 = 8200;

/// Cycle count at which [`Memory::reset_counters`] rebases the timeline.
pub const COUNTER_REBASE_THRESHOLD: u64 = 0x8000_0000;

// Internal divider right after the boot ROM hands over.
const DMG_BOOT_DIVIDER: u16 = 0xABCC;
const CGB_BOOT_DIVIDER: u16 = 0x1EA0;

/// Bus a CPU access travels on, as far as OAM DMA conflicts go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bus {
    External,
    Wram,
    Vram,
    Internal,
}

#[derive(Debug, Clone, Copy)]
struct OamDma {
    src: u16,
    /// Cycle the first byte is copied, or `DISABLED` when idle.
    start: u64,
    /// Bytes copied so far.
    pos: u8,
}

#[derive(Debug, Clone, Copy)]
struct HdmaState {
    src: u16,
    /// Offset into VRAM (0x0000-0x1FF0).
    dst: u16,
    /// Remaining blocks minus one, as FF55 reports it.
    len: u8,
    active: bool,
    /// A general-purpose transfer is waiting for the `Dma` event.
    gdma: bool,
}

impl Default for HdmaState {
    fn default() -> Self {
        Self {
            src: 0,
            dst: 0,
            len: 0x7F,
            active: false,
            gdma: false,
        }
    }
}

/// The address space and every unit hanging off it.
///
/// Accesses carry the cycle they happen on. Units are brought forward to
/// that cycle only when something observes or changes them, and the event
/// schedule in [`InterruptRequester::events`] makes sure the CPU loop stops
/// at every point where a unit has work of its own to do.
pub struct Memory {
    pub cart: Option<Cartridge>,
    pub cheats: Cheats,
    pub ppu: Ppu,
    pub apu: Apu,
    pub timer: Timer,
    pub serial: Serial,
    pub joypad: Joypad,
    pub intreq: InterruptRequester,
    /// OAM at 0x000, I/O shadow at 0x100, HRAM at 0x180.
    ioamhram: [u8; 0x200],
    wram: Vec<u8>,
    svbk: usize,
    mode: HardwareMode,
    double_speed: bool,
    key1_armed: bool,
    oam_dma: OamDma,
    hdma: HdmaState,
    active: bool,
    blit_time: Option<u64>,
    /// Sample queue position of a completed frame the host has not received.
    frame_mark: Option<usize>,
}

impl Memory {
    pub fn new_with_mode(mode: HardwareMode) -> Self {
        let cgb = mode.is_cgb();
        let wram_banks = if cgb { 8 } else { 2 };
        Self {
            cart: None,
            cheats: Cheats::default(),
            ppu: Ppu::new_with_mode(mode),
            apu: Apu::new_with_mode(cgb),
            timer: Timer::new(),
            serial: Serial::new(cgb),
            joypad: Joypad::new(),
            intreq: InterruptRequester::default(),
            ioamhram: [0; 0x200],
            wram: vec![0; wram_banks * WRAM_BANK_SIZE],
            svbk: 1,
            mode,
            double_speed: false,
            key1_armed: false,
            oam_dma: OamDma {
                src: 0,
                start: DISABLED,
                pos: 0,
            },
            hdma: HdmaState::default(),
            active: false,
            blit_time: None,
            frame_mark: None,
        }
    }

    pub fn load_cart(&mut self, cart: Cartridge) {
        self.cart = Some(cart);
    }

    #[inline]
    pub fn mode(&self) -> HardwareMode {
        self.mode
    }

    #[inline]
    pub fn is_cgb(&self) -> bool {
        self.mode.is_cgb()
    }

    #[inline]
    fn cgb_native(&self) -> bool {
        self.mode == HardwareMode::Cgb
    }

    #[inline]
    pub fn double_speed(&self) -> bool {
        self.double_speed
    }

    /// KEY1 bit 0: the next STOP switches speed.
    #[inline]
    pub fn speed_switch_armed(&self) -> bool {
        self.key1_armed && self.cgb_native()
    }

    pub fn oam(&self) -> &[u8] {
        &self.ioamhram[..OAM_SIZE]
    }

    /// I/O state the boot ROM leaves behind, with the LCD starting its first
    /// frame at `cc`.
    pub fn apply_boot_state(&mut self, cc: u64) {
        self.ppu.apply_boot_state(cc);
        let divider = if self.is_cgb() {
            CGB_BOOT_DIVIDER
        } else {
            DMG_BOOT_DIVIDER
        };
        self.timer.set_divider(cc, divider);
        self.joypad.restore(0x00);
        self.intreq.set_if(INT_VBLANK, cc);
        self.sync_events();
    }

    fn sync_events(&mut self) {
        let events = &mut self.intreq.events;
        events.set(Event::Lcd, self.ppu.next_event_time());
        events.set(Event::Tima, self.timer.next_irq_time());
        events.set(Event::Serial, self.serial.next_event_time());
    }

    #[inline]
    fn sync_timer_event(&mut self) {
        let t = self.timer.next_irq_time();
        self.intreq.events.set(Event::Tima, t);
    }

    #[inline]
    fn sync_serial_event(&mut self) {
        let t = self.serial.next_event_time();
        self.intreq.events.set(Event::Serial, t);
    }

    // ---- run control ----

    #[inline]
    pub fn next_event_time(&self) -> u64 {
        self.intreq.events.next_time()
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Arms the `End` event: the current run stops once `cc` is reached.
    pub fn set_end_time(&mut self, cc: u64) {
        self.intreq.events.set(Event::End, cc);
        self.active = true;
    }

    /// Cycles between the last frame blit of this run and `cc`, or -1.
    pub fn take_cycles_since_blit(&mut self, cc: u64) -> i64 {
        self.blit_time
            .take()
            .map_or(-1, |t| cc.saturating_sub(t) as i64)
    }

    pub fn frame_pending(&self) -> bool {
        self.frame_mark.is_some()
    }

    /// Moves queued samples into `out`. Also returns the offset within
    /// `out` at which a video frame completed, if it is among them.
    pub fn drain_samples(&mut self, out: &mut [u32]) -> (usize, Option<usize>) {
        let n = self.apu.take_samples(out);
        let frame = match self.frame_mark {
            Some(mark) if mark <= n => {
                self.frame_mark = None;
                Some(mark)
            }
            Some(mark) => {
                self.frame_mark = Some(mark - n);
                None
            }
            None => None,
        };
        (n, frame)
    }

    fn frame_completed(&mut self, t: u64) {
        self.apu.generate_samples(t, self.double_speed);
        self.frame_mark = Some(self.apu.pending_samples());
        self.blit_time = Some(t);
        if self.active && t < self.intreq.events.time(Event::End) {
            self.intreq.events.set(Event::End, t);
        }
    }

    // ---- lazy units ----

    fn update_lcd(&mut self, cc: u64) {
        self.update_oam_dma(cc);
        self.ppu
            .update(cc, &self.ioamhram[..OAM_SIZE], &mut self.intreq);
        self.after_lcd();
    }

    /// Picks up what the LCD reported during its last update.
    fn after_lcd(&mut self) {
        if let Some(t) = self.ppu.take_hblank()
            && self.hdma.active
            && !self.hdma.gdma
            && !self.intreq.events.is_enabled(Event::Dma)
        {
            self.intreq.events.set(Event::Dma, t);
        }
        if let Some(t) = self.ppu.take_frame_done() {
            self.frame_completed(t);
        }
        let next = self.ppu.next_event_time();
        self.intreq.events.set(Event::Lcd, next);
    }

    /// Brings interrupt sources up to `cc` so IF reflects them.
    fn update_irq_sources(&mut self, cc: u64) {
        self.timer.update(cc, &mut self.intreq);
        self.sync_timer_event();
        self.update_lcd(cc);
    }

    // ---- OAM DMA ----

    fn oam_dma_source(&self, index: u8) -> u16 {
        let src = self.oam_dma.src.wrapping_add(index as u16);
        if src >= 0xE000 { src - 0x2000 } else { src }
    }

    fn update_oam_dma(&mut self, cc: u64) {
        let start = self.oam_dma.start;
        if start == DISABLED || cc < start {
            return;
        }
        let due = ((cc - start) / OAM_DMA_BYTE_CYCLES + 1).min(OAM_SIZE as u64) as u8;
        while self.oam_dma.pos < due {
            let i = self.oam_dma.pos;
            let byte = self.dma_source_read(self.oam_dma_source(i));
            self.ioamhram[i as usize] = byte;
            self.oam_dma.pos += 1;
        }
    }

    fn start_oam_dma(&mut self, val: u8, cc: u64) {
        self.update_oam_dma(cc);
        self.oam_dma = OamDma {
            src: (val as u16) << 8,
            start: cc + OAM_DMA_DELAY,
            pos: 0,
        };
        self.intreq
            .events
            .set(Event::Oam, cc + OAM_DMA_DELAY + OAM_DMA_CYCLES);
        #[cfg(feature = "ppu-trace")]
        trace!("OAM DMA from {:04X} at {cc}", self.oam_dma.src);
    }

    fn finish_oam_dma(&mut self) {
        let end = self.intreq.events.time(Event::Oam);
        self.update_oam_dma(end);
        self.oam_dma.start = DISABLED;
        self.intreq.events.disable(Event::Oam);
    }

    #[inline]
    fn oam_dma_running(&self, cc: u64) -> bool {
        self.oam_dma.start != DISABLED && cc >= self.oam_dma.start
    }

    fn bus_of(&self, addr: u16) -> Bus {
        match addr {
            0x8000..=0x9FFF => Bus::Vram,
            0xC000..=0xFDFF if self.is_cgb() => Bus::Wram,
            0x0000..=0x7FFF | 0xA000..=0xFDFF => Bus::External,
            _ => Bus::Internal,
        }
    }

    /// Whether the DMA owns the bus `addr` is on.
    fn oam_dma_conflict(&self, addr: u16) -> bool {
        let bus = self.bus_of(addr);
        bus != Bus::Internal && bus == self.bus_of(self.oam_dma_source(0))
    }

    /// Byte the DMA is driving onto its bus right now.
    fn oam_dma_bus_byte(&self) -> u8 {
        let i = self.oam_dma.pos.saturating_sub(1);
        self.dma_source_read(self.oam_dma_source(i))
    }

    /// Reads DMA engines see, without CPU access gates.
    fn dma_source_read(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x7FFF => self.cart.as_ref().map_or(0xFF, |c| c.read_rom(addr)),
            0x8000..=0x9FFF => self.ppu.read_vram(addr),
            0xA000..=0xBFFF => self.cart.as_ref().map_or(0xFF, |c| c.read_ram(addr)),
            0xC000..=0xFFFF => {
                let addr = if addr >= 0xE000 { addr - 0x2000 } else { addr };
                self.wram[self.wram_offset(addr)]
            }
        }
    }

    #[inline]
    fn wram_offset(&self, addr: u16) -> usize {
        let bank = if addr & 0x1000 == 0 { 0 } else { self.svbk };
        bank * WRAM_BANK_SIZE + (addr as usize & 0x0FFF)
    }

    // ---- HDMA / GDMA ----

    fn hdma_status(&self) -> u8 {
        if self.hdma.active {
            self.hdma.len & 0x7F
        } else {
            0x80 | self.hdma.len
        }
    }

    fn write_hdma_control(&mut self, val: u8, cc: u64) {
        if self.hdma.active && !self.hdma.gdma && val & 0x80 == 0 {
            self.hdma.active = false;
            trace!("HDMA cancelled with {} blocks left", self.hdma.len as u16 + 1);
            return;
        }
        self.hdma.len = val & 0x7F;
        self.hdma.active = true;
        if val & 0x80 == 0 {
            self.hdma.gdma = true;
            self.intreq.events.set(Event::Dma, cc);
            return;
        }
        self.hdma.gdma = false;
        self.update_lcd(cc);
        let in_hblank =
            self.ppu.mode() == 0 && (self.ppu.ly() as usize) < crate::ppu::SCREEN_HEIGHT;
        if !self.ppu.is_enabled() || in_hblank {
            self.intreq.events.set(Event::Dma, cc);
        }
    }

    /// Copies one 16-byte block and returns the cycle the CPU resumes on.
    fn dma_block(&mut self, cc: u64) -> u64 {
        self.update_lcd(cc);
        trace!(
            "DMA block {:04X} -> {:04X} at {cc}",
            self.hdma.src,
            0x8000 | self.hdma.dst
        );
        for _ in 0..0x10 {
            let src = self.hdma.src;
            let byte = if (0x8000..=0x9FFF).contains(&src) {
                0xFF
            } else {
                self.dma_source_read(src)
            };
            self.ppu.write_vram(self.hdma.dst, byte);
            self.hdma.src = src.wrapping_add(1);
            self.hdma.dst = (self.hdma.dst + 1) & 0x1FFF;
        }
        if self.hdma.len == 0 {
            self.hdma.active = false;
            self.hdma.gdma = false;
            self.hdma.len = 0x7F;
        } else {
            self.hdma.len -= 1;
        }
        cc + (DMA_BLOCK_CYCLES << self.double_speed as u32)
    }

    fn dma_event(&mut self, mut cc: u64) -> u64 {
        self.intreq.events.disable(Event::Dma);
        if self.hdma.gdma {
            while self.hdma.active {
                cc = self.dma_block(cc);
            }
        } else if self.hdma.active {
            cc = self.dma_block(cc);
        }
        cc
    }

    // ---- events ----

    /// Processes the earliest pending event. Returns the cycle the CPU
    /// continues from, later than `cc` when the event stalls it.
    pub fn event(&mut self, cc: u64, pc: &mut u16, sp: &mut u16) -> u64 {
        match self.intreq.events.next_event() {
            Event::Interrupts => self.interrupt(cc, pc, sp),
            Event::Dma => self.dma_event(cc),
            Event::Oam => {
                self.finish_oam_dma();
                cc
            }
            Event::Lcd => {
                self.update_lcd(cc);
                cc
            }
            Event::Tima => {
                self.timer.update(cc, &mut self.intreq);
                self.sync_timer_event();
                cc
            }
            Event::Serial => {
                self.serial.complete(cc, &mut self.intreq);
                self.sync_serial_event();
                cc
            }
            Event::End => {
                self.intreq.events.disable(Event::End);
                self.active = false;
                cc
            }
        }
    }

    fn interrupt(&mut self, mut cc: u64, pc: &mut u16, sp: &mut u16) -> u64 {
        if self.intreq.halted() {
            self.intreq.unhalt();
            cc += 4;
        }
        if !self.intreq.ime() {
            self.intreq.events.disable(Event::Interrupts);
            return cc;
        }
        let Some(bit) = self.intreq.acknowledge() else {
            return cc;
        };
        cc += 8;
        *sp = sp.wrapping_sub(1);
        self.write(*sp, (*pc >> 8) as u8, cc);
        cc += 4;
        *sp = sp.wrapping_sub(1);
        self.write(*sp, *pc as u8, cc);
        cc += 4;
        *pc = vector(bit);
        cc += 4;
        if bit == INT_VBLANK && self.cheats.has_vblank_writes() {
            let writes: Vec<_> = self.cheats.vblank_writes().collect();
            for (addr, val) in writes {
                self.write(addr, val, cc);
            }
        }
        cc
    }

    /// Polls the link transport for an externally clocked transfer.
    pub fn poll_serial(&mut self, cc: u64) {
        self.serial.poll_external(cc, &mut self.intreq);
    }

    /// STOP with KEY1 armed. Returns the cycle the CPU resumes on.
    pub fn speed_change(&mut self, cc: u64) -> u64 {
        self.apu.generate_samples(cc, self.double_speed);
        self.update_lcd(cc);
        let ds = !self.double_speed;

        let end = self.intreq.events.time(Event::End);
        if end != DISABLED {
            let left = end.saturating_sub(cc);
            let end = cc + if ds { left * 2 } else { left / 2 };
            self.intreq.events.set(Event::End, end);
        }
        self.double_speed = ds;
        self.key1_armed = false;
        self.ppu
            .speed_change(cc, ds, &self.ioamhram[..OAM_SIZE], &mut self.intreq);
        self.after_lcd();
        self.timer.write_div(cc, &mut self.intreq);
        self.sync_timer_event();
        debug!(
            "Switched to {} speed at cycle {cc}",
            if ds { "double" } else { "normal" }
        );
        cc + SPEED_SWITCH_STALL
    }

    /// Moves the whole timeline back so `cc` stays small. Returns the new
    /// cycle count.
    pub fn reset_counters(&mut self, cc: u64) -> u64 {
        let dec = (cc & !0x7FFF).saturating_sub(0x8000);
        if dec == 0 {
            return cc;
        }
        self.update_oam_dma(cc);
        self.timer.reset_cc(dec);
        self.serial.reset_cc(dec);
        self.apu.reset_counter(dec);
        self.ppu.reset_cc(dec);
        self.intreq.reset_cc(dec);
        if self.oam_dma.start != DISABLED {
            self.oam_dma.start = self.oam_dma.start.saturating_sub(dec);
        }
        self.blit_time = self.blit_time.map(|t| t.saturating_sub(dec));
        trace!("Rebased cycle counter by {dec}");
        cc - dec
    }

    // ---- CPU bus ----

    pub fn read(&mut self, addr: u16, cc: u64) -> u8 {
        if self.oam_dma.start != DISABLED {
            self.update_oam_dma(cc);
            if self.oam_dma_running(cc) {
                if (0xFE00..=0xFEFF).contains(&addr) {
                    return 0xFF;
                }
                if self.oam_dma_conflict(addr) {
                    return self.oam_dma_bus_byte();
                }
            }
        }
        match addr >> 12 {
            0x0..=0x7 => self.cart.as_ref().map_or(0xFF, |c| c.read_rom(addr)),
            0xC | 0xD => self.wram[self.wram_offset(addr)],
            0xE => self.wram[self.wram_offset(addr - 0x2000)],
            0xF if addr < 0xFE00 => self.wram[self.wram_offset(addr - 0x2000)],
            _ => self.nontrivial_read(addr, cc),
        }
    }

    fn nontrivial_read(&mut self, addr: u16, cc: u64) -> u8 {
        match addr {
            0x8000..=0x9FFF => {
                self.update_lcd(cc);
                if self.ppu.vram_accessible() {
                    self.ppu.read_vram(addr)
                } else {
                    0xFF
                }
            }
            0xA000..=0xBFFF => self.cart.as_ref().map_or(0xFF, |c| c.read_ram(addr)),
            0xFE00..=0xFE9F => {
                self.update_lcd(cc);
                if self.ppu.oam_readable() {
                    self.ioamhram[(addr - 0xFE00) as usize]
                } else {
                    0xFF
                }
            }
            0xFF00..=0xFF7F => self.read_io(addr, cc),
            0xFF80..=0xFFFE => self.ioamhram[(addr - 0xFE00) as usize],
            0xFFFF => self.intreq.ie_reg(),
            _ => 0xFF,
        }
    }

    fn read_io(&mut self, addr: u16, cc: u64) -> u8 {
        let cgb = self.is_cgb();
        let native = self.cgb_native();
        match addr {
            0xFF00 => self.joypad.read(cc, &mut self.intreq),
            0xFF01 => self.serial.read_sb(cc),
            0xFF02 => self.serial.read_sc(),
            0xFF04 => self.timer.read_div(cc),
            0xFF05 => {
                let v = self.timer.read_tima(cc, &mut self.intreq);
                self.sync_timer_event();
                v
            }
            0xFF06 => self.timer.tma,
            0xFF07 => 0xF8 | self.timer.tac,
            0xFF0F => {
                self.update_irq_sources(cc);
                0xE0 | self.intreq.if_reg()
            }
            0xFF10..=0xFF3F => {
                self.apu.generate_samples(cc, self.double_speed);
                self.apu.read_reg(addr)
            }
            0xFF40..=0xFF4B => {
                self.update_lcd(cc);
                self.ppu.read_reg(addr)
            }
            0xFF4D if native => 0x7E | (self.double_speed as u8) << 7 | self.key1_armed as u8,
            0xFF4F if native => 0xFE | self.ppu.vram_bank() as u8,
            0xFF55 if native => self.hdma_status(),
            0xFF56 if native => (self.ioamhram[0x156] & 0xC1) | 0x3E,
            0xFF68..=0xFF6C => {
                self.update_lcd(cc);
                self.ppu.read_reg(addr)
            }
            0xFF70 if native => 0xF8 | self.svbk as u8,
            0xFF72 | 0xFF73 if cgb => self.ioamhram[addr as usize - 0xFE00],
            0xFF74 if native => self.ioamhram[0x174],
            0xFF75 if cgb => 0x8F | (self.ioamhram[0x175] & 0x70),
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8, cc: u64) {
        if self.oam_dma.start != DISABLED {
            self.update_oam_dma(cc);
            if self.oam_dma_running(cc)
                && ((0xFE00..=0xFEFF).contains(&addr) || self.oam_dma_conflict(addr))
            {
                return;
            }
        }
        match addr >> 12 {
            0x0..=0x7 => {
                if let Some(cart) = self.cart.as_mut() {
                    cart.mbc_write(addr, val);
                }
            }
            0xC | 0xD => {
                let i = self.wram_offset(addr);
                self.wram[i] = val;
            }
            0xE => {
                let i = self.wram_offset(addr - 0x2000);
                self.wram[i] = val;
            }
            0xF if addr < 0xFE00 => {
                let i = self.wram_offset(addr - 0x2000);
                self.wram[i] = val;
            }
            _ => self.nontrivial_write(addr, val, cc),
        }
    }

    fn nontrivial_write(&mut self, addr: u16, val: u8, cc: u64) {
        match addr {
            0x8000..=0x9FFF => {
                self.update_lcd(cc);
                if self.ppu.vram_accessible() {
                    self.ppu.write_vram(addr, val);
                }
            }
            0xA000..=0xBFFF => {
                if let Some(cart) = self.cart.as_mut() {
                    cart.write_ram(addr, val);
                }
            }
            0xFE00..=0xFE9F => {
                self.update_lcd(cc);
                if self.ppu.oam_writable() {
                    self.ioamhram[(addr - 0xFE00) as usize] = val;
                }
            }
            0xFF00..=0xFF7F => self.write_io(addr, val, cc),
            0xFF80..=0xFFFE => self.ioamhram[(addr - 0xFE00) as usize] = val,
            0xFFFF => self.intreq.set_ie(val, cc),
            _ => {}
        }
    }

    fn write_io(&mut self, addr: u16, val: u8, cc: u64) {
        let native = self.cgb_native();
        match addr {
            0xFF00 => self.joypad.write(val),
            0xFF01 => self.serial.write_sb(val),
            0xFF02 => {
                self.serial.write_sc(val, cc);
                self.sync_serial_event();
            }
            0xFF04 => {
                self.timer.write_div(cc, &mut self.intreq);
                self.sync_timer_event();
            }
            0xFF05 => {
                self.timer.write_tima(val, cc, &mut self.intreq);
                self.sync_timer_event();
            }
            0xFF06 => {
                self.timer.write_tma(val, cc, &mut self.intreq);
                self.sync_timer_event();
            }
            0xFF07 => {
                self.timer.write_tac(val, cc, &mut self.intreq);
                self.sync_timer_event();
            }
            0xFF0F => {
                self.update_irq_sources(cc);
                self.intreq.set_if(val, cc);
            }
            0xFF10..=0xFF3F => {
                self.apu.generate_samples(cc, self.double_speed);
                self.apu.write_reg(addr, val);
            }
            0xFF46 => {
                self.update_lcd(cc);
                self.ppu.write_reg(addr, val, cc, &mut self.intreq);
                self.start_oam_dma(val, cc);
            }
            0xFF40..=0xFF4B | 0xFF68..=0xFF6C => {
                self.update_lcd(cc);
                self.ppu.write_reg(addr, val, cc, &mut self.intreq);
                self.after_lcd();
            }
            0xFF4D if native => self.key1_armed = val & 0x01 != 0,
            0xFF4F if native => {
                self.update_lcd(cc);
                self.ppu.set_vram_bank(val);
            }
            0xFF51 if native && !self.hdma.active => {
                self.hdma.src = (val as u16) << 8 | (self.hdma.src & 0x00F0);
            }
            0xFF52 if native && !self.hdma.active => {
                self.hdma.src = (self.hdma.src & 0xFF00) | (val & 0xF0) as u16;
            }
            0xFF53 if native && !self.hdma.active => {
                self.hdma.dst = ((val & 0x1F) as u16) << 8 | (self.hdma.dst & 0x00F0);
            }
            0xFF54 if native && !self.hdma.active => {
                self.hdma.dst = (self.hdma.dst & 0x1F00) | (val & 0xF0) as u16;
            }
            0xFF55 if native => self.write_hdma_control(val, cc),
            0xFF70 if native => {
                let bank = (val & 0x07) as usize;
                self.svbk = bank.max(1);
            }
            0xFF56 | 0xFF72..=0xFF75 => self.ioamhram[addr as usize - 0xFE00] = val,
            _ => {}
        }
    }

    // ---- save state ----

    pub(crate) fn save(&self, st: &mut SaveState) {
        let m = &mut st.mem;
        m.ioamhram = self.ioamhram.to_vec();
        m.wram = self.wram.clone();
        m.svbk = self.svbk as u8;
        m.double_speed = self.double_speed;
        m.key1_armed = self.key1_armed;
        m.if_reg = self.intreq.if_reg();
        m.ie_reg = self.intreq.ie_reg();
        m.ime = self.intreq.ime();
        m.halted = self.intreq.halted();
        m.min_int_time = self.intreq.min_int_time();
        m.event_times = self.intreq.events.times();
        m.oam_dma_start = self.oam_dma.start;
        m.oam_dma_src = self.oam_dma.src;
        m.oam_dma_pos = self.oam_dma.pos;
        m.hdma_src = self.hdma.src;
        m.hdma_dst = self.hdma.dst;
        m.hdma_len = self.hdma.len;
        m.hdma_active = self.hdma.active;
        m.gdma_pending = self.hdma.gdma;
        m.joypad_select = self.joypad.select();
        m.frame_mark = self
            .frame_mark
            .and_then(|m| u32::try_from(m).ok())
            .unwrap_or(u32::MAX);
        self.timer.save(&mut st.timer);
        self.serial.save(&mut st.serial);
        self.ppu.save(&mut st.ppu);
        self.apu.save(&mut st.apu);
        if let Some(cart) = &self.cart {
            cart.save(&mut st.cart);
        }
    }

    pub(crate) fn load(&mut self, st: &SaveState) {
        let m = &st.mem;
        if m.ioamhram.len() == self.ioamhram.len() {
            self.ioamhram.copy_from_slice(&m.ioamhram);
        }
        if m.wram.len() == self.wram.len() {
            self.wram.copy_from_slice(&m.wram);
        }
        let wram_banks = self.wram.len() / WRAM_BANK_SIZE;
        self.svbk = (m.svbk as usize % wram_banks).max(1);
        self.double_speed = m.double_speed && self.cgb_native();
        self.key1_armed = m.key1_armed;
        self.oam_dma = OamDma {
            src: m.oam_dma_src,
            start: m.oam_dma_start,
            pos: m.oam_dma_pos.min(OAM_SIZE as u8),
        };
        self.hdma = HdmaState {
            src: m.hdma_src,
            dst: m.hdma_dst & 0x1FF0,
            len: m.hdma_len & 0x7F,
            active: m.hdma_active,
            gdma: m.gdma_pending,
        };
        self.joypad.restore(m.joypad_select);
        self.frame_mark = (m.frame_mark != u32::MAX).then_some(m.frame_mark as usize);
        self.blit_time = None;
        self.active = false;

        self.timer.load(&st.timer);
        self.serial.load(&st.serial);
        self.ppu.load(&st.ppu, &self.ioamhram[..OAM_SIZE], self.double_speed);
        self.apu.load(&st.apu);
        if let Some(cart) = self.cart.as_mut() {
            cart.restore_state(&st.cart);
        }

        let mut times: [u64; EVENT_COUNT] = m.event_times;
        times[Event::End as usize] = DISABLED;
        times[Event::Interrupts as usize] = DISABLED;
        if self.oam_dma.start == DISABLED {
            times[Event::Oam as usize] = DISABLED;
        }
        self.intreq.events.set_all(times);
        self.sync_events();
        self.intreq.restore(
            m.if_reg,
            m.ie_reg,
            m.ime,
            m.halted,
            m.min_int_time,
            st.cpu.cycle_counter,
        );
    }
}
