use crate::{
    hardware::HardwareMode,
    mmu::{COUNTER_REBASE_THRESHOLD, Memory},
    savestate::CpuState,
};
#[cfg(feature = "cpu-trace")]
use log::trace;
use log::warn;

// CPU flag bits as documented in gbdev.io/pandocs/The_CPU_Flags.html
const FLAG_Z: u8 = 0x80; // Zero
const FLAG_N: u8 = 0x40; // Subtract
const FLAG_H: u8 = 0x20; // Half Carry
const FLAG_C: u8 = 0x10; // Carry

// Post-boot CPU state from gbdev.io/pandocs/Power_Up_State.html
const BOOT_PC: u16 = 0x0100;
const BOOT_SP: u16 = 0xFFFE;

const DMG_BOOT_A: u8 = 0x01;
const DMG_BOOT_F: u8 = 0xB0;
const DMG_BOOT_B: u8 = 0x00;
const DMG_BOOT_C: u8 = 0x13;
const DMG_BOOT_D: u8 = 0x00;
const DMG_BOOT_E: u8 = 0xD8;
const DMG_BOOT_H: u8 = 0x01;
const DMG_BOOT_L: u8 = 0x4D;

const CGB_BOOT_A: u8 = 0x11;
const CGB_BOOT_F: u8 = 0x80;
const CGB_BOOT_B: u8 = 0x00;
const CGB_BOOT_C: u8 = 0x00;
const CGB_BOOT_D: u8 = 0xFF;
const CGB_BOOT_E: u8 = 0x56;
const CGB_BOOT_H: u8 = 0x00;
const CGB_BOOT_L: u8 = 0x0D;

/// Clock units per machine cycle. Double speed halves the LCD/APU rates
/// instead of changing this.
const M_CYCLE: u64 = 4;

pub struct Cpu {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub pc: u16,
    pub sp: u16,
    pub cycles: u64,
    /// HALT bug: the next opcode fetch does not advance PC.
    skip: bool,
    /// An undefined opcode hung the CPU.
    locked: bool,
}

impl Cpu {
    /// Registers as the boot ROM leaves them for `mode`. `gba` selects the
    /// GBA flavour of the CGB boot ROM.
    pub fn new_with_mode(mode: HardwareMode, gba: bool) -> Self {
        let (a, f, b, c, d, e, h, l) = if mode.is_cgb() {
            (
                CGB_BOOT_A,
                CGB_BOOT_F,
                CGB_BOOT_B | gba as u8,
                CGB_BOOT_C,
                CGB_BOOT_D,
                CGB_BOOT_E,
                CGB_BOOT_H,
                CGB_BOOT_L,
            )
        } else {
            (
                DMG_BOOT_A, DMG_BOOT_F, DMG_BOOT_B, DMG_BOOT_C, DMG_BOOT_D, DMG_BOOT_E, DMG_BOOT_H,
                DMG_BOOT_L,
            )
        };
        Self {
            a,
            f,
            b,
            c,
            d,
            e,
            h,
            l,
            pc: BOOT_PC,
            sp: BOOT_SP,
            cycles: 0,
            skip: false,
            locked: false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn get_bc(&self) -> u16 {
        ((self.b as u16) << 8) | self.c as u16
    }

    fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = val as u8;
    }

    fn get_de(&self) -> u16 {
        ((self.d as u16) << 8) | self.e as u16
    }

    fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = val as u8;
    }

    pub fn get_hl(&self) -> u16 {
        ((self.h as u16) << 8) | self.l as u16
    }

    fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = val as u8;
    }

    /// BC, DE, HL, SP by opcode bits 4-5.
    fn get_r16(&self, index: u8) -> u16 {
        match index & 0x03 {
            0 => self.get_bc(),
            1 => self.get_de(),
            2 => self.get_hl(),
            _ => self.sp,
        }
    }

    fn set_r16(&mut self, index: u8, val: u16) {
        match index & 0x03 {
            0 => self.set_bc(val),
            1 => self.set_de(val),
            2 => self.set_hl(val),
            _ => self.sp = val,
        }
    }

    /// Branch condition NZ, Z, NC, C by opcode bits 3-4.
    fn condition(&self, opcode: u8) -> bool {
        match (opcode >> 3) & 0x03 {
            0 => self.f & FLAG_Z == 0,
            1 => self.f & FLAG_Z != 0,
            2 => self.f & FLAG_C == 0,
            _ => self.f & FLAG_C != 0,
        }
    }

    /// Runs until the memory's `End` event or until a video frame completes,
    /// whichever comes first. Returns the cycles executed after the frame
    /// completed, or -1 if none did.
    pub fn run_for(&mut self, mem: &mut Memory, cycles: u64) -> i64 {
        mem.set_end_time(self.cycles + cycles);
        while mem.is_active() {
            let mut next = mem.next_event_time();
            while self.cycles < next {
                if self.locked || mem.intreq.halted() {
                    self.cycles = next;
                    break;
                }
                self.step(mem);
                next = mem.next_event_time();
            }
            self.cycles = mem.event(self.cycles, &mut self.pc, &mut self.sp);
        }
        if self.cycles >= COUNTER_REBASE_THRESHOLD {
            self.cycles = mem.reset_counters(self.cycles);
        }
        mem.take_cycles_since_blit(self.cycles)
    }

    #[inline(always)]
    fn tick(&mut self) {
        self.cycles += M_CYCLE;
    }

    #[inline(always)]
    fn fetch8(&mut self, mem: &mut Memory) -> u8 {
        let val = mem.read(self.pc, self.cycles);
        self.pc = self.pc.wrapping_add(1);
        self.tick();
        val
    }

    #[inline(always)]
    fn fetch16(&mut self, mem: &mut Memory) -> u16 {
        let lo = self.fetch8(mem) as u16;
        let hi = self.fetch8(mem) as u16;
        (hi << 8) | lo
    }

    #[inline(always)]
    fn read8(&mut self, mem: &mut Memory, addr: u16) -> u8 {
        let val = mem.read(addr, self.cycles);
        self.tick();
        val
    }

    #[inline(always)]
    fn write8(&mut self, mem: &mut Memory, addr: u16, val: u8) {
        mem.write(addr, val, self.cycles);
        self.tick();
    }

    /// Formatted CPU state string for debugging.
    pub fn debug_state(&self) -> String {
        format!(
            "AF:{:04X} BC:{:04X} DE:{:04X} HL:{:04X} PC:{:04X} SP:{:04X} CY:{}",
            ((self.a as u16) << 8) | self.f as u16,
            self.get_bc(),
            self.get_de(),
            self.get_hl(),
            self.pc,
            self.sp,
            self.cycles
        )
    }

    fn push_stack(&mut self, mem: &mut Memory, val: u16) {
        self.sp = self.sp.wrapping_sub(1);
        self.write8(mem, self.sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        self.write8(mem, self.sp, val as u8);
    }

    fn pop_stack(&mut self, mem: &mut Memory) -> u16 {
        let lo = self.read8(mem, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        let hi = self.read8(mem, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        (hi << 8) | lo
    }

    fn read_reg(&mut self, mem: &mut Memory, index: u8) -> u8 {
        match index {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => self.read8(mem, self.get_hl()),
            7 => self.a,
            _ => unreachable!(),
        }
    }

    fn write_reg(&mut self, mem: &mut Memory, index: u8, val: u8) {
        match index {
            0 => self.b = val,
            1 => self.c = val,
            2 => self.d = val,
            3 => self.e = val,
            4 => self.h = val,
            5 => self.l = val,
            6 => {
                let addr = self.get_hl();
                self.write8(mem, addr, val);
            }
            7 => self.a = val,
            _ => unreachable!(),
        }
    }

    fn inc8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_add(1);
        self.f = (self.f & FLAG_C)
            | if res == 0 { FLAG_Z } else { 0 }
            | if val & 0x0F == 0x0F { FLAG_H } else { 0 };
        res
    }

    fn dec8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_sub(1);
        self.f = (self.f & FLAG_C)
            | FLAG_N
            | if res == 0 { FLAG_Z } else { 0 }
            | if val & 0x0F == 0 { FLAG_H } else { 0 };
        res
    }

    /// ADD/ADC/SUB/SBC/AND/XOR/OR/CP by opcode bits 3-5.
    fn alu(&mut self, op: u8, val: u8) {
        let a = self.a;
        let carry_in = if self.f & FLAG_C != 0 { 1u8 } else { 0 };
        match op {
            0 | 1 => {
                let c = if op == 1 { carry_in } else { 0 };
                let sum = a as u16 + val as u16 + c as u16;
                let res = sum as u8;
                self.f = if res == 0 { FLAG_Z } else { 0 }
                    | if (a & 0x0F) + (val & 0x0F) + c > 0x0F {
                        FLAG_H
                    } else {
                        0
                    }
                    | if sum > 0xFF { FLAG_C } else { 0 };
                self.a = res;
            }
            2 | 3 | 7 => {
                let c = if op == 3 { carry_in } else { 0 };
                let diff = a as i16 - val as i16 - c as i16;
                let res = diff as u8;
                self.f = FLAG_N
                    | if res == 0 { FLAG_Z } else { 0 }
                    | if ((a & 0x0F) as i16) - ((val & 0x0F) as i16) - (c as i16) < 0 {
                        FLAG_H
                    } else {
                        0
                    }
                    | if diff < 0 { FLAG_C } else { 0 };
                if op != 7 {
                    self.a = res;
                }
            }
            4 => {
                self.a &= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 } | FLAG_H;
            }
            5 => {
                self.a ^= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 };
            }
            _ => {
                self.a |= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 };
            }
        }
    }

    fn add_hl(&mut self, val: u16) {
        let hl = self.get_hl();
        self.f = (self.f & FLAG_Z)
            | if (hl & 0x0FFF) + (val & 0x0FFF) > 0x0FFF {
                FLAG_H
            } else {
                0
            }
            | if hl as u32 + val as u32 > 0xFFFF {
                FLAG_C
            } else {
                0
            };
        self.set_hl(hl.wrapping_add(val));
    }

    /// SP plus a signed immediate, with the flags ADD SP,e and LD HL,SP+e set.
    fn sp_offset(&mut self, mem: &mut Memory) -> u16 {
        let val = self.fetch8(mem) as i8 as i16 as u16;
        let sp = self.sp;
        self.f = if (sp & 0x0F) + (val & 0x0F) > 0x0F {
            FLAG_H
        } else {
            0
        } | if (sp & 0xFF) + (val & 0xFF) > 0xFF {
            FLAG_C
        } else {
            0
        };
        sp.wrapping_add(val)
    }

    fn daa(&mut self) {
        let mut correction = 0u8;
        let mut carry = false;
        if self.f & FLAG_H != 0 || (self.f & FLAG_N == 0 && (self.a & 0x0F) > 9) {
            correction |= 0x06;
        }
        if self.f & FLAG_C != 0 || (self.f & FLAG_N == 0 && self.a > 0x99) {
            correction |= 0x60;
            carry = true;
        }
        if self.f & FLAG_N == 0 {
            self.a = self.a.wrapping_add(correction);
        } else {
            self.a = self.a.wrapping_sub(correction);
        }
        self.f = if self.a == 0 { FLAG_Z } else { 0 }
            | (self.f & FLAG_N)
            | if carry { FLAG_C } else { 0 };
    }

    /// RLC/RRC/RL/RR/SLA/SRA/SWAP/SRL by CB opcode bits 3-5.
    fn shift(&mut self, op: u8, val: u8) -> u8 {
        let carry_in = self.f & FLAG_C != 0;
        let (res, carry) = match op {
            0 => (val.rotate_left(1), val & 0x80 != 0),
            1 => (val.rotate_right(1), val & 0x01 != 0),
            2 => ((val << 1) | carry_in as u8, val & 0x80 != 0),
            3 => ((val >> 1) | (carry_in as u8) << 7, val & 0x01 != 0),
            4 => (val << 1, val & 0x80 != 0),
            5 => ((val >> 1) | (val & 0x80), val & 0x01 != 0),
            6 => (val.rotate_left(4), false),
            _ => (val >> 1, val & 0x01 != 0),
        };
        self.f = if res == 0 { FLAG_Z } else { 0 } | if carry { FLAG_C } else { 0 };
        res
    }

    fn handle_cb(&mut self, opcode: u8, mem: &mut Memory) {
        let r = opcode & 0x07;
        let bit = (opcode >> 3) & 0x07;
        match opcode {
            0x00..=0x3F => {
                let val = self.read_reg(mem, r);
                let res = self.shift(bit, val);
                self.write_reg(mem, r, res);
            }
            0x40..=0x7F => {
                let val = self.read_reg(mem, r);
                self.f =
                    (self.f & FLAG_C) | FLAG_H | if val & (1 << bit) == 0 { FLAG_Z } else { 0 };
            }
            0x80..=0xBF => {
                let val = self.read_reg(mem, r);
                self.write_reg(mem, r, val & !(1 << bit));
            }
            0xC0..=0xFF => {
                let val = self.read_reg(mem, r);
                self.write_reg(mem, r, val | (1 << bit));
            }
        }
    }

    fn halt(&mut self, mem: &mut Memory) {
        if mem.intreq.pending() != 0 {
            // Already pending: HALT falls through. Without IME the next
            // fetch repeats the byte after HALT.
            if !mem.intreq.ime() {
                self.skip = true;
            }
        } else {
            mem.intreq.halt(self.cycles);
        }
    }

    fn stop(&mut self, mem: &mut Memory) {
        let _ = self.fetch8(mem);
        if mem.speed_switch_armed() {
            self.cycles = mem.speed_change(self.cycles);
        } else {
            mem.write(0xFF04, 0, self.cycles);
            self.halt(mem);
        }
    }

    pub fn step(&mut self, mem: &mut Memory) {
        #[cfg(feature = "cpu-trace")]
        trace!("{}", self.debug_state());

        let opcode = mem.read(self.pc, self.cycles);
        if self.skip {
            self.skip = false;
        } else {
            self.pc = self.pc.wrapping_add(1);
        }
        self.tick();

        match opcode {
            0x00 => {}
            0x01 | 0x11 | 0x21 | 0x31 => {
                let val = self.fetch16(mem);
                self.set_r16(opcode >> 4, val);
            }
            0x02 => self.write8(mem, self.get_bc(), self.a),
            0x12 => self.write8(mem, self.get_de(), self.a),
            0x22 => {
                let addr = self.get_hl();
                self.write8(mem, addr, self.a);
                self.set_hl(addr.wrapping_add(1));
            }
            0x32 => {
                let addr = self.get_hl();
                self.write8(mem, addr, self.a);
                self.set_hl(addr.wrapping_sub(1));
            }
            0x03 | 0x13 | 0x23 | 0x33 => {
                let val = self.get_r16(opcode >> 4).wrapping_add(1);
                self.set_r16(opcode >> 4, val);
                self.tick();
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                let val = self.get_r16(opcode >> 4).wrapping_sub(1);
                self.set_r16(opcode >> 4, val);
                self.tick();
            }
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let r = (opcode >> 3) & 0x07;
                let val = self.read_reg(mem, r);
                let res = self.inc8(val);
                self.write_reg(mem, r, res);
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let r = (opcode >> 3) & 0x07;
                let val = self.read_reg(mem, r);
                let res = self.dec8(val);
                self.write_reg(mem, r, res);
            }
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let val = self.fetch8(mem);
                self.write_reg(mem, (opcode >> 3) & 0x07, val);
            }
            0x07 | 0x0F | 0x17 | 0x1F => {
                // Accumulator rotates always clear Z.
                let res = self.shift(opcode >> 3, self.a);
                self.a = res;
                self.f &= FLAG_C;
            }
            0x08 => {
                let addr = self.fetch16(mem);
                self.write8(mem, addr, self.sp as u8);
                self.write8(mem, addr.wrapping_add(1), (self.sp >> 8) as u8);
            }
            0x09 | 0x19 | 0x29 | 0x39 => {
                self.add_hl(self.get_r16(opcode >> 4));
                self.tick();
            }
            0x0A => self.a = self.read8(mem, self.get_bc()),
            0x1A => self.a = self.read8(mem, self.get_de()),
            0x2A => {
                let addr = self.get_hl();
                self.a = self.read8(mem, addr);
                self.set_hl(addr.wrapping_add(1));
            }
            0x3A => {
                let addr = self.get_hl();
                self.a = self.read8(mem, addr);
                self.set_hl(addr.wrapping_sub(1));
            }
            0x10 => self.stop(mem),
            0x18 => {
                let offset = self.fetch8(mem) as i8;
                self.pc = self.pc.wrapping_add(offset as u16);
                self.tick();
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch8(mem) as i8;
                if self.condition(opcode) {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    self.tick();
                }
            }
            0x27 => self.daa(),
            0x2F => {
                self.a = !self.a;
                self.f = (self.f & (FLAG_Z | FLAG_C)) | FLAG_N | FLAG_H;
            }
            0x37 => self.f = (self.f & FLAG_Z) | FLAG_C,
            0x3F => self.f = (self.f & (FLAG_Z | FLAG_C)) ^ FLAG_C,
            0x76 => self.halt(mem),
            0x40..=0x7F => {
                let val = self.read_reg(mem, opcode & 0x07);
                self.write_reg(mem, (opcode >> 3) & 0x07, val);
            }
            0x80..=0xBF => {
                let val = self.read_reg(mem, opcode & 0x07);
                self.alu((opcode >> 3) & 0x07, val);
            }
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                self.tick();
                if self.condition(opcode) {
                    self.pc = self.pop_stack(mem);
                    self.tick();
                }
            }
            0xC9 => {
                self.pc = self.pop_stack(mem);
                self.tick();
            }
            0xD9 => {
                self.pc = self.pop_stack(mem);
                self.tick();
                mem.intreq.enable_now(self.cycles);
            }
            0xC1 | 0xD1 | 0xE1 => {
                let val = self.pop_stack(mem);
                self.set_r16(opcode >> 4, val);
            }
            0xF1 => {
                let val = self.pop_stack(mem);
                self.a = (val >> 8) as u8;
                self.f = (val as u8) & 0xF0;
            }
            0xC5 | 0xD5 | 0xE5 => {
                let val = self.get_r16(opcode >> 4);
                self.tick();
                self.push_stack(mem, val);
            }
            0xF5 => {
                let val = ((self.a as u16) << 8) | (self.f & 0xF0) as u16;
                self.tick();
                self.push_stack(mem, val);
            }
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let addr = self.fetch16(mem);
                if self.condition(opcode) {
                    self.pc = addr;
                    self.tick();
                }
            }
            0xC3 => {
                self.pc = self.fetch16(mem);
                self.tick();
            }
            0xE9 => self.pc = self.get_hl(),
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let addr = self.fetch16(mem);
                if self.condition(opcode) {
                    self.tick();
                    self.push_stack(mem, self.pc);
                    self.pc = addr;
                }
            }
            0xCD => {
                let addr = self.fetch16(mem);
                self.tick();
                self.push_stack(mem, self.pc);
                self.pc = addr;
            }
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let val = self.fetch8(mem);
                self.alu((opcode >> 3) & 0x07, val);
            }
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                self.tick();
                self.push_stack(mem, self.pc);
                self.pc = (opcode & 0x38) as u16;
            }
            0xCB => {
                let cb = self.fetch8(mem);
                self.handle_cb(cb, mem);
            }
            0xE0 => {
                let addr = 0xFF00 | self.fetch8(mem) as u16;
                self.write8(mem, addr, self.a);
            }
            0xF0 => {
                let addr = 0xFF00 | self.fetch8(mem) as u16;
                self.a = self.read8(mem, addr);
            }
            0xE2 => self.write8(mem, 0xFF00 | self.c as u16, self.a),
            0xF2 => self.a = self.read8(mem, 0xFF00 | self.c as u16),
            0xEA => {
                let addr = self.fetch16(mem);
                self.write8(mem, addr, self.a);
            }
            0xFA => {
                let addr = self.fetch16(mem);
                self.a = self.read8(mem, addr);
            }
            0xE8 => {
                self.sp = self.sp_offset(mem);
                self.tick();
                self.tick();
            }
            0xF8 => {
                let val = self.sp_offset(mem);
                self.set_hl(val);
                self.tick();
            }
            0xF9 => {
                self.sp = self.get_hl();
                self.tick();
            }
            0xF3 => mem.intreq.di(),
            0xFB => mem.intreq.ei(self.cycles),
            _ => {
                warn!(
                    "Undefined opcode {opcode:02X} at PC={:04X}, CPU locked",
                    self.pc.wrapping_sub(1)
                );
                self.locked = true;
            }
        }
    }

    pub(crate) fn save(&self, st: &mut CpuState) {
        st.cycle_counter = self.cycles;
        st.pc = self.pc;
        st.sp = self.sp;
        st.a = self.a;
        st.b = self.b;
        st.c = self.c;
        st.d = self.d;
        st.e = self.e;
        st.f = self.f;
        st.h = self.h;
        st.l = self.l;
        st.skip = self.skip;
        st.locked = self.locked;
    }

    pub(crate) fn load(&mut self, st: &CpuState) {
        self.cycles = st.cycle_counter;
        self.pc = st.pc;
        self.sp = st.sp;
        self.a = st.a;
        self.b = st.b;
        self.c = st.c;
        self.d = st.d;
        self.e = st.e;
        self.f = st.f & 0xF0;
        self.h = st.h;
        self.l = st.l;
        self.skip = st.skip;
        self.locked = st.locked;
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new_with_mode(HardwareMode::Dmg, false)
    }
}
