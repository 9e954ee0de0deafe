use crate::scheduler::{DISABLED, Event, EventSchedule};

pub const INT_VBLANK: u8 = 0x01;
pub const INT_STAT: u8 = 0x02;
pub const INT_TIMER: u8 = 0x04;
pub const INT_SERIAL: u8 = 0x08;
pub const INT_JOYPAD: u8 = 0x10;

/// Narrow capability handed to units that raise interrupts.
pub trait IrqSink {
    /// Sets `flag` in IF as of cycle `cc`.
    fn request_irq(&mut self, flag: u8, cc: u64);
}

/// IF/IE/IME/HALT state together with the event schedule it drives.
///
/// The `Interrupts` slot is kept armed exactly while an enabled interrupt is
/// pending and the CPU can react to it (IME set or halted).
#[derive(Clone, Debug)]
pub struct InterruptRequester {
    pub events: EventSchedule,
    if_reg: u8,
    ie_reg: u8,
    ime: bool,
    halted: bool,
    min_int_time: u64,
}

impl Default for InterruptRequester {
    fn default() -> Self {
        Self {
            events: EventSchedule::default(),
            if_reg: 0,
            ie_reg: 0,
            ime: false,
            halted: false,
            min_int_time: 0,
        }
    }
}

impl InterruptRequester {
    #[inline]
    pub fn if_reg(&self) -> u8 {
        self.if_reg
    }

    #[inline]
    pub fn ie_reg(&self) -> u8 {
        self.ie_reg
    }

    #[inline]
    pub fn ime(&self) -> bool {
        self.ime
    }

    #[inline]
    pub fn halted(&self) -> bool {
        self.halted
    }

    #[inline]
    pub fn pending(&self) -> u8 {
        self.if_reg & self.ie_reg & 0x1F
    }

    pub fn min_int_time(&self) -> u64 {
        self.min_int_time
    }

    fn reschedule(&mut self, cc: u64) {
        if self.pending() != 0 && (self.ime || self.halted) {
            let due = cc.max(self.min_int_time);
            if due < self.events.time(Event::Interrupts) {
                self.events.set(Event::Interrupts, due);
            }
        } else {
            self.events.disable(Event::Interrupts);
        }
    }

    pub fn set_if(&mut self, value: u8, cc: u64) {
        self.if_reg = value & 0x1F;
        self.events.disable(Event::Interrupts);
        self.reschedule(cc);
    }

    pub fn set_ie(&mut self, value: u8, cc: u64) {
        self.ie_reg = value;
        self.events.disable(Event::Interrupts);
        self.reschedule(cc);
    }

    /// IME takes effect once the instruction after `EI` has executed.
    pub fn ei(&mut self, cc: u64) {
        self.ime = true;
        self.min_int_time = cc + 1;
        self.reschedule(cc);
    }

    /// Immediate enable used by `RETI`.
    pub fn enable_now(&mut self, cc: u64) {
        self.ime = true;
        self.reschedule(cc);
    }

    pub fn di(&mut self) {
        self.ime = false;
        if !self.halted {
            self.events.disable(Event::Interrupts);
        }
    }

    pub fn halt(&mut self, cc: u64) {
        self.halted = true;
        self.reschedule(cc);
    }

    pub fn unhalt(&mut self) {
        self.halted = false;
        if !self.ime {
            self.events.disable(Event::Interrupts);
        }
    }

    /// Acknowledges the highest-priority pending interrupt, clearing IME.
    /// Returns its IF bit.
    pub fn acknowledge(&mut self) -> Option<u8> {
        let pending = self.pending();
        if pending == 0 || !self.ime {
            return None;
        }
        let bit = pending & pending.wrapping_neg();
        self.if_reg &= !bit;
        self.ime = false;
        self.events.disable(Event::Interrupts);
        Some(bit)
    }

    pub fn reset_cc(&mut self, dec: u64) {
        self.min_int_time = self.min_int_time.saturating_sub(dec);
        self.events.rebase(dec);
    }

    pub(crate) fn restore(
        &mut self,
        if_reg: u8,
        ie_reg: u8,
        ime: bool,
        halted: bool,
        min_int_time: u64,
        cc: u64,
    ) {
        self.if_reg = if_reg & 0x1F;
        self.ie_reg = ie_reg;
        self.ime = ime;
        self.halted = halted;
        self.min_int_time = min_int_time;
        self.events.set(Event::Interrupts, DISABLED);
        self.reschedule(cc);
    }
}

impl IrqSink for InterruptRequester {
    fn request_irq(&mut self, flag: u8, cc: u64) {
        self.if_reg |= flag & 0x1F;
        self.reschedule(cc);
    }
}

/// Vector address for a single IF bit.
pub fn vector(bit: u8) -> u16 {
    0x40 + 8 * bit.trailing_zeros() as u16
}
