use crate::{
    interrupts::{INT_TIMER, IrqSink},
    savestate::TimerState,
    scheduler::DISABLED,
};

/// TIMA input clock periods in master cycles, indexed by TAC bits 0-1.
const TIMA_PERIODS: [u64; 4] = [1024, 16, 64, 256];

/// Cycles between TIMA overflowing to 0x00 and the TMA reload/IRQ.
const RELOAD_DELAY: u64 = 4;

/// DIV/TIMA/TMA/TAC.
///
/// Nothing is stepped per cycle: the 16-bit divider is `cc - div_base`, and
/// TIMA is brought forward from `last_update` in closed form whenever it is
/// observed or written. The memory scheduler only needs
/// [`Timer::next_irq_time`].
#[derive(Clone, Debug)]
pub struct Timer {
    div_base: u64,
    pub tima: u8,
    pub tma: u8,
    pub tac: u8,
    last_update: u64,
    reload_time: u64,
    /// Cycle on which the last reload happened, for same-cycle write quirks.
    reloaded_at: u64,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            div_base: 0,
            tima: 0,
            tma: 0,
            tac: 0,
            last_update: 0,
            reload_time: DISABLED,
            reloaded_at: DISABLED,
        }
    }

    #[inline]
    fn enabled(&self) -> bool {
        self.tac & 0x04 != 0
    }

    #[inline]
    fn period(&self) -> u64 {
        TIMA_PERIODS[(self.tac & 0x03) as usize]
    }

    /// Internal 16-bit divider value at `cc`.
    #[inline]
    pub fn divider(&self, cc: u64) -> u16 {
        cc.wrapping_sub(self.div_base) as u16
    }

    /// Sets the internal divider so it reads `value` at `cc`.
    pub fn set_divider(&mut self, cc: u64, value: u16) {
        self.div_base = cc.wrapping_sub(value as u64);
        self.last_update = cc;
    }

    pub fn read_div(&self, cc: u64) -> u8 {
        (self.divider(cc) >> 8) as u8
    }

    fn signal(&self, cc: u64) -> bool {
        self.enabled() && (self.divider(cc) as u64) & (self.period() >> 1) != 0
    }

    fn ticks_between(&self, from: u64, to: u64) -> u64 {
        let p = self.period();
        to.wrapping_sub(self.div_base) / p - from.wrapping_sub(self.div_base) / p
    }

    fn first_tick_after(&self, t: u64) -> u64 {
        let p = self.period();
        t + p - t.wrapping_sub(self.div_base) % p
    }

    fn tick(&mut self, t: u64) {
        if self.tima == 0xFF {
            self.tima = 0;
            self.reload_time = t + RELOAD_DELAY;
        } else {
            self.tima += 1;
        }
    }

    /// Brings TIMA up to date, raising the timer interrupt for every reload
    /// that happened at or before `cc`.
    pub fn update(&mut self, cc: u64, irq: &mut impl IrqSink) {
        loop {
            if self.reload_time <= cc {
                let t = self.reload_time;
                self.tima = self.tma;
                self.reloaded_at = t;
                self.reload_time = DISABLED;
                self.last_update = self.last_update.max(t);
                irq.request_irq(INT_TIMER, t);
            }
            if !self.enabled() || cc <= self.last_update {
                break;
            }

            let n = self.ticks_between(self.last_update, cc);
            let to_overflow = 0x100 - self.tima as u64;
            if n < to_overflow {
                self.tima += n as u8;
                break;
            }
            let overflow_at =
                self.first_tick_after(self.last_update) + (to_overflow - 1) * self.period();
            self.tima = 0;
            self.reload_time = overflow_at + RELOAD_DELAY;
            self.last_update = overflow_at;
            if self.reload_time > cc {
                break;
            }
        }
        self.last_update = self.last_update.max(cc);
    }

    /// When the timer interrupt will next be raised, or `DISABLED`.
    pub fn next_irq_time(&self) -> u64 {
        if self.reload_time != DISABLED {
            return self.reload_time;
        }
        if !self.enabled() {
            return DISABLED;
        }
        self.first_tick_after(self.last_update)
            + (0xFF - self.tima as u64) * self.period()
            + RELOAD_DELAY
    }

    pub fn read_tima(&mut self, cc: u64, irq: &mut impl IrqSink) -> u8 {
        self.update(cc, irq);
        self.tima
    }

    pub fn write_div(&mut self, cc: u64, irq: &mut impl IrqSink) {
        self.update(cc, irq);
        // Resetting the divider while the selected bit is high is a falling edge.
        if self.signal(cc) {
            self.tick(cc);
        }
        self.div_base = cc;
        self.last_update = cc;
    }

    pub fn write_tima(&mut self, value: u8, cc: u64, irq: &mut impl IrqSink) {
        self.update(cc, irq);
        if self.reloaded_at == cc {
            return;
        }
        if self.reload_time != DISABLED {
            // Writing in the window before the reload cancels it.
            self.reload_time = DISABLED;
        }
        self.tima = value;
    }

    pub fn write_tma(&mut self, value: u8, cc: u64, irq: &mut impl IrqSink) {
        self.update(cc, irq);
        self.tma = value;
        if self.reloaded_at == cc {
            self.tima = value;
        }
    }

    pub fn write_tac(&mut self, value: u8, cc: u64, irq: &mut impl IrqSink) {
        self.update(cc, irq);
        let old_signal = self.signal(cc);
        self.tac = value & 0x07;
        if old_signal && !self.signal(cc) {
            self.tick(cc);
        }
        self.last_update = cc;
    }

    pub fn reset_cc(&mut self, dec: u64) {
        self.div_base = self.div_base.wrapping_sub(dec);
        self.last_update = self.last_update.saturating_sub(dec);
        if self.reload_time != DISABLED {
            self.reload_time = self.reload_time.saturating_sub(dec);
        }
        if self.reloaded_at != DISABLED {
            self.reloaded_at = self.reloaded_at.saturating_sub(dec);
        }
    }

    pub(crate) fn save(&self, st: &mut TimerState) {
        st.div_base = self.div_base;
        st.last_update = self.last_update;
        st.reload_time = self.reload_time;
        st.reloaded_at = self.reloaded_at;
        st.tima = self.tima;
        st.tma = self.tma;
        st.tac = self.tac;
    }

    pub(crate) fn load(&mut self, st: &TimerState) {
        self.div_base = st.div_base;
        self.last_update = st.last_update;
        self.reload_time = st.reload_time;
        self.reloaded_at = st.reloaded_at;
        self.tima = st.tima;
        self.tma = st.tma;
        self.tac = st.tac & 0x07;
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

    #[test]
    fn div_counts_every_256_cycles() {
        let mut irq = Recorder::default();
        let mut t = Timer::new();
        assert_eq!(t.read_div(255), 0);
        assert_eq!(t.read_div(256), 1);
        t.write_div(1000, &mut irq);
        assert_eq!(t.read_div(1000 + 255), 0);
        assert_eq!(t.read_div(1000 + 512), 2);
    }

    #[test]
    fn tima_overflow_reloads_after_delay() {
        let mut irq = Recorder::default();
        let mut t = Timer::new();
        t.write_tma(0xF0, 0, &mut irq);
        t.write_tac(0x05, 0, &mut irq);
        t.write_tima(0xFE, 0, &mut irq);
        assert_eq!(t.next_irq_time(), 32 + RELOAD_DELAY);
        assert_eq!(t.read_tima(16, &mut irq), 0xFF);
        assert_eq!(t.read_tima(33, &mut irq), 0x00);
        assert!(irq.0.is_empty());
        assert_eq!(t.read_tima(36, &mut irq), 0xF0);
        assert_eq!(irq.0, vec![(INT_TIMER, 36)]);
    }

    #[test]
    fn long_gaps_are_resolved_in_closed_form() {
        let mut irq = Recorder::default();
        let mut t = Timer::new();
        t.write_tac(0x05, 0, &mut irq);
        // 1000 overflows with TMA=0: one every 256 ticks of 16 cycles.
        let cc = 1000 * 256 * 16 + 8 * 16;
        assert_eq!(t.read_tima(cc, &mut irq), 8);
        assert_eq!(irq.0.len(), 1000);
        assert_eq!(irq.0[0], (INT_TIMER, 256 * 16 + RELOAD_DELAY));
    }

    #[test]
    fn tima_write_cancels_pending_reload() {
        let mut irq = Recorder::default();
        let mut t = Timer::new();
        t.write_tac(0x05, 0, &mut irq);
        t.write_tima(0xFF, 0, &mut irq);
        t.update(17, &mut irq);
        assert_eq!(t.tima, 0);
        t.write_tima(0x42, 18, &mut irq);
        t.update(40, &mut irq);
        assert!(irq.0.is_empty());
        assert_eq!(t.tima, 0x43);
    }

    #[test]
    fn div_reset_with_high_bit_ticks_tima() {
        let mut irq = Recorder::default();
        let mut t = Timer::new();
        t.write_tac(0x05, 0, &mut irq);
        // Bit 3 of the divider is high from cycle 8 to 15.
        t.write_div(10, &mut irq);
        assert_eq!(t.tima, 1);
        t.write_div(12, &mut irq);
        assert_eq!(t.tima, 1);
    }

    #[test]
    fn disabling_timer_on_high_bit_ticks_tima() {
        let mut irq = Recorder::default();
        let mut t = Timer::new();
        t.write_tac(0x05, 0, &mut irq);
        t.write_tac(0x01, 9, &mut irq);
        assert_eq!(t.tima, 1);
        assert_eq!(t.next_irq_time(), DISABLED);
    }

    #[test]
    fn rebase_preserves_divider_phase() {
        let mut irq = Recorder::default();
        let mut t = Timer::new();
        t.write_div(0x100, &mut irq);
        let before = t.read_div(0x9000);
        t.update(0x9000, &mut irq);
        t.reset_cc(0x8000);
        assert_eq!(t.read_div(0x1000), before);
    }
}
