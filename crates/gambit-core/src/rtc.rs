use std::time::{SystemTime, UNIX_EPOCH};

const SECONDS_PER_DAY: i64 = 86_400;
const DAY_COUNTER_SPAN: i64 = 0x200 * SECONDS_PER_DAY;

/// Source of wall-clock seconds. Hosts and tests can pin it.
pub type TimeSource = fn() -> i64;

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtcLatch {
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub day_low: u8,
    pub day_high: u8,
}

/// MBC3 real-time clock.
///
/// The counter value is never stored directly: it is always recomputed as
/// `now - base_time` (or `halt_time - base_time` while halted). Register writes
/// shift `base_time` so that the derived field reads back as written.
#[derive(Debug, Clone)]
pub struct Mbc3Rtc {
    pub base_time: i64,
    pub halt_time: i64,
    /// DH register: bit 0 day bit 8, bit 6 halt, bit 7 day carry.
    pub day_high: u8,
    pub latched: RtcLatch,
    latch_armed: bool,
    selected: Option<u8>,
}

impl Mbc3Rtc {
    pub fn new(now: i64) -> Self {
        Self {
            base_time: now,
            halt_time: now,
            day_high: 0,
            latched: RtcLatch::default(),
            latch_armed: false,
            selected: None,
        }
    }

    fn halted(&self) -> bool {
        self.day_high & 0x40 != 0
    }

    fn reference(&self, now: i64) -> i64 {
        if self.halted() { self.halt_time } else { now }
    }

    fn elapsed(&mut self, now: i64) -> i64 {
        let mut elapsed = self.reference(now) - self.base_time;
        while elapsed >= DAY_COUNTER_SPAN {
            self.base_time += DAY_COUNTER_SPAN;
            elapsed -= DAY_COUNTER_SPAN;
            self.day_high |= 0x80;
        }
        elapsed.max(0)
    }

    /// Selects which register 0xA000-0xBFFF maps to. `None` unmaps the clock.
    pub fn select(&mut self, reg: Option<u8>) {
        self.selected = reg.filter(|r| (0x08..=0x0C).contains(r));
    }

    pub fn is_selected(&self) -> bool {
        self.selected.is_some()
    }

    /// Handles a write to 0x6000-0x7FFF. Latching happens on a 0 -> 1 sequence.
    pub fn latch_write(&mut self, value: u8, now: i64) {
        if value == 0 {
            self.latch_armed = true;
            return;
        }
        if value == 1 && self.latch_armed {
            self.latch(now);
        }
        self.latch_armed = false;
    }

    pub fn latch(&mut self, now: i64) {
        let mut t = self.elapsed(now);
        let days = t / SECONDS_PER_DAY;
        t %= SECONDS_PER_DAY;
        self.latched = RtcLatch {
            seconds: (t % 60) as u8,
            minutes: ((t / 60) % 60) as u8,
            hours: (t / 3600) as u8,
            day_low: (days & 0xFF) as u8,
            day_high: (self.day_high & 0xFE) | ((days >> 8) & 0x01) as u8,
        };
    }

    pub fn read(&self) -> u8 {
        match self.selected {
            Some(0x08) => self.latched.seconds,
            Some(0x09) => self.latched.minutes,
            Some(0x0A) => self.latched.hours,
            Some(0x0B) => self.latched.day_low,
            Some(0x0C) => self.latched.day_high | 0x3E,
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, value: u8, now: i64) {
        let Some(reg) = self.selected else {
            return;
        };
        let elapsed = self.elapsed(now);
        match reg {
            0x08 => {
                let old = elapsed % 60;
                self.base_time += old - (value & 0x3F) as i64;
            }
            0x09 => {
                let old = (elapsed / 60) % 60;
                self.base_time += (old - (value & 0x3F) as i64) * 60;
            }
            0x0A => {
                let old = (elapsed / 3600) % 24;
                self.base_time += (old - (value & 0x1F) as i64) * 3600;
            }
            0x0B => {
                let old = (elapsed / SECONDS_PER_DAY) & 0xFF;
                self.base_time += (old - value as i64) * SECONDS_PER_DAY;
            }
            0x0C => {
                let old_high = (elapsed / SECONDS_PER_DAY) & 0x100;
                self.base_time += (old_high - (((value & 0x01) as i64) << 8)) * SECONDS_PER_DAY;
                let halt_changed = (self.day_high ^ value) & 0x40 != 0;
                if halt_changed {
                    if value & 0x40 != 0 {
                        self.halt_time = now;
                    } else {
                        self.base_time += now - self.halt_time;
                    }
                }
                self.day_high = value & 0xC1;
            }
            _ => {}
        }
    }
}
