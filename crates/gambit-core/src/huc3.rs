//! HuC3 clock peripheral.
//!
//! The chip is driven through the cartridge RAM window once the mode register
//! (0x0000-0x1FFF) selects one of the clock modes. Commands are single bytes:
//! the high nibble is the opcode and the low nibble its argument. The clock
//! exposes a small nibble-addressed scratch memory whose first six nibbles hold
//! the minute-of-day and day counters.

const SECONDS_PER_DAY: i64 = 86_400;
const MEMORY_NIBBLES: usize = 0x100;

#[derive(Debug, Clone)]
pub struct Huc3Clock {
    pub base_time: i64,
    pub memory: [u8; MEMORY_NIBBLES],
    pub index: u8,
    /// Value returned by reads in mode 0x0C.
    pub response: u8,
}

impl Huc3Clock {
    pub fn new(now: i64) -> Self {
        Self {
            base_time: now,
            memory: [0; MEMORY_NIBBLES],
            index: 0,
            response: 0,
        }
    }

    pub fn read(&self, mode: u8) -> u8 {
        match mode {
            0x0C => self.response,
            // Semaphore: the chip is always ready.
            0x0D => 0x01,
            // IR receiver: no light detected.
            0x0E => 0xC0,
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, mode: u8, value: u8, now: i64) {
        if mode != 0x0B {
            return;
        }
        let arg = value & 0x0F;
        match value >> 4 {
            0x1 => {
                let nibble = self.memory[self.index as usize] & 0x0F;
                self.response = 0x10 | nibble;
                self.index = self.index.wrapping_add(1);
            }
            0x3 => {
                self.memory[self.index as usize] = arg;
                self.response = 0x30 | arg;
                self.index = self.index.wrapping_add(1);
            }
            0x4 => self.index = (self.index & 0xF0) | arg,
            0x5 => self.index = (self.index & 0x0F) | (arg << 4),
            0x6 => self.extended(arg, now),
            op => log::trace!("HuC3 ignored command {op:X}{arg:X}"),
        }
    }

    fn extended(&mut self, arg: u8, now: i64) {
        match arg {
            0x0 => self.latch_time(now),
            0x1 => self.commit_time(now),
            0x2 => self.response = 0x61,
            _ => self.response = 0x60,
        }
    }

    fn latch_time(&mut self, now: i64) {
        let elapsed = (now - self.base_time).max(0);
        let minutes = ((elapsed % SECONDS_PER_DAY) / 60) as u32;
        let days = ((elapsed / SECONDS_PER_DAY) & 0xFFF) as u32;
        for i in 0..3 {
            self.memory[i] = ((minutes >> (4 * i)) & 0x0F) as u8;
            self.memory[3 + i] = ((days >> (4 * i)) & 0x0F) as u8;
        }
        self.response = 0x60;
    }

    fn commit_time(&mut self, now: i64) {
        let mut minutes = 0i64;
        let mut days = 0i64;
        for i in 0..3 {
            minutes |= ((self.memory[i] & 0x0F) as i64) << (4 * i);
            days |= ((self.memory[3 + i] & 0x0F) as i64) << (4 * i);
        }
        let seconds_into_minute = (now - self.base_time).max(0) % 60;
        self.base_time = now - days * SECONDS_PER_DAY - minutes * 60 - seconds_into_minute;
        self.response = 0x61;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(clock: &mut Huc3Clock, value: u8, now: i64) {
        clock.write(0x0B, value, now);
    }

    fn read_nibble(clock: &mut Huc3Clock, now: i64) -> u8 {
        command(clock, 0x10, now);
        clock.read(0x0C) & 0x0F
    }

    #[test]
    fn latched_time_is_readable_by_nibble() {
        let mut clock = Huc3Clock::new(0);
        let now = 3 * SECONDS_PER_DAY + 0x123 * 60 + 17;
        command(&mut clock, 0x60, now);
        command(&mut clock, 0x40, now);
        command(&mut clock, 0x50, now);
        let nibbles: Vec<u8> = (0..6).map(|_| read_nibble(&mut clock, now)).collect();
        assert_eq!(nibbles, vec![0x3, 0x2, 0x1, 0x3, 0x0, 0x0]);
    }

    #[test]
    fn committed_time_moves_base() {
        let mut clock = Huc3Clock::new(0);
        let now = 10_000;
        command(&mut clock, 0x40, now);
        command(&mut clock, 0x50, now);
        // 5 minutes, 2 days
        for nibble in [0x5, 0x0, 0x0, 0x2, 0x0, 0x0] {
            command(&mut clock, 0x30 | nibble, now);
        }
        command(&mut clock, 0x61, now);
        assert_eq!(clock.base_time, now - 2 * SECONDS_PER_DAY - 5 * 60 - now % 60);

        command(&mut clock, 0x60, now + 60);
        assert_eq!(clock.memory[0], 0x6);
        assert_eq!(clock.memory[3], 0x2);
    }

    #[test]
    fn semaphore_and_ir_defaults() {
        let clock = Huc3Clock::new(0);
        assert_eq!(clock.read(0x0D), 0x01);
        assert_eq!(clock.read(0x0E), 0xC0);
        assert_eq!(clock.read(0x0A), 0xFF);
    }
}
