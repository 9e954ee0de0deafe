/// Timestamp of a slot with nothing pending.
pub const DISABLED: u64 = u64::MAX;

/// Named event slots. Declaration order is the tie-break priority when two
/// slots are due on the same cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Event {
    Interrupts,
    Dma,
    Oam,
    Lcd,
    Tima,
    Serial,
    End,
}

pub const EVENT_COUNT: usize = 7;

impl Event {
    pub const ALL: [Event; EVENT_COUNT] = [
        Event::Interrupts,
        Event::Dma,
        Event::Oam,
        Event::Lcd,
        Event::Tima,
        Event::Serial,
        Event::End,
    ];
}

/// Fixed set of event timestamps with a cached minimum.
#[derive(Clone, Debug)]
pub struct EventSchedule {
    times: [u64; EVENT_COUNT],
    min_event: Event,
}

impl Default for EventSchedule {
    fn default() -> Self {
        Self {
            times: [DISABLED; EVENT_COUNT],
            min_event: Event::Interrupts,
        }
    }
}

impl EventSchedule {
    #[inline]
    pub fn time(&self, event: Event) -> u64 {
        self.times[event as usize]
    }

    #[inline]
    pub fn set(&mut self, event: Event, time: u64) {
        self.times[event as usize] = time;
        self.rederive();
    }

    #[inline]
    pub fn disable(&mut self, event: Event) {
        self.set(event, DISABLED);
    }

    #[inline]
    pub fn is_enabled(&self, event: Event) -> bool {
        self.time(event) != DISABLED
    }

    /// The slot that fires next.
    #[inline]
    pub fn next_event(&self) -> Event {
        self.min_event
    }

    #[inline]
    pub fn next_time(&self) -> u64 {
        self.times[self.min_event as usize]
    }

    fn rederive(&mut self) {
        let mut best = Event::Interrupts;
        for event in Event::ALL {
            if self.times[event as usize] < self.times[best as usize] {
                best = event;
            }
        }
        self.min_event = best;
    }

    /// Moves every pending timestamp back by `dec` cycles.
    pub fn rebase(&mut self, dec: u64) {
        for t in self.times.iter_mut().filter(|t| **t != DISABLED) {
            *t = t.saturating_sub(dec);
        }
        self.rederive();
    }

    pub fn times(&self) -> [u64; EVENT_COUNT] {
        self.times
    }

    pub fn set_all(&mut self, times: [u64; EVENT_COUNT]) {
        self.times = times;
        self.rederive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_tracks_updates() {
        let mut s = EventSchedule::default();
        assert_eq!(s.next_time(), DISABLED);
        s.set(Event::Tima, 500);
        s.set(Event::Lcd, 300);
        assert_eq!(s.next_event(), Event::Lcd);
        s.disable(Event::Lcd);
        assert_eq!(s.next_event(), Event::Tima);
        assert_eq!(s.next_time(), 500);
    }

    #[test]
    fn ties_resolve_by_slot_order() {
        let mut s = EventSchedule::default();
        s.set(Event::Serial, 100);
        s.set(Event::Tima, 100);
        s.set(Event::Dma, 100);
        assert_eq!(s.next_event(), Event::Dma);
        s.set(Event::Interrupts, 100);
        assert_eq!(s.next_event(), Event::Interrupts);
    }

    #[test]
    fn rebase_keeps_disabled_slots() {
        let mut s = EventSchedule::default();
        s.set(Event::Oam, 0x9000);
        s.set(Event::End, 0x8100);
        s.rebase(0x8000);
        assert_eq!(s.time(Event::Oam), 0x1000);
        assert_eq!(s.time(Event::End), 0x100);
        assert_eq!(s.time(Event::Tima), DISABLED);
        assert_eq!(s.next_event(), Event::End);
    }
}
