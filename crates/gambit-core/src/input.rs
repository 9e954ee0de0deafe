use crate::interrupts::{INT_JOYPAD, IrqSink};

pub const A: u8 = 0x01;
pub const B: u8 = 0x02;
pub const SELECT: u8 = 0x04;
pub const START: u8 = 0x08;
pub const RIGHT: u8 = 0x10;
pub const LEFT: u8 = 0x20;
pub const UP: u8 = 0x40;
pub const DOWN: u8 = 0x80;

/// Host side of the joypad, sampled on every P1 read.
///
/// Returns the held buttons as a mask of [`A`], [`B`], [`SELECT`], [`START`],
/// [`RIGHT`], [`LEFT`], [`UP`] and [`DOWN`], with 1 meaning pressed.
pub trait InputGetter: Send {
    fn buttons(&mut self) -> u8;
}

impl<F> InputGetter for F
where
    F: FnMut() -> u8 + Send,
{
    fn buttons(&mut self) -> u8 {
        self()
    }
}

/// Getter used until the host installs one: nothing is ever pressed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInput;

impl InputGetter for NoInput {
    fn buttons(&mut self) -> u8 {
        0
    }
}

/// P1/JOYP register.
pub struct Joypad {
    /// Bits 4-5 as last written.
    select: u8,
    /// Active-low nibble returned by the previous read.
    last_nibble: u8,
    getter: Box<dyn InputGetter>,
}

impl std::fmt::Debug for Joypad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Joypad")
            .field("select", &self.select)
            .field("last_nibble", &self.last_nibble)
            .finish_non_exhaustive()
    }
}

impl Default for Joypad {
    fn default() -> Self {
        Self::new()
    }
}

impl Joypad {
    pub fn new() -> Self {
        Self {
            select: 0x30,
            last_nibble: 0x0F,
            getter: Box::new(NoInput),
        }
    }

    pub fn set_getter(&mut self, getter: Box<dyn InputGetter>) {
        self.getter = getter;
    }

    /// Takes the installed getter, leaving [`NoInput`] in its place.
    pub fn take_getter(&mut self) -> Box<dyn InputGetter> {
        std::mem::replace(&mut self.getter, Box::new(NoInput))
    }

    pub fn select(&self) -> u8 {
        self.select
    }

    pub fn write(&mut self, val: u8) {
        self.select = val & 0x30;
    }

    fn nibble(&self, buttons: u8) -> u8 {
        let mut pressed = 0;
        if self.select & 0x10 == 0 {
            pressed |= buttons >> 4;
        }
        if self.select & 0x20 == 0 {
            pressed |= buttons & 0x0F;
        }
        !pressed & 0x0F
    }

    /// Samples the getter. A line going low raises the joypad interrupt.
    pub fn read(&mut self, cc: u64, irq: &mut impl IrqSink) -> u8 {
        let buttons = self.getter.buttons();
        let nibble = self.nibble(buttons);
        if self.last_nibble & !nibble != 0 {
            irq.request_irq(INT_JOYPAD, cc);
        }
        self.last_nibble = nibble;
        0xC0 | self.select | nibble
    }

    pub(crate) fn restore(&mut self, select: u8) {
        self.select = select & 0x30;
        self.last_nibble = 0x0F;
    }
}
