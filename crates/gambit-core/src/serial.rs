use crate::{
    interrupts::{INT_SERIAL, IrqSink},
    savestate::SerialState,
    scheduler::DISABLED,
};
use log::trace;

/// Link cable transport.
pub trait SerialIo: Send {
    /// Clocks `byte` out to the partner as the internal-clock master and
    /// returns the partner's byte. `fast` is the CGB high-speed clock.
    fn send(&mut self, byte: u8, fast: bool) -> u8;

    /// Asks whether the partner has clocked a transfer in. On `true`, `input`
    /// holds the byte received in exchange for `out`.
    fn check(&mut self, out: u8, input: &mut u8, fast: &mut bool) -> bool;
}

/// No cable attached: the line floats high, so every transfer receives 0xFF.
#[derive(Default, Debug, Clone, Copy)]
pub struct NullSerial;

impl SerialIo for NullSerial {
    fn send(&mut self, _byte: u8, _fast: bool) -> u8 {
        0xFF
    }

    fn check(&mut self, _out: u8, _input: &mut u8, _fast: &mut bool) -> bool {
        false
    }
}

/// SB/SC and the transfer in flight.
pub struct Serial {
    sb: u8,
    sc: u8,
    /// Byte shifted in when the transfer completes.
    incoming: u8,
    transfer_end: u64,
    io: Box<dyn SerialIo>,
    cgb_mode: bool,
}

impl std::fmt::Debug for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Serial")
            .field("sb", &self.sb)
            .field("sc", &self.sc)
            .field("transfer_end", &self.transfer_end)
            .finish_non_exhaustive()
    }
}

impl Serial {
    pub fn new(cgb: bool) -> Self {
        Self {
            sb: 0,
            sc: 0,
            incoming: 0xFF,
            transfer_end: DISABLED,
            io: Box::new(NullSerial),
            cgb_mode: cgb,
        }
    }

    pub fn connect(&mut self, io: Box<dyn SerialIo>) {
        self.io = io;
    }

    /// Takes the installed transport, leaving the null one in its place.
    pub fn disconnect(&mut self) -> Box<dyn SerialIo> {
        std::mem::replace(&mut self.io, Box::new(NullSerial))
    }

    fn fast_clock(&self) -> bool {
        self.cgb_mode && self.sc & 0x02 != 0
    }

    /// Master cycles per shifted bit. The clock is divided from the CPU
    /// clock, so double speed also doubles the transfer rate.
    fn bit_period(&self) -> u64 {
        if self.fast_clock() { 16 } else { 512 }
    }

    pub fn next_event_time(&self) -> u64 {
        self.transfer_end
    }

    pub fn read_sb(&self, cc: u64) -> u8 {
        if self.transfer_end == DISABLED || cc >= self.transfer_end {
            return self.sb;
        }
        // Bits already exchanged show up as the register shifts.
        let left = (self.transfer_end - cc).div_ceil(self.bit_period());
        let shifted = 8u32.saturating_sub(left as u32);
        if shifted == 0 {
            return self.sb;
        }
        ((self.sb as u16) << shifted | (self.incoming as u16) >> (8 - shifted)) as u8
    }

    pub fn read_sc(&self) -> u8 {
        if self.cgb_mode {
            self.sc | 0x7C
        } else {
            self.sc | 0x7E
        }
    }

    pub fn write_sb(&mut self, val: u8) {
        self.sb = val;
    }

    pub fn write_sc(&mut self, val: u8, cc: u64) {
        self.sc = val & if self.cgb_mode { 0x83 } else { 0x81 };
        self.transfer_end = DISABLED;
        if self.sc & 0x81 == 0x81 {
            self.incoming = self.io.send(self.sb, self.fast_clock());
            self.transfer_end = cc + 8 * self.bit_period();
            trace!(
                "Serial transfer out {:02X} in {:02X}, done at {}",
                self.sb, self.incoming, self.transfer_end
            );
        }
    }

    /// Finishes an internal-clock transfer whose time has come.
    pub fn complete(&mut self, cc: u64, irq: &mut impl IrqSink) {
        if self.transfer_end == DISABLED || cc < self.transfer_end {
            return;
        }
        let t = self.transfer_end;
        self.finish(self.incoming, t, irq);
    }

    fn finish(&mut self, incoming: u8, t: u64, irq: &mut impl IrqSink) {
        self.sb = incoming;
        self.sc &= 0x7F;
        self.transfer_end = DISABLED;
        irq.request_irq(INT_SERIAL, t);
    }

    /// Gives the transport a chance to clock in a pending external-clock
    /// transfer.
    pub fn poll_external(&mut self, cc: u64, irq: &mut impl IrqSink) {
        if self.sc & 0x81 != 0x80 {
            return;
        }
        let mut input = 0xFF;
        let mut fast = false;
        if self.io.check(self.sb, &mut input, &mut fast) {
            trace!("Serial external transfer out {:02X} in {input:02X}", self.sb);
            self.finish(input, cc, irq);
        }
    }

    pub fn reset_cc(&mut self, dec: u64) {
        if self.transfer_end != DISABLED {
            self.transfer_end = self.transfer_end.saturating_sub(dec);
        }
    }

    pub(crate) fn save(&self, st: &mut SerialState) {
        st.sb = self.sb;
        st.sc = self.sc;
        st.incoming = self.incoming;
        st.transfer_end = self.transfer_end;
    }

    pub(crate) fn load(&mut self, st: &SerialState) {
        self.sb = st.sb;
        self.sc = st.sc & if self.cgb_mode { 0x83 } else { 0x81 };
        self.incoming = st.incoming;
        self.transfer_end = if self.sc & 0x81 == 0x81 {
            st.transfer_end
        } else {
            DISABLED
        };
    }
}
