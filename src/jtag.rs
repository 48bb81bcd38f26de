//! TAP state tracking and MPSSE opcode encoding.
//!
//! `Jtag` keeps the Test Access Port in one of a small set of tracked states
//! and encodes state changes and data shifts into MPSSE command bytes on a
//! `CorrectedIo`.  Only the states the bus bridge needs are tracked; every
//! transition goes through a fixed table of TMS programs, and anything not
//! in the table is rejected rather than guessed.
use log::debug;

use crate::error::{Error, Result};
use crate::io::CorrectedIo;
use crate::transport::Transport;

// MPSSE command opcodes (FTDI AN 108).
const MPSSE_CLOCK_BYTES_OUT: u8 = 0x19;
const MPSSE_CLOCK_BYTES_IN_OUT: u8 = 0x39;
const MPSSE_CLOCK_BITS_OUT: u8 = 0x1B;
const MPSSE_CLOCK_BITS_IN_OUT: u8 = 0x3B;
const MPSSE_CLOCK_TMS_OUT: u8 = 0x4B;
const MPSSE_CLOCK_TMS_IN_OUT: u8 = 0x6B;
const MPSSE_CLOCK_N_BITS: u8 = 0x8E;
const MPSSE_CLOCK_N_BYTES: u8 = 0x8F;
const MPSSE_LOOPBACK_OFF: u8 = 0x85;
const MPSSE_NO_CLK_DIV5: u8 = 0x8A;
const MPSSE_NO_ADAPTIVE_CLK: u8 = 0x97;
const MPSSE_NO_3PHASE_CLK: u8 = 0x8D;
const MPSSE_SET_CLK_DIVISOR: u8 = 0x86;
const MPSSE_SET_GPIO_LOW: u8 = 0x80;
/// Deliberately invalid opcode; the chip answers 0xFA plus the opcode, which
/// doubles as a startup sanity check.
const MPSSE_BAD_OPCODE: u8 = 0xAB;
const MPSSE_BAD_OPCODE_RESPONSE: u8 = 0xFA;

/// GPIO low byte: bit 0 TCK out, bit 1 TDI out, bit 2 TDO in, bit 3 TMS out,
/// bit 7 tri-state buffer enable on Digilent boards.
const GPIO_LOW_VALUE: u8 = 0x80;
const GPIO_LOW_DIRECTION: u8 = 0x8B;

/// Largest byte count one clock-bytes opcode can carry.
const MAX_SHIFT_BLOCK: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState {
    Unknown,
    TestLogicReset,
    RunTestIdle,
    ShiftDr,
    ShiftIr,
}

/// A fixed TMS bit program: `pattern` is clocked out LSB first for `cycles`
/// cycles.  Zero cycles means the transition is a no-op.
struct TmsProgram {
    cycles: u8,
    pattern: u8,
}

/// Legal (source, target) transitions.  Everything else is an error.
fn tms_path(from: TapState, to: TapState) -> Option<TmsProgram> {
    use TapState::*;
    let p = |cycles, pattern| Some(TmsProgram { cycles, pattern });
    match (from, to) {
        (TestLogicReset, RunTestIdle) => p(1, 0x00),
        (RunTestIdle, RunTestIdle) => p(0, 0x00),
        (TestLogicReset, ShiftDr) => p(4, 0x02), // TMS 0-1-0-0
        (RunTestIdle, ShiftDr) => p(3, 0x01),    // TMS 1-0-0
        (TestLogicReset, ShiftIr) => p(5, 0x06), // TMS 0-1-1-0-0
        (RunTestIdle, ShiftIr) => p(4, 0x03),    // TMS 1-1-0-0
        _ => None,
    }
}

pub struct Jtag<T> {
    io: CorrectedIo<T>,
    state: TapState,
}

impl<T: Transport> Jtag<T> {
    /// Bring up the MPSSE engine and leave the TAP state unknown.
    ///
    /// Loopback is disabled twice in separate transactions; AN 135 sends
    /// these blocks separately, and combining them causes irregular startup
    /// failures (e.g. IDCODE reading 0xFFFFFFF).  Each following
    /// configuration group is chased with an invalid opcode, and the chip
    /// must echo the documented bad-opcode pair or the preceding
    /// configuration cannot be trusted.
    pub fn new(mut io: CorrectedIo<T>, clk_div: u16) -> Result<Self> {
        for _ in 0..2 {
            io.queue(&[MPSSE_LOOPBACK_OFF], 0)?;
            io.execute()?;
        }

        io.queue(
            &[MPSSE_NO_CLK_DIV5, MPSSE_NO_ADAPTIVE_CLK, MPSSE_NO_3PHASE_CLK, MPSSE_BAD_OPCODE],
            2,
        )?;
        Self::check_startup_readback(&mut io)?;

        let [lo, hi] = clk_div.to_le_bytes();
        io.queue(&[MPSSE_SET_CLK_DIVISOR, lo, hi, MPSSE_BAD_OPCODE], 2)?;
        Self::check_startup_readback(&mut io)?;

        io.queue(
            &[MPSSE_SET_GPIO_LOW, GPIO_LOW_VALUE, GPIO_LOW_DIRECTION, MPSSE_BAD_OPCODE],
            2,
        )?;
        Self::check_startup_readback(&mut io)?;

        debug!("MPSSE configured, clock divisor {clk_div}");
        Ok(Self { io, state: TapState::Unknown })
    }

    fn check_startup_readback(io: &mut CorrectedIo<T>) -> Result<()> {
        let n = io.execute()?;
        let data = io.data();
        if n != 2 || data[0] != MPSSE_BAD_OPCODE_RESPONSE || data[1] != MPSSE_BAD_OPCODE {
            return Err(Error::ProtocolDesync(format!(
                "expected bad-opcode response fa ab, got {:02x?}",
                &data[..n]
            )));
        }
        Ok(())
    }

    pub fn state(&self) -> TapState {
        self.state
    }

    /// Enter Test-Logic-Reset from any state with 5 ones on TMS.
    pub fn reset(&mut self) -> Result<()> {
        self.clock_tms(false, 5, 0x1F, false)?;
        self.state = TapState::TestLogicReset;
        Ok(())
    }

    pub fn enter_idle(&mut self) -> Result<()> {
        self.enter(TapState::RunTestIdle, "enter Run-Test/Idle")
    }

    pub fn enter_shift_dr(&mut self) -> Result<()> {
        self.enter(TapState::ShiftDr, "enter Shift-DR")
    }

    pub fn enter_shift_ir(&mut self) -> Result<()> {
        self.enter(TapState::ShiftIr, "enter Shift-IR")
    }

    fn enter(&mut self, to: TapState, op: &'static str) -> Result<()> {
        let Some(prog) = tms_path(self.state, to) else {
            return Err(Error::StateTransition { from: self.state, op });
        };
        if prog.cycles > 0 {
            self.clock_tms(false, prog.cycles, prog.pattern, false)?;
        }
        self.state = to;
        Ok(())
    }

    /// Clock out up to 6 TMS bits with a fixed data-line level.  The bit
    /// above the pattern sets the level TMS rests at afterwards.
    fn clock_tms(&mut self, data: bool, cycles: u8, pattern: u8, final_state: bool) -> Result<()> {
        if cycles == 0 || cycles > 6 {
            return Err(Error::Usage(format!(
                "TMS clock supports 1 to 6 cycles, got {cycles}"
            )));
        }
        let mut val = pattern;
        if data {
            val |= 0x80;
        }
        if final_state {
            val |= 1 << cycles;
        }
        self.io.queue(&[MPSSE_CLOCK_TMS_OUT, cycles - 1, val], 0)
    }

    /// Clock `bits` cycles without touching TMS or data, split into a whole
    /// byte opcode plus a remainder opcode.
    pub fn clock_bits(&mut self, bits: usize) -> Result<()> {
        let bytes = bits >> 3;
        let rem = bits - (bytes << 3);
        if bytes > 0 {
            let m = bytes - 1;
            self.io
                .queue(&[MPSSE_CLOCK_N_BYTES, (m & 0xFF) as u8, (m >> 8) as u8], 0)?;
        }
        if rem > 0 {
            self.io.queue(&[MPSSE_CLOCK_N_BITS, (rem - 1) as u8], 0)?;
        }
        Ok(())
    }

    /// Emit idle clock cycles, e.g. for the post-configuration startup
    /// sequence.
    pub fn clock_idle(&mut self, cycles: usize) -> Result<()> {
        self.clock_bits(cycles)
    }

    /// Shift `bits` bits of `data` (LSB first) through the current shift
    /// register, optionally capturing the response.  Exiting the shift state
    /// requires raising TMS together with the last data bit, so the final
    /// bit rides on a 3-cycle TMS command back to Run-Test/Idle; when
    /// reading, corrections are registered so the caller sees a contiguous
    /// logical byte stream.
    pub fn shift(&mut self, bits: usize, data: &[u8], read: bool) -> Result<()> {
        if bits == 0 {
            return Ok(());
        }
        if self.state != TapState::ShiftDr && self.state != TapState::ShiftIr {
            return Err(Error::StateTransition { from: self.state, op: "shift" });
        }
        if data.len() * 8 < bits {
            return Err(Error::Usage(format!(
                "shift of {bits} bit(s) needs {} byte(s), got {}",
                bits.div_ceil(8),
                data.len()
            )));
        }

        // The final bit is handled separately below.
        let bits = bits - 1;
        let n_bytes = bits >> 3;
        let rem = bits & 0x7;

        // Whole bytes, in blocks the clock-bytes opcode can express.
        let mut remaining = n_bytes;
        let mut offset = 0;
        while remaining > 0 {
            let block = remaining.min(MAX_SHIFT_BLOCK);
            let m = block - 1;
            let op = if read { MPSSE_CLOCK_BYTES_IN_OUT } else { MPSSE_CLOCK_BYTES_OUT };
            self.io.queue(&[op, (m & 0xFF) as u8, (m >> 8) as u8], 0)?;
            self.io
                .queue(&data[offset..offset + block], if read { block } else { 0 })?;
            remaining -= block;
            offset += block;
        }

        // Remaining bits except the final one.  The chip returns them
        // left-aligned in one byte.
        if rem > 0 {
            let op = if read { MPSSE_CLOCK_BITS_IN_OUT } else { MPSSE_CLOCK_BITS_OUT };
            self.io
                .queue(&[op, (rem - 1) as u8, data[n_bytes]], usize::from(read))?;
            if read {
                self.io.add_fixup(0xFF, (8 - rem) as i32, false);
            }
        }

        // Final bit on the data line of a TMS 1-1-0 program back to idle.
        // When reading, the captured bit lands at position 5 of the response
        // byte and is merged into the partial byte above if there is one.
        let last_bit = data[n_bytes] & (1 << rem) != 0;
        let op = if read { MPSSE_CLOCK_TMS_IN_OUT } else { MPSSE_CLOCK_TMS_OUT };
        let val = if last_bit { 0x83 } else { 0x03 };
        self.io.queue(&[op, 0x02, val], usize::from(read))?;
        if read {
            self.io.add_fixup(0x20, 5 - rem as i32, rem > 0);
        }
        self.state = TapState::RunTestIdle;
        Ok(())
    }

    /// Run all queued commands and return the corrected read byte count.
    pub fn execute(&mut self) -> Result<usize> {
        self.io.execute()
    }

    /// Copy of the first `n` corrected read bytes of the last execute.
    pub fn read_copy(&self, n: usize) -> Result<Vec<u8>> {
        let data = self.io.data();
        if n > data.len() {
            return Err(Error::Usage(format!(
                "requested {n} read byte(s), only {} available",
                data.len()
            )));
        }
        Ok(data[..n].to_vec())
    }

    /// Corrected read data of the last execute.
    pub fn data(&self) -> &[u8] {
        self.io.data()
    }
}
