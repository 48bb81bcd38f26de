//! The bus-bridge command protocol, carried inside one JTAG data-register
//! shift per execute cycle through a Xilinx BSCANE2 USER instruction.
//!
//! Writes and reads only append to a command buffer; nothing touches the
//! hardware until `execute`.  A shadow copy of the FPGA decoder's
//! configuration registers (address increment, word width, word count,
//! address pointer) suppresses commands that would not change the remote
//! state.  The shadow is updated in the same statement sequence that appends
//! the command bytes, never before, so it cannot diverge from the wire
//! stream.
//!
//! Reads return a [`Handle`] bound to the upcoming execute; decoding one
//! against any other execute cycle is an error.
use log::debug;

use crate::error::{Error, Result};
use crate::jtag::Jtag;
use crate::transport::Transport;

/// Command tokens understood by the FPGA-side decoder (busBridge2 RTL).
#[derive(Clone, Copy)]
#[repr(u8)]
enum Cmd {
    /// No-op, used to pad the stream so trailing response bytes get clocked
    /// out.
    Idle = 0,
    /// Set address increment (1-byte argument; 0 is valid).
    AddrInc = 1,
    /// Set word width in bytes (argument is width minus one).
    WordWidth = 2,
    /// Set transfer size in words (16-bit LE argument, count minus one).
    NWords = 3,
    /// Set address (32-bit LE argument), then write data follows.
    AddrWrite = 4,
    /// Write data follows at the current address pointer.
    Write = 5,
    /// Set address (32-bit LE argument), then read.
    AddrRead = 6,
    /// Read from the current address pointer.
    Read = 7,
    /// Respond with the 16-bit timing-margin tracker value.
    QueryMargin = 8,
}

/// JTAG instruction register opcodes for the BSCANE2 USER registers.
fn user_opcode(user: u8) -> Result<u8> {
    match user {
        1 => Ok(0x02),
        2 => Ok(0x03),
        3 => Ok(0x22),
        4 => Ok(0x23),
        _ => Err(Error::Configuration(format!(
            "USER register selector must be 1..=4, got {user}"
        ))),
    }
}

const IR_LEN: usize = 6;
/// Response bytes trail the command stream by one byte of hardware latency.
const RESPONSE_LATENCY: usize = 1;

/// Deferred-read token: a byte offset into the corrected read stream of one
/// specific execute cycle.  Valid to decode exactly once the matching
/// execute has completed.
#[derive(Debug, Clone, Copy)]
pub struct Handle {
    offset: usize,
    generation: u64,
}

pub struct BusMaster<T> {
    jtag: Jtag<T>,
    cmd: Vec<u8>,
    user_opcode: u8,
    read_flag: bool,
    /// Pad target so the last response byte still gets clocked out.
    pad_to: usize,
    /// Completed execute cycles; handles are stamped with the cycle that
    /// will finalize them.
    generation: u64,
    // Shadow of the remote decoder's configuration registers.  The RTL
    // reset values are the initial mirror state.
    addr_inc: u8,
    word_width: usize,
    n_words: usize,
    addr: u32,
}

impl<T: Transport> BusMaster<T> {
    /// Attach the bus protocol to a JTAG engine, talking through the given
    /// USER register (1..=4).  The TAP must be in Test-Logic-Reset or
    /// Run-Test/Idle when `execute` is first called.
    pub fn new(jtag: Jtag<T>, user: u8) -> Result<Self> {
        Ok(Self {
            jtag,
            cmd: Vec::new(),
            user_opcode: user_opcode(user)?,
            read_flag: false,
            pad_to: 0,
            generation: 0,
            addr_inc: 1,
            word_width: 4,
            n_words: 1,
            addr: 0,
        })
    }

    fn set_addr_inc(&mut self, addr_inc: u8) {
        if self.addr_inc != addr_inc {
            self.cmd.push(Cmd::AddrInc as u8);
            self.cmd.push(addr_inc);
            self.addr_inc = addr_inc;
        }
    }

    fn set_word_width(&mut self, width: usize) {
        if self.word_width != width {
            self.cmd.push(Cmd::WordWidth as u8);
            self.cmd.push((width - 1) as u8);
            self.word_width = width;
        }
    }

    fn set_n_words(&mut self, n_words: usize) -> Result<()> {
        if self.n_words != n_words {
            if n_words == 0 || n_words > 0xFFFF {
                return Err(Error::Configuration(format!(
                    "word count must be 1..=65535, got {n_words}"
                )));
            }
            let m = (n_words - 1) as u16;
            self.cmd.push(Cmd::NWords as u8);
            self.cmd.extend_from_slice(&m.to_le_bytes());
            self.n_words = n_words;
        }
        Ok(())
    }

    /// Emit the configuration and addressing preamble for one transfer,
    /// eliding whatever already matches the shadow state, and advance the
    /// shadow address pointer the way the hardware will.
    fn header(&mut self, width: usize, addr: u32, addr_inc: u8, n_words: usize, write: bool) -> Result<()> {
        // The increment has no effect on single-word transfers.
        if n_words != 1 {
            self.set_addr_inc(addr_inc);
        }
        self.set_word_width(width);
        self.set_n_words(n_words)?;

        if addr == self.addr {
            self.cmd.push(if write { Cmd::Write } else { Cmd::Read } as u8);
        } else {
            self.cmd.push(if write { Cmd::AddrWrite } else { Cmd::AddrRead } as u8);
            self.cmd.extend_from_slice(&addr.to_le_bytes());
            self.addr = addr;
        }
        self.addr = self
            .addr
            .wrapping_add(u32::from(self.addr_inc).wrapping_mul(n_words as u32));
        Ok(())
    }

    /// Queue an 8-bit write of `data` starting at `addr`.
    pub fn write8(&mut self, addr: u32, data: &[u8], addr_inc: u8) -> Result<()> {
        self.header(1, addr, addr_inc, data.len(), true)?;
        self.cmd.extend_from_slice(data);
        Ok(())
    }

    /// Queue a 16-bit write of `data` starting at `addr`.
    pub fn write16(&mut self, addr: u32, data: &[u16], addr_inc: u8) -> Result<()> {
        self.header(2, addr, addr_inc, data.len(), true)?;
        for w in data {
            self.cmd.extend_from_slice(&w.to_le_bytes());
        }
        Ok(())
    }

    /// Queue a 32-bit write of `data` starting at `addr`.
    pub fn write32(&mut self, addr: u32, data: &[u32], addr_inc: u8) -> Result<()> {
        self.header(4, addr, addr_inc, data.len(), true)?;
        for w in data {
            self.cmd.extend_from_slice(&w.to_le_bytes());
        }
        Ok(())
    }

    /// Queue a single 32-bit write.
    pub fn write_word(&mut self, addr: u32, value: u32) -> Result<()> {
        self.write32(addr, &[value], 1)
    }

    fn issue_read(&mut self, width: usize, n_words: usize) -> Handle {
        let handle = Handle {
            offset: self.cmd.len() + RESPONSE_LATENCY,
            generation: self.generation + 1,
        };
        // Placeholder words keep the clock running while the response
        // streams back; as all-zero bytes they decode as IDLE tokens.
        self.cmd.resize(self.cmd.len() + n_words * width, 0);
        self.read_flag = true;
        self.pad_to = self.cmd.len() + RESPONSE_LATENCY;
        handle
    }

    /// Queue an 8-bit read of `n_words` words from `addr`.
    pub fn read8(&mut self, addr: u32, n_words: usize, addr_inc: u8) -> Result<Handle> {
        self.header(1, addr, addr_inc, n_words, false)?;
        Ok(self.issue_read(1, n_words))
    }

    /// Queue a 16-bit read of `n_words` words from `addr`.
    pub fn read16(&mut self, addr: u32, n_words: usize, addr_inc: u8) -> Result<Handle> {
        self.header(2, addr, addr_inc, n_words, false)?;
        Ok(self.issue_read(2, n_words))
    }

    /// Queue a 32-bit read of `n_words` words from `addr`.
    pub fn read32(&mut self, addr: u32, n_words: usize, addr_inc: u8) -> Result<Handle> {
        self.header(4, addr, addr_inc, n_words, false)?;
        Ok(self.issue_read(4, n_words))
    }

    /// Queue a timing-margin query; decode the handle with [`get_u16`].
    ///
    /// [`get_u16`]: Self::get_u16
    pub fn query_margin(&mut self) -> Handle {
        self.cmd.push(Cmd::QueryMargin as u8);
        self.issue_read(2, 1)
    }

    /// Send everything queued since the last execute as one JTAG
    /// data-register shift and collect the responses.
    ///
    /// The cycle is consumed whether or not it succeeds: after a failed
    /// execute, its handles (and those of every earlier cycle) decode to a
    /// `Usage` error, never to another cycle's data.
    pub fn execute(&mut self) -> Result<()> {
        while self.cmd.len() < self.pad_to {
            self.cmd.push(Cmd::Idle as u8);
        }
        self.pad_to = 0;

        debug!(
            "bus execute: {} command byte(s), readback {}",
            self.cmd.len(),
            self.read_flag
        );
        self.generation += 1;
        let result = self.shift_cycle();
        self.cmd.clear();
        self.read_flag = false;
        if result.is_err() {
            // Poison the failed cycle so its handles stay stale forever.
            self.generation += 1;
        }
        result
    }

    fn shift_cycle(&mut self) -> Result<()> {
        self.jtag.enter_shift_ir()?;
        self.jtag.shift(IR_LEN, &[self.user_opcode], false)?;
        self.jtag.enter_shift_dr()?;
        self.jtag.shift(self.cmd.len() * 8, &self.cmd, self.read_flag)?;
        self.jtag.execute()?;
        Ok(())
    }

    fn decode_offset(&self, handle: Handle, n_bytes: usize) -> Result<usize> {
        if handle.generation != self.generation {
            return Err(Error::Usage(format!(
                "handle belongs to execute cycle {}, current cycle is {}",
                handle.generation, self.generation
            )));
        }
        let data = self.jtag.data();
        if handle.offset + n_bytes > data.len() {
            return Err(Error::Usage(format!(
                "handle needs bytes {}..{} but only {} were read",
                handle.offset,
                handle.offset + n_bytes,
                data.len()
            )));
        }
        Ok(handle.offset)
    }

    pub fn get_u8(&self, handle: Handle) -> Result<u8> {
        let p = self.decode_offset(handle, 1)?;
        Ok(self.jtag.data()[p])
    }

    pub fn get_u8s(&self, handle: Handle, count: usize) -> Result<Vec<u8>> {
        let p = self.decode_offset(handle, count)?;
        Ok(self.jtag.data()[p..p + count].to_vec())
    }

    pub fn get_u16(&self, handle: Handle) -> Result<u16> {
        Ok(self.get_u16s(handle, 1)?[0])
    }

    pub fn get_u16s(&self, handle: Handle, count: usize) -> Result<Vec<u16>> {
        let p = self.decode_offset(handle, count * 2)?;
        let data = &self.jtag.data()[p..p + count * 2];
        Ok(data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    pub fn get_u32(&self, handle: Handle) -> Result<u32> {
        Ok(self.get_u32s(handle, 1)?[0])
    }

    pub fn get_u32s(&self, handle: Handle, count: usize) -> Result<Vec<u32>> {
        let p = self.decode_offset(handle, count * 4)?;
        let data = &self.jtag.data()[p..p + count * 4];
        Ok(data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}
