//! Software model of an FTDI MPSSE engine wired to a single Xilinx-style
//! TAP.  The TAP carries the usual IDCODE and BYPASS registers, a USER
//! register hosting the bus-bridge decoder, and a plain shift register used
//! to check bit-exact data transport.
//!
//! The model consumes the MPSSE command stream incrementally, so it behaves
//! the same regardless of how the host chunks its writes.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use busbridge::error::Result;
use busbridge::transport::Transport;

pub const DEFAULT_IDCODE: u32 = 0x0362_D093; // XC7A35T
pub const MARGIN: u16 = 0x0140;
/// IR opcode routing the data register to a plain shift register preloaded
/// from a test pattern.
pub const TEST_IR: u8 = 0x38;

const IR_IDCODE: u8 = 0x09;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Tap {
    Reset,
    Idle,
    SelectDr,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIr,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

fn tap_step(s: Tap, tms: bool) -> Tap {
    use Tap::*;
    match (s, tms) {
        (Reset, false) => Idle,
        (Reset, true) => Reset,
        (Idle, false) => Idle,
        (Idle, true) => SelectDr,
        (SelectDr, false) => CaptureDr,
        (SelectDr, true) => SelectIr,
        (CaptureDr, false) => ShiftDr,
        (CaptureDr, true) => Exit1Dr,
        (ShiftDr, false) => ShiftDr,
        (ShiftDr, true) => Exit1Dr,
        (Exit1Dr, false) => PauseDr,
        (Exit1Dr, true) => UpdateDr,
        (PauseDr, false) => PauseDr,
        (PauseDr, true) => Exit2Dr,
        (Exit2Dr, false) => ShiftDr,
        (Exit2Dr, true) => UpdateDr,
        (UpdateDr, false) => Idle,
        (UpdateDr, true) => SelectDr,
        (SelectIr, false) => CaptureIr,
        (SelectIr, true) => Reset,
        (CaptureIr, false) => ShiftIr,
        (CaptureIr, true) => Exit1Ir,
        (ShiftIr, false) => ShiftIr,
        (ShiftIr, true) => Exit1Ir,
        (Exit1Ir, false) => PauseIr,
        (Exit1Ir, true) => UpdateIr,
        (PauseIr, false) => PauseIr,
        (PauseIr, true) => Exit2Ir,
        (Exit2Ir, false) => ShiftIr,
        (Exit2Ir, true) => UpdateIr,
        (UpdateIr, false) => Idle,
        (UpdateIr, true) => SelectIr,
    }
}

#[derive(Default)]
enum DecState {
    #[default]
    Idle,
    AddrIncArg,
    WidthArg,
    NWordsArg(Vec<u8>),
    AddrArg {
        write: bool,
        got: Vec<u8>,
    },
    WriteData {
        words_left: usize,
        cur: Vec<u8>,
    },
}

/// The FPGA-side bus-bridge command decoder: word-addressed memory plus the
/// four configuration registers the host mirrors.
pub struct Decoder {
    mem: HashMap<u32, u32>,
    addr_inc: u8,
    width: usize,
    n_words: usize,
    addr: u32,
    state: DecState,
    /// Response bytes produced by the most recent input byte; they reach
    /// TDO with one byte of latency.
    staged: Vec<u8>,
    /// Every token seen in command position, for elision assertions.
    pub tokens: Vec<u8>,
}

impl Decoder {
    fn new() -> Self {
        Self {
            mem: HashMap::new(),
            addr_inc: 1,
            width: 4,
            n_words: 1,
            addr: 0,
            state: DecState::Idle,
            staged: Vec::new(),
            tokens: Vec::new(),
        }
    }

    fn push_read(&mut self) {
        for _ in 0..self.n_words {
            let word = *self.mem.get(&self.addr).unwrap_or(&0);
            self.staged
                .extend_from_slice(&word.to_le_bytes()[..self.width]);
            self.addr = self.addr.wrapping_add(u32::from(self.addr_inc));
        }
    }

    fn start_write(&mut self) {
        self.state = DecState::WriteData { words_left: self.n_words, cur: Vec::new() };
    }

    fn process(&mut self, b: u8) {
        match std::mem::take(&mut self.state) {
            DecState::Idle => {
                self.tokens.push(b);
                match b {
                    0 => {}
                    1 => self.state = DecState::AddrIncArg,
                    2 => self.state = DecState::WidthArg,
                    3 => self.state = DecState::NWordsArg(Vec::new()),
                    4 => self.state = DecState::AddrArg { write: true, got: Vec::new() },
                    5 => self.start_write(),
                    6 => self.state = DecState::AddrArg { write: false, got: Vec::new() },
                    7 => self.push_read(),
                    8 => self.staged.extend_from_slice(&MARGIN.to_le_bytes()),
                    _ => {}
                }
            }
            DecState::AddrIncArg => self.addr_inc = b,
            DecState::WidthArg => self.width = usize::from(b) + 1,
            DecState::NWordsArg(mut got) => {
                got.push(b);
                if got.len() == 2 {
                    self.n_words = usize::from(u16::from_le_bytes([got[0], got[1]])) + 1;
                } else {
                    self.state = DecState::NWordsArg(got);
                }
            }
            DecState::AddrArg { write, mut got } => {
                got.push(b);
                if got.len() == 4 {
                    self.addr = u32::from_le_bytes([got[0], got[1], got[2], got[3]]);
                    if write {
                        self.start_write();
                    } else {
                        self.push_read();
                    }
                } else {
                    self.state = DecState::AddrArg { write, got };
                }
            }
            DecState::WriteData { mut words_left, mut cur } => {
                cur.push(b);
                if cur.len() == self.width {
                    let mut w = [0u8; 4];
                    w[..self.width].copy_from_slice(&cur);
                    self.mem.insert(self.addr, u32::from_le_bytes(w));
                    self.addr = self.addr.wrapping_add(u32::from(self.addr_inc));
                    words_left -= 1;
                    cur.clear();
                }
                if words_left > 0 {
                    self.state = DecState::WriteData { words_left, cur };
                }
            }
        }
    }
}

pub struct SimChip {
    inbuf: Vec<u8>,
    rx: VecDeque<u8>,
    tap: Tap,
    ir_shift: u8,
    ir: u8,
    idcode: u32,
    dr_id: u32,
    dr_bypass: bool,
    user_opcode: u8,
    // USER register byte framing
    bit_idx: u32,
    cur_in: u8,
    tdo_byte: u8,
    fifo: VecDeque<u8>,
    pub dec: Decoder,
    // plain test shift register
    test_pattern: Vec<u8>,
    test_out: VecDeque<bool>,
    /// TDI bits captured during the last test-register shift session.
    pub captured: Vec<bool>,
}

impl SimChip {
    pub fn new(idcode: u32, user_opcode: u8) -> Self {
        Self {
            inbuf: Vec::new(),
            rx: VecDeque::new(),
            tap: Tap::Reset,
            ir_shift: 0,
            ir: IR_IDCODE,
            idcode,
            dr_id: 0,
            dr_bypass: false,
            user_opcode,
            bit_idx: 0,
            cur_in: 0,
            tdo_byte: 0,
            fifo: VecDeque::new(),
            dec: Decoder::new(),
            test_pattern: Vec::new(),
            test_out: VecDeque::new(),
            captured: Vec::new(),
        }
    }

    pub fn set_test_pattern(&mut self, pattern: &[u8]) {
        self.test_pattern = pattern.to_vec();
    }

    /// Inject a spurious byte into the receive queue, as a glitched chip
    /// would, to provoke the host's desync detection.
    pub fn inject_rx_noise(&mut self, byte: u8) {
        self.rx.push_front(byte);
    }

    fn capture_dr(&mut self) {
        if self.ir == IR_IDCODE {
            self.dr_id = self.idcode;
        } else if self.ir == self.user_opcode {
            self.bit_idx = 0;
            self.cur_in = 0;
            self.tdo_byte = 0;
            self.fifo.clear();
            self.dec.staged.clear();
            self.dec.state = DecState::Idle;
        } else if self.ir == TEST_IR {
            self.test_out = self
                .test_pattern
                .iter()
                .flat_map(|b| (0..8).map(move |i| b >> i & 1 != 0))
                .collect();
            self.captured.clear();
        } else {
            self.dr_bypass = false;
        }
    }

    fn shift_dr_bit(&mut self, tdi: bool) -> bool {
        if self.ir == IR_IDCODE {
            let out = self.dr_id & 1 != 0;
            self.dr_id = (self.dr_id >> 1) | (u32::from(tdi) << 31);
            out
        } else if self.ir == self.user_opcode {
            if self.bit_idx == 0 {
                self.tdo_byte = self.fifo.pop_front().unwrap_or(0);
                let staged = std::mem::take(&mut self.dec.staged);
                self.fifo.extend(staged);
            }
            let out = self.tdo_byte >> self.bit_idx & 1 != 0;
            self.cur_in |= u8::from(tdi) << self.bit_idx;
            self.bit_idx += 1;
            if self.bit_idx == 8 {
                let b = self.cur_in;
                self.bit_idx = 0;
                self.cur_in = 0;
                self.dec.process(b);
            }
            out
        } else if self.ir == TEST_IR {
            self.captured.push(tdi);
            self.test_out.pop_front().unwrap_or(false)
        } else {
            let out = self.dr_bypass;
            self.dr_bypass = tdi;
            out
        }
    }

    /// One TCK cycle: shift if in a shift state, then advance the TAP.
    fn clock(&mut self, tdi: bool, tms: bool) -> bool {
        let tdo = match self.tap {
            Tap::ShiftDr => self.shift_dr_bit(tdi),
            Tap::ShiftIr => {
                let out = self.ir_shift & 1 != 0;
                self.ir_shift = (self.ir_shift >> 1) | (u8::from(tdi) << 5);
                out
            }
            _ => false,
        };
        let prev = self.tap;
        self.tap = tap_step(self.tap, tms);
        if self.tap != prev {
            match self.tap {
                Tap::Reset => self.ir = IR_IDCODE,
                Tap::CaptureIr => self.ir_shift = 0x01,
                Tap::CaptureDr => self.capture_dr(),
                Tap::UpdateIr => self.ir = self.ir_shift & 0x3F,
                _ => {}
            }
        }
        tdo
    }

    /// Consume as many complete MPSSE commands as the input buffer holds.
    fn process_commands(&mut self) {
        loop {
            let Some(&op) = self.inbuf.first() else { return };
            let consumed = match op {
                0x85 | 0x8A | 0x97 | 0x8D | 0x87 => 1,
                0x86 | 0x80 => {
                    if self.inbuf.len() < 3 {
                        return;
                    }
                    3
                }
                0x8E => {
                    if self.inbuf.len() < 2 {
                        return;
                    }
                    let n = usize::from(self.inbuf[1]) + 1;
                    for _ in 0..n {
                        self.clock(false, false);
                    }
                    2
                }
                0x8F => {
                    if self.inbuf.len() < 3 {
                        return;
                    }
                    let n = usize::from(self.inbuf[1]) | usize::from(self.inbuf[2]) << 8;
                    for _ in 0..(n + 1) * 8 {
                        self.clock(false, false);
                    }
                    3
                }
                0x4B | 0x6B => {
                    if self.inbuf.len() < 3 {
                        return;
                    }
                    let cycles = usize::from(self.inbuf[1]) + 1;
                    let val = self.inbuf[2];
                    let tdi = val & 0x80 != 0;
                    let mut resp = 0u8;
                    for c in 0..cycles {
                        let tms = val >> c & 1 != 0;
                        let tdo = self.clock(tdi, tms);
                        resp = (resp >> 1) | (u8::from(tdo) << 7);
                    }
                    if op == 0x6B {
                        self.rx.push_back(resp);
                    }
                    3
                }
                0x19 | 0x39 => {
                    if self.inbuf.len() < 3 {
                        return;
                    }
                    let n = (usize::from(self.inbuf[1]) | usize::from(self.inbuf[2]) << 8) + 1;
                    if self.inbuf.len() < 3 + n {
                        return;
                    }
                    for i in 0..n {
                        let byte = self.inbuf[3 + i];
                        let mut resp = 0u8;
                        for bit in 0..8 {
                            let tdo = self.clock(byte >> bit & 1 != 0, false);
                            resp = (resp >> 1) | (u8::from(tdo) << 7);
                        }
                        if op == 0x39 {
                            self.rx.push_back(resp);
                        }
                    }
                    3 + n
                }
                0x1B | 0x3B => {
                    if self.inbuf.len() < 3 {
                        return;
                    }
                    let bits = usize::from(self.inbuf[1]) + 1;
                    let byte = self.inbuf[2];
                    let mut resp = 0u8;
                    for bit in 0..bits {
                        let tdo = self.clock(byte >> bit & 1 != 0, false);
                        resp = (resp >> 1) | (u8::from(tdo) << 7);
                    }
                    if op == 0x3B {
                        self.rx.push_back(resp);
                    }
                    3
                }
                _ => {
                    self.rx.push_back(0xFA);
                    self.rx.push_back(op);
                    1
                }
            };
            self.inbuf.drain(..consumed);
        }
    }
}

/// Clonable `Transport` over a shared chip model, so tests can keep a view
/// into the model after handing it to the stack.
#[derive(Clone)]
pub struct SharedSim(pub Rc<RefCell<SimChip>>);

impl SharedSim {
    pub fn new() -> Self {
        SharedSim(Rc::new(RefCell::new(SimChip::new(DEFAULT_IDCODE, 0x02))))
    }
}

impl Transport for SharedSim {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut chip = self.0.borrow_mut();
        chip.inbuf.extend_from_slice(buf);
        chip.process_commands();
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut chip = self.0.borrow_mut();
        let n = buf.len().min(chip.rx.len());
        for b in buf.iter_mut().take(n) {
            *b = chip.rx.pop_front().unwrap();
        }
        Ok(n)
    }

    fn rx_available(&mut self) -> Result<usize> {
        Ok(self.0.borrow().rx.len())
    }
}
