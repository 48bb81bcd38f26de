//! Buffered byte I/O against the MPSSE engine.
//!
//! `IoBuffer` presents an unbounded logical byte channel on top of a chip
//! with a fixed maximum transfer size and blocking read/write calls: bytes
//! are queued together with the number of response bytes they will produce,
//! and nothing touches the wire until the queue overflows or `execute` is
//! called.
//!
//! `CorrectedIo` sits on top and repairs the raw byte stream after an
//! execute.  JTAG shifts whose bit count is not a multiple of 8 still return
//! whole bytes per command, with the significant bits left-aligned; the
//! recorded corrections mask, shift and merge those partial bytes back into
//! the logical stream.
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// MPSSE "send immediately" token, appended before a finalizing flush.
const MPSSE_SEND_IMMEDIATE: u8 = 0x87;

pub struct IoBuffer<T> {
    dev: T,
    max_transfer: usize,
    write_buf: Vec<u8>,
    read_buf: Vec<u8>,
    scratch: Vec<u8>,
    read_pending: usize,
    /// Set when an execute has completed; the next queued byte starts a new
    /// cycle and discards the previous read data.
    exec_done: bool,
}

impl<T: Transport> IoBuffer<T> {
    pub fn new(dev: T, max_transfer: usize) -> Self {
        Self {
            dev,
            max_transfer,
            write_buf: Vec::with_capacity(max_transfer),
            read_buf: Vec::new(),
            scratch: vec![0; max_transfer],
            read_pending: 0,
            exec_done: false,
        }
    }

    /// Append `data` to the write queue and account for `n_read` response
    /// bytes the device will send for it.  Flushes to the chip whenever the
    /// queue reaches the maximum transfer size; such intermediate flushes
    /// cannot finalize reads since the full request is not yet known.
    pub fn queue(&mut self, data: &[u8], n_read: usize) -> Result<()> {
        if self.exec_done {
            self.read_buf.clear();
            self.exec_done = false;
        }
        self.read_pending += n_read;
        let mut pos = 0;
        loop {
            let room = self.max_transfer - self.write_buf.len();
            let chunk = room.min(data.len() - pos);
            self.write_buf.extend_from_slice(&data[pos..pos + chunk]);
            pos += chunk;
            if pos == data.len() {
                return Ok(());
            }
            self.flush(false)?;
        }
    }

    /// Flush everything, block until all expected response bytes have
    /// arrived, and return the number of bytes read.  Leftover bytes in the
    /// device's receive buffer afterwards mean the host lost track of the
    /// command/response pairing and are fatal.
    pub fn execute(&mut self) -> Result<usize> {
        self.queue(&[MPSSE_SEND_IMMEDIATE], 0)?;
        self.flush(true)?;
        debug_assert!(self.read_pending == 0);
        debug_assert!(self.write_buf.is_empty());

        // The cycle is over either way; marking it done here keeps the next
        // cycle from inheriting this one's read data after a caller purges
        // the receive buffer and carries on.
        self.exec_done = true;

        let residual = self.dev.rx_available()?;
        if residual > 0 {
            return Err(Error::Transport(format!(
                "{residual} unexpected byte(s) left in receive buffer after execute"
            )));
        }
        debug!("execute complete, {} byte(s) read", self.read_buf.len());
        Ok(self.read_buf.len())
    }

    /// Send the write queue in chunks of at most the maximum transfer size.
    /// Mid-stream, only the bytes the chip has already produced are drained;
    /// the final chunk of a finalizing flush blocks for the full expected
    /// count.
    fn flush(&mut self, finalize: bool) -> Result<()> {
        let mut pos = 0;
        while pos < self.write_buf.len() {
            let end = self.write_buf.len().min(pos + self.max_transfer);
            let written = self.dev.write(&self.write_buf[pos..end])?;
            if written == 0 {
                return Err(Error::Transport("device accepted no data".into()));
            }
            trace!("wrote {written} of {} pending byte(s)", self.write_buf.len() - pos);
            pos += written;

            let more = pos < self.write_buf.len();
            let want = if more || !finalize {
                self.read_pending.min(self.dev.rx_available()?)
            } else {
                self.read_pending
            };
            self.drain(want)?;
        }
        self.write_buf.clear();
        Ok(())
    }

    /// Read exactly `want` bytes into the read buffer.  The buffer grows by
    /// amortized doubling and is only reset when a new cycle starts, so long
    /// read sequences stay O(n) overall.
    fn drain(&mut self, mut want: usize) -> Result<()> {
        while want > 0 {
            let chunk = want.min(self.max_transfer);
            let got = self.dev.read(&mut self.scratch[..chunk])?;
            if got == 0 {
                return Err(Error::Transport(format!(
                    "read timed out with {want} byte(s) still expected"
                )));
            }
            self.read_buf.extend_from_slice(&self.scratch[..got]);
            self.read_pending -= got;
            want -= got;
        }
        Ok(())
    }
}

/// One recorded repair of the raw read stream.
struct Fixup {
    pos: usize,
    mask: u8,
    shift: i32,
    merge: bool,
}

pub struct CorrectedIo<T> {
    io: IoBuffer<T>,
    fixups: Vec<Fixup>,
}

impl<T: Transport> CorrectedIo<T> {
    pub fn new(io: IoBuffer<T>) -> Self {
        Self { io, fixups: Vec::new() }
    }

    pub fn queue(&mut self, data: &[u8], n_read: usize) -> Result<()> {
        self.io.queue(data, n_read)
    }

    /// Record a correction for the read byte most recently scheduled.
    /// `mask` is applied first, then `shift` (positive: right, negative:
    /// left, zero: none).  With `merge`, the corrected byte is OR'd into the
    /// byte before it and removed from the stream.
    pub fn add_fixup(&mut self, mask: u8, shift: i32, merge: bool) {
        let next_read_pos = self.io.read_pending + self.io.read_buf.len();
        debug_assert!(next_read_pos > 0);
        self.fixups.push(Fixup { pos: next_read_pos - 1, mask, shift, merge });
    }

    /// Execute and post-process: apply the recorded corrections in order,
    /// compacting the buffer as merged bytes are removed, and return the
    /// corrected byte count.
    pub fn execute(&mut self) -> Result<usize> {
        let mut n = match self.io.execute() {
            Ok(n) => n,
            Err(e) => {
                // Stale corrections would land on the wrong positions of a
                // later cycle's stream.
                self.fixups.clear();
                return Err(e);
            }
        };

        let buf = &mut self.io.read_buf;
        let mut removed = 0;
        for f in self.fixups.drain(..) {
            // Positions were recorded against the raw stream; account for
            // the bytes already merged away.
            let p = f.pos - removed;
            buf[p] &= f.mask;
            if f.shift > 0 {
                buf[p] >>= f.shift;
            } else {
                buf[p] <<= -f.shift;
            }
            if f.merge {
                buf[p - 1] |= buf[p];
                n -= 1;
                removed += 1;
                buf.copy_within(p + 1.., p);
            }
        }
        buf.truncate(n);
        Ok(n)
    }

    /// The corrected read data of the last execute.
    pub fn data(&self) -> &[u8] {
        &self.io.read_buf
    }
}
