//! This crate turns an FTDI chip in MPSSE mode into a JTAG master and
//! carries a compact memory-bus protocol over that link, so a host can read
//! and write an FPGA's internal address space and load its configuration
//! bitstream.
//!
//! The stack is layered bottom up.  The `Transport` trait is the seam with
//! the vendor USB driver: blocking write/read plus a receive-count poll.  On
//! top of it, `IoBuffer` queues outgoing bytes together with expected
//! response counts, hiding the chip's maximum transfer size, and
//! `CorrectedIo` repairs the partial bytes produced by bit-granular JTAG
//! shifts.  `Jtag` tracks the TAP state and encodes TMS programs and data
//! shifts as MPSSE opcodes.  `BusMaster` speaks the bus-bridge command
//! protocol through a BSCANE2 USER register, batching commands until
//! `execute` and handing out deferred-read handles.
//!
//! Nothing below `execute` is asynchronous; every layer blocks until the
//! hardware has answered, and one session object drives one chip.
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//! use busbridge::transport::d2xx::D2xx;
//! use busbridge::io::{CorrectedIo, IoBuffer};
//! use busbridge::jtag::Jtag;
//! use busbridge::bus::BusMaster;
//!
//! # fn main() -> busbridge::Result<()> {
//! let dev = D2xx::open("Digilent Adept USB Device A", 65535, Duration::from_secs(1))?;
//! let io = CorrectedIo::new(IoBuffer::new(dev, 65535));
//! let mut jtag = Jtag::new(io, 0)?;
//! jtag.reset()?;
//!
//! let mut bus = BusMaster::new(jtag, 1)?;
//! bus.write_word(0x1234_5678, 1)?;
//! let h = bus.read32(0x1234_5678, 1, 1)?;
//! bus.execute()?;
//! println!("{:#010x}", bus.get_u32(h)?);
//! # Ok(())
//! # }
//! ```

pub mod bitstream;
pub mod bus;
pub mod error;
pub mod io;
pub mod jtag;
pub mod memtest;
pub mod transport;

pub use error::{Error, Result};
