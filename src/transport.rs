//! The boundary with the vendor USB driver.  Hardware backends implement the
//! `Transport` trait; everything above it only sees blocking byte I/O plus a
//! non-blocking receive-count poll.
#[cfg(feature = "d2xx")]
pub mod d2xx;

use crate::error::Result;

pub trait Transport {
    /// Send up to `buf.len()` bytes to the device.  Returns the number of
    /// bytes accepted, which may be less than requested when the chip is
    /// slow to drain its FIFO.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Receive up to `buf.len()` bytes, blocking up to the transport's
    /// configured timeout.  Returns the number of bytes placed in `buf`;
    /// zero indicates a timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Number of received bytes waiting in the device without blocking.
    fn rx_available(&mut self) -> Result<usize>;
}
