//! `Transport` backend for FTDI devices through the D2XX driver.
use std::time::Duration;

use libftd2xx::{BitMode, Ftdi, FtdiCommon};

use crate::error::Result;
use crate::transport::Transport;

pub struct D2xx<T> {
    ft: T,
}

impl D2xx<Ftdi> {
    /// Open the device whose EEPROM description matches `description`, e.g.
    /// "Digilent Adept USB Device A" for Digilent boards.
    pub fn open(description: &str, max_transfer_size: u32, timeout: Duration) -> Result<Self> {
        let ft = Ftdi::with_description(description)?;
        Self::with_device(ft, max_transfer_size, timeout)
    }
}

impl<T: FtdiCommon> D2xx<T> {
    /// Take over an already-opened device and apply the session
    /// configuration the MPSSE engine needs: reset, USB transfer size, no
    /// event/error characters, timeouts, zero latency timer, RTS/CTS flow
    /// control (per AN 135), and bit mode reset followed by MPSSE.
    pub fn with_device(mut ft: T, max_transfer_size: u32, timeout: Duration) -> Result<Self> {
        ft.reset()?;
        ft.set_usb_parameters(max_transfer_size)?;
        ft.set_chars(0, false, 0, false)?;
        ft.set_timeouts(timeout, timeout)?;
        ft.set_latency_timer(Duration::from_millis(0))?;
        ft.set_flow_control_rts_cts()?;
        ft.set_bit_mode(0x00, BitMode::Reset)?;
        ft.set_bit_mode(0x00, BitMode::Mpsse)?;
        Ok(Self { ft })
    }
}

impl<T: FtdiCommon> Transport for D2xx<T> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.ft.write(buf)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.ft.read(buf)?)
    }

    fn rx_available(&mut self) -> Result<usize> {
        Ok(self.ft.queue_status()?)
    }
}
