//! Configuration-bitstream upload and IDCODE readout for Xilinx 7-series
//! devices.
//!
//! The bitstream file format and the JTAG shift order are bit-reversed
//! relative to each other, so every byte is reversed before shifting.
use log::debug;

use crate::error::{Error, Result};
use crate::jtag::Jtag;
use crate::transport::Transport;

// 6-bit instruction register opcodes (UG470).
const IR_CFG_IN: u8 = 0x05;
const IR_IDCODE: u8 = 0x09;
const IR_JSTART: u8 = 0x0C;
const IR_SHUTDOWN: u8 = 0x0D;
const IR_LEN: usize = 6;

/// Read the device IDCODE: 32 bits from the data register after loading the
/// IDCODE instruction, LSB first.
pub fn read_idcode<T: Transport>(jtag: &mut Jtag<T>) -> Result<u32> {
    jtag.reset()?;
    jtag.enter_shift_ir()?;
    jtag.shift(IR_LEN, &[IR_IDCODE], false)?;
    jtag.enter_shift_dr()?;
    jtag.shift(32, &[0u8; 4], true)?;
    let n = jtag.execute()?;
    if n != 4 {
        return Err(Error::ProtocolDesync(format!(
            "IDCODE readback returned {n} byte(s), expected 4"
        )));
    }
    let d = jtag.data();
    Ok(u32::from_le_bytes([d[0], d[1], d[2], d[3]]))
}

/// Load a configuration bitstream: SHUTDOWN, shift the bit-reversed
/// bitstream through CFG_IN, then JSTART.
pub fn upload<T: Transport>(jtag: &mut Jtag<T>, bitstream: &[u8]) -> Result<()> {
    let reversed: Vec<u8> = bitstream.iter().map(|b| b.reverse_bits()).collect();
    debug!("uploading bitstream, {} byte(s)", reversed.len());

    jtag.reset()?;

    jtag.enter_shift_ir()?;
    jtag.shift(IR_LEN, &[IR_SHUTDOWN], false)?;
    jtag.clock_idle(16)?;

    jtag.enter_shift_ir()?;
    jtag.shift(IR_LEN, &[IR_CFG_IN], false)?;
    jtag.enter_shift_dr()?;
    jtag.shift(reversed.len() * 8, &reversed, false)?;
    jtag.clock_idle(1)?;

    jtag.enter_shift_ir()?;
    jtag.shift(IR_LEN, &[IR_JSTART], false)?;
    jtag.clock_idle(32)?;

    jtag.execute()?;
    Ok(())
}
