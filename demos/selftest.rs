//! Hardware self test: bring up the MPSSE JTAG link, stress the shift
//! splitting logic, optionally load a bitstream, then hammer the bus bridge
//! with randomized memory tests and timing-margin queries.
//!
//! Usage: selftest [device-description] [bitstream.bit]
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use busbridge::bus::BusMaster;
use busbridge::io::{CorrectedIo, IoBuffer};
use busbridge::jtag::Jtag;
use busbridge::transport::d2xx::D2xx;
use busbridge::{bitstream, memtest};

const MAX_TRANSFER: usize = 65535;

fn main() -> busbridge::Result<()> {
    env_logger::init();
    let description = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Digilent Adept USB Device A".to_string());

    let dev = D2xx::open(&description, MAX_TRANSFER as u32, Duration::from_secs(1))?;
    let io = CorrectedIo::new(IoBuffer::new(dev, MAX_TRANSFER));
    let mut jtag = Jtag::new(io, 0)?;

    // Stress the read splitting: the final bit of every shift needs its own
    // TMS command and returns a separate byte that must be merged back.
    // All counts 25..=32 produce four logical bytes through different
    // command patterns, and the groups must be pairwise identical.
    jtag.reset()?;
    jtag.enter_shift_ir()?;
    jtag.shift(6, &[0x09], false)?;
    for n_bits in 25..=32 {
        for _ in 0..20 {
            jtag.enter_shift_dr()?;
            jtag.shift(n_bits, &[0u8; 4], true)?;
        }
        let n = jtag.execute()?;
        let buf = jtag.read_copy(n)?;
        assert_eq!(buf.len(), 20 * 4);
        for group in buf.chunks_exact(4).skip(1) {
            assert_eq!(group, &buf[..4], "shift splitting must be content independent");
        }
    }

    let idcode = bitstream::read_idcode(&mut jtag)?;
    println!("IDCODE {idcode:#010x}");

    if let Some(path) = std::env::args().nth(2) {
        let bits = std::fs::read(path)?;
        let start = std::time::Instant::now();
        bitstream::upload(&mut jtag, &bits)?;
        println!("bitstream upload: {} ms", start.elapsed().as_millis());
    }

    let mut bus = BusMaster::new(jtag, 1)?;
    let mut rng = StdRng::seed_from_u64(0);

    // Single-word round trips double as a latency benchmark; each iteration
    // should land close to the 0.125 ms USB 2.0 microframe rate.
    let start = std::time::Instant::now();
    let n_rep = 1000;
    memtest::mem_test32(&mut bus, 1, 0x8765_4321, n_rep, &mut rng)?;
    println!(
        "roundtrip time {} ms",
        start.elapsed().as_secs_f64() * 1000.0 / n_rep as f64
    );

    let mem_size = 16384;
    let ram = 0xF000_0000;
    memtest::mem_test8(&mut bus, mem_size, ram, 40, &mut rng)?;
    memtest::mem_test16(&mut bus, mem_size, ram, 20, &mut rng)?;
    memtest::mem_test32(&mut bus, mem_size, ram, 10, &mut rng)?;

    // Reset the margin tracker, then check the margin left after a read.
    bus.query_margin();
    bus.read32(ram, 1, 1)?;
    let margin = bus.query_margin();
    bus.execute()?;
    println!("timing margin: {}", bus.get_u16(margin)?);

    println!("all tests passed");
    Ok(())
}
