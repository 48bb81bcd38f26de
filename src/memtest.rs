//! Randomized write/read-back self tests against a memory region behind the
//! bus bridge.
//!
//! Each iteration splits the region into random contiguous segments, writes
//! them in one random order and reads them back in another, all batched into
//! a single execute, then compares word for word.  The generator is passed
//! in so runs are reproducible.
use rand::seq::SliceRandom;
use rand::Rng;

use crate::bus::BusMaster;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Split `mem_size` words into randomly-sized contiguous segments in random
/// order.  Returns `(word offset, word count)` pairs covering the region
/// exactly once.
fn segmentize(mem_size: usize, rng: &mut impl Rng) -> Vec<(u32, usize)> {
    let mut lens = Vec::new();
    let mut rem = mem_size;
    while rem > 0 {
        let n = rng.gen_range(1..=rem);
        lens.push(n);
        rem -= n;
    }
    lens.shuffle(rng);

    let mut segs = Vec::with_capacity(lens.len());
    let mut offset = 0u32;
    for n in lens {
        segs.push((offset, n));
        offset += n as u32;
    }
    segs
}

fn mismatch(width: u8, ix: usize, wrote: u32, read: u32) -> Error {
    Error::ProtocolDesync(format!(
        "memtest{width} mismatch at word {ix}: wrote {wrote:#x}, read {read:#x}"
    ))
}

pub fn mem_test8<T: Transport>(
    bus: &mut BusMaster<T>,
    mem_size: usize,
    base_addr: u32,
    n_iter: usize,
    rng: &mut impl Rng,
) -> Result<()> {
    for _ in 0..n_iter {
        let wr: Vec<u8> = (0..mem_size).map(|_| rng.gen()).collect();
        let segs = segmentize(mem_size, rng);
        let mut order: Vec<usize> = (0..segs.len()).collect();

        order.shuffle(rng);
        for &s in &order {
            let (o, n) = segs[s];
            bus.write8(base_addr.wrapping_add(o), &wr[o as usize..o as usize + n], 1)?;
        }

        order.shuffle(rng);
        let mut handles = Vec::with_capacity(order.len());
        for &s in &order {
            let (o, n) = segs[s];
            handles.push(bus.read8(base_addr.wrapping_add(o), n, 1)?);
        }

        bus.execute()?;

        let mut rd = vec![0u8; mem_size];
        for (h, &s) in handles.iter().zip(&order) {
            let (o, n) = segs[s];
            rd[o as usize..o as usize + n].copy_from_slice(&bus.get_u8s(*h, n)?);
        }
        for (ix, (w, r)) in wr.iter().zip(&rd).enumerate() {
            if w != r {
                return Err(mismatch(8, ix, u32::from(*w), u32::from(*r)));
            }
        }
    }
    Ok(())
}

pub fn mem_test16<T: Transport>(
    bus: &mut BusMaster<T>,
    mem_size: usize,
    base_addr: u32,
    n_iter: usize,
    rng: &mut impl Rng,
) -> Result<()> {
    for _ in 0..n_iter {
        let wr: Vec<u16> = (0..mem_size).map(|_| rng.gen()).collect();
        let segs = segmentize(mem_size, rng);
        let mut order: Vec<usize> = (0..segs.len()).collect();

        order.shuffle(rng);
        for &s in &order {
            let (o, n) = segs[s];
            bus.write16(base_addr.wrapping_add(o), &wr[o as usize..o as usize + n], 1)?;
        }

        order.shuffle(rng);
        let mut handles = Vec::with_capacity(order.len());
        for &s in &order {
            let (o, n) = segs[s];
            handles.push(bus.read16(base_addr.wrapping_add(o), n, 1)?);
        }

        bus.execute()?;

        let mut rd = vec![0u16; mem_size];
        for (h, &s) in handles.iter().zip(&order) {
            let (o, n) = segs[s];
            rd[o as usize..o as usize + n].copy_from_slice(&bus.get_u16s(*h, n)?);
        }
        for (ix, (w, r)) in wr.iter().zip(&rd).enumerate() {
            if w != r {
                return Err(mismatch(16, ix, u32::from(*w), u32::from(*r)));
            }
        }
    }
    Ok(())
}

pub fn mem_test32<T: Transport>(
    bus: &mut BusMaster<T>,
    mem_size: usize,
    base_addr: u32,
    n_iter: usize,
    rng: &mut impl Rng,
) -> Result<()> {
    for _ in 0..n_iter {
        let wr: Vec<u32> = (0..mem_size).map(|_| rng.gen()).collect();
        let segs = segmentize(mem_size, rng);
        let mut order: Vec<usize> = (0..segs.len()).collect();

        order.shuffle(rng);
        for &s in &order {
            let (o, n) = segs[s];
            bus.write32(base_addr.wrapping_add(o), &wr[o as usize..o as usize + n], 1)?;
        }

        order.shuffle(rng);
        let mut handles = Vec::with_capacity(order.len());
        for &s in &order {
            let (o, n) = segs[s];
            handles.push(bus.read32(base_addr.wrapping_add(o), n, 1)?);
        }

        bus.execute()?;

        let mut rd = vec![0u32; mem_size];
        for (h, &s) in handles.iter().zip(&order) {
            let (o, n) = segs[s];
            rd[o as usize..o as usize + n].copy_from_slice(&bus.get_u32s(*h, n)?);
        }
        for (ix, (w, r)) in wr.iter().zip(&rd).enumerate() {
            if w != r {
                return Err(mismatch(32, ix, *w, *r));
            }
        }
    }
    Ok(())
}
