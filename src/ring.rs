/*
    TrackFlux
    https://github.com/dbalsom/trackflux

    Copyright 2024 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/ring.rs

    Single-producer/single-consumer buffers shared between the track engine
    and the flux pump. Producer counters are published with Release stores
    after the element stores; consumers load them with Acquire. Counters are
    monotonic and count bitcells; lengths are powers of two.
*/

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Engine-private staging buffer with chunk-granular prod/cons counters.
/// Not shared with the pump; no atomics needed.
#[derive(Debug)]
pub struct DataBuf {
    pub p: Box<[u8]>,
    pub prod: u32,
    pub cons: u32,
}

impl DataBuf {
    pub fn new(len: usize) -> Self {
        DataBuf {
            p: vec![0u8; len].into_boxed_slice(),
            prod: 0,
            cons: 0,
        }
    }

    pub fn reset(&mut self) {
        self.prod = 0;
        self.cons = 0;
    }
}

/// Lock-free SPSC ring of raw bitcells. Element storage is byte-granular;
/// the IMG codec views it as big-endian 16-bit words, the HFE engine as a
/// byte stream. `prod`/`cons` count bitcells (bits), not bytes.
#[derive(Debug)]
pub struct BitcellRing {
    buf: Box<[AtomicU8]>,
    prod: AtomicU32,
    cons: AtomicU32,
}

impl BitcellRing {
    pub fn new(len_bytes: usize) -> Self {
        assert!(len_bytes.is_power_of_two());
        BitcellRing {
            buf: (0..len_bytes).map(|_| AtomicU8::new(0)).collect(),
            prod: AtomicU32::new(0),
            cons: AtomicU32::new(0),
        }
    }

    pub fn len_bytes(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn len_words(&self) -> u32 {
        self.len_bytes() / 2
    }

    /// Producer position in bitcells.
    pub fn prod(&self) -> u32 {
        self.prod.load(Ordering::Acquire)
    }

    /// Consumer position in bitcells.
    pub fn cons(&self) -> u32 {
        self.cons.load(Ordering::Acquire)
    }

    /// Publish the producer counter after all element stores.
    pub fn publish_prod(&self, bitcells: u32) {
        self.prod.store(bitcells, Ordering::Release);
    }

    pub fn publish_cons(&self, bitcells: u32) {
        self.cons.store(bitcells, Ordering::Release);
    }

    pub fn reset(&self) {
        self.prod.store(0, Ordering::Release);
        self.cons.store(0, Ordering::Release);
    }

    pub fn byte(&self, index: u32) -> u8 {
        self.buf[(index & (self.len_bytes() - 1)) as usize].load(Ordering::Relaxed)
    }

    pub fn set_byte(&self, index: u32, v: u8) {
        self.buf[(index & (self.len_bytes() - 1)) as usize].store(v, Ordering::Relaxed);
    }

    /// Big-endian 16-bit word at word `index`: the high byte is earlier in
    /// time, and the most significant bit of each byte is the first bitcell.
    pub fn word(&self, index: u32) -> u16 {
        let i = (index & (self.len_words() - 1)) * 2;
        (self.byte(i) as u16) << 8 | self.byte(i + 1) as u16
    }

    pub fn set_word(&self, index: u32, v: u16) {
        let i = (index & (self.len_words() - 1)) * 2;
        self.set_byte(i, (v >> 8) as u8);
        self.set_byte(i + 1, v as u8);
    }
}

pub const MAX_WRITES: usize = 4;

#[derive(Copy, Clone, Debug, Default)]
pub struct WriteDesc {
    /// System-tick timestamp at which the write gate asserted.
    pub start: u32,
    /// Final bitcell count captured into the write ring, valid once the
    /// descriptor has been closed by the pump.
    pub bc_end: u32,
}

/// SPSC queue of write-window descriptors. The pump opens a descriptor when
/// the write gate asserts (`begin`), closes it when the gate deasserts
/// (`end`); the engine drains closed descriptors (`retire`) after the final
/// batch of decoded data has been consumed.
#[derive(Debug)]
pub struct WriteQueue {
    start: [AtomicU32; MAX_WRITES],
    bc_end: [AtomicU32; MAX_WRITES],
    prod: AtomicU32,
    bc: AtomicU32,
    cons: AtomicU32,
}

impl WriteQueue {
    pub fn new() -> Self {
        WriteQueue {
            start: std::array::from_fn(|_| AtomicU32::new(0)),
            bc_end: std::array::from_fn(|_| AtomicU32::new(0)),
            prod: AtomicU32::new(0),
            bc: AtomicU32::new(0),
            cons: AtomicU32::new(0),
        }
    }

    /// Pump side: open a descriptor.
    pub fn begin(&self, start_ticks: u32) {
        let i = self.prod.load(Ordering::Relaxed);
        self.start[i as usize & (MAX_WRITES - 1)].store(start_ticks, Ordering::Relaxed);
        self.prod.store(i.wrapping_add(1), Ordering::Release);
    }

    /// Pump side: close the oldest open descriptor with its end position.
    pub fn end(&self, bc_end: u32) {
        let i = self.bc.load(Ordering::Relaxed);
        self.bc_end[i as usize & (MAX_WRITES - 1)].store(bc_end, Ordering::Relaxed);
        self.bc.store(i.wrapping_add(1), Ordering::Release);
    }

    /// Engine side: the descriptor currently being drained.
    pub fn current(&self) -> WriteDesc {
        let i = self.cons.load(Ordering::Relaxed) as usize & (MAX_WRITES - 1);
        WriteDesc {
            start: self.start[i].load(Ordering::Acquire),
            bc_end: self.bc_end[i].load(Ordering::Acquire),
        }
    }

    /// True once the pump has closed the current descriptor: this is a
    /// flushing call and `bc_end` is final.
    pub fn flushing(&self) -> bool {
        self.cons.load(Ordering::Relaxed) != self.bc.load(Ordering::Acquire)
    }

    /// True while any descriptor is open or closed but not yet retired.
    pub fn pending(&self) -> bool {
        self.cons.load(Ordering::Relaxed) != self.prod.load(Ordering::Acquire)
    }

    pub fn retire(&self) {
        self.cons.fetch_add(1, Ordering::Release);
    }

    pub fn reset(&self) {
        self.prod.store(0, Ordering::Release);
        self.bc.store(0, Ordering::Release);
        self.cons.store(0, Ordering::Release);
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}
