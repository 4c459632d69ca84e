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

    tests/common/mod.rs

    Common support routines for tests: in-memory image builders and a
    stand-in for the hardware flux pump on both the read and write sides.
*/
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;

use trackflux::codec::{crc16_ccitt, mfm_to_bin, MFM_TAB};
use trackflux::io::ReadWriteSeek;
use trackflux::ring::BitcellRing;
use trackflux::{Arena, HostProfile, Image, ImageFormat};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn open_mem(
    data: Vec<u8>,
    format: ImageFormat,
    host: HostProfile,
) -> Image<Cursor<Vec<u8>>> {
    let mut arena = Arena::with_capacity(4096);
    Image::open(Cursor::new(data), format, host, &mut arena).expect("open failed")
}

/// Drain `n` raw MFM/FM words from the read ring, refilling via the engine
/// as space frees up.
pub fn pump_read_words<F: ReadWriteSeek>(im: &mut Image<F>, n: usize) -> Vec<u16> {
    let bc = im.read_bc();
    let mut out = Vec::with_capacity(n);
    let mut cons = bc.cons() / 16;
    let mut stalled = 0;
    while out.len() < n {
        im.read_track().expect("read_track failed");
        let prod = bc.prod() / 16;
        stalled = if cons == prod { stalled + 1 } else { 0 };
        assert!(stalled < 64, "engine stalled with {} of {} words", out.len(), n);
        while cons != prod && out.len() < n {
            out.push(bc.word(cons));
            cons += 1;
        }
        bc.publish_cons(cons * 16);
    }
    out
}

pub fn decode_words(words: &[u16]) -> Vec<u8> {
    words.iter().map(|&w| mfm_to_bin(w)).collect()
}

pub fn find_seq(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Feeds raw 16-bit words into the write ring, playing the ISR pump role.
pub struct WordFeeder {
    pub ring: Arc<BitcellRing>,
    pub pos: u32,
}

impl WordFeeder {
    pub fn new(ring: Arc<BitcellRing>) -> Self {
        WordFeeder { ring, pos: 0 }
    }

    pub fn raw(&mut self, w: u16) {
        self.ring.set_word(self.pos, w);
        self.pos += 1;
    }

    /// A plainly-encoded MFM byte. The write path ignores clock bits, so
    /// no cross-word clock suppression is needed here.
    pub fn byte(&mut self, b: u8) {
        self.raw(MFM_TAB[b as usize]);
    }

    pub fn bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.byte(b);
        }
    }

    /// Publish everything fed so far; returns the bitcell count.
    pub fn publish(&self) -> u32 {
        let bits = self.pos * 16;
        self.ring.publish_prod(bits);
        bits
    }
}

/// Feed a full MFM sector write (sync + IDAM + sync + DAM + payload + CRCs)
/// the way a controller would produce it: the leading sync byte of each
/// triple is lost to resynchronization.
pub fn feed_mfm_sector_write(
    feeder: &mut WordFeeder,
    cyl: u8,
    head: u8,
    sec: u8,
    sec_no: u8,
    payload: &[u8],
) {
    // Gap before the header.
    feeder.bytes(&[0x4E; 12]);

    // IDAM: two clean sync words survive.
    feeder.raw(0x4489);
    feeder.raw(0x4489);
    let idam = [0xA1, 0xA1, 0xA1, 0xFE, cyl, head, sec, sec_no];
    feeder.bytes(&idam[3..]);
    let crc = crc16_ccitt(&idam, 0xFFFF);
    feeder.bytes(&[(crc >> 8) as u8, crc as u8]);

    // Gap 2.
    feeder.bytes(&[0x4E; 22]);

    // DAM.
    feeder.raw(0x4489);
    feeder.raw(0x4489);
    feeder.byte(0xFB);
    feeder.bytes(payload);
    let crc = crc16_ccitt(payload, crc16_ccitt(&[0xA1, 0xA1, 0xA1, 0xFB], 0xFFFF));
    feeder.bytes(&[(crc >> 8) as u8, crc as u8]);

    // Trailing gap.
    feeder.bytes(&[0x4E; 16]);
}

/// Minimal single-track HFE builder. `sides` holds 256 bytes per head;
/// the declared bitrate is 250 kbit/s.
pub fn build_hfe(v3: bool, side0: &[u8; 256], side1: &[u8; 256]) -> Vec<u8> {
    let mut f = vec![0xFFu8; 512 * 3];

    // 64-byte header block.
    f[..8].copy_from_slice(if v3 { b"HXCHFEV3" } else { b"HXCPICFE" });
    f[8] = 0; // formatrevision
    f[9] = 1; // nr_tracks
    f[10] = 2; // nr_sides
    f[11] = 0xFF; // track_encoding
    f[12..14].copy_from_slice(&250u16.to_le_bytes()); // bitrate
    f[14..16].copy_from_slice(&0u16.to_le_bytes()); // rpm
    f[16] = 7; // interface_mode: generic shugart
    f[17] = 1; // rsvd
    f[18..20].copy_from_slice(&1u16.to_le_bytes()); // track_list_offset
    f[20] = 0xFF; // write_allowed
    f[21] = 0xFF; // single_step

    // Track LUT block: one track at block 2, 512 bytes (256 per side).
    f[512..514].copy_from_slice(&2u16.to_le_bytes());
    f[514..516].copy_from_slice(&512u16.to_le_bytes());

    // Track data block.
    f[1024..1280].copy_from_slice(side0);
    f[1280..1536].copy_from_slice(side1);
    f
}

/// Feeds raw bytes into the write ring for pre-encoded (HFE) writes.
pub struct ByteFeeder {
    pub ring: Arc<BitcellRing>,
    pub pos: u32,
}

impl ByteFeeder {
    pub fn new(ring: Arc<BitcellRing>) -> Self {
        ByteFeeder { ring, pos: 0 }
    }

    pub fn byte(&mut self, b: u8) {
        self.ring.set_byte(self.pos, b);
        self.pos += 1;
    }

    pub fn publish(&self) -> u32 {
        let bits = self.pos * 8;
        self.ring.publish_prod(bits);
        bits
    }
}
