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

    src/hfe.rs

    HxC Floppy Emulator (HFE) image files, v1 and v3. Tracks are stored as
    raw bitcells, least-significant bit first, in 512-byte blocks that
    interleave 256 bytes of head 0 with 256 bytes of head 1. HFEv3 may
    intersperse opcode bytes (low nibble 0xF, opcode in the bit-reversed
    high nibble): no-op, index mark, bitrate change, bit skip, flaky byte.
*/

use binrw::{binrw, BinRead};
use log::{debug, warn};
use std::time::Instant;

use crate::clock::{stk_sysclk, sysclk_ns, sysclk_us};
use crate::image::{FormatState, Image};
use crate::io::{read_upto, ReadWriteSeek, SeekFrom};
use crate::codec::REVERSE_TABLE;
use crate::{ImageError, SyncMode, MAX_CUSTOM_PULSES};

// HFEv3 opcodes. The 4-bit codes have their bit ordering reversed.
#[allow(dead_code)]
const OP_NOP: u8 = 0; // no effect
const OP_INDEX: u8 = 8; // index mark
const OP_BITRATE: u8 = 4; // +1 byte: new bitrate
const OP_SKIP: u8 = 12; // +1 byte: skip 0-8 bits in next byte
const OP_RAND: u8 = 2; // flaky byte

/// Fields are little endian.
#[binrw]
#[brw(little)]
#[allow(dead_code)]
struct DiskHeader {
    sig: [u8; 8],
    formatrevision: u8,
    nr_tracks: u8,
    nr_sides: u8,
    track_encoding: u8,
    bitrate: u16, // kB/s, approx
    rpm: u16,     // unused, can be zero
    interface_mode: u8,
    rsvd: u8,
    track_list_offset: u16,
    write_allowed: u8,
    single_step: u8,
    t0s0_altencoding: u8,
    t0s0_encoding: u8,
    t0s1_altencoding: u8,
    t0s1_encoding: u8,
}

#[binrw]
#[brw(little)]
struct TrackHeader {
    offset: u16,
    len: u16,
}

#[derive(Debug)]
pub(crate) struct HfeState {
    pub is_v3: bool,
    pub double_step: bool,
    /// Track-LUT position, in 512-byte blocks.
    pub tlut_base: u16,
    /// Current track data position, in 512-byte blocks.
    pub trk_off: u32,
    /// Length of one side of the current track, in bytes.
    pub trk_len: u32,
    /// Byte cursor into the current side.
    pub trk_pos: u32,
    pub batch_secs: u32,
    pub write_start: u32,
    pub write_wrapped: bool,
    /// Read-modify-write batch window, in file bytes relative to the track.
    pub batch_off: u32,
    pub batch_len: u32,
    pub batch_dirty: bool,
    /// Index pulses observed so far this revolution; published to the
    /// handle's exported set at track wrap.
    pub pending_index_pulses: [u32; MAX_CUSTOM_PULSES],
    pub next_index_pulses_pos: usize,
}

fn as_hfe(state: &mut FormatState) -> &mut HfeState {
    match state {
        FormatState::Hfe(hfe) => hfe,
        _ => unreachable!("HFE call on a non-HFE mount"),
    }
}

impl<F: ReadWriteSeek> Image<F> {
    pub(crate) fn hfe_open(&mut self) -> Result<(), ImageError> {
        self.fp.seek(SeekFrom::Start(0))?;
        let hdr = DiskHeader::read(&mut self.fp).map_err(|_| ImageError::UnknownFormat)?;

        let is_v3 = match &hdr.sig {
            b"HXCHFEV3" => {
                if hdr.formatrevision > 0 {
                    return Err(ImageError::UnknownFormat);
                }
                true
            }
            b"HXCPICFE" => {
                if hdr.formatrevision > 1 {
                    return Err(ImageError::UnknownFormat);
                }
                false
            }
            _ => return Err(ImageError::UnknownFormat),
        };

        // Sanity-check the header fields.
        if hdr.nr_tracks == 0 || !(1..=2).contains(&hdr.nr_sides) || hdr.bitrate == 0 {
            return Err(ImageError::UnknownFormat);
        }

        let double_step = hdr.single_step == 0;
        self.state = FormatState::Hfe(HfeState {
            is_v3,
            double_step,
            tlut_base: hdr.track_list_offset,
            trk_off: 0,
            trk_len: 0,
            trk_pos: 0,
            batch_secs: 8,
            write_start: 0,
            write_wrapped: false,
            batch_off: 0,
            batch_len: 0,
            batch_dirty: false,
            pending_index_pulses: [0; MAX_CUSTOM_PULSES],
            next_index_pulses_pos: 0,
        });

        self.nr_cyls = hdr.nr_tracks as u16;
        if double_step {
            self.nr_cyls = (self.nr_cyls * 2).min(255);
        }
        self.nr_sides = hdr.nr_sides;
        self.write_bc_ticks = sysclk_us(500) / hdr.bitrate as u32;
        self.ticks_per_cell = self.write_bc_ticks * 16;
        self.sync = SyncMode::Raw;

        debug!(
            "HFE{}: tracks: {}, sides: {}, bitrate: {}kbit/s{}",
            if is_v3 { "v3" } else { "v1" },
            hdr.nr_tracks,
            hdr.nr_sides,
            hdr.bitrate,
            if double_step { ", double-step" } else { "" }
        );

        // Get an initial value for ticks per revolution.
        self.hfe_seek_track(0)
    }

    fn hfe_seek_track(&mut self, track: u16) -> Result<(), ImageError> {
        let tlut_base = as_hfe(&mut self.state).tlut_base;
        self.fp
            .seek(SeekFrom::Start(tlut_base as u64 * 512 + (track / 2) as u64 * 4))?;
        let thdr = TrackHeader::read(&mut self.fp).map_err(|_| ImageError::UnknownFormat)?;

        let hfe = as_hfe(&mut self.state);
        hfe.trk_off = thdr.offset as u32;
        // Two heads interleave within each 512-byte block.
        hfe.trk_len = thdr.len as u32 / 2;
        self.tracklen_bc = hfe.trk_len * 8;
        self.stk_per_rev = stk_sysclk(self.tracklen_bc * self.write_bc_ticks);
        self.cur_track = track;
        Ok(())
    }

    pub(crate) fn hfe_setup_track(
        &mut self,
        track: u16,
        start_pos: Option<&mut u32>,
    ) -> Result<(), ImageError> {
        let double_step = as_hfe(&mut self.state).double_step;
        let cyl = track >> if double_step { 2 } else { 1 };
        let side = track & (self.nr_sides as u16 - 1);
        let track = cyl * 2 + side;

        if track != self.cur_track {
            self.hfe_seek_track(track)?;
        }

        let mut sys_ticks = match &start_pos {
            Some(p) => **p,
            None => self.wq.current().start,
        };
        self.cur_bc = (sys_ticks * 16) / self.ticks_per_cell;
        if self.cur_bc >= self.tracklen_bc {
            self.cur_bc = 0;
        }
        self.cur_ticks = self.cur_bc * self.ticks_per_cell;
        self.ticks_since_flux = 0;

        sys_ticks = self.cur_ticks / 16;

        self.bufs.read_data.reset();
        self.bufs.read_bc.reset();

        // If there are opcodes (other than random) in the track, seeking is
        // not precise: opcodes contribute zero bitcells, so the track will
        // appear misaligned until it has been read from the beginning.
        // Writes are shifted backward in time the same way.
        let mut i = 0;
        while i < self.index_pulses_len {
            if self.cur_ticks < self.index_pulses[i] {
                break;
            }
            i += 1;
        }
        let exported: [u32; MAX_CUSTOM_PULSES] = self.index_pulses;
        let write_bc_ticks = self.write_bc_ticks;
        let cur_bc = self.cur_bc;
        let hfe = as_hfe(&mut self.state);
        hfe.pending_index_pulses = exported;
        hfe.next_index_pulses_pos = i;

        // Aggressively batch reads at HD data rate; that can be faster than
        // some USB drives will serve up a single block.
        hfe.batch_secs = if write_bc_ticks > sysclk_ns(1500) { 2 } else { 8 };

        if let Some(sp) = start_pos {
            // Read mode.
            hfe.trk_pos = (cur_bc / 8) & !255;
            self.hfe_read_track()?;
            self.bufs.read_bc.publish_cons(cur_bc & 2047);
            *sp = sys_ticks;
        } else {
            // Write mode.
            hfe.trk_pos = cur_bc / 8;
            hfe.write_start = hfe.trk_pos;
            hfe.write_wrapped = false;
            hfe.batch_len = 0;
            hfe.batch_dirty = false;
        }

        Ok(())
    }

    pub(crate) fn hfe_read_track(&mut self) -> Result<bool, ImageError> {
        let Image {
            fp,
            state,
            bufs,
            cur_track,
            ..
        } = self;
        let hfe = as_hfe(state);
        let rd = &mut bufs.read_data;
        let bc = &*bufs.read_bc;

        if rd.prod == rd.cons {
            let nr_sec = hfe
                .batch_secs
                .min((hfe.trk_len + 255 - hfe.trk_pos) / 256);
            fp.seek(SeekFrom::Start(
                hfe.trk_off as u64 * 512 + hfe.trk_pos as u64 * 2,
            ))?;
            read_upto(fp, &mut rd.p[..nr_sec as usize * 512])?;
            rd.cons = 0;
            rd.prod = nr_sec;
            hfe.trk_pos += nr_sec * 256;
            if hfe.trk_pos >= hfe.trk_len {
                hfe.trk_pos = 0;
            }
        }

        // Fill the raw-bitcell ring, selecting this head's half of each
        // 512-byte block.
        let bc_c = bc.cons() / 8;
        let mut bc_p = bc.prod() / 8;
        let bc_space = bc.len_bytes() - bc_p.wrapping_sub(bc_c);

        let mut nr_sec = (rd.prod - rd.cons).min(bc_space / 256);
        if nr_sec == 0 {
            return Ok(false);
        }

        let head_off = (*cur_track as usize & 1) * 256;
        while nr_sec > 0 {
            let src = rd.cons as usize * 512 + head_off;
            for i in 0..256u32 {
                bc.set_byte(bc_p + i, rd.p[src + i as usize]);
            }
            rd.cons += 1;
            bc_p += 256;
            nr_sec -= 1;
        }

        bc.publish_prod(bc_p * 8);

        Ok(true)
    }

    /// Generate flux from pre-encoded bitcells, interpreting v3 opcodes at
    /// byte boundaries. Bits are consumed least-significant first.
    pub(crate) fn hfe_rdata_flux(&mut self, tbuf: &mut [u16]) -> usize {
        let bc = std::sync::Arc::clone(&self.bufs.read_bc);
        let bc_p = bc.prod();
        let mut bc_c = bc.cons();
        let mut ticks_per_cell = self.ticks_per_cell;
        let mut ticks = self.ticks_since_flux;
        let is_v3 = match &self.state {
            FormatState::Hfe(hfe) => hfe.is_v3,
            _ => unreachable!("HFE call on a non-HFE mount"),
        };
        let mut y: u32 = 8;
        let mut todo = tbuf.len();
        let mut out = 0;

        'fill: while bc_p.wrapping_sub(bc_c) >= 3 * 8 {
            debug_assert!(y == 8);
            if self.cur_bc >= self.tracklen_bc {
                debug_assert!(self.cur_bc == self.tracklen_bc);
                self.tracklen_ticks = self.cur_ticks;
                self.cur_bc = 0;
                self.cur_ticks = 0;
                // Skip the tail of the current 256-byte block.
                bc_c = (bc_c + 256 * 8 - 1) & !(256 * 8 - 1);
                self.publish_index_pulses();
                continue;
            }
            y = bc_c % 8;
            let mut x = bc.byte(bc_c / 8) >> y;
            if is_v3 && y == 0 && (x & 0xF) == 0xF {
                // V3 byte-aligned opcode processing.
                match x >> 4 {
                    OP_BITRATE => {
                        let rate = REVERSE_TABLE[bc.byte(bc_c / 8 + 1) as usize] as u32;
                        ticks_per_cell = sysclk_us(2) * 16 * rate / 72;
                        self.ticks_per_cell = ticks_per_cell;
                        self.write_bc_ticks = ticks_per_cell / 16;
                        bc_c += 2 * 8;
                        self.cur_bc += 2 * 8;
                        y = 8;
                        continue;
                    }
                    OP_SKIP => {
                        let skip = (REVERSE_TABLE[bc.byte(bc_c / 8 + 1) as usize] & 7) as u32;
                        bc_c += 2 * 8 + skip;
                        self.cur_bc += 2 * 8 + skip;
                        y = skip;
                        x = bc.byte(bc_c / 8) >> y;
                    }
                    OP_RAND => {
                        x = rand::random();
                    }
                    op => {
                        if op == OP_INDEX {
                            let hfe = as_hfe(&mut self.state);
                            if hfe.next_index_pulses_pos < MAX_CUSTOM_PULSES {
                                hfe.pending_index_pulses[hfe.next_index_pulses_pos] =
                                    self.cur_ticks;
                            }
                            hfe.next_index_pulses_pos += 1;
                        }
                        // OP_NOP and unknown opcodes consume a byte and
                        // contribute no flux.
                        bc_c += 8;
                        self.cur_bc += 8;
                        y = 8;
                        continue;
                    }
                }
            }
            bc_c += 8 - y;
            self.cur_bc += 8 - y;
            self.cur_ticks += (8 - y) * ticks_per_cell;
            while y < 8 {
                y += 1;
                ticks += ticks_per_cell;
                if x & 1 != 0 {
                    tbuf[out] = ((ticks >> 4) - 1) as u16;
                    out += 1;
                    ticks &= 15;
                    todo -= 1;
                    if todo == 0 {
                        break 'fill;
                    }
                }
                x >>= 1;
            }
        }

        bc.publish_cons(bc_c - (8 - y));
        self.cur_bc -= 8 - y;
        self.cur_ticks -= (8 - y) * ticks_per_cell;
        self.ticks_since_flux = ticks;
        out
    }

    /// Publish the revolution's recorded pulses as the exported set,
    /// bumping the version once if anything changed.
    fn publish_index_pulses(&mut self) {
        let (pending, pos) = {
            let hfe = as_hfe(&mut self.state);
            let pos = hfe.next_index_pulses_pos.min(MAX_CUSTOM_PULSES);
            hfe.next_index_pulses_pos = 0;
            (hfe.pending_index_pulses, pos)
        };
        if pos != self.index_pulses_len || self.index_pulses[..pos] != pending[..pos] {
            self.index_pulses[..pos].copy_from_slice(&pending[..pos]);
            self.index_pulses_len = pos;
            self.index_pulses_ver += 1;
        }
    }

    pub(crate) fn hfe_write_track(&mut self) -> Result<bool, ImageError> {
        const BATCH_SECS: u32 = 8;

        let Image {
            fp,
            state,
            bufs,
            wq,
            cur_track,
            ..
        } = self;
        let hfe = as_hfe(state);
        let is_v3 = hfe.is_v3;
        let wr = &*bufs.write_bc;
        let wrbuf = &mut bufs.write_data.p;
        let head_off = (*cur_track as u32 & 1) * 256;

        let write = wq.current();
        let mut flush = wq.flushing();
        let mut c = wr.cons() / 8;
        let mut p = wr.prod() / 8;
        // If we are processing final data then use the end index, rounded
        // to nearest.
        if flush {
            p = (write.bc_end + 4) / 8;
        }

        if hfe.batch_len == 0 {
            debug_assert!(!hfe.batch_dirty);
            // Read-modify-write an aligned window of whole blocks.
            hfe.batch_off = (hfe.trk_pos & !255) << 1;
            hfe.batch_len =
                (BATCH_SECS * 512).min((((hfe.trk_len * 2) + 511) & !511) - hfe.batch_off);
            fp.seek(SeekFrom::Start(hfe.trk_off as u64 * 512 + hfe.batch_off as u64))?;
            read_upto(fp, &mut wrbuf[..hfe.batch_len as usize])?;

            if is_v3 && (hfe.trk_pos & 255) >= 1 {
                // Avoid starting the write in the middle of an opcode. This
                // would most likely occur at the start of the track.
                let wi = (head_off + ((hfe.trk_pos & !255) << 1) - hfe.batch_off
                    + (hfe.trk_pos & 255)) as usize
                    - 1;
                if (hfe.trk_pos & 255) >= 2
                    && wrbuf[wi - 1] & 0xF == 0xF
                    && wrbuf[wi - 1] >> 4 == OP_SKIP
                {
                    hfe.trk_pos += 1;
                }
                if wrbuf[wi] & 0xF == 0xF {
                    match wrbuf[wi] >> 4 {
                        OP_SKIP => hfe.trk_pos += 2,
                        OP_BITRATE => hfe.trk_pos += 1,
                        _ => {}
                    }
                }
            }
        }

        let mut writeback = false;
        loop {
            let off = hfe.trk_pos;

            // All bytes remaining in the raw-bitcell buffer, limited to the
            // end of the current 256-byte block and of the track.
            let mut nr = p.wrapping_sub(c);
            nr = nr.min(256 - (off & 255));
            nr = nr.min(hfe.trk_len - off);
            if nr == 0 {
                break;
            }

            // Bail if the required window is not buffered.
            let block_off = (off & !255) << 1;
            if block_off < hfe.batch_off || block_off >= hfe.batch_off + hfe.batch_len {
                writeback = true;
                break;
            }

            // Encode into the batch buffer for later write-out, preserving
            // v3 opcodes (and their operands) except flaky bytes.
            let mut wi = (head_off + block_off - hfe.batch_off + (off & 255)) as usize;
            let mut i = 0;
            while i < nr {
                let b = wrbuf[wi];
                if is_v3 && b & 0xF == 0xF && b >> 4 != OP_RAND {
                    let skip = match b >> 4 {
                        // Skipped bits are unlikely to matter; the bitrate
                        // is assumed constant for the whole track and was
                        // already applied while reading.
                        OP_SKIP => 2,
                        OP_BITRATE => 1,
                        _ => 0,
                    };
                    wi += 1 + skip;
                    i += 1 + skip as u32;
                    continue;
                }
                wrbuf[wi] = REVERSE_TABLE[wr.byte(c) as usize];
                wi += 1;
                c += 1;
                i += 1;
            }
            hfe.batch_dirty = true;

            hfe.trk_pos += i; // may exceed nr due to truncated opcodes
            if hfe.trk_pos >= hfe.trk_len {
                assert!(hfe.trk_pos - hfe.trk_len <= 2, "write ran past track end");
                hfe.trk_pos = 0;
                hfe.write_wrapped = true;
            }
        }

        if writeback {
            // More data than the window holds: ensure we get called again.
            flush = false;
        } else if flush {
            // Final call: push the window out.
            writeback = true;
        }

        if writeback && hfe.batch_dirty {
            let t = Instant::now();
            fp.seek(SeekFrom::Start(hfe.trk_off as u64 * 512 + hfe.batch_off as u64))?;
            fp.write_all(&wrbuf[..hfe.batch_len as usize])?;
            debug!(
                "HFE write {}-{} ({}): {} us",
                hfe.batch_off,
                hfe.batch_off + hfe.batch_len - 1,
                hfe.batch_len,
                t.elapsed().as_micros()
            );
            hfe.batch_len = 0;
            hfe.batch_dirty = false;
        }

        if flush && hfe.write_wrapped && hfe.trk_pos > hfe.write_start {
            warn!("HFE write wrapped ({} > {})", hfe.trk_pos, hfe.write_start);
        }

        wr.publish_cons(c * 8);

        Ok(flush)
    }
}
