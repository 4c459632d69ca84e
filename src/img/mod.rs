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

    src/img/mod.rs

    Sector images for IBM/ISO track formats. The track is synthesized on
    the fly: a monotonic phase counter walks GAP4A/IAM, then four phases
    per sector (IDAM, DAM, DATA, post-data) in rotational order, then the
    pre-index gap. The write path scans the incoming bitcell stream for
    sync words, re-locks to a sector on a valid IDAM, and commits decoded
    sector payloads back to the image file.
*/

pub mod probe;
pub mod types;

use std::time::Instant;

use log::{debug, warn};

pub use types::ImgType;

use crate::arena::Arena;
use crate::clock::{stk_ms, sysclk_ms, sysclk_stk};
use crate::codec::{
    crc16_ccitt, fm_encode_byte, fm_sync, mfm_to_bin, FM_SYNC_CLK, MFM_SYNC_A1, MFM_SYNC_C2,
    MFM_TAB,
};
use crate::image::{FormatState, Image};
use crate::io::{stream_len, ReadWriteSeek, SeekFrom};
use crate::ring::{BitcellRing, DataBuf};
use crate::{HostProfile, ImageError, SyncMode, MAX_SECTORS};

// MFM gap sizes in bytes.
const GAP_1: u32 = 50; // Post-IAM
const GAP_2: u32 = 22; // Post-IDAM
const GAP_4A: u32 = 80; // Post-Index
const GAP_SYNC: u32 = 12;

// 8271 mini-diskette values.
const FM_GAP_2: u32 = 11;
const FM_GAP_4A: u32 = 16;
const FM_GAP_SYNC: u32 = 6;

/// Extra bitcells granted to tracks whose encoded layout exceeds the
/// nominal length ("long track"). May need calibration per drive.
const LONG_TRACK_SLACK: u32 = 100;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) enum ImgLayout {
    /// Cylinder-major, head-interleaved: the common case.
    #[default]
    Interleaved,
    /// As above with the head order swapped within each cylinder.
    InterleavedSwapSides,
    /// Side 0 forward then side 1 in reverse cylinder order (TI-99).
    SequentialReverseSide1,
}

/// Per-mount geometry and per-track position state for sector images.
#[derive(Debug)]
pub(crate) struct ImgState {
    // Geometry, fixed after open.
    pub sec_no: u8,
    pub nr_sectors: u8,
    pub interleave: u8,
    pub skew: u8,
    pub skew_cyls_only: bool,
    pub sec_base: [u8; 2],
    pub has_iam: bool,
    pub post_crc_syncs: u8,
    pub gap_2: u8,
    pub gap_3: u8,
    pub gap_4a: u8,
    pub gap_4: u32,
    pub idx_sz: u32,
    pub idam_sz: u32,
    pub dam_sz_pre: u32,
    pub dam_sz_post: u32,
    /// Raw bitcell rate in kcells/s: 250 SD, 500 DD, 1000 HD, 2000 ED.
    pub data_rate: u32,
    pub rpm: u32,
    pub base_off: u32,
    pub layout: ImgLayout,

    // Per-track state, rebuilt on seek.
    pub trk_off: u64,
    pub sec_map: [u8; MAX_SECTORS],
    pub trk_sec: u8,
    pub rd_sec_pos: u32,
    pub decode_pos: i32,
    pub decode_data_pos: u32,
    pub crc: u16,
    pub mfm_carry: bool,
    /// -2 ignore, -1 unknown, else logical sector index.
    pub write_sector: i32,
}

impl Default for ImgState {
    fn default() -> Self {
        ImgState {
            sec_no: 0,
            nr_sectors: 0,
            interleave: 0,
            skew: 0,
            skew_cyls_only: false,
            sec_base: [0; 2],
            has_iam: false,
            post_crc_syncs: 0,
            gap_2: 0,
            gap_3: 0,
            gap_4a: 0,
            gap_4: 0,
            idx_sz: 0,
            idam_sz: 0,
            dam_sz_pre: 0,
            dam_sz_post: 0,
            data_rate: 0,
            rpm: 0,
            base_off: 0,
            layout: ImgLayout::default(),
            trk_off: 0,
            sec_map: [0xFF; MAX_SECTORS],
            trk_sec: 0,
            rd_sec_pos: 0,
            decode_pos: 0,
            decode_data_pos: 0,
            crc: 0xFFFF,
            mfm_carry: false,
            write_sector: -1,
        }
    }
}

pub(crate) fn sec_sz(sec_no: u8) -> u32 {
    128 << sec_no
}

impl ImgState {
    pub(crate) fn enc_sec_sz(&self) -> u32 {
        self.idam_sz + self.dam_sz_pre + sec_sz(self.sec_no) + self.dam_sz_post
    }

    /// Shrink the IDAM pre-sync gap if sectors are close together.
    fn idam_gap_sync(&self) -> u32 {
        (self.gap_3 as u32).min(GAP_SYNC)
    }
}

fn as_img(state: &mut FormatState) -> &mut ImgState {
    match state {
        FormatState::Img(img) => img,
        _ => unreachable!("sector-image call on a non-IMG mount"),
    }
}

/// MFM word emitter with the clock-suppression carry: the leading clock of
/// a word is masked when the previous word's final data bit was one.
struct MfmEmitter<'a> {
    bc: &'a BitcellRing,
    pos: u32,
    prev: bool,
}

impl MfmEmitter<'_> {
    fn raw(&mut self, w: u16) {
        self.bc.set_word(self.pos, w & !((self.prev as u16) << 15));
        self.pos += 1;
        self.prev = w & 1 != 0;
    }

    fn byte(&mut self, b: u8) {
        self.raw(MFM_TAB[b as usize]);
    }
}

struct FmEmitter<'a> {
    bc: &'a BitcellRing,
    pos: u32,
}

impl FmEmitter<'_> {
    fn raw(&mut self, w: u16) {
        self.bc.set_word(self.pos, w);
        self.pos += 1;
    }

    fn byte(&mut self, b: u8) {
        self.raw(fm_encode_byte(b));
    }
}

/// Pull the next 1 KiB (or remainder) of the upcoming sector into the
/// staging buffer, walking the rotational map.
fn fetch_data<F: ReadWriteSeek>(
    fp: &mut F,
    img: &mut ImgState,
    rd: &mut DataBuf,
    head: usize,
) -> Result<(), ImageError> {
    if rd.prod != rd.cons {
        return Ok(());
    }

    let sec = (img.sec_map[img.trk_sec as usize] - img.sec_base[head]) as u32;
    let off = sec * sec_sz(img.sec_no) + img.rd_sec_pos * 1024;
    let mut len = sec_sz(img.sec_no) - img.rd_sec_pos * 1024;

    if len > 1024 {
        len = 1024;
        img.rd_sec_pos += 1;
    } else {
        img.rd_sec_pos = 0;
        img.trk_sec += 1;
        if img.trk_sec >= img.nr_sectors {
            img.trk_sec = 0;
        }
    }

    fp.seek(SeekFrom::Start(img.trk_off + off as u64))?;
    fp.read_exact(&mut rd.p[..len as usize])?;

    rd.prod += 1;
    Ok(())
}

impl<F: ReadWriteSeek> Image<F> {
    pub(crate) fn img(&self) -> &ImgState {
        match &self.state {
            FormatState::Img(img) => img,
            _ => unreachable!("sector-image call on a non-IMG mount"),
        }
    }

    pub(crate) fn img_mut(&mut self) -> &mut ImgState {
        as_img(&mut self.state)
    }

    pub(crate) fn reset_img(&mut self) {
        self.state = FormatState::Img(ImgState::default());
    }

    /// Image payload size: file size less any header prefix.
    pub(crate) fn im_size(&mut self) -> Result<u64, ImageError> {
        let base_off = self.img().base_off as u64;
        Ok(stream_len(&mut self.fp)?.saturating_sub(base_off))
    }

    /*
     * Openers
     */

    pub(crate) fn img_open(&mut self) -> Result<(), ImageError> {
        match self.host {
            HostProfile::Msx => {
                let r = self.msx_open();
                self.fall_back_to_default(r)
            }
            HostProfile::PcDos => {
                let r = self.pc_dos_open();
                self.fall_back_to_default(r)
            }
            HostProfile::Ti99 => self.ti99_open(),
            HostProfile::Uknc => {
                let img = self.img_mut();
                img.gap_2 = 24;
                img.gap_4a = 27;
                img.post_crc_syncs = 1;
                self.generic_open(types::UKNC_TYPES)
            }
            HostProfile::Nascom => {
                self.img_mut().skew_cyls_only = true;
                let r = self.generic_open(types::NASCOM_TYPES);
                self.fall_back_to_default(r)
            }
            HostProfile::Default => self.generic_open(types::DEFAULT_TYPES),
            host => {
                let r = self.generic_open(types::host_types(host));
                self.fall_back_to_default(r)
            }
        }
    }

    /// Retry the default geometry list after a host-specific strategy
    /// rejects. Real I/O failures are not retried.
    fn fall_back_to_default(&mut self, r: Result<(), ImageError>) -> Result<(), ImageError> {
        match r {
            Err(ImageError::UnknownFormat) => {
                self.reset_img();
                self.generic_open(types::DEFAULT_TYPES)
            }
            r => r,
        }
    }

    pub(crate) fn adfs_open(&mut self) -> Result<(), ImageError> {
        self.img_mut().skew_cyls_only = true;
        self.generic_open(types::ADFS_TYPES)
    }

    pub(crate) fn d81_open(&mut self) -> Result<(), ImageError> {
        self.img_mut().layout = ImgLayout::InterleavedSwapSides;
        self.generic_open(types::D81_TYPES)
    }

    pub(crate) fn mbd_open(&mut self) -> Result<(), ImageError> {
        self.generic_open(types::MBD_TYPES)
    }

    pub(crate) fn mgt_open(&mut self) -> Result<(), ImageError> {
        self.generic_open(types::DEFAULT_TYPES)
    }

    /// Atari ST: the default 80-cylinder geometries with the IAM
    /// suppressed; TOS formats 720kB disks with skew.
    pub(crate) fn st_open(&mut self, arena: &mut Arena) -> Result<(), ImageError> {
        let eighty = || types::DEFAULT_TYPES.iter().filter(|ty| ty.cyls == 80);
        let st: &mut [ImgType] = arena.alloc_slice(eighty().count());
        for (out, ty) in st.iter_mut().zip(eighty()) {
            *out = *ty;
            out.has_iam = 0;
            if out.nr_secs == 9 {
                out.skew = 2;
            }
        }
        self.generic_open(st)
    }

    /// Walk a geometry hint table looking for a match on file size, then
    /// hand the matched geometry to the MFM track builder.
    pub(crate) fn generic_open(&mut self, types: &[ImgType]) -> Result<(), ImageError> {
        let payload = self.im_size()?;
        let m = types::match_image_size(types, payload).ok_or(ImageError::UnknownFormat)?;

        self.nr_cyls = m.nr_cyls;
        self.nr_sides = m.nr_sides;
        let img = self.img_mut();
        img.sec_no = m.ty.sec_no;
        img.interleave = m.ty.interleave;
        img.skew = m.ty.skew;
        img.nr_sectors = m.ty.nr_secs;
        img.gap_3 = m.ty.gap3;
        img.rpm = m.ty.rpm as u32;
        img.sec_base = [m.ty.base, m.ty.base];
        if m.ty.inter_track_numbering != 0 {
            img.sec_base[1] += m.ty.nr_secs;
        }
        img.has_iam = m.ty.has_iam != 0;

        self.mfm_open()
    }

    fn check_geometry(&self) -> Result<(), ImageError> {
        let img = self.img();
        if !(1..=2).contains(&self.nr_sides)
            || !(1..=254).contains(&self.nr_cyls)
            || img.nr_sectors < 1
            || img.nr_sectors as usize > MAX_SECTORS
            || img.sec_no > 6
        {
            return Err(ImageError::InvalidGeometry);
        }
        Ok(())
    }

    /*
     * Track-geometry builders
     */

    pub(crate) fn mfm_open(&mut self) -> Result<(), ImageError> {
        const GAP_3_BY_NO: [u8; 8] = [32, 54, 84, 116, 255, 255, 255, 255];

        self.check_geometry()?;

        let Image {
            state,
            stk_per_rev,
            tracklen_bc,
            ticks_per_cell,
            write_bc_ticks,
            sync,
            ..
        } = self;
        let img = as_img(state);

        if img.rpm == 0 {
            img.rpm = 300;
        }
        if img.gap_2 == 0 {
            img.gap_2 = GAP_2 as u8;
        }
        if img.gap_3 == 0 {
            img.gap_3 = GAP_3_BY_NO[img.sec_no as usize];
        }
        if img.gap_4a == 0 {
            img.gap_4a = GAP_4A as u8;
        }

        *stk_per_rev = stk_ms(200) * 300 / img.rpm;

        img.idx_sz = img.gap_4a as u32;
        if img.has_iam {
            img.idx_sz += GAP_SYNC + 4 + GAP_1;
        }
        img.idam_sz = img.idam_gap_sync() + 8 + 2 + img.gap_2 as u32;
        img.dam_sz_pre = GAP_SYNC + 4;
        img.dam_sz_post = 2 + img.gap_3 as u32;

        img.idam_sz += img.post_crc_syncs as u32;
        img.dam_sz_post += img.post_crc_syncs as u32;

        // Minimum track length, with no pre-index track gap.
        let mut tracklen = (img.enc_sec_sz() * img.nr_sectors as u32 + img.idx_sz) * 16;

        // Infer the bitcell rate and hence the standard track length.
        let mut i = 0;
        while i < 3 {
            // SD=0, DD=1, HD=2, ED=3
            let maxlen = ((50_000 * 300 / img.rpm) << i) + 5_000;
            if tracklen < maxlen {
                break;
            }
            i += 1;
        }
        img.data_rate = 250 << i; // SD=250, DD=500, HD=1000, ED=2000
        *tracklen_bc = img.data_rate * 200 * 300 / img.rpm;

        // Does the track data fit within the standard track length?
        if *tracklen_bc < tracklen {
            if tracklen - img.gap_4a as u32 * 16 <= *tracklen_bc {
                // Eliminating the post-index gap 4a suffices.
                tracklen -= img.gap_4a as u32 * 16;
                img.idx_sz -= img.gap_4a as u32;
                img.gap_4a = 0;
            } else {
                // Extend the track length ("long track").
                *tracklen_bc = tracklen + LONG_TRACK_SLACK;
            }
        }

        // Round the track length up to a multiple of 32 bitcells.
        *tracklen_bc = (*tracklen_bc + 31) & !31;

        *ticks_per_cell = sysclk_stk(*stk_per_rev) * 16 / *tracklen_bc;
        img.gap_4 = (*tracklen_bc - tracklen) / 16;

        *write_bc_ticks = sysclk_ms(1) / img.data_rate;

        *sync = SyncMode::Mfm;

        self.dump_info();

        Ok(())
    }

    pub(crate) fn fm_open(&mut self) -> Result<(), ImageError> {
        const FM_GAP_3_BY_NO: [u8; 8] = [27, 42, 58, 138, 255, 255, 255, 255];

        self.check_geometry()?;

        let Image {
            state,
            stk_per_rev,
            tracklen_bc,
            ticks_per_cell,
            write_bc_ticks,
            sync,
            ..
        } = self;
        let img = as_img(state);

        if img.rpm == 0 {
            img.rpm = 300;
        }
        if img.gap_2 == 0 {
            img.gap_2 = FM_GAP_2 as u8;
        }
        if img.gap_3 == 0 {
            img.gap_3 = FM_GAP_3_BY_NO[img.sec_no as usize];
        }
        if img.gap_4a == 0 {
            img.gap_4a = FM_GAP_4A as u8;
        }

        *stk_per_rev = stk_ms(200) * 300 / img.rpm;

        img.idx_sz = img.gap_4a as u32;
        img.idam_sz = FM_GAP_SYNC + 5 + 2 + img.gap_2 as u32;
        img.dam_sz_pre = FM_GAP_SYNC + 1;
        img.dam_sz_post = 2 + img.gap_3 as u32;

        // Minimum track length, with no pre-index track gap.
        let tracklen = (img.enc_sec_sz() * img.nr_sectors as u32 + img.idx_sz) * 16;

        // Data rate is always SD.
        img.data_rate = 250;
        *tracklen_bc = img.data_rate * 200 * 300 / img.rpm;

        if *tracklen_bc <= tracklen {
            return Err(ImageError::InvalidGeometry);
        }

        // Round the track length up to a multiple of 32 bitcells.
        *tracklen_bc = (*tracklen_bc + 31) & !31;

        *ticks_per_cell = sysclk_stk(*stk_per_rev) * 16 / *tracklen_bc;
        img.gap_4 = (*tracklen_bc - tracklen) / 16;

        *write_bc_ticks = sysclk_ms(1) / img.data_rate;

        *sync = SyncMode::Fm;

        self.dump_info();

        Ok(())
    }

    fn dump_info(&self) {
        let img = self.img();
        debug!(
            "{} {}-{}-{}: rpm: {}, tracklen: {}, datarate: {}",
            self.sync, self.nr_cyls, self.nr_sides, img.nr_sectors, img.rpm, self.tracklen_bc,
            img.data_rate
        );
        debug!(
            " gap2: {}, gap3: {}, gap4a: {}, gap4: {}, ticks_per_cell: {}, write_bc_ticks: {}, has_iam: {}",
            img.gap_2, img.gap_3, img.gap_4a, img.gap_4, self.ticks_per_cell, self.write_bc_ticks,
            img.has_iam
        );
    }

    /*
     * Track position
     */

    fn img_seek_track(&mut self, track: u16, cyl: u16, side: u8) {
        let Image {
            state,
            nr_cyls,
            nr_sides,
            cur_track,
            ..
        } = self;
        let img = as_img(state);

        *cur_track = track;

        // Create the logical sector map in rotational order.
        let n = img.nr_sectors as u32;
        let trk = cyl as u32 * *nr_sides as u32 + side as u32;
        img.sec_map = [0xFF; MAX_SECTORS];
        let skew_unit = if img.skew_cyls_only { cyl as u32 } else { trk };
        let mut pos = (skew_unit * img.skew as u32) % n;
        let base = img.sec_base[(track & (*nr_sides as u16 - 1)) as usize];
        for i in 0..n {
            while img.sec_map[pos as usize] != 0xFF {
                pos = (pos + 1) % n;
            }
            img.sec_map[pos as usize] = i as u8 + base;
            pos = (pos + img.interleave as u32) % n;
        }

        let trk_len = img.nr_sectors as u64 * sec_sz(img.sec_no) as u64;
        img.trk_off = match img.layout {
            ImgLayout::SequentialReverseSide1 => {
                let seq = if side != 0 {
                    2 * *nr_cyls as u64 - cyl as u64 - 1
                } else {
                    cyl as u64
                };
                seq * trk_len
            }
            ImgLayout::InterleavedSwapSides => (trk ^ (*nr_sides as u32 - 1)) as u64 * trk_len,
            ImgLayout::Interleaved => trk as u64 * trk_len,
        };
        img.trk_off += img.base_off as u64;
    }

    /// Invert the phase layout to recover the decode state for an
    /// arbitrary bitcell position within the track. Returns the byte
    /// offset into the recovered phase.
    fn calc_start_pos(&mut self) -> u32 {
        let Image { state, cur_bc, .. } = self;
        let img = as_img(state);

        img.crc = 0xFFFF;
        img.trk_sec = 0;
        img.rd_sec_pos = 0;
        img.decode_data_pos = 0;

        let mut decode_off = *cur_bc / 16;
        if decode_off < img.idx_sz {
            // Post-index track gap.
            img.decode_pos = 0;
        } else {
            let ess = img.enc_sec_sz();
            decode_off -= img.idx_sz;
            let sec = decode_off / ess;
            if sec < img.nr_sectors as u32 {
                // IDAM
                img.trk_sec = sec as u8;
                img.decode_pos = sec as i32 * 4 + 1;
                decode_off -= sec * ess;
                if decode_off >= img.idam_sz {
                    // DAM
                    decode_off -= img.idam_sz;
                    img.decode_pos += 1;
                    if decode_off >= img.dam_sz_pre {
                        // Data or post-data
                        decode_off -= img.dam_sz_pre;
                        img.decode_pos += 1;
                        if decode_off < sec_sz(img.sec_no) {
                            // Data
                            img.rd_sec_pos = decode_off / 1024;
                            img.decode_data_pos = img.rd_sec_pos;
                            decode_off %= 1024;
                        } else {
                            // Post-data; start fetch at the next sector.
                            decode_off -= sec_sz(img.sec_no);
                            img.decode_pos += 1;
                            img.trk_sec = (img.trk_sec + 1) % img.nr_sectors;
                        }
                    }
                }
            } else {
                // Pre-index track gap.
                decode_off -= img.nr_sectors as u32 * ess;
                img.decode_pos = img.nr_sectors as i32 * 4 + 1;
                img.decode_data_pos = decode_off / 1024;
                decode_off %= 1024;
            }
        }

        decode_off
    }

    pub(crate) fn img_setup_track(
        &mut self,
        track: u16,
        start_pos: Option<&mut u32>,
    ) -> Result<(), ImageError> {
        let cyl = (track / 2).min(self.nr_cyls - 1);
        let side = ((track & 1) as u8).min(self.nr_sides - 1);
        let track = cyl * 2 + side as u16;

        if track != self.cur_track {
            self.img_seek_track(track, cyl, side);
        }

        {
            let img = self.img_mut();
            img.write_sector = -1;
            img.mfm_carry = false;
        }

        let sys_ticks = start_pos.as_ref().map_or(0, |p| **p);
        self.cur_bc = (sys_ticks * 16) / self.ticks_per_cell;
        self.cur_bc &= !15;
        if self.cur_bc >= self.tracklen_bc {
            self.cur_bc = 0;
        }
        self.cur_ticks = self.cur_bc * self.ticks_per_cell;
        self.ticks_since_flux = 0;

        let decode_off = self.calc_start_pos();

        self.bufs.read_data.reset();
        self.bufs.read_bc.reset();

        if let Some(sp) = start_pos {
            self.img_read_track()?;
            self.bufs.read_bc.publish_cons(decode_off * 16);
            *sp = sys_ticks;
        }

        Ok(())
    }

    /*
     * Read path
     */

    pub(crate) fn img_read_track(&mut self) -> Result<bool, ImageError> {
        if self.sync == SyncMode::Fm {
            self.fm_read_track()
        } else {
            self.mfm_read_track()
        }
    }

    fn mfm_read_track(&mut self) -> Result<bool, ImageError> {
        let Image {
            fp,
            state,
            bufs,
            cur_track,
            nr_sides,
            ..
        } = self;
        let img = as_img(state);
        let head = (*cur_track & (*nr_sides as u16 - 1)) as usize;

        fetch_data(fp, img, &mut bufs.read_data, head)?;

        let rd = &mut bufs.read_data;
        let bc = &*bufs.read_bc;

        // Generate some MFM if there is space in the raw-bitcell ring.
        let bc_p = bc.prod() / 16;
        let bc_c = bc.cons() / 16;
        let bc_space = bc.len_words() - bc_p.wrapping_sub(bc_c);
        let mut em = MfmEmitter {
            bc,
            pos: bc_p,
            prev: img.mfm_carry,
        };

        let nr = img.nr_sectors as i32;
        if img.decode_pos == 0 {
            // Post-index track gap.
            if bc_space < img.idx_sz {
                return Ok(false);
            }
            for _ in 0..img.gap_4a {
                em.byte(0x4E);
            }
            if img.has_iam {
                // IAM
                for _ in 0..GAP_SYNC {
                    em.byte(0x00);
                }
                for _ in 0..3 {
                    em.raw(MFM_SYNC_C2);
                }
                em.byte(0xFC);
                for _ in 0..GAP_1 {
                    em.byte(0x4E);
                }
            }
        } else if img.decode_pos == nr * 4 + 1 {
            // Pre-index track gap.
            let mut sz = img.gap_4 - img.decode_data_pos * 1024;
            if bc_space < sz.min(1024) {
                return Ok(false);
            }
            if sz > 1024 {
                sz = 1024;
                img.decode_data_pos += 1;
                img.decode_pos -= 1;
            } else {
                img.decode_data_pos = 0;
                img.decode_pos = if img.idx_sz != 0 { -1 } else { 0 };
            }
            for _ in 0..sz {
                em.byte(0x4E);
            }
        } else {
            match (img.decode_pos - 1) & 3 {
                0 => {
                    // IDAM
                    let cyl = (*cur_track / 2) as u8;
                    let hd = (*cur_track & 1) as u8;
                    let sec = img.sec_map[((img.decode_pos - 1) >> 2) as usize];
                    let idam = [0xA1, 0xA1, 0xA1, 0xFE, cyl, hd, sec, img.sec_no];
                    if bc_space < img.idam_sz {
                        return Ok(false);
                    }
                    for _ in 0..img.idam_gap_sync() {
                        em.byte(0x00);
                    }
                    for _ in 0..3 {
                        em.raw(MFM_SYNC_A1);
                    }
                    for &b in &idam[3..] {
                        em.byte(b);
                    }
                    let crc = crc16_ccitt(&idam, 0xFFFF);
                    em.byte((crc >> 8) as u8);
                    em.byte(crc as u8);
                    for _ in 0..img.post_crc_syncs {
                        em.raw(MFM_SYNC_A1);
                    }
                    for _ in 0..img.gap_2 {
                        em.byte(0x4E);
                    }
                }
                1 => {
                    // DAM
                    let dam = [0xA1, 0xA1, 0xA1, 0xFB];
                    if bc_space < img.dam_sz_pre {
                        return Ok(false);
                    }
                    for _ in 0..GAP_SYNC {
                        em.byte(0x00);
                    }
                    for _ in 0..3 {
                        em.raw(MFM_SYNC_A1);
                    }
                    em.byte(dam[3]);
                    img.crc = crc16_ccitt(&dam, 0xFFFF);
                }
                2 => {
                    // Data
                    let mut len = sec_sz(img.sec_no) - img.decode_data_pos * 1024;
                    if bc_space < len.min(1024) {
                        return Ok(false);
                    }
                    if len > 1024 {
                        len = 1024;
                        img.decode_data_pos += 1;
                        img.decode_pos -= 1;
                    } else {
                        img.decode_data_pos = 0;
                    }
                    let buf = &rd.p[..len as usize];
                    for &b in buf {
                        em.byte(b);
                    }
                    img.crc = crc16_ccitt(buf, img.crc);
                    rd.cons += 1;
                }
                _ => {
                    // Post-data
                    if bc_space < img.dam_sz_post {
                        return Ok(false);
                    }
                    let crc = img.crc;
                    em.byte((crc >> 8) as u8);
                    em.byte(crc as u8);
                    for _ in 0..img.post_crc_syncs {
                        em.raw(MFM_SYNC_A1);
                    }
                    for _ in 0..img.gap_3 {
                        em.byte(0x4E);
                    }
                }
            }
        }

        img.decode_pos += 1;
        img.mfm_carry = em.prev;
        let pos = em.pos;
        bc.publish_prod(pos * 16);

        Ok(true)
    }

    fn fm_read_track(&mut self) -> Result<bool, ImageError> {
        let Image {
            fp,
            state,
            bufs,
            cur_track,
            nr_sides,
            ..
        } = self;
        let img = as_img(state);
        let head = (*cur_track & (*nr_sides as u16 - 1)) as usize;

        fetch_data(fp, img, &mut bufs.read_data, head)?;

        let rd = &mut bufs.read_data;
        let bc = &*bufs.read_bc;

        // Generate some FM if there is space in the raw-bitcell ring.
        let bc_p = bc.prod() / 16;
        let bc_c = bc.cons() / 16;
        let bc_space = bc.len_words() - bc_p.wrapping_sub(bc_c);
        let mut em = FmEmitter { bc, pos: bc_p };

        let nr = img.nr_sectors as i32;
        if img.decode_pos == 0 {
            // Post-index track gap.
            if bc_space < img.idx_sz {
                return Ok(false);
            }
            for _ in 0..img.gap_4a {
                em.byte(0xFF);
            }
            debug_assert!(!img.has_iam);
        } else if img.decode_pos == nr * 4 + 1 {
            // Pre-index track gap.
            let mut sz = img.gap_4 - img.decode_data_pos * 1024;
            if bc_space < sz.min(1024) {
                return Ok(false);
            }
            if sz > 1024 {
                sz = 1024;
                img.decode_data_pos += 1;
                img.decode_pos -= 1;
            } else {
                img.decode_data_pos = 0;
                img.decode_pos = if img.idx_sz != 0 { -1 } else { 0 };
            }
            for _ in 0..sz {
                em.byte(0xFF);
            }
        } else {
            match (img.decode_pos - 1) & 3 {
                0 => {
                    // IDAM
                    let cyl = (*cur_track / 2) as u8;
                    let hd = (*cur_track & 1) as u8;
                    let sec = img.sec_map[((img.decode_pos - 1) >> 2) as usize];
                    let idam = [0xFE, cyl, hd, sec, img.sec_no];
                    if bc_space < img.idam_sz {
                        return Ok(false);
                    }
                    for _ in 0..FM_GAP_SYNC {
                        em.byte(0x00);
                    }
                    em.raw(fm_sync(idam[0], FM_SYNC_CLK));
                    for &b in &idam[1..] {
                        em.byte(b);
                    }
                    let crc = crc16_ccitt(&idam, 0xFFFF);
                    em.byte((crc >> 8) as u8);
                    em.byte(crc as u8);
                    for _ in 0..img.gap_2 {
                        em.byte(0xFF);
                    }
                }
                1 => {
                    // DAM
                    let dam = [0xFB];
                    if bc_space < img.dam_sz_pre {
                        return Ok(false);
                    }
                    for _ in 0..FM_GAP_SYNC {
                        em.byte(0x00);
                    }
                    em.raw(fm_sync(dam[0], FM_SYNC_CLK));
                    img.crc = crc16_ccitt(&dam, 0xFFFF);
                }
                2 => {
                    // Data
                    let mut len = sec_sz(img.sec_no) - img.decode_data_pos * 1024;
                    if bc_space < len.min(1024) {
                        return Ok(false);
                    }
                    if len > 1024 {
                        len = 1024;
                        img.decode_data_pos += 1;
                        img.decode_pos -= 1;
                    } else {
                        img.decode_data_pos = 0;
                    }
                    let buf = &rd.p[..len as usize];
                    for &b in buf {
                        em.byte(b);
                    }
                    img.crc = crc16_ccitt(buf, img.crc);
                    rd.cons += 1;
                }
                _ => {
                    // Post-data
                    if bc_space < img.dam_sz_post {
                        return Ok(false);
                    }
                    let crc = img.crc;
                    em.byte((crc >> 8) as u8);
                    em.byte(crc as u8);
                    for _ in 0..img.gap_3 {
                        em.byte(0xFF);
                    }
                }
            }
        }

        img.decode_pos += 1;
        let pos = em.pos;
        bc.publish_prod(pos * 16);

        Ok(true)
    }

    /*
     * Write path
     */

    pub(crate) fn img_write_track(&mut self) -> Result<bool, ImageError> {
        if self.sync == SyncMode::Fm {
            self.fm_write_track()
        } else {
            self.mfm_write_track()
        }
    }

    /// Convert the write-start tick offset to a logical sector, rounding
    /// to the nearest sector centre. Used when a DAM arrives without a
    /// preceding IDAM (e.g. format operations).
    fn infer_write_sector(img: &mut ImgState, start_ticks: u32, ticks_per_cell: u32, head: usize) {
        let base = (start_ticks / ticks_per_cell) as i64; // in data bytes
        let ess = img.enc_sec_sz() as i64;
        let sec = (base - img.idx_sz as i64 - img.idam_sz as i64 + ess / 2) / ess;
        if !(0..img.nr_sectors as i64).contains(&sec) {
            warn!("IMG bad sector offset: {} -> {}", base, sec);
            img.write_sector = -2;
        } else {
            // Convert rotational order to logical order.
            img.write_sector =
                img.sec_map[sec as usize] as i32 - img.sec_base[head] as i32;
        }
    }

    fn mfm_write_track(&mut self) -> Result<bool, ImageError> {
        let Image {
            fp,
            state,
            bufs,
            wq,
            cur_track,
            nr_sides,
            ticks_per_cell,
            ..
        } = self;
        let img = as_img(state);
        let head = (*cur_track & (*nr_sides as u16 - 1)) as usize;
        let sec_base = img.sec_base[head];
        let wr = &*bufs.write_bc;
        let wrbuf = &mut bufs.write_data.p;

        let write = wq.current();
        let flush = wq.flushing();
        let mut c = wr.cons() / 16;
        let mut p = wr.prod() / 16;
        // If we are processing final data then use the end index, rounded up.
        if flush {
            p = (write.bc_end + 15) / 16;
        }

        let sec_bytes = sec_sz(img.sec_no) as usize;

        if img.write_sector == -1 {
            Self::infer_write_sector(img, write.start, *ticks_per_cell, head);
        }

        while p.wrapping_sub(c) as i32 >= (3 + sec_bytes + 2) as i32 {
            // Scan for sync words and address marks. The leading sync byte
            // of a triple is rarely captured cleanly, so expect two raw
            // sync words and consume three words for the header.
            if wr.word(c) != MFM_SYNC_A1 {
                c += 1;
                continue;
            }
            c += 1;
            let mut x = 0;
            for _ in 0..2 {
                x = mfm_to_bin(wr.word(c));
                c += 1;
                if x != 0xA1 {
                    break;
                }
            }

            match x {
                0xFE => {
                    // IDAM
                    wrbuf[..3].fill(0xA1);
                    wrbuf[3] = x;
                    for i in 4..10 {
                        wrbuf[i] = mfm_to_bin(wr.word(c));
                        c += 1;
                    }
                    let crc = crc16_ccitt(&wrbuf[..10], 0xFFFF);
                    if crc != 0 {
                        warn!("IMG IDAM bad CRC {:04x}, sector {}", crc, wrbuf[6]);
                    } else {
                        let ws = wrbuf[6] as i32 - sec_base as i32;
                        if !(0..img.nr_sectors as i32).contains(&ws) {
                            warn!("IMG IDAM bad sector: {}", wrbuf[6]);
                            img.write_sector = -2;
                        } else {
                            img.write_sector = ws;
                        }
                    }
                }
                0xFB => {
                    // DAM
                    for i in 0..sec_bytes + 2 {
                        wrbuf[i] = mfm_to_bin(wr.word(c));
                        c += 1;
                    }
                    let seed = crc16_ccitt(&[0xA1, 0xA1, 0xA1, 0xFB], 0xFFFF);
                    let crc = crc16_ccitt(&wrbuf[..sec_bytes + 2], seed);
                    if crc != 0 {
                        warn!(
                            "IMG bad CRC {:04x}, sector {}[{}]",
                            crc,
                            img.write_sector,
                            img.write_sector + sec_base as i32
                        );
                    } else if img.write_sector < 0 {
                        warn!("IMG DAM for unknown sector ({})", img.write_sector);
                    } else {
                        // All good: write out to mass storage.
                        let t = Instant::now();
                        let off = img.trk_off + img.write_sector as u64 * sec_bytes as u64;
                        fp.seek(SeekFrom::Start(off))?;
                        fp.write_all(&wrbuf[..sec_bytes])?;
                        debug!(
                            "IMG write {}[{}]/{}: {} us",
                            img.write_sector,
                            img.write_sector + sec_base as i32,
                            img.nr_sectors,
                            t.elapsed().as_micros()
                        );
                    }
                }
                _ => {}
            }
        }

        wr.publish_cons(c * 16);

        Ok(flush)
    }

    fn fm_write_track(&mut self) -> Result<bool, ImageError> {
        let Image {
            fp,
            state,
            bufs,
            wq,
            cur_track,
            nr_sides,
            ticks_per_cell,
            ..
        } = self;
        let img = as_img(state);
        let head = (*cur_track & (*nr_sides as u16 - 1)) as usize;
        let sec_base = img.sec_base[head];
        let wr = &*bufs.write_bc;
        let wrbuf = &mut bufs.write_data.p;

        let write = wq.current();
        let flush = wq.flushing();
        let mut c = wr.cons() / 16;
        let mut p = wr.prod() / 16;
        if flush {
            p = (write.bc_end + 15) / 16;
        }

        let sec_bytes = sec_sz(img.sec_no) as usize;

        if img.write_sector == -1 {
            Self::infer_write_sector(img, write.start, *ticks_per_cell, head);
        }

        while p.wrapping_sub(c) as i32 >= (2 + sec_bytes + 2) as i32 {
            if wr.word(c) != 0xAAAA {
                c += 1;
                continue;
            }
            c += 1;
            let sync = wr.word(c);
            if mfm_to_bin(sync >> 1) != FM_SYNC_CLK {
                continue;
            }
            let x = mfm_to_bin(sync);
            c += 1;

            match x {
                0xFE => {
                    // IDAM
                    wrbuf[0] = x;
                    for i in 1..7 {
                        wrbuf[i] = mfm_to_bin(wr.word(c));
                        c += 1;
                    }
                    let crc = crc16_ccitt(&wrbuf[..7], 0xFFFF);
                    if crc != 0 {
                        warn!("IMG IDAM bad CRC {:04x}, sector {}", crc, wrbuf[3]);
                    } else {
                        let ws = wrbuf[3] as i32 - sec_base as i32;
                        if !(0..img.nr_sectors as i32).contains(&ws) {
                            warn!("IMG IDAM bad sector: {}", wrbuf[3]);
                            img.write_sector = -2;
                        } else {
                            img.write_sector = ws;
                        }
                    }
                }
                0xFB => {
                    // DAM
                    for i in 0..sec_bytes + 2 {
                        wrbuf[i] = mfm_to_bin(wr.word(c));
                        c += 1;
                    }
                    let seed = crc16_ccitt(&[0xFB], 0xFFFF);
                    let crc = crc16_ccitt(&wrbuf[..sec_bytes + 2], seed);
                    if crc != 0 {
                        warn!(
                            "IMG bad CRC {:04x}, sector {}[{}]",
                            crc,
                            img.write_sector,
                            img.write_sector + sec_base as i32
                        );
                    } else if img.write_sector < 0 {
                        warn!("IMG DAM for unknown sector ({})", img.write_sector);
                    } else {
                        let t = Instant::now();
                        let off = img.trk_off + img.write_sector as u64 * sec_bytes as u64;
                        fp.seek(SeekFrom::Start(off))?;
                        fp.write_all(&wrbuf[..sec_bytes])?;
                        debug!(
                            "IMG write {}[{}]/{}: {} us",
                            img.write_sector,
                            img.write_sector + sec_base as i32,
                            img.nr_sectors,
                            t.elapsed().as_micros()
                        );
                    }
                }
                _ => {}
            }
        }

        wr.publish_cons(c * 16);

        Ok(flush)
    }

    /// Grow an undersized image file to its full geometry, zero-filled.
    pub(crate) fn img_extend(&mut self) -> Result<(), ImageError> {
        let (nr_sectors, sec_no, base_off) = {
            let img = self.img();
            (img.nr_sectors, img.sec_no, img.base_off)
        };
        let sz = nr_sectors as u64
            * sec_sz(sec_no) as u64
            * self.nr_sides as u64
            * self.nr_cyls as u64
            + base_off as u64;
        let cur = stream_len(&mut self.fp)?;
        if cur >= sz {
            return Ok(());
        }

        self.fp.seek(SeekFrom::Start(cur))?;
        let zeros = [0u8; 4096];
        let mut remaining = sz - cur;
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            self.fp.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
        self.fp.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageFormat;
    use crate::io::Cursor;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn open_img(
        bytes: usize,
        format: ImageFormat,
        host: HostProfile,
    ) -> Image<Cursor<Vec<u8>>> {
        let mut arena = Arena::with_capacity(4096);
        Image::open(Cursor::new(vec![0u8; bytes]), format, host, &mut arena).unwrap()
    }

    #[test]
    fn test_pc_1440k_geometry() {
        init();
        let mut im = open_img(1_474_560, ImageFormat::Img, HostProfile::Default);
        assert_eq!((im.nr_cyls, im.nr_sides), (80, 2));
        {
            let img = im.img();
            assert_eq!(img.sec_no, 2);
            assert_eq!(img.nr_sectors, 18);
            assert_eq!(img.gap_3, 84);
            assert!(img.has_iam);
            assert_eq!(img.rpm, 300);
            // HD bitcell rate.
            assert_eq!(img.data_rate, 1000);
        }
        assert_eq!(im.sync(), SyncMode::Mfm);
        assert_eq!(im.tracklen_bc % 32, 0);

        let mut start = 0;
        im.setup_track(0, Some(&mut start)).unwrap();
        let map: Vec<u8> = im.img().sec_map[..18].to_vec();
        let want: Vec<u8> = (1..=18).collect();
        assert_eq!(map, want);
    }

    #[test]
    fn test_st_720k_skewed_map() {
        init();
        let mut im = open_img(737_280, ImageFormat::St, HostProfile::Default);
        {
            let img = im.img();
            assert!(!img.has_iam);
            assert_eq!(img.skew, 2);
            assert_eq!(img.nr_sectors, 9);
        }
        // Track 11 (cyl 5, side 1): start position (11*2) mod 9 = 4.
        im.setup_track(11, Some(&mut 0)).unwrap();
        let map: Vec<u8> = im.img().sec_map[..9].to_vec();
        assert_eq!(map, vec![6, 7, 8, 9, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_kaypro_inter_track_numbering() {
        init();
        let mut im = open_img(409_600, ImageFormat::Img, HostProfile::Kaypro);
        {
            let img = im.img();
            assert_eq!(img.nr_sectors, 10);
            assert_eq!(img.interleave, 3);
            assert_eq!(img.sec_base, [1, 11]);
        }
        // Side 1: IDs continue from head 0.
        im.setup_track(1, Some(&mut 0)).unwrap();
        let mut map: Vec<u8> = im.img().sec_map[..10].to_vec();
        map.sort_unstable();
        let want: Vec<u8> = (11..=20).collect();
        assert_eq!(map, want);
    }

    #[test]
    fn test_sec_map_is_permutation_everywhere() {
        init();
        let mut im = open_img(737_280, ImageFormat::St, HostProfile::Default);
        for track in 0..160 {
            im.setup_track(track, Some(&mut 0)).unwrap();
            let head = (track & 1) as usize;
            let img = im.img();
            let base = img.sec_base[head];
            let mut map: Vec<u8> = img.sec_map[..img.nr_sectors as usize].to_vec();
            map.sort_unstable();
            let want: Vec<u8> = (base..base + img.nr_sectors).collect();
            assert_eq!(map, want, "track {}", track);
        }
    }

    #[test]
    fn test_ti99_reverse_side1_layout() {
        init();
        // 720k DSDD80: 80 cyls, 2 sides, 18 sectors of 256 bytes.
        let mut im = open_img(737_280, ImageFormat::Ti99, HostProfile::Ti99);
        assert_eq!((im.nr_cyls, im.nr_sides), (80, 2));
        let img = im.img();
        assert_eq!(img.nr_sectors, 18);
        assert_eq!(img.layout, ImgLayout::SequentialReverseSide1);

        let trk_len = 18u64 * 256;
        im.setup_track(1, Some(&mut 0)).unwrap();
        assert_eq!(im.img().trk_off, (2 * 80 - 1) * trk_len);
        im.setup_track(0, Some(&mut 0)).unwrap();
        assert_eq!(im.img().trk_off, 0);
        im.setup_track(159, Some(&mut 0)).unwrap();
        assert_eq!(im.img().trk_off, 80 * trk_len);
    }

    #[test]
    fn test_short_track_trims_gap4a() {
        init();
        // 1.68M DMF: 21 sectors only fit the nominal HD track once the
        // post-index gap is dropped.
        let im = open_img(1_720_320, ImageFormat::Img, HostProfile::Default);
        let img = im.img();
        assert_eq!(img.nr_sectors, 21);
        assert_eq!(img.gap_4a, 0);
        let tracklen = (img.enc_sec_sz() * 21 + img.idx_sz) * 16;
        assert!(im.tracklen_bc >= tracklen);
        assert_eq!(im.tracklen_bc % 32, 0);
        // gap_4 absorbs the slack exactly.
        assert_eq!(img.gap_4, (im.tracklen_bc - tracklen) / 16);
    }

    #[test]
    fn test_long_track_extends() {
        init();
        // A layout too large even for an ED track gets the track length
        // extended instead.
        let oversized = [types::ImgType {
            nr_secs: 40,
            nr_sides: 2,
            has_iam: 1,
            gap3: 116,
            interleave: 1,
            sec_no: 3,
            base: 1,
            inter_track_numbering: 0,
            skew: 0,
            cyls: 80,
            rpm: 300,
        }];
        let fp = Cursor::new(vec![0u8; 80 * 40 * 1024 * 2]);
        let im = Image::open_with_table(fp, HostProfile::Default, &oversized).unwrap();
        let img = im.img();
        let tracklen = (img.enc_sec_sz() * 40 + img.idx_sz) * 16;
        assert!(tracklen > 400_000);
        assert_eq!(im.tracklen_bc, (tracklen + 100 + 31) & !31);
        assert_eq!(img.gap_4, (im.tracklen_bc - tracklen) / 16);
    }

    #[test]
    fn test_uknc_quirks() {
        init();
        // 10x2x80x512 = 819200 bytes.
        let im = open_img(819_200, ImageFormat::Img, HostProfile::Uknc);
        let img = im.img();
        assert_eq!(img.gap_2, 24);
        assert_eq!(img.gap_4a, 27);
        assert_eq!(img.post_crc_syncs, 1);
        assert!(!img.has_iam);
    }

    #[test]
    fn test_d81_swaps_sides() {
        init();
        // 800k D81: 80x2x10x512, heads swapped within each cylinder.
        let mut im = open_img(819_200, ImageFormat::D81, HostProfile::Default);
        assert_eq!(im.img().layout, ImgLayout::InterleavedSwapSides);
        let trk_len = 10u64 * 512;
        im.setup_track(0, Some(&mut 0)).unwrap();
        assert_eq!(im.img().trk_off, trk_len);
        im.setup_track(1, Some(&mut 0)).unwrap();
        assert_eq!(im.img().trk_off, 0);
    }

    #[test]
    fn test_adfs_skews_by_cylinder_only() {
        init();
        // ADFS D/E 800k: 5x1kB sectors, skew 1, numbered from 0.
        let mut im = open_img(819_200, ImageFormat::Adfs, HostProfile::Default);
        let img = im.img();
        assert!(img.skew_cyls_only);
        assert_eq!((img.nr_sectors, img.sec_no, img.skew), (5, 3, 1));
        // Both heads of cylinder 1 start at the same rotational offset.
        im.setup_track(2, Some(&mut 0)).unwrap();
        let side0: Vec<u8> = im.img().sec_map[..5].to_vec();
        im.setup_track(3, Some(&mut 0)).unwrap();
        let side1: Vec<u8> = im.img().sec_map[..5].to_vec();
        assert_eq!(side0, side1);
        assert_eq!(side0, vec![4, 0, 1, 2, 3]);
    }

    #[test]
    fn test_calc_start_pos_inverts_layout() {
        init();
        let mut im = open_img(1_474_560, ImageFormat::Img, HostProfile::Default);
        im.setup_track(0, Some(&mut 0)).unwrap();

        // Seek into the middle of sector 3's data phase.
        let (idx_sz, idam_sz, dam_sz_pre, ess) = {
            let img = im.img();
            (img.idx_sz, img.idam_sz, img.dam_sz_pre, img.enc_sec_sz())
        };
        let byte_off = idx_sz + 3 * ess + idam_sz + dam_sz_pre + 100;
        im.cur_bc = byte_off * 16;
        let off = im.calc_start_pos();
        let img = im.img();
        assert_eq!(img.decode_pos, 3 * 4 + 3);
        assert_eq!(img.trk_sec, 3);
        assert_eq!(off, 100);

        // Seek into the pre-index gap.
        im.cur_bc = (idx_sz + 18 * ess + 10) * 16;
        let off = im.calc_start_pos();
        assert_eq!(im.img().decode_pos, 18 * 4 + 1);
        assert_eq!(off, 10);
    }

    #[test]
    fn test_trd_extend() {
        init();
        // A truncated TRD grows to full 80x2x16x256 geometry.
        let mut data = vec![0u8; 0x1000];
        data[0x8E3] = 0x16;
        let mut arena = Arena::with_capacity(4096);
        let mut im = Image::open(
            Cursor::new(data),
            ImageFormat::Trd,
            HostProfile::Default,
            &mut arena,
        )
        .unwrap();
        im.extend().unwrap();
        let data = im.into_inner().into_inner();
        assert_eq!(data.len(), 80 * 2 * 16 * 256);
    }
}
