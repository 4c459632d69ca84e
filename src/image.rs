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

    src/image.rs

    The mounted-image handle and the per-format dispatch. Each format
    exposes the capability set {open, setup_track, read_track, rdata_flux,
    write_track} plus an optional extend; dispatch is an enum match, one
    arm per format. The shared bitcell-to-flux generator for codec-framed
    (IMG family) tracks also lives here.
*/

use std::sync::Arc;

use crate::arena::Arena;
use crate::hfe::HfeState;
use crate::img::ImgState;
use crate::io::ReadWriteSeek;
use crate::ring::{BitcellRing, DataBuf, WriteQueue};
use crate::{HostProfile, ImageError, SyncMode, MAX_CUSTOM_PULSES};

const READ_DATA_LEN: usize = 4096;
const WRITE_DATA_LEN: usize = 16384;
const READ_BC_LEN: usize = 8192;
const WRITE_BC_LEN: usize = 32768;

/// Image container format, normally resolved from the file extension.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ImageFormat {
    Img,
    Adfs,
    D81,
    Mbd,
    Mgt,
    St,
    Pc98Fdi,
    Pc98Hdm,
    Trd,
    Opd,
    Ssd,
    Dsd,
    Sdu,
    Jvc,
    Vdk,
    Ti99,
    Hfe,
}

impl ImageFormat {
    /// Resolve a format from a file extension. `.dsk` is host-dependent:
    /// TI-99 hosts route it to the V9T9 opener.
    pub fn from_ext(ext: &str, host: HostProfile) -> Option<ImageFormat> {
        Some(match ext.to_ascii_lowercase().as_str() {
            "img" | "ima" => ImageFormat::Img,
            "dsk" if host == HostProfile::Ti99 => ImageFormat::Ti99,
            "dsk" => ImageFormat::Img,
            "adl" | "adm" | "ads" => ImageFormat::Adfs,
            "d81" => ImageFormat::D81,
            "mbd" => ImageFormat::Mbd,
            "mgt" => ImageFormat::Mgt,
            "st" => ImageFormat::St,
            "fdi" => ImageFormat::Pc98Fdi,
            "hdm" => ImageFormat::Pc98Hdm,
            "trd" => ImageFormat::Trd,
            "opd" => ImageFormat::Opd,
            "ssd" => ImageFormat::Ssd,
            "dsd" => ImageFormat::Dsd,
            "sdu" => ImageFormat::Sdu,
            "jvc" => ImageFormat::Jvc,
            "vdk" => ImageFormat::Vdk,
            "v9t9" => ImageFormat::Ti99,
            "hfe" => ImageFormat::Hfe,
            _ => return None,
        })
    }
}

/// Staging and ring buffers between the image file and the flux pump.
#[derive(Debug)]
pub struct ImageBufs {
    pub read_data: DataBuf,
    pub write_data: DataBuf,
    pub read_bc: Arc<BitcellRing>,
    pub write_bc: Arc<BitcellRing>,
}

impl ImageBufs {
    fn new() -> Self {
        ImageBufs {
            read_data: DataBuf::new(READ_DATA_LEN),
            write_data: DataBuf::new(WRITE_DATA_LEN),
            read_bc: Arc::new(BitcellRing::new(READ_BC_LEN)),
            write_bc: Arc::new(BitcellRing::new(WRITE_BC_LEN)),
        }
    }
}

/// Format-specific state; exactly one is live per mounted image.
#[derive(Debug)]
pub(crate) enum FormatState {
    Img(ImgState),
    Hfe(HfeState),
}

/// A mounted image: one open file, decoded geometry, current rotational
/// position, and the buffers shared with the flux pump. Created once per
/// mount; geometry is immutable after `open`.
#[derive(Debug)]
pub struct Image<F> {
    pub(crate) fp: F,
    format: ImageFormat,
    pub(crate) host: HostProfile,

    pub(crate) nr_cyls: u16,
    pub(crate) nr_sides: u8,
    pub(crate) cur_track: u16,

    pub(crate) tracklen_bc: u32,
    pub(crate) cur_bc: u32,
    pub(crate) ticks_per_cell: u32,
    pub(crate) cur_ticks: u32,
    pub(crate) tracklen_ticks: u32,
    pub(crate) ticks_since_flux: u32,
    pub(crate) stk_per_rev: u32,
    pub(crate) write_bc_ticks: u32,

    pub(crate) sync: SyncMode,
    pub(crate) bufs: ImageBufs,
    pub(crate) wq: Arc<WriteQueue>,

    pub(crate) index_pulses: [u32; MAX_CUSTOM_PULSES],
    pub(crate) index_pulses_len: usize,
    pub(crate) index_pulses_ver: u32,

    pub(crate) state: FormatState,
}

impl<F: ReadWriteSeek> Image<F> {
    /// Mount an image. `arena` provides boot-time scratch for openers that
    /// derive type tables.
    pub fn open(
        fp: F,
        format: ImageFormat,
        host: HostProfile,
        arena: &mut Arena,
    ) -> Result<Image<F>, ImageError> {
        let mut im = Image::open_shell(fp, format, host);

        match format {
            ImageFormat::Img => im.img_open()?,
            ImageFormat::Adfs => im.adfs_open()?,
            ImageFormat::D81 => im.d81_open()?,
            ImageFormat::Mbd => im.mbd_open()?,
            ImageFormat::Mgt => im.mgt_open()?,
            ImageFormat::St => im.st_open(arena)?,
            ImageFormat::Pc98Fdi => im.pc98fdi_open()?,
            ImageFormat::Pc98Hdm => im.pc98hdm_open()?,
            ImageFormat::Trd => im.trd_open()?,
            ImageFormat::Opd => im.opd_open()?,
            ImageFormat::Ssd => im.ssd_open()?,
            ImageFormat::Dsd => im.dsd_open()?,
            ImageFormat::Sdu => im.sdu_open()?,
            ImageFormat::Jvc => im.jvc_open()?,
            ImageFormat::Vdk => im.vdk_open()?,
            ImageFormat::Ti99 => im.ti99_open()?,
            ImageFormat::Hfe => im.hfe_open()?,
        }

        Ok(im)
    }

    /// Mount a raw sector image against a caller-built type table (the
    /// IMG.CFG path: per-size overrides in the same shape as the built-ins).
    pub fn open_with_table(
        fp: F,
        host: HostProfile,
        types: &[crate::img::ImgType],
    ) -> Result<Image<F>, ImageError> {
        let mut im = Image::open_shell(fp, ImageFormat::Img, host);
        im.generic_open(types)?;
        Ok(im)
    }

    pub(crate) fn open_shell(fp: F, format: ImageFormat, host: HostProfile) -> Image<F> {
        Image {
            fp,
            format,
            host,
            nr_cyls: 0,
            nr_sides: 0,
            cur_track: u16::MAX,
            tracklen_bc: 0,
            cur_bc: 0,
            ticks_per_cell: 0,
            cur_ticks: 0,
            tracklen_ticks: 0,
            ticks_since_flux: 0,
            stk_per_rev: 0,
            write_bc_ticks: 0,
            sync: SyncMode::Mfm,
            bufs: ImageBufs::new(),
            wq: Arc::new(WriteQueue::new()),
            index_pulses: [0; MAX_CUSTOM_PULSES],
            index_pulses_len: 0,
            index_pulses_ver: 0,
            state: FormatState::Img(ImgState::default()),
        }
    }

    /// Pre-grow an undersized image to its full geometry (TRD/SSD/DSD
    /// images are commonly distributed truncated). No-op for other formats.
    pub fn extend(&mut self) -> Result<(), ImageError> {
        match self.format {
            ImageFormat::Trd | ImageFormat::Ssd | ImageFormat::Dsd => self.img_extend(),
            _ => Ok(()),
        }
    }

    /// Prepare the engine for a physical (track, start position). With
    /// `start_pos` the engine primes the read ring at that rotational
    /// offset (read mode); without it, the next write descriptor's start
    /// tick determines the position (write mode).
    pub fn setup_track(
        &mut self,
        track: u16,
        start_pos: Option<&mut u32>,
    ) -> Result<(), ImageError> {
        match self.state {
            FormatState::Img(_) => self.img_setup_track(track, start_pos),
            FormatState::Hfe(_) => self.hfe_setup_track(track, start_pos),
        }
    }

    /// Make bounded progress filling the read-side rings. Returns true if
    /// any phase or block was emitted; false when the rings are full (or
    /// staging data is exhausted) and the call made no progress.
    pub fn read_track(&mut self) -> Result<bool, ImageError> {
        match self.state {
            FormatState::Img(_) => self.img_read_track(),
            FormatState::Hfe(_) => self.hfe_read_track(),
        }
    }

    /// Drain raw bitcells into flux intervals. Each interval is in system
    /// ticks, less one. Returns the number of intervals produced.
    pub fn rdata_flux(&mut self, tbuf: &mut [u16]) -> usize {
        match self.state {
            FormatState::Img(_) => self.bc_rdata_flux(tbuf),
            FormatState::Hfe(_) => self.hfe_rdata_flux(tbuf),
        }
    }

    /// Make bounded progress decoding the write ring back into the image.
    /// Returns true once the current write descriptor has been fully
    /// consumed and retired.
    pub fn write_track(&mut self) -> Result<bool, ImageError> {
        let flush = match self.state {
            FormatState::Img(_) => self.img_write_track()?,
            FormatState::Hfe(_) => self.hfe_write_track()?,
        };
        if flush {
            self.wq.retire();
        }
        Ok(flush)
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn host(&self) -> HostProfile {
        self.host
    }

    pub fn nr_cyls(&self) -> u16 {
        self.nr_cyls
    }

    pub fn nr_sides(&self) -> u8 {
        self.nr_sides
    }

    pub fn sync(&self) -> SyncMode {
        self.sync
    }

    pub fn track(&self) -> u16 {
        self.cur_track
    }

    pub fn tracklen_bc(&self) -> u32 {
        self.tracklen_bc
    }

    pub fn tracklen_ticks(&self) -> u32 {
        self.tracklen_ticks
    }

    pub fn ticks_per_cell(&self) -> u32 {
        self.ticks_per_cell
    }

    pub fn write_bc_ticks(&self) -> u32 {
        self.write_bc_ticks
    }

    pub fn stk_per_rev(&self) -> u32 {
        self.stk_per_rev
    }

    /// Raw-bitcell ring consumed by the flux pump.
    pub fn read_bc(&self) -> Arc<BitcellRing> {
        Arc::clone(&self.bufs.read_bc)
    }

    /// Raw-bitcell ring produced by the flux pump during writes.
    pub fn write_bc(&self) -> Arc<BitcellRing> {
        Arc::clone(&self.bufs.write_bc)
    }

    /// Write-window descriptor queue shared with the pump.
    pub fn write_queue(&self) -> Arc<WriteQueue> {
        Arc::clone(&self.wq)
    }

    /// Index-mark pulse timestamps recorded on the current track, in the
    /// engine's 1/16th-tick units.
    pub fn index_pulses(&self) -> &[u32] {
        &self.index_pulses[..self.index_pulses_len]
    }

    /// Bumped whenever the exported pulse set changes; consumers poll this
    /// to detect revisions.
    pub fn index_pulses_version(&self) -> u32 {
        self.index_pulses_ver
    }

    /// Unmount, returning the underlying file handle.
    pub fn into_inner(self) -> F {
        self.fp
    }

    /// Generate flux from codec-framed bitcells (IMG family). Bits are
    /// consumed most-significant first from each ring byte; every set bit
    /// emits one interval of accumulated cell ticks. Mirrors the HFE
    /// generator minus opcode handling.
    fn bc_rdata_flux(&mut self, tbuf: &mut [u16]) -> usize {
        let bc = Arc::clone(&self.bufs.read_bc);
        let bc_p = bc.prod();
        let mut bc_c = bc.cons();
        let ticks_per_cell = self.ticks_per_cell;
        let mut ticks = self.ticks_since_flux;
        let mut y: u32 = 8;
        let mut todo = tbuf.len();
        let mut out = 0;

        'fill: while bc_p.wrapping_sub(bc_c) >= 8 {
            debug_assert!(y == 8);
            if self.cur_bc >= self.tracklen_bc {
                debug_assert!(self.cur_bc == self.tracklen_bc);
                self.tracklen_ticks = self.cur_ticks;
                self.cur_bc = 0;
                self.cur_ticks = 0;
                continue;
            }
            y = bc_c % 8;
            let mut x = bc.byte(bc_c / 8) << y;
            bc_c += 8 - y;
            self.cur_bc += 8 - y;
            self.cur_ticks += (8 - y) * ticks_per_cell;
            while y < 8 {
                y += 1;
                ticks += ticks_per_cell;
                if x & 0x80 != 0 {
                    tbuf[out] = ((ticks >> 4) - 1) as u16;
                    out += 1;
                    ticks &= 15;
                    todo -= 1;
                    if todo == 0 {
                        break 'fill;
                    }
                }
                x <<= 1;
            }
        }

        bc.publish_cons(bc_c - (8 - y));
        self.cur_bc -= 8 - y;
        self.cur_ticks -= (8 - y) * ticks_per_cell;
        self.ticks_since_flux = ticks;
        out
    }
}
