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

    src/img/probe.rs

    Format-specific openers that read a header prefix (BPB, FDI, SDU, VDK,
    JVC, TRD, TI-99 VIB) to pin down or override geometry before delegating
    to the MFM/FM track-geometry builder. A prober that rejects returns
    UnknownFormat; the dispatcher may then try the next strategy.
*/

use binrw::{binrw, BinRead};

use crate::image::Image;
use crate::io::{stream_len, ReadWriteSeek, SeekFrom};
use crate::{ImageError, MAX_SECTORS};

#[binrw]
#[brw(little)]
#[allow(dead_code)]
struct FdiHeader {
    zero: u32,
    density: u32,
    header_size: u32,
    image_body_size: u32,
    sector_size_bytes: u32,
    nr_secs: u32,
    nr_sides: u32,
    cyls: u32,
}

#[binrw]
#[brw(little)]
#[allow(dead_code)]
struct SduHeader {
    app: [u8; 21],
    ver: [u8; 5],
    flags: u16,
    disk_type: u16,
    max_c: u16,
    max_h: u16,
    max_s: u16,
    used_c: u16,
    used_h: u16,
    used_s: u16,
    sec_size: u16,
    trk_size: u16,
}

#[binrw]
#[brw(little)]
#[allow(dead_code)]
struct VdkHeader {
    id: [u8; 2],
    hlen: u16,
    misc: [u8; 4],
    cyls: u8,
    heads: u8,
    flags: u8,
    compression: u8,
}

/// TI-99 Volume Information Block, sector 0. Only byte-wide fields are
/// consulted, so the machine's big-endian word order does not matter here.
#[binrw]
#[brw(little)]
#[allow(dead_code)]
struct Ti99Vib {
    name: [u8; 10],
    tot_secs: u16,
    secs_per_track: u8,
    id: [u8; 3],
    protection: u8,
    tracks_per_side: u8,
    sides: u8,
    density: u8,
}

/// The BIOS Parameter Block fields the probe consults, gathered from their
/// scattered boot-sector offsets.
struct Bpb {
    sig: u16,
    bytes_per_sec: u16,
    sec_per_track: u16,
    num_heads: u16,
    tot_sec: u16,
}

fn read_u16_at<F: ReadWriteSeek>(fp: &mut F, off: u64) -> Result<u16, ImageError> {
    let mut b = [0u8; 2];
    fp.seek(SeekFrom::Start(off))
        .and_then(|_| fp.read_exact(&mut b))
        .map_err(|_| ImageError::UnknownFormat)?;
    Ok(u16::from_le_bytes(b))
}

fn bpb_read<F: ReadWriteSeek>(fp: &mut F) -> Result<Bpb, ImageError> {
    Ok(Bpb {
        sig: read_u16_at(fp, 510)?,          // BS_55AA
        bytes_per_sec: read_u16_at(fp, 11)?, // BPB_BytsPerSec
        sec_per_track: read_u16_at(fp, 24)?, // BPB_SecPerTrk
        num_heads: read_u16_at(fp, 26)?,     // BPB_NumHeads
        tot_sec: read_u16_at(fp, 19)?,       // BPB_TotSec16
    })
}

impl<F: ReadWriteSeek> Image<F> {
    pub(crate) fn pc98fdi_open(&mut self) -> Result<(), ImageError> {
        self.fp.seek(SeekFrom::Start(0))?;
        let h = FdiHeader::read(&mut self.fp).map_err(|_| ImageError::UnknownFormat)?;
        if h.nr_secs == 0 || h.nr_secs > MAX_SECTORS as u32 || h.cyls > 254 || h.nr_sides > 2 {
            return Err(ImageError::UnknownFormat);
        }
        let img = self.img_mut();
        if h.density == 0x30 {
            img.rpm = 300;
            img.gap_3 = 84;
        } else {
            img.rpm = 360;
            img.gap_3 = 116;
        }
        img.sec_no = if h.sector_size_bytes == 512 { 2 } else { 3 };
        img.nr_sectors = h.nr_secs as u8;
        img.interleave = 1;
        img.sec_base = [1, 1];
        img.skew = 0;
        img.has_iam = true;
        // Skip the FDI header (typically 4096 bytes).
        img.base_off = h.header_size;
        self.nr_cyls = h.cyls as u16;
        self.nr_sides = h.nr_sides as u8;
        self.mfm_open()
    }

    pub(crate) fn pc98hdm_open(&mut self) -> Result<(), ImageError> {
        let img = self.img_mut();
        img.rpm = 360;
        img.gap_3 = 116;
        img.sec_no = 3;
        img.nr_sectors = 8;
        img.interleave = 1;
        img.sec_base = [1, 1];
        img.skew = 0;
        img.has_iam = true;
        img.base_off = 0;
        self.nr_cyls = 77;
        self.nr_sides = 2;
        self.mfm_open()
    }

    pub(crate) fn sdu_open(&mut self) -> Result<(), ImageError> {
        self.fp.seek(SeekFrom::Start(0))?;
        let h = SduHeader::read(&mut self.fp).map_err(|_| ImageError::UnknownFormat)?;

        // Accept 180k/360k/720k/1.44M/2.88M PC geometries only.
        let (cyls, sides, secs) = (h.max_c, h.max_h, h.max_s);
        if !matches!(cyls, 40 | 80) || !matches!(sides, 1 | 2) || !matches!(secs, 9 | 18 | 36) {
            return Err(ImageError::UnknownFormat);
        }

        self.nr_cyls = cyls;
        self.nr_sides = sides as u8;
        let img = self.img_mut();
        img.nr_sectors = secs as u8;
        img.sec_no = 2; // 512-byte sectors
        img.interleave = 1;
        img.sec_base = [1, 1];
        img.gap_3 = 84;
        img.has_iam = true;
        // Skip 46-byte SABDU header.
        img.base_off = 46;
        self.mfm_open()
    }

    pub(crate) fn vdk_open(&mut self) -> Result<(), ImageError> {
        self.fp.seek(SeekFrom::Start(0))?;
        let h = VdkHeader::read(&mut self.fp).map_err(|_| ImageError::UnknownFormat)?;
        if &h.id != b"dk" || h.hlen < 12 {
            return Err(ImageError::UnknownFormat);
        }
        if h.heads != 1 && h.heads != 2 {
            return Err(ImageError::UnknownFormat);
        }

        self.nr_cyls = h.cyls as u16;
        self.nr_sides = h.heads;
        let img = self.img_mut();
        img.sec_no = 1; // 256-byte sectors
        img.interleave = 2; // DDOS likes a 2:1 interleave (ref. xroar)
        img.sec_base = [1, 1];
        img.nr_sectors = 18;
        img.gap_3 = 20;
        img.gap_4a = 54;
        img.has_iam = true;
        img.base_off = h.hlen as u32;
        self.mfm_open()
    }

    pub(crate) fn jvc_open(&mut self) -> Result<(), ImageError> {
        // Header length is whatever the file size leaves over mod 256.
        let f_size = stream_len(&mut self.fp)?;
        let base_off = (f_size & 255) as u32;

        // Header bytes override the defaults in order; a zero-length header
        // is a plain 35-track DECB image.
        let mut jvc: [u8; 5] = [18, 1, 1, 1, 0];
        self.fp.seek(SeekFrom::Start(0))?;
        let take = base_off.min(5) as usize;
        self.fp.read_exact(&mut jvc[..take])?;
        let (spt, sides, ssize_code, sec_id, attr) = (jvc[0], jvc[1], jvc[2], jvc[3], jvc[4]);
        if attr != 0 || (sides != 1 && sides != 2) || spt == 0 {
            return Err(ImageError::UnknownFormat);
        }

        self.nr_sides = sides;
        let img = self.img_mut();
        img.base_off = base_off;
        img.sec_no = ssize_code & 3;
        img.interleave = 3; // RSDOS likes a 3:1 interleave (ref. xroar)
        img.sec_base = [sec_id, sec_id];
        img.nr_sectors = spt;

        let bps = 128u64 << (ssize_code & 3);
        let mut bpc = bps * spt as u64 * sides as u64;
        let payload = self.im_size()?;
        let mut nr_cyls = payload / bpc;
        let mut nr_sides = sides;
        if nr_cyls >= 88 && nr_sides == 1 {
            nr_sides += 1;
            nr_cyls /= 2;
            bpc *= 2;
        }
        if payload % bpc >= bps {
            nr_cyls += 1;
        }
        self.nr_cyls = nr_cyls as u16;
        self.nr_sides = nr_sides;

        let img = self.img_mut();
        img.gap_3 = 20;
        img.gap_4a = 54;
        img.has_iam = true;
        self.mfm_open()
    }

    pub(crate) fn trd_open(&mut self) -> Result<(), ImageError> {
        // Interrogate the TR-DOS geometry identifier.
        let mut geometry = [0u8; 1];
        let ok = self
            .fp
            .seek(SeekFrom::Start(0x8E3))
            .and_then(|_| self.fp.read_exact(&mut geometry))
            .is_ok();

        (self.nr_cyls, self.nr_sides) = match geometry[0] {
            0x16 if ok => (80, 2),
            0x17 if ok => (40, 2),
            0x18 if ok => (80, 1),
            0x19 if ok => (40, 1),
            _ => {
                // Guess geometry from the image size.
                if self.im_size()? < 40 * 2 * 16 * 256 {
                    (40, 1)
                } else {
                    (80, 2)
                }
            }
        };

        let img = self.img_mut();
        img.sec_no = 1; // 256-byte
        img.interleave = 1;
        img.skew = 0;
        img.sec_base = [1, 1];
        img.nr_sectors = 16;
        img.gap_3 = 57;
        img.has_iam = true;
        self.mfm_open()
    }

    pub(crate) fn opd_open(&mut self) -> Result<(), ImageError> {
        (self.nr_cyls, self.nr_sides) = match self.im_size()? {
            184_320 => (40, 1),
            737_280 => (80, 2),
            _ => return Err(ImageError::UnknownFormat),
        };

        let img = self.img_mut();
        img.sec_no = 1; // 256-byte
        img.interleave = 13;
        img.skew = 13;
        img.skew_cyls_only = true;
        img.sec_base = [0, 0];
        img.nr_sectors = 18;
        img.gap_3 = 12;
        img.has_iam = true;
        self.mfm_open()
    }

    fn dfs_open(&mut self) -> Result<(), ImageError> {
        self.nr_cyls = 80;
        let img = self.img_mut();
        img.interleave = 1;
        img.skew = 3;
        img.skew_cyls_only = true;
        img.sec_no = 1; // 256-byte
        img.sec_base = [0, 0];
        img.nr_sectors = 10;
        img.gap_3 = 21;
        self.fm_open()
    }

    pub(crate) fn ssd_open(&mut self) -> Result<(), ImageError> {
        self.nr_sides = 1;
        self.dfs_open()
    }

    pub(crate) fn dsd_open(&mut self) -> Result<(), ImageError> {
        self.nr_sides = 2;
        self.dfs_open()
    }

    pub(crate) fn ti99_open(&mut self) -> Result<(), ImageError> {
        // Must be a whole number of 256-byte sectors.
        let mut fsize = self.im_size()?;
        if fsize % 256 != 0 {
            return Err(ImageError::UnknownFormat);
        }
        fsize /= 256;

        // A 3-sector footer is a bad-sector map: trim and ignore it.
        if fsize % 10 == 3 {
            fsize -= 3;
        }
        if fsize == 0 {
            return Err(ImageError::UnknownFormat);
        }

        // Volume Information Block in sector 0, if present, disambiguates
        // the overloaded sizes below.
        self.fp.seek(SeekFrom::Start(0))?;
        let vib = Ti99Vib::read(&mut self.fp).map_err(|_| ImageError::UnknownFormat)?;
        let have_vib = &vib.id == b"DSK";

        let img = self.img_mut();
        img.has_iam = false;
        img.interleave = 4;
        img.skew = 3;
        img.skew_cyls_only = true;
        img.sec_no = 1;
        img.sec_base = [0, 0];
        img.layout = super::ImgLayout::SequentialReverseSide1;

        if fsize % (40 * 9) == 0 {
            // 9/18/36 sectors-per-track formats.
            match fsize / (40 * 9) {
                1 => {
                    // SSSD
                    self.set_ti99_fm(40, 1, 9)
                }
                2 => {
                    if have_vib && vib.sides == 1 {
                        // Disambiguated: SSDD.
                        self.set_ti99_mfm(40, 1, 18, 5)
                    } else {
                        // Assume DSSD.
                        self.set_ti99_fm(40, 2, 9)
                    }
                }
                4 => {
                    if have_vib && vib.tracks_per_side == 80 {
                        // Disambiguated: DSSD80.
                        self.set_ti99_fm(80, 2, 9)
                    } else {
                        // Assume DSDD.
                        self.set_ti99_mfm(40, 2, 18, 5)
                    }
                }
                8 => self.set_ti99_mfm(80, 2, 18, 5),  // DSDD80
                16 => self.set_ti99_mfm(80, 2, 36, 5), // DSHD80
                _ => Err(ImageError::UnknownFormat),
            }
        } else if fsize % (40 * 16) == 0 {
            // SSDD/DSDD, 16 sectors.
            let nr_sides = fsize / (40 * 16);
            if nr_sides <= 2 {
                let img = self.img_mut();
                img.gap_3 = 44;
                img.nr_sectors = 16;
                img.interleave = 5;
                self.nr_cyls = 40;
                self.nr_sides = nr_sides as u8;
                self.mfm_open()
            } else {
                Err(ImageError::UnknownFormat)
            }
        } else {
            Err(ImageError::UnknownFormat)
        }
    }

    fn set_ti99_fm(&mut self, cyls: u16, sides: u8, secs: u8) -> Result<(), ImageError> {
        self.nr_cyls = cyls;
        self.nr_sides = sides;
        let img = self.img_mut();
        img.nr_sectors = secs;
        img.gap_3 = 44;
        self.fm_open()
    }

    fn set_ti99_mfm(&mut self, cyls: u16, sides: u8, secs: u8, interleave: u8) -> Result<(), ImageError> {
        self.nr_cyls = cyls;
        self.nr_sides = sides;
        let img = self.img_mut();
        img.nr_sectors = secs;
        img.interleave = interleave;
        img.gap_3 = 24;
        self.mfm_open()
    }

    /// Disambiguate overloaded MSX image sizes via the boot sector. The
    /// BS_55AA signature is not valid in MSX-DOS, so it is not checked.
    pub(crate) fn msx_open(&mut self) -> Result<(), ImageError> {
        let size = self.im_size()?;
        if matches!(size, 327_680 | 368_640) {
            // 320k: 80/1/8 or 40/2/8? 360k: 80/1/9 or 40/2/9?
            let bpb = bpb_read(&mut self.fp)?;
            if bpb.bytes_per_sec == 512
                && (bpb.num_heads == 1 || bpb.num_heads == 2)
                && bpb.tot_sec as u64 == size / bpb.bytes_per_sec as u64
                && (bpb.sec_per_track == 8 || bpb.sec_per_track == 9)
            {
                let img = self.img_mut();
                img.sec_no = 2;
                img.nr_sectors = bpb.sec_per_track as u8;
                img.interleave = 1;
                img.sec_base = [1, 1];
                img.skew = 0;
                img.has_iam = true;
                self.nr_sides = bpb.num_heads as u8;
                self.nr_cyls = if self.nr_sides == 1 { 80 } else { 40 };
                if self.mfm_open().is_ok() {
                    return Ok(());
                }
            }
        }

        // Use the MSX-specific list; the caller falls back to the generic
        // list if this rejects too.
        self.reset_img();
        self.generic_open(super::types::MSX_TYPES)
    }

    pub(crate) fn pc_dos_open(&mut self) -> Result<(), ImageError> {
        let bpb = bpb_read(&mut self.fp)?;

        if bpb.sig != 0xAA55 {
            return Err(ImageError::UnknownFormat);
        }

        let sec_no = (0..=6u8)
            .find(|&no| 128u16 << no == bpb.bytes_per_sec)
            .ok_or(ImageError::UnknownFormat)?; // >8kB?

        if bpb.sec_per_track == 0 || bpb.sec_per_track > MAX_SECTORS as u16 {
            return Err(ImageError::UnknownFormat);
        }
        if bpb.num_heads != 1 && bpb.num_heads != 2 {
            return Err(ImageError::UnknownFormat);
        }

        let spc = bpb.sec_per_track as u32 * bpb.num_heads as u32;
        let nr_cyls = (bpb.tot_sec as u32 + spc - 1) / spc;
        if nr_cyls == 0 {
            return Err(ImageError::UnknownFormat);
        }

        self.nr_cyls = nr_cyls as u16;
        self.nr_sides = bpb.num_heads as u8;
        let img = self.img_mut();
        img.sec_no = sec_no;
        img.nr_sectors = bpb.sec_per_track as u8;
        img.interleave = 1;
        img.sec_base = [1, 1];
        img.skew = 0;
        img.has_iam = true;
        self.mfm_open()
    }
}
