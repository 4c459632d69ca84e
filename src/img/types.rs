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

    src/img/types.rs

    Geometry hint tables for raw sector images, one table per host profile,
    and the size matcher that walks them. Tables are ordered so the most
    common geometry for each file size appears first; the first entry whose
    cylinder-count window covers the payload size wins.
*/

use bytemuck::{Pod, Zeroable};

use crate::HostProfile;

/// One geometry hint. Plain data so that derived tables can live in arena
/// scratch.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct ImgType {
    pub nr_secs: u8,
    /// 1 or 2.
    pub nr_sides: u8,
    pub has_iam: u8,
    pub gap3: u8,
    pub interleave: u8,
    /// Sector size code: 128 << sec_no bytes.
    pub sec_no: u8,
    /// First sector ID (0 or 1).
    pub base: u8,
    /// Head-1 sector IDs continue from head 0.
    pub inter_track_numbering: u8,
    pub skew: u8,
    /// Cylinder class: 40 or 80.
    pub cyls: u8,
    /// 300 or 360.
    pub rpm: u16,
}

const IAM: u8 = 1;
const ITN: u8 = 1;

#[allow(clippy::too_many_arguments)]
const fn t(
    nr_secs: u8,
    nr_sides: u8,
    has_iam: u8,
    gap3: u8,
    interleave: u8,
    sec_no: u8,
    base: u8,
    inter_track_numbering: u8,
    skew: u8,
    cyls: u8,
    rpm: u16,
) -> ImgType {
    ImgType {
        nr_secs,
        nr_sides,
        has_iam,
        gap3,
        interleave,
        sec_no,
        base,
        inter_track_numbering,
        skew,
        cyls,
        rpm,
    }
}

pub const DEFAULT_TYPES: &[ImgType] = &[
    t(8, 1, IAM, 84, 1, 2, 1, 0, 0, 40, 300),  // 160k
    t(9, 1, IAM, 84, 1, 2, 1, 0, 0, 40, 300),  // 180k
    t(10, 1, IAM, 30, 1, 2, 1, 0, 0, 40, 300), // 200k
    t(8, 2, IAM, 84, 1, 2, 1, 0, 0, 40, 300),  // 320k
    t(9, 2, IAM, 84, 1, 2, 1, 0, 0, 40, 300),  // 360k (#1)
    t(10, 2, IAM, 30, 1, 2, 1, 0, 0, 40, 300), // 400k (#1)
    t(15, 2, IAM, 84, 1, 2, 1, 0, 0, 80, 360), // 1.2MB
    t(9, 1, IAM, 84, 1, 2, 1, 0, 0, 80, 300),  // 360k (#2)
    t(10, 1, IAM, 30, 1, 2, 1, 0, 0, 80, 300), // 400k (#2)
    t(11, 1, IAM, 3, 2, 2, 1, 0, 0, 80, 300),  // 440k
    t(8, 2, IAM, 84, 1, 2, 1, 0, 0, 80, 300),  // 640k
    t(9, 2, IAM, 84, 1, 2, 1, 0, 0, 80, 300),  // 720k
    t(10, 2, IAM, 30, 1, 2, 1, 0, 0, 80, 300), // 800k
    t(11, 2, IAM, 3, 2, 2, 1, 0, 0, 80, 300),  // 880k
    t(18, 2, IAM, 84, 1, 2, 1, 0, 0, 80, 300), // 1.44M
    t(19, 2, IAM, 70, 1, 2, 1, 0, 0, 80, 300), // 1.52M
    t(21, 2, IAM, 18, 2, 2, 1, 0, 0, 80, 300), // 1.68M
    t(20, 2, IAM, 40, 1, 2, 1, 0, 0, 80, 300), // 1.6M
    t(36, 2, IAM, 84, 1, 2, 1, 0, 0, 80, 300), // 2.88M
];

pub const ADFS_TYPES: &[ImgType] = &[
    // ADFS D/E: 5 * 1kB, 800k
    t(5, 2, IAM, 116, 1, 3, 0, 0, 1, 80, 300),
    // ADFS F: 10 * 1kB, 1600k
    t(10, 2, IAM, 116, 1, 3, 0, 0, 2, 80, 300),
    // ADFS L 640k
    t(16, 2, IAM, 57, 1, 1, 0, 0, 0, 80, 300),
    // ADFS M 320k
    t(16, 1, IAM, 57, 1, 1, 0, 0, 0, 80, 300),
    // ADFS S 160k
    t(16, 1, IAM, 57, 1, 1, 0, 0, 0, 40, 300),
];

pub const AKAI_TYPES: &[ImgType] = &[
    // Akai DD: 5*1kB sectors
    t(5, 2, IAM, 116, 1, 3, 1, 0, 0, 80, 300),
    // Akai HD: 10*1kB sectors
    t(10, 2, IAM, 116, 1, 3, 1, 0, 0, 80, 300),
];

pub const CASIO_TYPES: &[ImgType] = &[
    t(8, 2, IAM, 116, 3, 3, 1, 0, 0, 80, 360), // 1280k
];

pub const D81_TYPES: &[ImgType] = &[t(10, 2, IAM, 30, 1, 2, 1, 0, 0, 80, 300)];

pub const DEC_TYPES: &[ImgType] = &[
    t(10, 1, IAM, 30, 1, 2, 1, 0, 0, 80, 300), // RX50 (400k); RX33 from default list
];

pub const ENSONIQ_TYPES: &[ImgType] = &[
    t(10, 2, IAM, 30, 1, 2, 0, 0, 0, 80, 300), // 800kB
    t(20, 2, IAM, 40, 1, 2, 0, 0, 0, 80, 300), // 1.6MB
];

pub const FLUKE_TYPES: &[ImgType] = &[t(16, 2, IAM, 57, 2, 1, 0, 0, 0, 80, 300)];

pub const KAYPRO_TYPES: &[ImgType] = &[
    t(10, 1, IAM, 30, 3, 2, 1, ITN, 0, 40, 300), // 200k
    t(10, 2, IAM, 30, 3, 2, 1, ITN, 0, 40, 300), // 400k
    t(10, 2, IAM, 30, 3, 2, 1, ITN, 0, 80, 300), // 800k
];

pub const MBD_TYPES: &[ImgType] = &[
    t(11, 2, IAM, 30, 1, 3, 1, 0, 0, 80, 300),
    t(5, 2, IAM, 116, 3, 1, 1, 0, 0, 80, 300),
    t(11, 2, IAM, 30, 1, 3, 1, 0, 0, 40, 300),
    t(5, 2, IAM, 116, 3, 1, 1, 0, 0, 40, 300),
];

pub const MEMOTECH_TYPES: &[ImgType] = &[
    t(16, 2, IAM, 57, 3, 1, 1, 0, 0, 40, 300), // Type 03
    t(16, 2, IAM, 57, 3, 1, 1, 0, 0, 80, 300), // Type 07
];

pub const MSX_TYPES: &[ImgType] = &[
    t(8, 1, IAM, 84, 1, 2, 1, 0, 0, 80, 300), // 320k
    t(9, 1, IAM, 84, 1, 2, 1, 0, 0, 80, 300), // 360k; everything else from default list
];

pub const NASCOM_TYPES: &[ImgType] = &[
    t(16, 1, IAM, 57, 3, 1, 1, 0, 8, 80, 300), // 320k
    t(16, 2, IAM, 57, 3, 1, 1, 0, 8, 80, 300), // 640k
];

pub const PC98_TYPES: &[ImgType] = &[
    t(8, 2, IAM, 116, 1, 3, 1, 0, 0, 80, 360), // 1232k
    t(8, 2, IAM, 116, 1, 2, 1, 0, 0, 80, 360), // 640k
    t(9, 2, IAM, 116, 1, 2, 1, 0, 0, 80, 360), // 720k
];

pub const UKNC_TYPES: &[ImgType] = &[t(10, 2, 0, 38, 1, 2, 1, 0, 0, 80, 300)];

/// The host-specific table consulted before falling back to the defaults.
pub fn host_types(host: HostProfile) -> &'static [ImgType] {
    match host {
        HostProfile::Akai | HostProfile::Gem => AKAI_TYPES,
        HostProfile::Casio => CASIO_TYPES,
        HostProfile::Dec => DEC_TYPES,
        HostProfile::Ensoniq => ENSONIQ_TYPES,
        HostProfile::Fluke => FLUKE_TYPES,
        HostProfile::Kaypro => KAYPRO_TYPES,
        HostProfile::Memotech => MEMOTECH_TYPES,
        HostProfile::Msx => MSX_TYPES,
        HostProfile::Nascom => NASCOM_TYPES,
        HostProfile::Pc98 => PC98_TYPES,
        HostProfile::Uknc => UKNC_TYPES,
        _ => DEFAULT_TYPES,
    }
}

pub(crate) struct TypeMatch {
    pub ty: ImgType,
    pub nr_cyls: u16,
    pub nr_sides: u8,
}

/// Walk the table in order; for each entry consider the cylinder-count
/// window of its class and accept the first (cyls, cylinder size) whose
/// product equals the payload size.
pub(crate) fn match_image_size(types: &[ImgType], payload: u64) -> Option<TypeMatch> {
    for ty in types {
        let (min_cyls, max_cyls) = match ty.cyls {
            40 => (38u64, 42u64),
            _ => (77, 85),
        };
        let cyl_sz = ty.nr_secs as u64 * (128u64 << ty.sec_no) * ty.nr_sides as u64;
        for nr_cyls in min_cyls..=max_cyls {
            if nr_cyls * cyl_sz == payload {
                return Some(TypeMatch {
                    ty: *ty,
                    nr_cyls: nr_cyls as u16,
                    nr_sides: ty.nr_sides,
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_common_pc_sizes() {
        for (size, secs, sides, cyls) in [
            (163_840, 8, 1, 40),
            (184_320, 9, 1, 40),
            (368_640, 9, 2, 40),
            (737_280, 9, 2, 80),
            (1_228_800, 15, 2, 80),
            (1_474_560, 18, 2, 80),
            (2_949_120, 36, 2, 80),
        ] {
            let m = match_image_size(DEFAULT_TYPES, size).unwrap();
            assert_eq!((m.ty.nr_secs, m.nr_sides, m.nr_cyls), (secs, sides, cyls), "size {}", size);
        }
    }

    #[test]
    fn test_match_cylinder_tolerance() {
        // 82-cylinder oversized 720k image still matches the 9x2x80 entry.
        let m = match_image_size(DEFAULT_TYPES, 82 * 9 * 2 * 512).unwrap();
        assert_eq!(m.nr_cyls, 82);
        assert_eq!(m.ty.nr_secs, 9);
        // One extra sector beyond any cylinder multiple must reject.
        assert!(match_image_size(DEFAULT_TYPES, 737_280 + 512).is_none());
    }

    #[test]
    fn test_table_order_resolves_ties() {
        // 368_640 bytes is both 40x2x9 and 80x1x9 of 512; table order picks
        // the 40-cylinder double-sided entry.
        let m = match_image_size(DEFAULT_TYPES, 368_640).unwrap();
        assert_eq!((m.nr_cyls, m.nr_sides), (40, 2));
    }
}
