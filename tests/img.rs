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

    tests/img.rs

    End-to-end tests of the sector-image pipeline: track synthesis, the
    write decoder, header probers and boundary file sizes.
*/
mod common;

use common::*;
use std::io::Cursor;
use trackflux::codec::crc16_ccitt;
use trackflux::{Arena, HostProfile, Image, ImageError, ImageFormat, SyncMode};

#[test]
fn test_write_then_read_sector() {
    init();

    // PC 1.44M image, all zeros. Write a patterned 512-byte sector to
    // (cyl 3, side 0, sec 7).
    let mut im = open_mem(
        vec![0u8; 1_474_560],
        ImageFormat::Img,
        HostProfile::Default,
    );
    let payload: Vec<u8> = (0..512).map(|i| (i as u32 * 7 + 3) as u8).collect();

    let wq = im.write_queue();
    let mut feeder = WordFeeder::new(im.write_bc());
    wq.begin(0);
    im.setup_track(6, None).unwrap();

    feed_mfm_sector_write(&mut feeder, 3, 0, 7, 2, &payload);
    let bits = feeder.publish();
    wq.end(bits);

    let mut flushed = false;
    for _ in 0..16 {
        if im.write_track().unwrap() {
            flushed = true;
            break;
        }
    }
    assert!(flushed);

    // On-file location: cylinder-major, head-interleaved, sector IDs based
    // at 1.
    let data = im.into_inner().into_inner();
    let off = (3 * 2 + 0) * 18 * 512 + (7 - 1) * 512;
    assert_eq!(&data[off..off + 512], &payload[..]);
    // Neighbouring sectors untouched.
    assert!(data[off - 512..off].iter().all(|&b| b == 0));
    assert!(data[off + 512..off + 1024].iter().all(|&b| b == 0));

    // Read the track back through the engine and validate the regenerated
    // bitstream: IDAM and DAM CRCs must both come out clean.
    let mut im = open_mem(data, ImageFormat::Img, HostProfile::Default);
    let mut start = 0;
    im.setup_track(6, Some(&mut start)).unwrap();
    let n_words = (im.tracklen_bc() / 16) as usize;
    let words = pump_read_words(&mut im, n_words);
    let bytes = decode_words(&words);

    let idam = find_seq(&bytes, &[0xA1, 0xA1, 0xA1, 0xFE, 3, 0, 7, 2]).expect("IDAM not found");
    assert_eq!(crc16_ccitt(&bytes[idam..idam + 10], 0xFFFF), 0);

    let dam = idam + find_seq(&bytes[idam..], &[0xA1, 0xA1, 0xA1, 0xFB]).expect("DAM not found");
    assert_eq!(crc16_ccitt(&bytes[dam..dam + 4 + 512 + 2], 0xFFFF), 0);
    assert_eq!(&bytes[dam + 4..dam + 4 + 512], &payload[..]);
}

#[test]
fn test_read_track_is_self_consistent() {
    init();

    // Fill a 720k image with per-sector markers and check every sector of
    // one track appears framed with a valid CRC.
    let mut data = vec![0u8; 737_280];
    for (i, chunk) in data.chunks_mut(512).enumerate() {
        chunk.fill((i % 251) as u8);
    }
    let mut im = open_mem(data, ImageFormat::Img, HostProfile::Default);
    let mut start = 0;
    im.setup_track(0, Some(&mut start)).unwrap();
    let n_words = (im.tracklen_bc() / 16) as usize;
    let words = pump_read_words(&mut im, n_words);
    let bytes = decode_words(&words);

    for sec in 1..=9u8 {
        let idam =
            find_seq(&bytes, &[0xA1, 0xA1, 0xA1, 0xFE, 0, 0, sec, 2]).expect("IDAM not found");
        assert_eq!(crc16_ccitt(&bytes[idam..idam + 10], 0xFFFF), 0, "sector {}", sec);
        let dam =
            idam + find_seq(&bytes[idam..], &[0xA1, 0xA1, 0xA1, 0xFB]).expect("DAM not found");
        assert_eq!(crc16_ccitt(&bytes[dam..dam + 4 + 512 + 2], 0xFFFF), 0);
        let want = ((sec as usize - 1) % 251) as u8;
        assert!(bytes[dam + 4..dam + 4 + 512].iter().all(|&b| b == want));
    }
}

#[test]
fn test_bad_crc_write_is_skipped() {
    init();

    let mut im = open_mem(
        vec![0u8; 1_474_560],
        ImageFormat::Img,
        HostProfile::Default,
    );
    let payload = vec![0x5A; 512];

    let wq = im.write_queue();
    let mut feeder = WordFeeder::new(im.write_bc());
    wq.begin(0);
    im.setup_track(0, None).unwrap();

    feed_mfm_sector_write(&mut feeder, 0, 0, 5, 2, &payload);
    // Corrupt one payload word after the fact: the DAM CRC no longer
    // matches and the sector must not be committed.
    feeder.ring.set_word(100, 0x5555);
    let bits = feeder.publish();
    wq.end(bits);

    while !im.write_track().unwrap() {}

    let data = im.into_inner().into_inner();
    assert!(data.iter().all(|&b| b == 0), "corrupt sector was committed");
}

#[test]
fn test_pc_dos_bpb_probe() {
    init();

    // 64 cylinders is in no built-in table; only the BPB can describe it.
    let size = 64 * 2 * 9 * 512;
    let mut data = vec![0u8; size];
    data[11..13].copy_from_slice(&512u16.to_le_bytes()); // BPB_BytsPerSec
    data[19..21].copy_from_slice(&((size / 512) as u16).to_le_bytes()); // BPB_TotSec16
    data[24..26].copy_from_slice(&9u16.to_le_bytes()); // BPB_SecPerTrk
    data[26..28].copy_from_slice(&2u16.to_le_bytes()); // BPB_NumHeads
    data[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());

    let im = open_mem(data.clone(), ImageFormat::Img, HostProfile::PcDos);
    assert_eq!((im.nr_cyls(), im.nr_sides()), (64, 2));

    // Without the boot signature the probe must reject, and no size table
    // covers this image.
    data[510] = 0;
    data[511] = 0;
    let mut arena = Arena::with_capacity(4096);
    let err = Image::open(
        Cursor::new(data),
        ImageFormat::Img,
        HostProfile::PcDos,
        &mut arena,
    )
    .unwrap_err();
    assert!(matches!(err, ImageError::UnknownFormat));
}

#[test]
fn test_msx_bpb_without_signature() {
    init();

    // 360k is ambiguous (80/1/9 vs 40/2/9). A plausible BPB with no boot
    // signature must still be believed on MSX.
    let size = 368_640;
    let mut data = vec![0u8; size];
    data[11..13].copy_from_slice(&512u16.to_le_bytes());
    data[19..21].copy_from_slice(&((size / 512) as u16).to_le_bytes());
    data[24..26].copy_from_slice(&9u16.to_le_bytes());
    data[26..28].copy_from_slice(&2u16.to_le_bytes());

    let im = open_mem(data, ImageFormat::Img, HostProfile::Msx);
    assert_eq!((im.nr_cyls(), im.nr_sides()), (40, 2));

    // With no BPB at all, the MSX table prefers the single-sided reading.
    let im = open_mem(vec![0u8; size], ImageFormat::Img, HostProfile::Msx);
    assert_eq!((im.nr_cyls(), im.nr_sides()), (80, 1));
}

#[test]
fn test_ti99_footer_trim() {
    init();

    // A 720k V9T9 image with a 3-sector bad-sector-map footer still opens
    // as DSDD80.
    let size = 737_280 + 3 * 256;
    let im = open_mem(vec![0u8; size], ImageFormat::Ti99, HostProfile::Ti99);
    assert_eq!((im.nr_cyls(), im.nr_sides()), (80, 2));

    // A size that is not a whole number of sectors must reject.
    let mut arena = Arena::with_capacity(4096);
    let err = Image::open(
        Cursor::new(vec![0u8; 737_280 + 100]),
        ImageFormat::Ti99,
        HostProfile::Ti99,
        &mut arena,
    )
    .unwrap_err();
    assert!(matches!(err, ImageError::UnknownFormat));
}

#[test]
fn test_fm_track_framing() {
    init();

    // DFS single-sided 200k: 80 tracks of 10 FM sectors of 256 bytes.
    let mut data = vec![0u8; 80 * 10 * 256];
    for (i, chunk) in data.chunks_mut(256).enumerate() {
        chunk.fill((i % 13) as u8);
    }
    let mut im = open_mem(data, ImageFormat::Ssd, HostProfile::Default);
    assert_eq!(im.sync(), SyncMode::Fm);

    let mut start = 0;
    im.setup_track(0, Some(&mut start)).unwrap();
    let n_words = (im.tracklen_bc() / 16) as usize;
    let words = pump_read_words(&mut im, n_words);

    // FM sector 0 header: sync word carrying 0xFE under the address-mark
    // clock, then track 0 / head 0 / sector 0 / size 1.
    let sync = trackflux::codec::fm_sync(0xFE, trackflux::codec::FM_SYNC_CLK);
    let pos = words.iter().position(|&w| w == sync).expect("FM IDAM sync not found");
    let hdr = decode_words(&words[pos..pos + 7]);
    assert_eq!(&hdr[..5], &[0xFE, 0, 0, 0, 1]);
    assert_eq!(crc16_ccitt(&hdr, 0xFFFF), 0);
}

#[test]
fn test_fm_write_then_read() {
    init();

    let mut im = open_mem(vec![0u8; 80 * 10 * 256], ImageFormat::Ssd, HostProfile::Default);
    let payload: Vec<u8> = (0..256).map(|i| i as u8).collect();

    let wq = im.write_queue();
    let mut feeder = WordFeeder::new(im.write_bc());
    wq.begin(0);
    im.setup_track(0, None).unwrap();

    // FM framing: 0xFF gap, zero sync run, clocked address marks.
    let fm = |b: u8| trackflux::codec::fm_encode_byte(b);
    for _ in 0..8 {
        feeder.raw(fm(0xFF));
    }
    for _ in 0..6 {
        feeder.raw(fm(0x00));
    }
    let sync = trackflux::codec::fm_sync(0xFE, trackflux::codec::FM_SYNC_CLK);
    feeder.raw(sync);
    let idam = [0xFE, 0, 0, 4, 1];
    for &b in &idam[1..] {
        feeder.raw(fm(b));
    }
    let crc = crc16_ccitt(&idam, 0xFFFF);
    feeder.raw(fm((crc >> 8) as u8));
    feeder.raw(fm(crc as u8));
    for _ in 0..11 {
        feeder.raw(fm(0xFF));
    }
    for _ in 0..6 {
        feeder.raw(fm(0x00));
    }
    feeder.raw(trackflux::codec::fm_sync(0xFB, trackflux::codec::FM_SYNC_CLK));
    for &b in &payload {
        feeder.raw(fm(b));
    }
    let crc = crc16_ccitt(&payload, crc16_ccitt(&[0xFB], 0xFFFF));
    feeder.raw(fm((crc >> 8) as u8));
    feeder.raw(fm(crc as u8));
    for _ in 0..8 {
        feeder.raw(fm(0xFF));
    }
    let bits = feeder.publish();
    wq.end(bits);

    while !im.write_track().unwrap() {}

    // DFS numbers sectors from 0: sector 4 is the fifth of the track.
    let data = im.into_inner().into_inner();
    assert_eq!(&data[4 * 256..5 * 256], &payload[..]);
}
