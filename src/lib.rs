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

    src/lib.rs

    TrackFlux is the track engine of a floppy-drive emulator: given an image
    file and a physical (cylinder, head), it synthesizes the raw bitcell
    stream the drive head would see, and decodes host-written bitcells back
    into the image. Sector images (IMG family) are framed on the fly in MFM
    or FM; HFE images carry pre-encoded bitcells with v3 opcodes.
*/

pub mod arena;
pub mod clock;
pub mod codec;
pub mod hfe;
pub mod image;
pub mod img;
pub mod io;
pub mod ring;

use std::fmt;
use std::fmt::{Display, Formatter};

use thiserror::Error;

/// Upper bound on sectors per track (the size of the rotational sector map).
pub const MAX_SECTORS: usize = 64;

/// Upper bound on recorded index-mark pulses per track (HFEv3).
pub const MAX_CUSTOM_PULSES: usize = 16;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("An IO error occurred reading or writing the disk image")]
    Io(#[from] std::io::Error),
    #[error("Unknown or unsupported disk image format")]
    UnknownFormat,
    #[error("The disk image geometry is out of the supported range")]
    InvalidGeometry,
}

/// Codec mode of the mounted image. Pre-encoded images (HFE) bypass the
/// codec entirely and are tagged `Raw`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    #[default]
    Mfm,
    Fm,
    Raw,
}

impl Display for SyncMode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            SyncMode::Mfm => write!(f, "MFM"),
            SyncMode::Fm => write!(f, "FM"),
            SyncMode::Raw => write!(f, "Raw"),
        }
    }
}

/// Host platform profile. Selects the active IMG type table and a few
/// per-platform tweaks before the size matcher runs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum HostProfile {
    #[default]
    Default,
    Akai,
    Gem,
    Casio,
    Dec,
    Ensoniq,
    Fluke,
    Kaypro,
    Memotech,
    Msx,
    Nascom,
    Pc98,
    PcDos,
    Ti99,
    Uknc,
}

pub use crate::arena::Arena;
pub use crate::image::{Image, ImageFormat};
pub use crate::ring::{BitcellRing, WriteQueue};
