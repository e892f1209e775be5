// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Session-based hardware video decoding.
//!
//! This crate drives a fixed-function media accelerator through an opaque,
//! session-based SDK interface (see [`backend::DecodeSession`]). The heavy
//! lifting - entropy decoding, motion compensation - happens inside the
//! hardware; what lives here is the session state machine, the pool of
//! hardware frame buffers shared with an optional post-processing stage, and
//! the bitstream/pacing bookkeeping around them.

pub mod backend;
pub mod bitstream;
pub mod decoder;
pub mod surface_pool;
pub mod utils;
pub mod vpp;

use std::str::FromStr;

/// Frame dimensions in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// A rational number, used for frame rates and pixel aspect ratios.
///
/// A zero numerator or denominator means "unset" and is a candidate for
/// being filled in from caller-supplied stream information.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Fraction {
    pub num: u32,
    pub den: u32,
}

impl Fraction {
    pub fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Whether either term is still unset.
    pub fn is_unset(&self) -> bool {
        self.num == 0 || self.den == 0
    }
}

/// Pixel format of a decoded frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
    I420,
    P010,
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            "i420" | "I420" => Ok(DecodedFormat::I420),
            "p010" | "P010" => Ok(DecodedFormat::P010),
            _ => Err("unrecognized output format. Valid values: nv12, i420, p010"),
        }
    }
}

/// Codec families the accelerator can be asked to decode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    Mpeg2,
    H264,
    H265,
    Vc1,
    Vp8,
    Vp9,
    Jpeg,
}

impl Codec {
    /// Whether the bitstream format guarantees complete, independently
    /// decodable frames per access unit. Codecs without that guarantee
    /// cannot run in live (low-latency) mode.
    pub fn supports_live_mode(&self) -> bool {
        !matches!(self, Codec::H264 | Codec::H265)
    }
}

/// Picture structure reported by the hardware for a decoded surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PictureStructure {
    Progressive,
    TopFieldFirst,
    BottomFieldFirst,
}

impl PictureStructure {
    pub fn is_field(&self) -> bool {
        !matches!(self, PictureStructure::Progressive)
    }
}

/// Interlacing mode of a stream, inferred from the pictures seen so far.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InterlaceMode {
    Progressive,
    Interleaved,
    /// Both progressive and field-coded pictures have been observed. This
    /// state is sticky: once set it is never downgraded.
    Mixed,
}

/// Visible rectangle within a coded surface.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Where the memory backing decoded surfaces lives. Affects the IO pattern
/// negotiated with the hardware and how the pool allocates.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MemoryType {
    System,
    #[default]
    Video,
}

/// Stream information supplied by the caller, used to fill in whatever the
/// hardware header parse leaves blank and to request an output format.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub resolution: Resolution,
    pub frame_rate: Fraction,
    pub pixel_aspect_ratio: Fraction,
    /// Interlacing hint from the container, if any.
    pub interlaced: Option<bool>,
    /// The output format the pipeline wants. A post-processing stage is
    /// inserted when this differs from the hardware's native decode format.
    pub format: DecodedFormat,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            resolution: Default::default(),
            frame_rate: Default::default(),
            pixel_aspect_ratio: Default::default(),
            interlaced: None,
            format: DecodedFormat::NV12,
        }
    }
}
