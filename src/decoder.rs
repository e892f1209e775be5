// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder-facing types shared by the session driver and its callers.

pub mod session;

use std::time::Duration;

use thiserror::Error;

use crate::surface_pool::SurfaceProxy;
use crate::Codec;
use crate::CropRect;
use crate::InterlaceMode;
use crate::MemoryType;
use crate::PictureStructure;
use crate::StreamInfo;

pub use session::Decoder;

/// Per-call outcome of the decoder.
///
/// `NeedMoreData`, `Ready` and `Flushed` are flow-control signals, not
/// failures: the caller is expected to feed more input, acknowledge the
/// negotiated parameters, or stop draining. `AllocationFailed` is
/// recoverable once downstream references are released. Everything else is
/// session-fatal; there is no in-place recovery.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not enough compressed data to continue")]
    NeedMoreData,
    #[error("stream parameters are known, output negotiation can proceed")]
    Ready,
    #[error("decoder fully drained")]
    Flushed,
    #[error("no output surface available")]
    AllocationFailed,
    #[error("failed to parse the stream header")]
    BitstreamParser,
    #[error("hardware decoder initialization failed")]
    InitFailed,
    #[error("codec is not supported by this device")]
    UnsupportedCodec,
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl DecodeError {
    /// Whether this outcome ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DecodeError::BitstreamParser
                | DecodeError::InitFailed
                | DecodeError::UnsupportedCodec
                | DecodeError::Unknown(_)
        )
    }
}

/// One completed output picture, in presentation order.
pub struct DecodedFrame {
    /// Monotonic presentation counter.
    pub presentation_number: u64,
    pub timestamp: u64,
    pub duration: u64,
    pub crop: CropRect,
    pub interlace_mode: InterlaceMode,
    pub top_field_first: bool,
    /// Ownership of the hardware surface transfers to the caller with this
    /// frame. Dropping it returns the surface to the pool.
    pub surface: SurfaceProxy,
}

/// Retry budgets for the spin-with-sleep points in the driver. Completion
/// latency is sub-millisecond to low-millisecond, so these are polls rather
/// than blocking OS waits; the budgets keep tests deterministic.
#[derive(Copy, Clone, Debug)]
pub struct BusyPoll {
    /// Sleep between submit retries while the device reports busy.
    pub busy_sleep: Duration,
    /// Maximum busy retries before giving up on a submission.
    pub max_submit_retries: usize,
    /// Per-attempt wait handed to the hardware sync call.
    pub sync_timeout: Duration,
    /// Maximum still-executing polls before a sync is abandoned.
    pub max_sync_attempts: usize,
}

impl Default for BusyPoll {
    fn default() -> Self {
        Self {
            busy_sleep: Duration::from_micros(500),
            max_submit_retries: 1000,
            sync_timeout: Duration::from_secs(1),
            max_sync_attempts: 60,
        }
    }
}

/// Session configuration fixed at construction time.
#[derive(Clone, Debug)]
pub struct DecoderConfig {
    pub codec: Codec,
    /// Number of in-flight operations to request from the hardware. Forced
    /// to 1 in live mode.
    pub async_depth: u16,
    /// Low-latency mode: decoded-order output, minimal internal buffering.
    /// Silently disabled for codecs whose bitstream cannot support it.
    pub live: bool,
    pub memory: MemoryType,
    pub stream_info: StreamInfo,
    pub busy_poll: BusyPoll,
}

impl DecoderConfig {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            async_depth: 4,
            live: false,
            memory: Default::default(),
            stream_info: Default::default(),
            busy_poll: Default::default(),
        }
    }
}

/// Tracks the stream's interlacing mode from per-surface picture structure
/// reports.
#[derive(Default)]
pub(crate) struct InterlaceTracker {
    mode: Option<InterlaceMode>,
    top_field_first: bool,
    seen_progressive: bool,
    seen_field: bool,
}

impl InterlaceTracker {
    /// Folds one hardware report into the stream mode. Monotonic toward
    /// `Mixed`: once both picture kinds have been observed the mode never
    /// reverts.
    pub(crate) fn update(&mut self, structure: PictureStructure) {
        if structure.is_field() {
            self.seen_field = true;
            self.top_field_first = structure == PictureStructure::TopFieldFirst;
        } else {
            self.seen_progressive = true;
        }

        // Once both kinds have been seen, `Mixed` holds for the rest of the
        // session.
        self.mode = if self.seen_field && self.seen_progressive {
            Some(InterlaceMode::Mixed)
        } else if structure.is_field() {
            Some(InterlaceMode::Interleaved)
        } else {
            Some(InterlaceMode::Progressive)
        };
    }

    pub(crate) fn mode(&self) -> Option<InterlaceMode> {
        self.mode
    }

    pub(crate) fn top_field_first(&self) -> bool {
        self.top_field_first
    }
}

/// Presentation numbering and timestamp assignment.
///
/// Policy: an explicit nonzero timestamp on the input wins; otherwise the
/// frame is paced at `base + n * duration`, with the base learned from the
/// first frame.
#[derive(Default)]
pub(crate) struct Pacing {
    base: Option<u64>,
    count: u64,
    duration: u64,
}

impl Pacing {
    pub(crate) fn set_duration(&mut self, duration: u64) {
        self.duration = duration;
    }

    pub(crate) fn duration(&self) -> u64 {
        self.duration
    }

    /// Assigns the next presentation number and timestamp.
    pub(crate) fn next(&mut self, explicit: Option<u64>) -> (u64, u64) {
        let number = self.count;
        self.count += 1;

        if self.base.is_none() {
            self.base = Some(explicit.unwrap_or(0));
        }

        let timestamp = match explicit {
            Some(pts) if pts != 0 => pts,
            // `unwrap` cannot fail, the base was just learned above.
            _ => self.base.unwrap() + number * self.duration,
        };

        (number, timestamp)
    }

    pub(crate) fn reset(&mut self) {
        self.base = None;
        self.count = 0;
    }
}
