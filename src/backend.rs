// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Seam to the proprietary hardware SDK.
//!
//! The SDK is a black box: a session handle with header-parse,
//! asynchronous-submit, sync-wait, query-requirements, reset and close entry
//! points. Everything in this module describes that ABI surface so the
//! decoder driver can be exercised against a software stand-in
//! (see [`dummy`]) as well as a real device.

pub mod dummy;

use enumn::N;

use crate::bitstream::Bitstream;
use crate::surface_pool::Surface;
use crate::Codec;
use crate::CropRect;
use crate::DecodedFormat;
use crate::Fraction;
use crate::MemoryType;
use crate::PictureStructure;
use crate::Resolution;

/// Raw identity of a hardware frame buffer. Assigned by the allocator, opaque
/// to everything but the SDK.
pub type SurfaceId = u32;

/// Token for a pending asynchronous operation, waited on to confirm
/// completion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyncPoint(pub u64);

/// Status codes as reported by the SDK.
///
/// Negative values are hard errors, positive values are warnings the caller
/// is expected to retry or absorb. None of these cross the decoder boundary
/// unmapped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(i32)]
pub enum HwStatus {
    Ok = 0,
    Unknown = -1,
    Unsupported = -3,
    MemoryAlloc = -4,
    NotFound = -9,
    /// The bitstream does not contain enough data to proceed.
    MoreData = -10,
    /// The current input needs another working surface before it can be
    /// submitted (multi-field or multi-tile content).
    MoreSurface = -11,
    DeviceFailed = -17,
    /// The submitted operation has not completed yet.
    InExecution = 1,
    /// The device cannot take more work right now; retry shortly.
    DeviceBusy = 2,
    VideoParamChanged = 3,
    IncompatibleParams = 5,
}

impl HwStatus {
    /// Maps a raw SDK status code. Codes outside the known set collapse to
    /// `Unknown` so that no raw value leaks upward.
    pub fn from_raw(raw: i32) -> Self {
        HwStatus::n(raw).unwrap_or(HwStatus::Unknown)
    }

    pub fn is_error(&self) -> bool {
        (*self as i32) < 0
    }

    pub fn is_warning(&self) -> bool {
        (*self as i32) > 0
    }
}

/// Fixed binary identifier of an auxiliary capability module some codecs
/// require the SDK to load before decoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PluginUid(pub [u8; 16]);

/// Hardware HEVC decode capability.
const HEVC_DEC_HW: PluginUid = PluginUid([
    0x33, 0xa6, 0x1c, 0x0b, 0x4c, 0x27, 0x45, 0x4c, 0xa8, 0xd8, 0x5d, 0xde, 0x75, 0x7c, 0x6f, 0x8e,
]);

/// Software fallback HEVC decode capability.
const HEVC_DEC_SW: PluginUid = PluginUid([
    0x15, 0xdd, 0x93, 0x68, 0x25, 0xad, 0x47, 0x5e, 0xa3, 0x4e, 0x35, 0xf3, 0xf5, 0x42, 0x17, 0xa6,
]);

/// Hybrid VP8 decode capability.
const VP8_DEC_HYBRID: PluginUid = PluginUid([
    0xf6, 0x22, 0x39, 0x4d, 0x8d, 0x87, 0x45, 0x2f, 0x87, 0x8c, 0x51, 0xf2, 0xfc, 0x9b, 0x41, 0x31,
]);

/// Hybrid VP9 decode capability.
const VP9_DEC_HYBRID: PluginUid = PluginUid([
    0xa9, 0x22, 0x39, 0x4d, 0x8d, 0x87, 0x45, 0x2f, 0x87, 0x8c, 0x51, 0xf2, 0xfc, 0x9b, 0x41, 0x31,
]);

/// Ordered candidate list of capability modules for `codec`. The driver
/// accepts the first one the SDK agrees to load; an empty list means the
/// codec needs none.
pub fn plugin_uids(codec: Codec) -> &'static [PluginUid] {
    match codec {
        Codec::H265 => &[HEVC_DEC_HW, HEVC_DEC_SW],
        Codec::Vp8 => &[VP8_DEC_HYBRID],
        Codec::Vp9 => &[VP9_DEC_HYBRID],
        _ => &[],
    }
}

/// Per-frame parameters negotiated with the hardware. The header parse fills
/// these in; zero-valued fields are completed from caller-supplied stream
/// information.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub resolution: Resolution,
    pub crop: CropRect,
    pub format: Option<DecodedFormat>,
    pub frame_rate: Fraction,
    pub aspect_ratio: Fraction,
    pub picture_structure: Option<PictureStructure>,
    pub bit_depth: u8,
}

/// The full parameter block for one decode session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VideoParams {
    pub codec: Codec,
    pub info: FrameInfo,
    /// Number of operations the hardware may have in flight before the
    /// caller must synchronize.
    pub async_depth: u16,
    pub io_pattern: MemoryType,
}

impl VideoParams {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            info: Default::default(),
            async_depth: 4,
            io_pattern: Default::default(),
        }
    }
}

/// Surface allocation requirements as reported by the SDK for a parameter
/// block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SurfaceRequest {
    /// How many surfaces the hardware suggests keeping around.
    pub suggested: u16,
    pub info: FrameInfo,
}

/// Result of one asynchronous submit call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub status: HwStatus,
    /// Present when the hardware accepted the work.
    pub sync: Option<SyncPoint>,
    /// The surface that will hold the decoded picture. Not necessarily the
    /// surface just submitted: the hardware's internal reference-picture
    /// buffering can return an older one.
    pub output: Option<SurfaceId>,
}

impl SubmitOutcome {
    pub fn status_only(status: HwStatus) -> Self {
        Self {
            status,
            sync: None,
            output: None,
        }
    }
}

/// One active hardware decode context.
///
/// Implementations translate these calls into the SDK's session ABI. A
/// session is exclusively owned by one decoder driver; it is never shared
/// concurrently.
pub trait DecodeSession {
    /// Asks the SDK to load an auxiliary capability module.
    fn load_plugin(&mut self, uid: &PluginUid) -> HwStatus;

    /// Parses the stream header out of `bitstream`, filling `params`.
    /// Does not consume input.
    fn parse_header(&mut self, bitstream: &Bitstream, params: &mut VideoParams) -> HwStatus;

    /// Queries how many surfaces `params` will need.
    fn query_requirements(&mut self, params: &VideoParams) -> Result<SurfaceRequest, HwStatus>;

    /// Initializes the decode pipeline for `params`.
    fn init(&mut self, params: &VideoParams) -> HwStatus;

    /// Submits one asynchronous decode operation against `surface`.
    ///
    /// `bitstream` is `None` when draining internally buffered reference
    /// frames at end of stream. Consumed bytes are reported by advancing the
    /// bitstream's offset cursor.
    fn submit(&mut self, bitstream: Option<&mut Bitstream>, surface: SurfaceId) -> SubmitOutcome;

    /// Waits up to `timeout_ms` for `sync` to complete. Returns
    /// [`HwStatus::InExecution`] if the operation is still running.
    fn sync_wait(&mut self, sync: SyncPoint, timeout_ms: u64) -> HwStatus;

    /// Picture structure the hardware reported for a completed output
    /// surface.
    fn output_picture_structure(&mut self, surface: SurfaceId) -> Option<PictureStructure>;

    /// Resets the session's internal parameters in place, keeping allocated
    /// resources.
    fn reset(&mut self, params: &VideoParams) -> HwStatus;

    /// Tears the session down. Further calls are undefined.
    fn close(&mut self);
}

/// Allocation interface for hardware frame buffers.
///
/// The "locked" flag is owned by the hardware; this layer only ever reads it.
pub trait SurfaceAllocator: Send + Sync {
    fn alloc(&self, info: &FrameInfo) -> anyhow::Result<Surface>;

    /// Whether the hardware still holds `id` (in-flight decode, pending
    /// reference, or scan-out).
    fn is_locked(&self, id: SurfaceId) -> bool;
}

/// Supplies session handles and device hints to decode/encode/filter stages
/// sharing one physical device. External collaborator, interface only.
pub trait SessionAggregator {
    type Session: DecodeSession;

    fn decode_session(&mut self) -> anyhow::Result<Self::Session>;

    /// Memory-type policy for surfaces allocated on this device.
    fn memory_type(&self) -> MemoryType;
}
