// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the
//! decoder run so we can test it in isolation.
//!
//! The session is fully scripted: header parsing requires a configurable
//! number of bytes, each accepted submission consumes a fixed-size access
//! unit, and busy/more-surface/still-executing sequences can be injected
//! per call.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::backend::DecodeSession;
use crate::backend::FrameInfo;
use crate::backend::HwStatus;
use crate::backend::PluginUid;
use crate::backend::SubmitOutcome;
use crate::backend::SurfaceAllocator;
use crate::backend::SurfaceId;
use crate::backend::SurfaceRequest;
use crate::backend::SyncPoint;
use crate::backend::VideoParams;
use crate::bitstream::Bitstream;
use crate::surface_pool::Surface;
use crate::PictureStructure;

/// Allocator over plain counters, with test-controlled lock flags standing
/// in for the hardware's.
pub struct DummyAllocator {
    next_id: AtomicU32,
    locked: Mutex<HashSet<SurfaceId>>,
}

impl DummyAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU32::new(1),
            locked: Mutex::new(HashSet::new()),
        })
    }

    /// Flips the hardware lock flag for `id`.
    pub fn set_locked(&self, id: SurfaceId, locked: bool) {
        let mut flags = self.locked.lock().unwrap();
        if locked {
            flags.insert(id);
        } else {
            flags.remove(&id);
        }
    }
}

impl SurfaceAllocator for Arc<DummyAllocator> {
    fn alloc(&self, info: &FrameInfo) -> anyhow::Result<Surface> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Surface::new(id, *info))
    }

    fn is_locked(&self, id: SurfaceId) -> bool {
        self.locked.lock().unwrap().contains(&id)
    }
}

/// Scripted outcome for one submit call, overriding the default behavior.
#[derive(Copy, Clone, Debug)]
pub enum SubmitStep {
    /// Report the device busy; the driver is expected to retry.
    Busy,
    /// Ask for another working surface for the same input.
    MoreSurface,
    /// Ask for more compressed data without consuming anything.
    MoreData,
    /// Consume one access unit and complete with the given picture
    /// structure.
    Frame(PictureStructure),
    /// Consume one access unit and complete reporting a previously
    /// submitted surface as output, the way the hardware's
    /// reference-picture buffering returns an older surface.
    EarlierFrame(PictureStructure),
}

/// Deterministic software stand-in for a hardware decode session.
pub struct DummySession {
    /// Bytes `parse_header` needs before it succeeds.
    pub header_len: usize,
    /// Bytes consumed per accepted submission.
    pub au_len: usize,
    /// Parameters "parsed" out of the header.
    pub parsed_info: FrameInfo,
    /// When set, `parse_header` hard-fails once enough bytes are present.
    pub corrupt_header: bool,
    /// When set, `init` fails.
    pub fail_init: bool,
    /// Capability modules the device accepts. `None` accepts everything.
    pub acceptable_plugins: Option<Vec<PluginUid>>,
    /// `InExecution` polls to report before each sync completes.
    pub sync_polls: usize,
    /// Frames held internally, served one per drain submission.
    pub buffered_drain_frames: usize,

    script: VecDeque<SubmitStep>,
    structures: VecDeque<PictureStructure>,
    pending_polls: Vec<(u64, usize)>,
    /// Every surface id ever passed to `submit`, in order.
    submitted: Vec<SurfaceId>,
    last_output: Option<(SurfaceId, PictureStructure)>,
    next_sync: u64,
    inited: bool,
    closed: Arc<AtomicBool>,
    reset_count: usize,
}

impl Default for DummySession {
    fn default() -> Self {
        Self {
            header_len: 16,
            au_len: 8,
            parsed_info: FrameInfo {
                resolution: (320, 240).into(),
                crop: crate::CropRect {
                    x: 0,
                    y: 0,
                    width: 320,
                    height: 240,
                },
                format: Some(crate::DecodedFormat::NV12),
                frame_rate: crate::Fraction::new(25, 1),
                aspect_ratio: crate::Fraction::new(1, 1),
                picture_structure: None,
                bit_depth: 8,
            },
            corrupt_header: false,
            fail_init: false,
            acceptable_plugins: None,
            sync_polls: 0,
            buffered_drain_frames: 0,
            script: Default::default(),
            structures: Default::default(),
            pending_polls: Default::default(),
            submitted: Default::default(),
            last_output: None,
            next_sync: 1,
            inited: false,
            closed: Default::default(),
            reset_count: 0,
        }
    }
}

impl DummySession {
    pub fn new() -> Self {
        Default::default()
    }

    /// Queues a scripted outcome for the next submit call.
    pub fn push_step(&mut self, step: SubmitStep) {
        self.script.push_back(step);
    }

    /// Queues the picture structure reported for upcoming completed frames.
    pub fn push_structure(&mut self, structure: PictureStructure) {
        self.structures.push_back(structure);
    }

    pub fn is_inited(&self) -> bool {
        self.inited
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Shared closed flag, observable after the session has been moved into
    /// a decoder.
    pub fn close_witness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub fn reset_count(&self) -> usize {
        self.reset_count
    }

    fn complete(&mut self, surface: SurfaceId, structure: PictureStructure) -> SubmitOutcome {
        let sync = SyncPoint(self.next_sync);
        self.next_sync += 1;
        self.pending_polls.push((sync.0, self.sync_polls));
        self.last_output = Some((surface, structure));

        SubmitOutcome {
            status: HwStatus::Ok,
            sync: Some(sync),
            output: Some(surface),
        }
    }

    fn next_structure(&mut self) -> PictureStructure {
        self.structures
            .pop_front()
            .unwrap_or(PictureStructure::Progressive)
    }
}

impl DecodeSession for DummySession {
    fn load_plugin(&mut self, uid: &PluginUid) -> HwStatus {
        match &self.acceptable_plugins {
            None => HwStatus::Ok,
            Some(accepted) if accepted.contains(uid) => HwStatus::Ok,
            Some(_) => HwStatus::Unsupported,
        }
    }

    fn parse_header(&mut self, bitstream: &Bitstream, params: &mut VideoParams) -> HwStatus {
        if bitstream.remaining() < self.header_len {
            return HwStatus::MoreData;
        }
        if self.corrupt_header {
            return HwStatus::Unknown;
        }

        params.info = self.parsed_info;
        HwStatus::Ok
    }

    fn query_requirements(&mut self, params: &VideoParams) -> Result<SurfaceRequest, HwStatus> {
        Ok(SurfaceRequest {
            suggested: params.async_depth + 3,
            info: params.info,
        })
    }

    fn init(&mut self, _params: &VideoParams) -> HwStatus {
        if self.fail_init {
            return HwStatus::DeviceFailed;
        }
        self.inited = true;
        HwStatus::Ok
    }

    fn submit(&mut self, bitstream: Option<&mut Bitstream>, surface: SurfaceId) -> SubmitOutcome {
        self.submitted.push(surface);

        match bitstream {
            None => {
                // Drain request: serve internally buffered frames until
                // empty.
                if self.buffered_drain_frames > 0 {
                    self.buffered_drain_frames -= 1;
                    let structure = self.next_structure();
                    self.complete(surface, structure)
                } else {
                    SubmitOutcome::status_only(HwStatus::MoreData)
                }
            }
            Some(bs) => {
                if let Some(step) = self.script.pop_front() {
                    return match step {
                        SubmitStep::Busy => SubmitOutcome::status_only(HwStatus::DeviceBusy),
                        SubmitStep::MoreSurface => {
                            SubmitOutcome::status_only(HwStatus::MoreSurface)
                        }
                        SubmitStep::MoreData => SubmitOutcome::status_only(HwStatus::MoreData),
                        SubmitStep::Frame(structure) => {
                            bs.advance(std::cmp::min(self.au_len, bs.remaining()));
                            self.complete(surface, structure)
                        }
                        SubmitStep::EarlierFrame(structure) => {
                            bs.advance(std::cmp::min(self.au_len, bs.remaining()));
                            let output = self
                                .submitted
                                .iter()
                                .copied()
                                .find(|id| *id != surface)
                                .unwrap_or(surface);
                            self.complete(output, structure)
                        }
                    };
                }

                if bs.remaining() >= self.au_len {
                    bs.advance(self.au_len);
                    let structure = self.next_structure();
                    self.complete(surface, structure)
                } else {
                    SubmitOutcome::status_only(HwStatus::MoreData)
                }
            }
        }
    }

    fn sync_wait(&mut self, sync: SyncPoint, _timeout_ms: u64) -> HwStatus {
        match self.pending_polls.iter_mut().find(|(id, _)| *id == sync.0) {
            Some((_, polls)) if *polls > 0 => {
                *polls -= 1;
                HwStatus::InExecution
            }
            Some(_) => HwStatus::Ok,
            None => HwStatus::NotFound,
        }
    }

    fn output_picture_structure(&mut self, surface: SurfaceId) -> Option<PictureStructure> {
        match self.last_output {
            Some((id, structure)) if id == surface => Some(structure),
            _ => None,
        }
    }

    fn reset(&mut self, _params: &VideoParams) -> HwStatus {
        self.reset_count += 1;
        HwStatus::Ok
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}
