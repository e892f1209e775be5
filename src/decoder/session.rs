// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode session driver.
//!
//! [`Decoder`] owns one hardware session and drives it from the caller's
//! thread: header detection on startup, then a submit/sync loop per input
//! buffer, pulling working surfaces from the pool and emitting completed
//! frames in presentation order. The hardware executes asynchronously in its
//! own context; the only blocking points here are the short busy-retry sleep
//! on submission and the bounded poll while waiting on a sync point.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::anyhow;

use crate::backend::plugin_uids;
use crate::backend::DecodeSession;
use crate::backend::HwStatus;
use crate::backend::SubmitOutcome;
use crate::backend::SurfaceAllocator;
use crate::backend::SurfaceId;
use crate::backend::SurfaceRequest;
use crate::backend::SyncPoint;
use crate::backend::VideoParams;
use crate::bitstream::Bitstream;
use crate::decoder::DecodeError;
use crate::decoder::DecodedFrame;
use crate::decoder::DecoderConfig;
use crate::decoder::InterlaceTracker;
use crate::decoder::Pacing;
use crate::surface_pool::PoolError;
use crate::surface_pool::SurfacePool;
use crate::surface_pool::SurfaceProxy;
use crate::vpp::VideoFilter;
use crate::Fraction;
use crate::InterlaceMode;

/// Session lifecycle. `Failed` is terminal: the only way out is tearing the
/// decoder down and building a new one.
#[derive(Debug, PartialEq, Eq)]
enum DecodingState {
    Uninitialized,
    Running,
    Failed,
}

/// Frame duration in nanoseconds for a given frame rate.
fn frame_duration(rate: Fraction) -> u64 {
    if rate.is_unset() {
        0
    } else {
        1_000_000_000u64 * u64::from(rate.den) / u64::from(rate.num)
    }
}

/// Drives one hardware decode session.
///
/// Callers must serialize calls per decoder; a single session is not designed
/// for concurrent use. The session handle is exclusively owned here and
/// closed on drop.
pub struct Decoder<S: DecodeSession> {
    session: S,
    config: DecoderConfig,
    params: VideoParams,
    bitstream: Bitstream,
    /// Consumed when the decoder builds its own pool at start. Unused when a
    /// filter stage supplies the pool instead.
    allocator: Option<Box<dyn SurfaceAllocator>>,
    pool: Option<Arc<SurfacePool>>,
    filter: Option<Box<dyn VideoFilter>>,
    filter_active: bool,
    ready: VecDeque<DecodedFrame>,
    state: DecodingState,
    pacing: Pacing,
    interlace: InterlaceTracker,
    /// Resolved live flag: the config bit, minus codecs whose bitstream
    /// cannot guarantee complete-frame boundaries.
    live: bool,
}

impl<S: DecodeSession> Decoder<S> {
    pub fn new(session: S, allocator: Box<dyn SurfaceAllocator>, config: DecoderConfig) -> Self {
        let live = config.live && config.codec.supports_live_mode();

        let mut params = VideoParams::new(config.codec);
        params.async_depth = if live { 1 } else { config.async_depth };
        params.io_pattern = config.memory;

        Self {
            session,
            params,
            bitstream: Bitstream::new(),
            allocator: Some(allocator),
            pool: None,
            filter: None,
            filter_active: false,
            ready: Default::default(),
            state: DecodingState::Uninitialized,
            pacing: Default::default(),
            interlace: Default::default(),
            live,
            config,
        }
    }

    /// Attaches a candidate post-processing stage. It is only engaged at
    /// session start, and only if the hardware's native format differs from
    /// the requested output format.
    pub fn with_filter(mut self, filter: Box<dyn VideoFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Feeds one compressed access unit and runs the decode loop.
    ///
    /// An empty `data` slice submits nothing new and decodes from whatever
    /// is already accumulated; callers signal end of stream by switching to
    /// [`flush`](Self::flush).
    ///
    /// Flow-control outcomes (`NeedMoreData`, `Ready`) are expected
    /// steady-state during startup and are not failures; see
    /// [`DecodeError`].
    pub fn decode(&mut self, data: &[u8], pts: Option<u64>) -> Result<(), DecodeError> {
        self.check_not_failed()?;

        if !data.is_empty() {
            self.bitstream.append(data);
            if let Some(pts) = pts {
                self.bitstream.set_timestamp(pts);
            }
        }

        if self.state == DecodingState::Uninitialized {
            return match self.start() {
                Ok(()) => {
                    self.state = DecodingState::Running;
                    Err(DecodeError::Ready)
                }
                Err(DecodeError::NeedMoreData) => Err(DecodeError::NeedMoreData),
                Err(e) => {
                    self.state = DecodingState::Failed;
                    Err(e)
                }
            };
        }

        self.decode_loop()
    }

    /// Drains one internally buffered frame after end of stream.
    ///
    /// Returns `Ok(())` with a frame queued per call until the hardware
    /// reports drained, then [`DecodeError::Flushed`].
    pub fn flush(&mut self) -> Result<(), DecodeError> {
        self.check_not_failed()?;

        if self.state == DecodingState::Uninitialized {
            return Err(DecodeError::Flushed);
        }

        let pool = self.running_pool()?;
        let (outcome, _held) = self.submit_with_retry(&pool, true)?;

        match outcome.status {
            HwStatus::Ok | HwStatus::VideoParamChanged => match (outcome.sync, outcome.output) {
                (Some(sync), Some(output)) => {
                    self.finish_frame(&pool, sync, output)?;
                    Ok(())
                }
                _ => Err(DecodeError::Flushed),
            },
            HwStatus::MoreData => Err(DecodeError::Flushed),
            s if s.is_warning() => Err(DecodeError::Flushed),
            s => Err(self.fail(anyhow!("hardware error while draining: {:?}", s))),
        }
    }

    /// Clears pacing state and buffered input, then resets the hardware
    /// session parameters in place.
    ///
    /// Refused for mixed-interlace streams: an in-place reset risks losing
    /// field-pairing state, so those sessions must be fully reinitialized.
    pub fn reset(&mut self) -> Result<(), DecodeError> {
        self.check_not_failed()?;

        if self.interlace.mode() == Some(InterlaceMode::Mixed) {
            return Err(DecodeError::Unknown(anyhow!(
                "mixed-interlace stream cannot be reset in place"
            )));
        }

        self.bitstream.clear();
        self.pacing.reset();
        self.ready.clear();

        if self.state == DecodingState::Running {
            let sts = self.session.reset(&self.params);
            if sts.is_error() {
                log::error!("hardware session reset failed: {:?}", sts);
                self.state = DecodingState::Failed;
                return Err(DecodeError::InitFailed);
            }
        }

        Ok(())
    }

    /// Pops the next completed frame, transferring surface ownership to the
    /// caller.
    pub fn next_frame(&mut self) -> Option<DecodedFrame> {
        self.ready.pop_front()
    }

    pub fn codec(&self) -> crate::Codec {
        self.config.codec
    }

    /// Negotiated parameters. Only meaningful once the session has started.
    pub fn params(&self) -> &VideoParams {
        &self.params
    }

    pub fn interlace_mode(&self) -> Option<InterlaceMode> {
        self.interlace.mode()
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    fn check_not_failed(&self) -> Result<(), DecodeError> {
        if self.state == DecodingState::Failed {
            Err(DecodeError::Unknown(anyhow!(
                "session is in failed state and must be rebuilt"
            )))
        } else {
            Ok(())
        }
    }

    fn running_pool(&self) -> Result<Arc<SurfacePool>, DecodeError> {
        match self.pool.as_ref() {
            Some(pool) => Ok(Arc::clone(pool)),
            None => Err(DecodeError::Unknown(anyhow!(
                "no surface pool; session never started"
            ))),
        }
    }

    fn fail(&mut self, err: anyhow::Error) -> DecodeError {
        log::error!("{}", err);
        self.state = DecodingState::Failed;
        DecodeError::Unknown(err)
    }

    /// Loads any codec-specific capability module, accepting the first
    /// candidate identifier the hardware takes.
    fn load_plugins(&mut self) -> Result<(), DecodeError> {
        let uids = plugin_uids(self.config.codec);
        if uids.is_empty() {
            return Ok(());
        }

        for uid in uids {
            if self.session.load_plugin(uid) == HwStatus::Ok {
                log::debug!("loaded capability module {:02x?}", uid.0);
                return Ok(());
            }
        }

        log::error!("no capability module accepted for {:?}", self.config.codec);
        Err(DecodeError::UnsupportedCodec)
    }

    /// Completes negotiated parameters from caller-supplied stream
    /// information wherever the header parse left a field unset.
    fn merge_stream_info(&mut self) {
        let hints = &self.config.stream_info;
        let info = &mut self.params.info;

        if info.frame_rate.is_unset() {
            info.frame_rate = hints.frame_rate;
        }
        if info.aspect_ratio.is_unset() {
            info.aspect_ratio = hints.pixel_aspect_ratio;
        }
        if info.resolution.width == 0 || info.resolution.height == 0 {
            info.resolution = hints.resolution;
        }
        if info.picture_structure.is_none() {
            info.picture_structure = hints.interlaced.map(|interlaced| {
                if interlaced {
                    crate::PictureStructure::TopFieldFirst
                } else {
                    crate::PictureStructure::Progressive
                }
            });
        }
    }

    /// One-time session start: plugin loading, header parse, parameter
    /// merge, filter decision, pool construction, hardware init.
    fn start(&mut self) -> Result<(), DecodeError> {
        self.load_plugins()?;

        match self.session.parse_header(&self.bitstream, &mut self.params) {
            HwStatus::MoreData => return Err(DecodeError::NeedMoreData),
            s if s.is_error() => {
                log::error!("header parse failed: {:?}", s);
                return Err(DecodeError::BitstreamParser);
            }
            _ => (),
        }

        self.merge_stream_info();
        self.pacing
            .set_duration(frame_duration(self.params.info.frame_rate));

        let request = self.session.query_requirements(&self.params).map_err(|s| {
            log::error!("surface requirements query failed: {:?}", s);
            DecodeError::AllocationFailed
        })?;

        let native = self.params.info.format;
        let requested = self.config.stream_info.format;

        if native.is_some_and(|f| f != requested) {
            let filter = self.filter.as_mut().ok_or_else(|| {
                log::error!(
                    "native format {:?} differs from requested {:?} but no filter stage is attached",
                    native,
                    requested
                );
                DecodeError::InitFailed
            })?;

            // The filter shares the decode pool; one surface beyond the
            // async window is enough on its side.
            let request = SurfaceRequest {
                suggested: request.suggested.saturating_sub(self.params.async_depth) + 1,
                ..request
            };
            let pool = filter.start(&request, requested).map_err(|e| {
                log::error!("filter start failed: {}", e);
                DecodeError::InitFailed
            })?;
            self.pool = Some(pool);
            self.filter_active = true;
        } else {
            let allocator = self
                .allocator
                .take()
                .ok_or(DecodeError::AllocationFailed)?;
            self.pool = Some(SurfacePool::new(allocator, self.params.info));
        }

        let sts = self.session.init(&self.params);
        if sts.is_error() {
            log::error!("hardware decoder init failed: {:?}", sts);
            return Err(DecodeError::InitFailed);
        }

        log::debug!(
            "session started: {:?} {}x{}, async depth {}, live {}",
            self.params.codec,
            self.params.info.resolution.width,
            self.params.info.resolution.height,
            self.params.async_depth,
            self.live,
        );

        Ok(())
    }

    /// The Running-state loop: acquire, submit, sync, emit.
    ///
    /// In live mode one call can produce zero, one or several frames, since
    /// decode order differs from display order under hardware reordering.
    fn decode_loop(&mut self) -> Result<(), DecodeError> {
        let pool = self.running_pool()?;
        // Guards the live-mode loop against spinning on input the hardware
        // refuses to consume.
        let mut stalled_at: Option<usize> = None;

        loop {
            let (outcome, _held) = self.submit_with_retry(&pool, false)?;

            match outcome.status {
                HwStatus::Ok | HwStatus::VideoParamChanged => {
                    match (outcome.sync, outcome.output) {
                        (Some(sync), Some(output)) => {
                            self.finish_frame(&pool, sync, output)?;
                            stalled_at = None;
                            if !self.live {
                                return Ok(());
                            }
                        }
                        _ => {
                            // Accepted without output: the hardware is
                            // buffering. Same handling as more-data.
                            self.bitstream.compact();
                            return Err(DecodeError::NeedMoreData);
                        }
                    }
                }
                HwStatus::MoreData => {
                    self.bitstream.compact();
                    let remaining = self.bitstream.remaining();
                    if self.live && remaining > 0 && stalled_at != Some(remaining) {
                        // Buffered data may still yield output; try again.
                        stalled_at = Some(remaining);
                        continue;
                    }
                    return Err(DecodeError::NeedMoreData);
                }
                s if s.is_warning() => {
                    self.bitstream.compact();
                    return Err(DecodeError::NeedMoreData);
                }
                s => {
                    return Err(self.fail(anyhow!("hardware error during decode: {:?}", s)));
                }
            }
        }
    }

    /// Acquires a working surface and submits, retrying while the device is
    /// busy and feeding additional surfaces while the hardware asks for them
    /// (multi-field or multi-tile inputs).
    ///
    /// The returned proxies keep every surface handed to this submission
    /// alive until the caller is done with the outcome.
    fn submit_with_retry(
        &mut self,
        pool: &Arc<SurfacePool>,
        drain: bool,
    ) -> Result<(SubmitOutcome, Vec<SurfaceProxy>), DecodeError> {
        let mut held = Vec::new();
        let mut busy_retries = 0;

        loop {
            let work = pool.acquire().map_err(|e| match e {
                PoolError::Exhausted => DecodeError::AllocationFailed,
                e => DecodeError::Unknown(anyhow::Error::new(e)),
            })?;

            let outcome = if drain {
                self.session.submit(None, work.id())
            } else {
                self.session.submit(Some(&mut self.bitstream), work.id())
            };

            match outcome.status {
                HwStatus::DeviceBusy => {
                    busy_retries += 1;
                    if busy_retries > self.config.busy_poll.max_submit_retries {
                        return Err(self.fail(anyhow!("device stayed busy past retry budget")));
                    }
                    std::thread::sleep(self.config.busy_poll.busy_sleep);
                }
                HwStatus::MoreSurface => {
                    // The hardware kept this surface for the same input and
                    // wants another one.
                    held.push(work);
                }
                _ => {
                    held.push(work);
                    return Ok((outcome, held));
                }
            }
        }
    }

    /// Post-submission path: compact consumed input, wait on the sync point,
    /// resolve the output surface, run the filter, build the frame record.
    fn finish_frame(
        &mut self,
        pool: &Arc<SurfacePool>,
        sync: SyncPoint,
        output: SurfaceId,
    ) -> Result<(), DecodeError> {
        self.bitstream.compact();
        self.wait_sync(sync)?;

        let mut proxy = match pool.find_by_id(output) {
            Ok(proxy) => proxy,
            // The hardware reported a surface this pool never allocated.
            Err(e) => return Err(self.fail(anyhow::Error::new(e))),
        };

        if let Some(structure) = self.session.output_picture_structure(output) {
            self.interlace.update(structure);
        }

        if self.filter_active {
            // `filter` is always present when `filter_active` is set.
            if let Some(filter) = self.filter.as_mut() {
                proxy = match filter.process(&proxy) {
                    Ok(converted) => converted,
                    Err(e) => return Err(self.fail(anyhow::Error::new(e))),
                };
            }
        }

        let (number, timestamp) = self.pacing.next(self.bitstream.take_timestamp());
        log::debug!("frame {} ready, pts {}", number, timestamp);

        self.ready.push_back(DecodedFrame {
            presentation_number: number,
            timestamp,
            duration: self.pacing.duration(),
            crop: proxy.surface().crop(),
            interlace_mode: self.interlace.mode().unwrap_or(InterlaceMode::Progressive),
            top_field_first: self.interlace.top_field_first(),
            surface: proxy,
        });

        Ok(())
    }

    /// Polls the completion handle with a bounded per-attempt timeout,
    /// retrying while the hardware reports still-executing.
    fn wait_sync(&mut self, sync: SyncPoint) -> Result<(), DecodeError> {
        let timeout_ms = self.config.busy_poll.sync_timeout.as_millis() as u64;

        for _ in 0..self.config.busy_poll.max_sync_attempts {
            match self.session.sync_wait(sync, timeout_ms) {
                HwStatus::Ok => return Ok(()),
                HwStatus::InExecution => continue,
                s => return Err(self.fail(anyhow!("sync wait failed: {:?}", s))),
            }
        }

        Err(self.fail(anyhow!("decode operation never completed")))
    }
}

impl<S: DecodeSession> Drop for Decoder<S> {
    fn drop(&mut self) {
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::backend::dummy::DummyAllocator;
    use crate::backend::dummy::DummySession;
    use crate::backend::dummy::SubmitStep;
    use crate::decoder::BusyPoll;
    use crate::vpp::FilterError;
    use crate::Codec;
    use crate::DecodedFormat;
    use crate::PictureStructure;

    fn test_config(codec: Codec) -> DecoderConfig {
        let mut config = DecoderConfig::new(codec);
        config.busy_poll = BusyPoll {
            busy_sleep: Duration::from_micros(1),
            max_submit_retries: 16,
            sync_timeout: Duration::from_millis(1),
            max_sync_attempts: 16,
        };
        config
    }

    fn new_decoder(session: DummySession, config: DecoderConfig) -> Decoder<DummySession> {
        Decoder::new(session, Box::new(DummyAllocator::new()), config)
    }

    /// Feeds enough bytes for the header and brings the session to Running.
    fn running_decoder(session: DummySession, config: DecoderConfig) -> Decoder<DummySession> {
        let header_len = session.header_len;
        let mut decoder = new_decoder(session, config);
        assert!(matches!(
            decoder.decode(&vec![0u8; header_len], None),
            Err(DecodeError::Ready)
        ));
        decoder
    }

    #[test]
    fn partial_header_chunks_return_need_more_data() {
        // Header needs 16 bytes; feed it in two 6-byte chunks plus a third.
        let mut decoder = new_decoder(DummySession::new(), test_config(Codec::H264));

        assert!(matches!(
            decoder.decode(&[0u8; 6], None),
            Err(DecodeError::NeedMoreData)
        ));
        assert!(matches!(
            decoder.decode(&[0u8; 6], None),
            Err(DecodeError::NeedMoreData)
        ));
        // Third chunk crosses the threshold: parameters known, Running.
        assert!(matches!(
            decoder.decode(&[0u8; 6], None),
            Err(DecodeError::Ready)
        ));
        assert_eq!(decoder.params().info.resolution, (320, 240).into());
        assert!(decoder.session.is_inited());
    }

    #[test]
    fn corrupt_header_is_session_fatal() {
        let mut session = DummySession::new();
        session.corrupt_header = true;
        let mut decoder = new_decoder(session, test_config(Codec::H264));

        assert!(matches!(
            decoder.decode(&[0u8; 32], None),
            Err(DecodeError::BitstreamParser)
        ));
        // No in-place recovery.
        assert!(matches!(
            decoder.decode(&[0u8; 32], None),
            Err(DecodeError::Unknown(_))
        ));
    }

    #[test]
    fn init_failure_is_surfaced() {
        let mut session = DummySession::new();
        session.fail_init = true;
        let mut decoder = new_decoder(session, test_config(Codec::H264));

        assert!(matches!(
            decoder.decode(&[0u8; 32], None),
            Err(DecodeError::InitFailed)
        ));
    }

    #[test]
    fn no_acceptable_plugin_means_unsupported_codec() {
        let mut session = DummySession::new();
        session.acceptable_plugins = Some(vec![]);
        let mut decoder = new_decoder(session, test_config(Codec::H265));

        assert!(matches!(
            decoder.decode(&[0u8; 32], None),
            Err(DecodeError::UnsupportedCodec)
        ));
    }

    #[test]
    fn codec_without_plugins_skips_loading() {
        let mut session = DummySession::new();
        // Even a device that rejects every module can decode H264.
        session.acceptable_plugins = Some(vec![]);
        let mut decoder = new_decoder(session, test_config(Codec::H264));

        assert!(matches!(
            decoder.decode(&[0u8; 32], None),
            Err(DecodeError::Ready)
        ));
    }

    #[test]
    fn one_frame_per_call_in_non_live_mode() {
        // Header bytes double as the first two access units (8 bytes each).
        let mut decoder = running_decoder(DummySession::new(), test_config(Codec::H264));

        assert!(decoder.decode(&[], None).is_ok());
        let first = decoder.next_frame().unwrap();
        assert_eq!(first.presentation_number, 0);
        assert!(decoder.next_frame().is_none());

        // The second buffered access unit comes out on the next call.
        assert!(decoder.decode(&[], None).is_ok());
        assert_eq!(decoder.next_frame().unwrap().presentation_number, 1);
    }

    #[test]
    fn live_mode_drains_all_buffered_access_units_in_one_call() {
        let mut config = test_config(Codec::Vp9);
        config.live = true;
        // 16 header bytes buffered at Ready = two 8-byte access units.
        let mut decoder = running_decoder(DummySession::new(), config);
        assert!(decoder.is_live());
        assert_eq!(decoder.params().async_depth, 1);

        assert!(matches!(
            decoder.decode(&[], None),
            Err(DecodeError::NeedMoreData)
        ));

        let first = decoder.next_frame().unwrap();
        let second = decoder.next_frame().unwrap();
        assert!(decoder.next_frame().is_none());

        assert_eq!(first.presentation_number, 0);
        assert_eq!(second.presentation_number, 1);
        assert!(second.timestamp > first.timestamp);
        // 25 fps stream: frames spaced by exactly one duration.
        assert_eq!(second.timestamp - first.timestamp, 40_000_000);
        assert_eq!(first.duration, 40_000_000);
    }

    #[test]
    fn live_mode_is_disabled_for_h264() {
        let mut config = test_config(Codec::H264);
        config.live = true;
        let decoder = new_decoder(DummySession::new(), config);
        assert!(!decoder.is_live());
    }

    #[test]
    fn explicit_pts_wins_over_computed_pacing() {
        let mut decoder = running_decoder(DummySession::new(), test_config(Codec::H264));

        // Drain the two access units buffered during startup.
        decoder.decode(&[], None).unwrap();
        decoder.decode(&[], None).unwrap();
        while decoder.next_frame().is_some() {}

        decoder.decode(&[1u8; 8], Some(9_000_000)).unwrap();
        assert_eq!(decoder.next_frame().unwrap().timestamp, 9_000_000);
    }

    #[test]
    fn device_busy_is_retried_and_never_surfaced() {
        let mut session = DummySession::new();
        session.push_step(SubmitStep::Busy);
        session.push_step(SubmitStep::Busy);
        session.push_step(SubmitStep::Frame(PictureStructure::Progressive));
        let mut decoder = running_decoder(session, test_config(Codec::H264));

        assert!(decoder.decode(&[], None).is_ok());
        assert!(decoder.next_frame().is_some());
    }

    #[test]
    fn busy_past_the_retry_budget_fails_the_session() {
        let mut session = DummySession::new();
        for _ in 0..64 {
            session.push_step(SubmitStep::Busy);
        }
        let mut decoder = running_decoder(session, test_config(Codec::H264));

        assert!(matches!(
            decoder.decode(&[], None),
            Err(DecodeError::Unknown(_))
        ));
    }

    #[test]
    fn more_surface_feeds_additional_surfaces() {
        let mut session = DummySession::new();
        session.push_step(SubmitStep::MoreSurface);
        session.push_step(SubmitStep::MoreSurface);
        session.push_step(SubmitStep::Frame(PictureStructure::Progressive));
        let mut decoder = running_decoder(session, test_config(Codec::H264));

        assert!(decoder.decode(&[], None).is_ok());
        assert!(decoder.next_frame().is_some());
    }

    #[test]
    fn still_executing_sync_is_polled_to_completion() {
        let mut session = DummySession::new();
        session.sync_polls = 5;
        let mut decoder = running_decoder(session, test_config(Codec::H264));

        assert!(decoder.decode(&[], None).is_ok());
        assert!(decoder.next_frame().is_some());
    }

    #[test]
    fn flush_yields_one_frame_per_call_until_drained() {
        let mut session = DummySession::new();
        session.buffered_drain_frames = 2;
        let mut decoder = running_decoder(session, test_config(Codec::H264));

        // Consume the buffered input first.
        decoder.decode(&[], None).unwrap();
        decoder.decode(&[], None).unwrap();
        while decoder.next_frame().is_some() {}

        assert!(decoder.flush().is_ok());
        assert!(decoder.next_frame().is_some());
        assert!(decoder.flush().is_ok());
        assert!(decoder.next_frame().is_some());

        assert!(matches!(decoder.flush(), Err(DecodeError::Flushed)));
        assert!(decoder.next_frame().is_none());
        // Stays drained.
        assert!(matches!(decoder.flush(), Err(DecodeError::Flushed)));
    }

    #[test]
    fn flush_before_start_reports_drained() {
        let mut decoder = new_decoder(DummySession::new(), test_config(Codec::H264));
        assert!(matches!(decoder.flush(), Err(DecodeError::Flushed)));
    }

    #[test]
    fn interlace_inference_marks_mixed_streams() {
        let mut session = DummySession::new();
        session.push_structure(PictureStructure::Progressive);
        session.push_structure(PictureStructure::TopFieldFirst);
        let mut decoder = running_decoder(session, test_config(Codec::H264));

        decoder.decode(&[], None).unwrap();
        assert_eq!(decoder.interlace_mode(), Some(InterlaceMode::Progressive));

        decoder.decode(&[], None).unwrap();
        assert_eq!(decoder.interlace_mode(), Some(InterlaceMode::Mixed));

        let frame = decoder.next_frame().unwrap();
        assert_eq!(frame.interlace_mode, InterlaceMode::Progressive);
    }

    #[test]
    fn reset_restarts_pacing_and_resets_the_hardware() {
        let mut decoder = running_decoder(DummySession::new(), test_config(Codec::H264));

        decoder.decode(&[], None).unwrap();
        assert_eq!(decoder.next_frame().unwrap().presentation_number, 0);

        decoder.reset().unwrap();
        assert_eq!(decoder.session.reset_count(), 1);

        decoder.decode(&[2u8; 8], None).unwrap();
        // Numbering restarts after the reset.
        assert_eq!(decoder.next_frame().unwrap().presentation_number, 0);
    }

    #[test]
    fn reset_is_refused_for_mixed_interlace_streams() {
        let mut session = DummySession::new();
        session.push_structure(PictureStructure::TopFieldFirst);
        session.push_structure(PictureStructure::Progressive);
        let mut decoder = running_decoder(session, test_config(Codec::H264));

        decoder.decode(&[], None).unwrap();
        decoder.decode(&[], None).unwrap();
        assert_eq!(decoder.interlace_mode(), Some(InterlaceMode::Mixed));

        assert!(matches!(decoder.reset(), Err(DecodeError::Unknown(_))));
    }

    #[test]
    fn reordered_output_resolves_an_earlier_surface() {
        let mut session = DummySession::new();
        session.push_step(SubmitStep::MoreData);
        session.push_step(SubmitStep::EarlierFrame(PictureStructure::Progressive));

        let allocator = DummyAllocator::new();
        let mut decoder = Decoder::new(
            session,
            Box::new(Arc::clone(&allocator)),
            test_config(Codec::H264),
        );
        assert!(matches!(
            decoder.decode(&[0u8; 16], None),
            Err(DecodeError::Ready)
        ));

        // The hardware buffers the first access unit as a reference picture:
        // no output, and the submitted surface stays locked after the
        // driver's reference to it is gone.
        assert!(matches!(
            decoder.decode(&[], None),
            Err(DecodeError::NeedMoreData)
        ));
        allocator.set_locked(1, true);

        // The next submission decodes into a fresh surface but reports the
        // earlier, still-locked one as output.
        decoder.decode(&[], None).unwrap();
        let frame = decoder.next_frame().unwrap();
        assert_eq!(frame.surface.id(), 1);
    }

    #[test]
    fn dropping_the_decoder_closes_the_session() {
        let session = DummySession::new();
        assert!(!session.is_closed());
        let closed = session.close_witness();

        let decoder = new_decoder(session, test_config(Codec::H264));
        assert!(!closed.load(Ordering::Relaxed));
        drop(decoder);
        assert!(closed.load(Ordering::Relaxed));
    }

    #[test]
    fn exhausted_pool_surfaces_allocation_failed() {
        let mut decoder = running_decoder(DummySession::new(), test_config(Codec::H264));

        decoder.decode(&[], None).unwrap();
        let frame = decoder.next_frame().unwrap();

        // Cap the pool while a frame is still held downstream.
        // The held frame plus the in-flight work surface exceed capacity 1.
        decoder.pool.as_ref().unwrap().set_capacity(1);
        assert!(matches!(
            decoder.decode(&[3u8; 8], None),
            Err(DecodeError::AllocationFailed)
        ));

        // Releasing the frame makes the next call succeed again.
        drop(frame);
        decoder.pool.as_ref().unwrap().set_capacity(0);
        assert!(decoder.decode(&[], None).is_ok());
    }

    /// Filter stub that hands frames through while counting invocations.
    struct PassthroughFilter {
        allocator: std::sync::Arc<DummyAllocator>,
        processed: std::sync::Arc<AtomicUsize>,
    }

    impl VideoFilter for PassthroughFilter {
        fn start(
            &mut self,
            request: &SurfaceRequest,
            _format: DecodedFormat,
        ) -> Result<Arc<SurfacePool>, FilterError> {
            Ok(SurfacePool::new(
                Box::new(Arc::clone(&self.allocator)),
                request.info,
            ))
        }

        fn process(&mut self, input: &SurfaceProxy) -> Result<SurfaceProxy, FilterError> {
            self.processed.fetch_add(1, Ordering::Relaxed);
            Ok(input.clone())
        }
    }

    #[test]
    fn filter_is_engaged_when_formats_differ() {
        let processed = std::sync::Arc::new(AtomicUsize::new(0));
        let filter = PassthroughFilter {
            allocator: DummyAllocator::new(),
            processed: std::sync::Arc::clone(&processed),
        };

        let mut config = test_config(Codec::H264);
        config.stream_info.format = DecodedFormat::I420; // native is NV12
        let decoder = new_decoder(DummySession::new(), config);
        let mut decoder = decoder.with_filter(Box::new(filter));

        assert!(matches!(
            decoder.decode(&[0u8; 16], None),
            Err(DecodeError::Ready)
        ));
        decoder.decode(&[], None).unwrap();

        assert_eq!(processed.load(Ordering::Relaxed), 1);
        assert!(decoder.next_frame().is_some());
    }

    #[test]
    fn format_mismatch_without_filter_fails_init() {
        let mut config = test_config(Codec::H264);
        config.stream_info.format = DecodedFormat::P010;
        let mut decoder = new_decoder(DummySession::new(), config);

        assert!(matches!(
            decoder.decode(&[0u8; 16], None),
            Err(DecodeError::InitFailed)
        ));
    }

    #[test]
    fn matching_formats_leave_the_filter_unengaged() {
        let processed = std::sync::Arc::new(AtomicUsize::new(0));
        let filter = PassthroughFilter {
            allocator: DummyAllocator::new(),
            processed: std::sync::Arc::clone(&processed),
        };

        // Native and requested are both NV12.
        let decoder = new_decoder(DummySession::new(), test_config(Codec::H264));
        let mut decoder = decoder.with_filter(Box::new(filter));

        assert!(matches!(
            decoder.decode(&[0u8; 16], None),
            Err(DecodeError::Ready)
        ));
        decoder.decode(&[], None).unwrap();

        assert_eq!(processed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn caller_hints_fill_unset_header_fields() {
        let mut session = DummySession::new();
        session.parsed_info.frame_rate = Fraction::default();
        session.parsed_info.aspect_ratio = Fraction::default();

        let mut config = test_config(Codec::H264);
        config.stream_info.frame_rate = Fraction::new(30, 1);
        config.stream_info.pixel_aspect_ratio = Fraction::new(4, 3);
        let mut decoder = new_decoder(session, config);

        assert!(matches!(
            decoder.decode(&[0u8; 16], None),
            Err(DecodeError::Ready)
        ));
        assert_eq!(decoder.params().info.frame_rate, Fraction::new(30, 1));
        assert_eq!(decoder.params().info.aspect_ratio, Fraction::new(4, 3));

        // Pacing derives from the merged frame rate.
        decoder.decode(&[], None).unwrap();
        assert_eq!(decoder.next_frame().unwrap().duration, 33_333_333);
    }

    #[test]
    fn crop_rectangle_reaches_the_output_frame() {
        let mut decoder = running_decoder(DummySession::new(), test_config(Codec::H264));

        decoder.decode(&[], None).unwrap();
        let frame = decoder.next_frame().unwrap();
        assert_eq!(frame.crop.width, 320);
        assert_eq!(frame.crop.height, 240);
    }
}
