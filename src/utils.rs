// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level
//! modules. Try not to add new code here unless it really doesn't belong
//! anywhere else.

use std::io::Cursor;

use bytes::Buf;
use bytes::BufMut;

use crate::backend::DecodeSession;
use crate::decoder::DecodeError;
use crate::decoder::DecodedFrame;
use crate::decoder::Decoder;

/// One compressed access unit plus its optional presentation timestamp.
pub struct AccessUnit<'a> {
    pub data: &'a [u8],
    pub pts: Option<u64>,
}

/// Iterator over length-prefixed access units.
///
/// Each record is a little-endian `u32` payload size, a little-endian `u64`
/// timestamp (0 meaning none), then the payload.
pub struct AccessUnitIterator<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> AccessUnitIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }
}

impl<'a> Iterator for AccessUnitIterator<'a> {
    type Item = AccessUnit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        // Make sure we have a whole record header.
        if self.cursor.remaining() < 12 {
            return None;
        }

        let len = self.cursor.get_u32_le() as usize;
        let pts = self.cursor.get_u64_le();

        if self.cursor.remaining() < len {
            return None;
        }

        let start = self.cursor.position() as usize;
        self.cursor.advance(len);
        let end = self.cursor.position() as usize;

        Some(AccessUnit {
            data: &self.cursor.get_ref()[start..end],
            pts: if pts == 0 { None } else { Some(pts) },
        })
    }
}

/// Appends one length-prefixed access-unit record to `stream`.
pub fn put_access_unit(stream: &mut Vec<u8>, payload: &[u8], pts: Option<u64>) {
    stream.put_u32_le(payload.len() as u32);
    stream.put_u64_le(pts.unwrap_or(0));
    stream.put_slice(payload);
}

/// Simple decoding loop that plays a stream once from start to finish,
/// including the end-of-stream drain, calling `on_frame` for every completed
/// frame in presentation order.
pub fn simple_decode_loop<S: DecodeSession>(
    decoder: &mut Decoder<S>,
    stream: AccessUnitIterator,
    on_frame: &mut dyn FnMut(DecodedFrame),
) -> Result<(), DecodeError> {
    let mut drain_frames = |decoder: &mut Decoder<S>, on_frame: &mut dyn FnMut(DecodedFrame)| {
        while let Some(frame) = decoder.next_frame() {
            on_frame(frame);
        }
    };

    for au in stream {
        let mut data = au.data;
        let mut pts = au.pts;

        loop {
            match decoder.decode(data, pts) {
                Ok(()) => {
                    drain_frames(decoder, on_frame);
                    // Keep decoding from the accumulator until it runs dry.
                    data = &[];
                    pts = None;
                }
                // Parameters negotiated; same input is still buffered.
                Err(DecodeError::Ready) => {
                    data = &[];
                    pts = None;
                }
                Err(DecodeError::NeedMoreData) => break,
                Err(e) => return Err(e),
            }
        }
    }

    loop {
        match decoder.flush() {
            Ok(()) => drain_frames(decoder, on_frame),
            Err(DecodeError::Flushed) => break,
            Err(e) => return Err(e),
        }
    }
    drain_frames(decoder, on_frame);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyAllocator;
    use crate::backend::dummy::DummySession;
    use crate::decoder::DecoderConfig;
    use crate::Codec;

    #[test]
    fn access_unit_iterator_roundtrip() {
        let mut stream = Vec::new();
        put_access_unit(&mut stream, &[1, 2, 3], Some(100));
        put_access_unit(&mut stream, &[4, 5], None);
        put_access_unit(&mut stream, &[6; 7], Some(300));

        let mut iter = AccessUnitIterator::new(&stream);

        let first = iter.next().unwrap();
        assert_eq!(first.data, &[1, 2, 3]);
        assert_eq!(first.pts, Some(100));

        let second = iter.next().unwrap();
        assert_eq!(second.data, &[4, 5]);
        assert_eq!(second.pts, None);

        let third = iter.next().unwrap();
        assert_eq!(third.data, &[6; 7]);
        assert_eq!(third.pts, Some(300));

        assert!(iter.next().is_none());
    }

    #[test]
    fn truncated_record_ends_iteration() {
        let mut stream = Vec::new();
        put_access_unit(&mut stream, &[1, 2, 3, 4], None);
        stream.put_u32_le(100); // claims 100 payload bytes
        stream.put_u64_le(0);
        stream.put_slice(&[0; 10]); // but only 10 are there

        let mut iter = AccessUnitIterator::new(&stream);
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
    }

    #[test]
    fn plays_a_stream_end_to_end() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut session = DummySession::new();
        session.buffered_drain_frames = 1;

        let mut decoder = Decoder::new(
            session,
            Box::new(DummyAllocator::new()),
            DecoderConfig::new(Codec::H264),
        );

        // Four 8-byte access units; the first two double as the 16-byte
        // header. One more frame comes out of the drain.
        let mut stream = Vec::new();
        for i in 0..4u8 {
            put_access_unit(&mut stream, &[i; 8], None);
        }

        let mut frames = Vec::new();
        simple_decode_loop(&mut decoder, AccessUnitIterator::new(&stream), &mut |f| {
            frames.push(f)
        })
        .unwrap();

        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.presentation_number, i as u64);
        }
    }
}
