// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Accumulator for not-yet-consumed compressed input.
//!
//! The hardware consumes input by advancing an offset into the buffer we hand
//! it. Consumed bytes are compacted out (shifted to index 0) after every sync
//! point so that the offsets the hardware reports on the next call remain
//! valid.

/// Growable byte buffer with a consumed-prefix cursor.
///
/// Invariant: `offset <= data.len()` at all times.
#[derive(Default)]
pub struct Bitstream {
    data: Vec<u8>,
    offset: usize,
    /// Timestamp of the most recently appended access unit, if the caller
    /// supplied one. Taken (at most once) when a frame completes.
    timestamp: Option<u64>,
}

impl Bitstream {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends compressed bytes to the end of the buffer. Never blocks, never
    /// truncates.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Marks `n` more bytes as consumed by the hardware.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.offset + n <= self.data.len());
        self.offset = std::cmp::min(self.offset + n, self.data.len());
    }

    /// Shifts the unconsumed suffix down to index 0 and resets the cursor, so
    /// that future hardware-reported offsets stay valid.
    pub fn compact(&mut self) {
        if self.offset > 0 {
            self.data.drain(..self.offset);
            self.offset = 0;
        }
    }

    /// Drops all buffered data and state. Used on flush/seek.
    pub fn clear(&mut self) {
        self.data.clear();
        self.offset = 0;
        self.timestamp = None;
    }

    /// Number of bytes the hardware has not consumed yet.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    /// Current consumed-prefix offset, as the hardware sees it.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = Some(timestamp);
    }

    /// Returns and clears the pending timestamp. Only the first frame
    /// completed out of an appended buffer carries its explicit timestamp.
    pub fn take_timestamp(&mut self) -> Option<u64> {
        self.timestamp.take()
    }
}
