// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Sequential NAL reading for a streaming run.
//!
//! The reader owns its container file handle and a rolling buffer: refill in
//! 64 KiB chunks up to 256 KiB, parse whole NAL units out of the front, keep
//! a trailing partial unit for the next round. `buffer_start_pos` tracks the
//! absolute container offset of the buffer's first byte so every emitted NAL
//! knows its file offset; the session needs that to flush audio frames in
//! step with video.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base::{err, Error};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::hevc;
use crate::oracle::{self, Anchor};
use crate::tindex::Segment;

const CHUNK_LEN: usize = 64 << 10;
const MIN_BUFFER_LEN: usize = 256 << 10;

/// Bound on refill rounds per call. The data region is zero-filled past the
/// recording's end, so a scan that keeps finding nothing is the end of the
/// stream, not a short read.
const MAX_REFILL_ROUNDS: usize = 10;

/// One NAL unit ready for the wire: payload without start code, plus the
/// presentation timestamp and the unit's absolute container offset.
#[derive(Clone, Debug)]
pub struct NalFrame {
    pub data: Vec<u8>,
    pub nal_type: u8,
    pub timestamp_ms: i64,
    pub file_offset: u64,
}

pub struct StreamReader {
    file: tokio::fs::File,
    /// Next container offset to read from.
    stream_pos: u64,
    buffer: Vec<u8>,
    /// Absolute container offset of `buffer[0]`.
    buffer_start_pos: u64,
    /// Running presentation clock, microseconds of wall-clock time.
    current_time_us: i64,
    /// Inter-frame interval in microseconds, shared with the session so a
    /// `speed` command retargets pacing mid-run.
    interval_us: Arc<AtomicU64>,
    segment: Segment,
    /// I-frame anchors for fine timestamp recomputation; empty disables it.
    anchors: Vec<Anchor>,
    frames_emitted: u64,
}

impl StreamReader {
    pub(crate) fn new(
        file: std::fs::File,
        start_pos: u64,
        start_time_ms: i64,
        segment: Segment,
        anchors: Vec<Anchor>,
        interval_us: Arc<AtomicU64>,
    ) -> Self {
        StreamReader {
            file: tokio::fs::File::from_std(file),
            stream_pos: start_pos,
            buffer: Vec::with_capacity(MIN_BUFFER_LEN + CHUNK_LEN),
            buffer_start_pos: start_pos,
            current_time_us: start_time_ms * 1_000,
            interval_us,
            segment,
            anchors,
            frames_emitted: 0,
        }
    }

    /// Current read position in the container.
    pub fn position(&self) -> u64 {
        self.stream_pos
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Reads the next batch of complete NAL units.
    ///
    /// An empty result means end of stream. Errors are I/O-level only; they
    /// abort the run.
    pub async fn read_next_nals(&mut self) -> Result<Vec<NalFrame>, Error> {
        for _ in 0..MAX_REFILL_ROUNDS {
            if !self.fill(CHUNK_LEN, false).await? && self.buffer.is_empty() {
                return Ok(Vec::new());
            }

            let units = hevc::parse_nal_units(&self.buffer);
            match units.len() {
                0 => {
                    // No start code anywhere; discard and rescan from the
                    // current read position.
                    self.buffer.clear();
                    self.buffer_start_pos = self.stream_pos;
                }
                1 => {
                    // A single, possibly huge unit; pull a larger chunk past
                    // the usual cap so the next parse can find its end.
                    if !self.fill(4 * CHUNK_LEN, true).await? {
                        return Ok(Vec::new());
                    }
                }
                _ => return Ok(self.emit(&units)),
            }
        }
        Ok(Vec::new())
    }

    /// Emits all units but the (possibly partial) last one and drains them
    /// from the buffer.
    fn emit(&mut self, units: &[hevc::NalUnit]) -> Vec<NalFrame> {
        let interval_us = self.interval_us.load(Ordering::Relaxed) as i64;
        let mut out = Vec::with_capacity(units.len() - 1);
        for u in &units[..units.len() - 1] {
            let file_offset = self.buffer_start_pos + u.offset as u64;
            let data = hevc::strip_start_code(&self.buffer[u.offset..u.end()]).to_vec();
            let timestamp_ms;
            if hevc::is_video_frame(u.nal_type) {
                if hevc::is_key_frame(u.nal_type) && !self.anchors.is_empty() {
                    let off = u32::try_from(file_offset).unwrap_or(u32::MAX);
                    self.current_time_us =
                        oracle::fine_time(&self.anchors, off, &self.segment) * 1_000_000;
                }
                timestamp_ms = self.current_time_us / 1_000;
                self.current_time_us += interval_us;
                self.frames_emitted += 1;
            } else {
                timestamp_ms = self.current_time_us / 1_000;
            }
            out.push(NalFrame {
                data,
                nal_type: u.nal_type,
                timestamp_ms,
                file_offset,
            });
        }

        let consumed = units[units.len() - 2].end();
        self.buffer.drain(..consumed);
        self.buffer_start_pos += consumed as u64;
        out
    }

    /// Appends up to `chunk_len` bytes unless the buffer is already full
    /// (`force` overrides the cap for oversized NAL units). Returns false
    /// only when the file yields no more bytes.
    async fn fill(&mut self, chunk_len: usize, force: bool) -> Result<bool, Error> {
        if !force && self.buffer.len() >= MIN_BUFFER_LEN {
            return Ok(true);
        }
        if self.buffer.is_empty() {
            self.buffer_start_pos = self.stream_pos;
        }
        self.file
            .seek(std::io::SeekFrom::Start(self.stream_pos))
            .await
            .map_err(|e| err!(Unavailable, msg("seek to {:#x} failed", self.stream_pos), source(e)))?;

        let start = self.buffer.len();
        self.buffer.resize(start + chunk_len, 0);
        let mut filled = 0;
        while filled < chunk_len {
            let n = self
                .file
                .read(&mut self.buffer[start + filled..])
                .await
                .map_err(|e| {
                    err!(Unavailable, msg("read at {:#x} failed", self.stream_pos), source(e))
                })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.buffer.truncate(start + filled);
        self.stream_pos += filled as u64;
        Ok(filled > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, ContainerSpec, FrameSpec};
    use crate::trec::CHANNEL_VIDEO_PRIMARY;

    fn interval(us: u64) -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(us))
    }

    fn test_segment() -> Segment {
        Segment {
            file_index: 0,
            channel: CHANNEL_VIDEO_PRIMARY,
            start_time: 1_766_034_449,
            end_time: 1_766_041_804,
            frame_count: 0,
        }
    }

    #[tokio::test]
    async fn reads_whole_stream_in_order() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let mut frames = vec![FrameSpec::video_key(
            CHANNEL_VIDEO_PRIMARY,
            1_766_034_449,
            &[0xaa; 512],
        )];
        for i in 0..5 {
            frames.push(FrameSpec::video_predicted(
                CHANNEL_VIDEO_PRIMARY,
                1_766_034_450 + i,
                &[0xbb; 256],
            ));
        }
        let spec = ContainerSpec { frames, ..ContainerSpec::default() };
        let path = testutil::write_container(dir.path(), 0, &spec);

        let f = std::fs::File::open(&path).unwrap();
        let mut r = StreamReader::new(
            f,
            spec.data_start,
            1_766_034_449_000,
            test_segment(),
            Vec::new(),
            interval(40_000),
        );

        let mut types = Vec::new();
        let mut last_offset = 0;
        let mut last_video_ts = 0;
        loop {
            let nals = r.read_next_nals().await.unwrap();
            if nals.is_empty() {
                break;
            }
            for n in &nals {
                assert!(n.file_offset >= last_offset, "offsets must ascend");
                last_offset = n.file_offset;
                if hevc::is_video_frame(n.nal_type) {
                    assert!(n.timestamp_ms >= last_video_ts);
                    last_video_ts = n.timestamp_ms;
                }
                types.push(n.nal_type);
            }
        }

        // Prologue, key frame, then the predicted frames. The final unit has
        // no terminating start code before the zero fill; it stays buffered
        // and is dropped at end of stream.
        assert_eq!(
            &types[..4],
            &[hevc::NAL_VPS, hevc::NAL_SPS, hevc::NAL_PPS, hevc::NAL_IDR_W_RADL]
        );
        assert_eq!(
            types.iter().filter(|&&t| t == hevc::NAL_TRAIL_R).count(),
            4
        );
    }

    #[tokio::test]
    async fn p_frames_advance_by_interval() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let mut frames = vec![FrameSpec::video_key(
            CHANNEL_VIDEO_PRIMARY,
            1_766_034_449,
            &[0xaa; 128],
        )];
        for _ in 0..4 {
            frames.push(FrameSpec::video_predicted(
                CHANNEL_VIDEO_PRIMARY,
                1_766_034_450,
                &[0xbb; 128],
            ));
        }
        let spec = ContainerSpec { frames, ..ContainerSpec::default() };
        let path = testutil::write_container(dir.path(), 0, &spec);

        let f = std::fs::File::open(&path).unwrap();
        let start_ms = 1_766_034_449_000;
        let mut r = StreamReader::new(
            f,
            spec.data_start,
            start_ms,
            test_segment(),
            Vec::new(),
            interval(40_000),
        );

        let mut video_ts = Vec::new();
        loop {
            let nals = r.read_next_nals().await.unwrap();
            if nals.is_empty() {
                break;
            }
            video_ts.extend(
                nals.iter()
                    .filter(|n| hevc::is_video_frame(n.nal_type))
                    .map(|n| n.timestamp_ms),
            );
        }
        // IDR + three of the four predicted frames; the last unit is retained
        // unterminated and never emitted.
        assert_eq!(video_ts.len(), 4);
        for (i, ts) in video_ts.iter().enumerate() {
            assert_eq!(*ts, start_ms + 40 * i as i64);
        }
        assert_eq!(r.frames_emitted(), 4);
    }

    #[tokio::test]
    async fn empty_region_is_eof() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let spec = ContainerSpec { write_index_table: false, ..ContainerSpec::default() };
        let path = testutil::write_container(dir.path(), 0, &spec);

        let f = std::fs::File::open(&path).unwrap();
        let mut r = StreamReader::new(
            f,
            0,
            0,
            test_segment(),
            Vec::new(),
            interval(40_000),
        );
        assert!(r.read_next_nals().await.unwrap().is_empty());
    }
}
