// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Byte↔time interpolation and seek resolution.
//!
//! The container stores no per-byte timestamps, so positions are mapped to
//! wall-clock time through anchors. Audio frames are the ground truth: they
//! are dense (~166/s) and each carries unix seconds, anchoring any offset to
//! within about a second. VPS positions paired with audio-derived times form
//! the anchor list the fine interpolator runs on; with no anchors at all, a
//! linear byte→time projection over the data region is the fallback. The
//! coarse projection divides by the full data-region length even when a
//! segment doesn't fill its container, so it is only good for UI hints.

use base::{err, Error};

use crate::manager::{LocatedVideoHeader, StorageManager};
use crate::tindex::Segment;
use crate::trec::{AudioFrame, DATA_REGION_END};

/// A `(byte offset, wall-clock seconds)` anchor within one container.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Anchor {
    pub offset: u32,
    pub time: i64,
}

/// Linear byte→time projection over the whole data region.
///
/// Only used when a segment has no anchors; the result always stays within
/// the segment's time range.
pub fn coarse_time(seg: &Segment, byte_offset: u32) -> i64 {
    let offset = u64::from(byte_offset.min(DATA_REGION_END));
    let scaled = offset as f64 / f64::from(DATA_REGION_END) * seg.duration() as f64;
    seg.start_time + scaled as i64
}

/// Interpolates a wall-clock time for `target_offset` between the nearest
/// anchors.
///
/// `anchors` must be sorted by offset with non-decreasing times. A missing
/// predecessor is synthesized as `(0, start_time)`; a missing successor as
/// `(DATA_REGION_END, end_time)`.
pub fn fine_time(anchors: &[Anchor], target_offset: u32, seg: &Segment) -> i64 {
    match anchors {
        [] => return seg.start_time,
        [_] => return coarse_time(seg, target_offset),
        _ => {}
    }

    let i = anchors.partition_point(|a| a.offset <= target_offset);
    let prev = if i > 0 {
        anchors[i - 1]
    } else {
        Anchor {
            offset: 0,
            time: seg.start_time,
        }
    };
    let next = if i < anchors.len() {
        anchors[i]
    } else {
        Anchor {
            offset: DATA_REGION_END,
            time: seg.end_time,
        }
    };

    let byte_range = i64::from(next.offset) - i64::from(prev.offset);
    if byte_range <= 0 {
        return prev.time;
    }
    let in_range = i64::from(target_offset) - i64::from(prev.offset);
    let scaled = in_range as f64 / byte_range as f64 * (next.time - prev.time) as f64;
    prev.time + scaled as i64
}

/// Wall-clock time of the greatest audio record at or before `target_offset`;
/// coarse projection when the segment has no audio.
pub fn audio_time_at_offset(audio: &[AudioFrame], target_offset: u32, seg: &Segment) -> i64 {
    let i = audio.partition_point(|a| a.file_offset <= target_offset);
    match i {
        0 if audio.is_empty() => coarse_time(seg, target_offset),
        0 => audio[0].unix_timestamp,
        _ => audio[i - 1].unix_timestamp,
    }
}

/// Byte offset of the first audio record at or after wall-clock `ts`, falling
/// back to the last audio record; `None` without audio.
pub fn audio_offset_at_time(audio: &[AudioFrame], ts: i64) -> Option<u32> {
    audio
        .iter()
        .find(|a| a.unix_timestamp >= ts)
        .or(audio.last())
        .map(|a| a.file_offset)
}

/// A resolved seek: everything a streaming run needs to start.
#[derive(Debug)]
pub struct ResolvedSeek {
    pub segment: Segment,
    /// Decoder prologue; its `stream_start_pos` is where the P-frame scan
    /// resumes.
    pub header: LocatedVideoHeader,
    /// Wall-clock seconds of the audio anchor closest to the IDR.
    pub actual_start_time: i64,
}

/// Resolves wall-clock `ts` on `channel` against the cached segments.
///
/// Falls back to any channel when the requested one has no covering cached
/// segment. Fails `NotFound` when nothing covers the instant. Returns
/// `Ok(None)` when a segment covers it but no decoder prologue exists in the
/// window at the resolved offset, a distinct and per-run-recoverable outcome.
pub fn resolve_seek(
    mgr: &StorageManager,
    ts: i64,
    channel: u32,
) -> Result<Option<ResolvedSeek>, Error> {
    let segment = mgr
        .find_segment_by_time(ts, Some(channel), true)
        .or_else(|| mgr.find_segment_by_time(ts, None, true))
        .ok_or_else(|| err!(NotFound, msg("no cached segment covers t={ts} ch={channel}")))?;

    let cached = mgr
        .cached_segment(segment.file_index)
        .ok_or_else(|| err!(Internal, msg("segment {} vanished from cache", segment.file_index)))?;

    let target_offset = audio_offset_at_time(&cached.audio_frames, ts).unwrap_or(0);

    let Some(header) = mgr.read_video_header(segment.file_index, u64::from(target_offset))? else {
        return Ok(None);
    };

    // Refine the start time to the audio anchor closest to the IDR.
    let anchor_offset = u32::try_from(header.stream_start_pos).unwrap_or(u32::MAX);
    let actual_start_time = if cached.audio_frames.is_empty() {
        ts
    } else {
        audio_time_at_offset(&cached.audio_frames, anchor_offset, &segment)
    };

    Ok(Some(ResolvedSeek {
        segment,
        header,
        actual_start_time,
    }))
}
