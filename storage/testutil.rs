// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Synthetic TPS volumes for tests.
//!
//! Real containers are 256 MiB each; the fixtures here are sparse files of
//! the same nominal size, so a whole multi-segment volume costs a few
//! hundred KiB of actual disk. The data region carries real Annex-B NAL
//! sequences and raw audio payloads, and the trailing frame table is written
//! newest-first, exactly as the firmware does.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Once;

use tempfile::TempDir;

use crate::cache::CacheDir;
use crate::hevc;
use crate::manager::StorageManager;
use crate::tindex::INDEX_FILE_NAME;
use crate::trec::{
    self, CHANNEL_AUDIO, CONTAINER_SIZE, DATA_REGION_END, FRAME_INDEX_MAGIC, FRAME_TYPE_AUDIO,
    FRAME_TYPE_KEY, FRAME_TYPE_PREDICTED,
};

static INIT: Once = Once::new();

/// Sets up logging for a test.
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
    });
}

/// One 64-byte master-index record to synthesize.
#[derive(Clone, Copy, Debug)]
pub struct SegmentSpec {
    pub channel: u8,
    pub start_time: i64,
    pub end_time: i64,
    pub frame_count: u16,
}

impl SegmentSpec {
    pub fn new(channel: u8, start_time: i64, end_time: i64) -> Self {
        SegmentSpec {
            channel,
            start_time,
            end_time,
            frame_count: 0,
        }
    }
}

/// Writes a `TIndex00.tps` with the given record slots.
pub fn write_master_index(dir: &Path, entries: &[SegmentSpec]) {
    let path = dir.join(INDEX_FILE_NAME);
    let mut f = File::create(&path).expect("create master index");
    f.set_len(0x0200_0000).expect("sparse master index");

    let mut header = vec![0u8; 0x18];
    header[0..4].copy_from_slice(&crate::tindex::INDEX_MAGIC.to_le_bytes());
    header[0x10..0x14].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    header[0x14..0x18].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    f.write_all(&header).expect("write header");

    f.seek(SeekFrom::Start(0x4FC)).expect("seek to table");
    for e in entries {
        let mut rec = [0u8; 0x40];
        // +0x00 file_offset (unused by the parser), +0x04 channel,
        // +0x06 frame_count, +0x08 start, +0x0C end.
        rec[4] = e.channel;
        rec[6..8].copy_from_slice(&e.frame_count.to_le_bytes());
        rec[8..12].copy_from_slice(&(e.start_time as u32).to_le_bytes());
        rec[12..16].copy_from_slice(&(e.end_time as u32).to_le_bytes());
        f.write_all(&rec).expect("write record");
    }
}

/// One frame to place in a container: its data-region bytes plus the values
/// for its trailing index record.
#[derive(Clone, Debug)]
pub struct FrameSpec {
    pub channel: u32,
    pub frame_type: u32,
    pub unix_ts: i64,
    pub blob: Vec<u8>,
}

fn nal(t: u8, payload: &[u8]) -> Vec<u8> {
    let mut v = vec![0, 0, 0, 1, t << 1, 0x01];
    v.extend_from_slice(payload);
    v
}

impl FrameSpec {
    /// A key frame with its full decoder prologue: VPS, SPS, PPS, IDR.
    pub fn video_key(channel: u32, unix_ts: i64, idr_payload: &[u8]) -> Self {
        let mut blob = nal(hevc::NAL_VPS, &[0x0c, 0x01, 0xff, 0xff]);
        blob.extend_from_slice(&nal(hevc::NAL_SPS, &[0x01, 0x60, 0x20]));
        blob.extend_from_slice(&nal(hevc::NAL_PPS, &[0xc1, 0x62]));
        blob.extend_from_slice(&nal(hevc::NAL_IDR_W_RADL, idr_payload));
        FrameSpec {
            channel,
            frame_type: FRAME_TYPE_KEY,
            unix_ts,
            blob,
        }
    }

    /// A key frame without parameter sets, as some firmware revisions emit
    /// mid-file; exercises the frame-index fallback for I-frame positions.
    pub fn video_key_bare(channel: u32, unix_ts: i64, idr_payload: &[u8]) -> Self {
        FrameSpec {
            channel,
            frame_type: FRAME_TYPE_KEY,
            unix_ts,
            blob: nal(hevc::NAL_IDR_W_RADL, idr_payload),
        }
    }

    pub fn video_predicted(channel: u32, unix_ts: i64, payload: &[u8]) -> Self {
        FrameSpec {
            channel,
            frame_type: FRAME_TYPE_PREDICTED,
            unix_ts,
            blob: nal(hevc::NAL_TRAIL_R, payload),
        }
    }

    /// A raw G.711 μ-law frame.
    pub fn audio(unix_ts: i64, payload: &[u8]) -> Self {
        FrameSpec {
            channel: CHANNEL_AUDIO,
            frame_type: FRAME_TYPE_AUDIO,
            unix_ts,
            blob: payload.to_vec(),
        }
    }
}

/// Parameters for one synthesized container.
#[derive(Clone, Debug)]
pub struct ContainerSpec {
    pub frames: Vec<FrameSpec>,
    /// Where the first frame's bytes land in the data region.
    pub data_start: u64,
    /// Offset of the frame table within the trailing region; the parser must
    /// find it by magic, not position.
    pub table_offset: u64,
    pub write_index_table: bool,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        ContainerSpec {
            frames: Vec::new(),
            data_start: 0x40,
            table_offset: 0x120,
            write_index_table: true,
        }
    }
}

/// Writes a sparse 256 MiB container and returns its path.
pub fn write_container(dir: &Path, file_index: u32, spec: &ContainerSpec) -> PathBuf {
    let path = dir.join(trec::container_name(file_index));
    let mut f = File::create(&path).expect("create container");
    f.set_len(CONTAINER_SIZE).expect("sparse container");

    // Data region: frame blobs back to back.
    let mut records = Vec::with_capacity(spec.frames.len());
    let mut offset = spec.data_start;
    f.seek(SeekFrom::Start(offset)).expect("seek to data start");
    for (seq, frame) in spec.frames.iter().enumerate() {
        f.write_all(&frame.blob).expect("write frame blob");
        records.push(raw_index_record(frame, seq as u32, offset as u32));
        offset += frame.blob.len() as u64;
        assert!(offset < u64::from(DATA_REGION_END), "fixture overflows data region");
    }

    // Trailing frame table, newest-first.
    if spec.write_index_table {
        f.seek(SeekFrom::Start(u64::from(DATA_REGION_END) + spec.table_offset))
            .expect("seek to frame table");
        for rec in records.iter().rev() {
            f.write_all(rec).expect("write index record");
        }
    }
    path
}

fn raw_index_record(frame: &FrameSpec, seq: u32, file_offset: u32) -> [u8; 44] {
    let mut rec = [0u8; 44];
    rec[0..4].copy_from_slice(&FRAME_INDEX_MAGIC.to_le_bytes());
    rec[4..8].copy_from_slice(&frame.frame_type.to_le_bytes());
    rec[8..12].copy_from_slice(&frame.channel.to_le_bytes());
    rec[12..16].copy_from_slice(&seq.to_le_bytes());
    rec[16..20].copy_from_slice(&file_offset.to_le_bytes());
    rec[20..24].copy_from_slice(&(frame.blob.len() as u32).to_le_bytes());
    // Monotonic microsecond clock derived from the wall clock; the sequence
    // number breaks ties within a second.
    let micro = (frame.unix_ts as u64) * 1_000_000 + u64::from(seq);
    rec[24..32].copy_from_slice(&micro.to_le_bytes());
    rec[32..36].copy_from_slice(&(frame.unix_ts as u32).to_le_bytes());
    rec
}

/// A whole synthesized volume: master index plus containers, with a cache
/// directory alongside.
pub struct TestVolume {
    pub dir: TempDir,
}

impl TestVolume {
    pub fn builder() -> TestVolumeBuilder {
        TestVolumeBuilder { segments: Vec::new() }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Loads a fresh manager over this volume.
    pub fn manager(&self) -> StorageManager {
        let cache = CacheDir::open(self.dir.path()).expect("cache dir");
        StorageManager::load(self.dir.path(), cache).expect("load volume")
    }
}

pub struct TestVolumeBuilder {
    segments: Vec<(u8, i64, i64, usize)>,
}

impl TestVolumeBuilder {
    /// Adds a segment with `gops` GOPs spread evenly over its interval.
    /// Each GOP is a keyframe prologue, one audio frame, and three predicted
    /// frames with interleaved audio.
    pub fn segment(mut self, channel: u8, start_time: i64, end_time: i64, gops: usize) -> Self {
        self.segments.push((channel, start_time, end_time, gops));
        self
    }

    pub fn build(self) -> TestVolume {
        let dir = tempfile::tempdir().expect("tempdir");
        let specs: Vec<SegmentSpec> = self
            .segments
            .iter()
            .map(|&(ch, start, end, _)| SegmentSpec::new(ch, start, end))
            .collect();
        write_master_index(dir.path(), &specs);

        for (file_index, &(ch, start, end, gops)) in self.segments.iter().enumerate() {
            let channel = u32::from(ch);
            let step = ((end - start) / gops.max(1) as i64).max(1);
            let mut frames = Vec::new();
            for g in 0..gops {
                let t = start + g as i64 * step;
                // The recording interleave begins each GOP with an audio
                // frame, then the key frame's prologue.
                frames.push(FrameSpec::audio(t, &[0x55; 320]));
                frames.push(FrameSpec::video_key(channel, t, &[0xaa; 400]));
                for p in 0..3 {
                    frames.push(FrameSpec::video_predicted(channel, t, &[0xbb; 200]));
                    frames.push(FrameSpec::audio(t + (p as i64 * step / 4).min(step - 1), &[0x55; 320]));
                }
            }
            write_container(dir.path(), file_index as u32, &ContainerSpec {
                frames,
                ..ContainerSpec::default()
            });
        }
        TestVolume { dir }
    }
}
