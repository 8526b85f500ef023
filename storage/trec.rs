// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Container (`TRec######.tps`) layout and trailing frame-index parsing.
//!
//! Each container is exactly 256 MiB: a data region holding the interleaved
//! H.265 Annex-B + G.711 byte stream, then a trailing region with a
//! self-describing frame table. The table does not start at a fixed offset;
//! it is found by scanning the first 7 MiB of the trailing region for its
//! record magic. Records are written newest-first by the firmware and
//! re-sorted ascending here.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use base::{bail, err, time::MIN_VALID_TIME, Error};
use memchr::memmem;
use serde::Serialize;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Exact size of every container file.
pub const CONTAINER_SIZE: u64 = 0x1000_0000; // 256 MiB

/// End of the data region / start of the trailing index region.
pub const DATA_REGION_END: u32 = 0x0F90_0000;

/// How far into the trailing region to search for the frame-index magic.
pub const INDEX_SEARCH_LEN: usize = 0x70_0000; // 7 MiB

/// Magic leading every frame-index record.
pub const FRAME_INDEX_MAGIC: u32 = 0x4C3D_2E1F;

/// Recognized `channel_id` values. The firmware's own tables disagree about
/// which of 3/258 is which, but the recording stream observed from this
/// hardware carries primary video on 2, audio on 3, and the sub stream on 258.
pub const CHANNEL_VIDEO_PRIMARY: u32 = 2;
pub const CHANNEL_AUDIO: u32 = 3;
pub const CHANNEL_VIDEO_SECONDARY: u32 = 258;

pub const FRAME_TYPE_KEY: u32 = 1;
pub const FRAME_TYPE_PREDICTED: u32 = 2;
pub const FRAME_TYPE_AUDIO: u32 = 3;

#[inline]
pub fn is_recognized_channel(ch: u32) -> bool {
    matches!(
        ch,
        CHANNEL_VIDEO_PRIMARY | CHANNEL_AUDIO | CHANNEL_VIDEO_SECONDARY
    )
}

/// Returns the container file name for a master-index slot.
pub fn container_name(file_index: u32) -> String {
    format!("TRec{file_index:06}.tps")
}

/// On-disk frame-index record: 44 bytes little-endian.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, Immutable, KnownLayout, Unaligned)]
#[allow(dead_code)] // the reserved tail exists only to pin the layout.
struct RawIndexEntry {
    magic: U32,
    frame_type: U32,
    channel: U32,
    frame_seq: U32,
    file_offset: U32,
    frame_size: U32,
    micro_timestamp: U64,
    unix_timestamp: U32,
    reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<RawIndexEntry>() == 44);

/// One kept frame-index record.
///
/// This is also the persistent cache's record format: the struct is written to
/// `.sidx` files byte-for-byte and mapped back as a slice, so its layout is
/// part of the cache version (see `cache::SIDX_VERSION`).
#[repr(C)]
#[derive(Clone, Copy, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
pub struct FrameIndexRecord {
    frame_type: U32,
    channel: U32,
    frame_seq: U32,
    file_offset: U32,
    frame_size: U32,
    micro_timestamp: U64,
    unix_timestamp: U32,
}

pub const FRAME_INDEX_RECORD_LEN: usize = std::mem::size_of::<FrameIndexRecord>();
const _: () = assert!(FRAME_INDEX_RECORD_LEN == 32);

impl FrameIndexRecord {
    pub fn frame_type(&self) -> u32 {
        self.frame_type.get()
    }

    pub fn channel(&self) -> u32 {
        self.channel.get()
    }

    pub fn frame_seq(&self) -> u32 {
        self.frame_seq.get()
    }

    /// Byte offset of the frame within its container.
    pub fn file_offset(&self) -> u32 {
        self.file_offset.get()
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size.get()
    }

    /// Monotonic microseconds since the firmware's internal origin.
    pub fn micro_timestamp(&self) -> u64 {
        self.micro_timestamp.get()
    }

    /// Wall-clock unix seconds.
    pub fn unix_timestamp(&self) -> i64 {
        i64::from(self.unix_timestamp.get())
    }

    pub fn is_audio(&self) -> bool {
        self.channel() == CHANNEL_AUDIO
    }

    pub fn is_key(&self) -> bool {
        self.frame_type() == FRAME_TYPE_KEY
    }
}

impl std::fmt::Debug for FrameIndexRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameIndexRecord")
            .field("frame_type", &self.frame_type())
            .field("channel", &self.channel())
            .field("frame_seq", &self.frame_seq())
            .field("file_offset", &self.file_offset())
            .field("frame_size", &self.frame_size())
            .field("micro_timestamp", &self.micro_timestamp())
            .field("unix_timestamp", &self.unix_timestamp())
            .finish()
    }
}

impl PartialEq for FrameIndexRecord {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for FrameIndexRecord {}

impl Serialize for FrameIndexRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("FrameIndexRecord", 7)?;
        s.serialize_field("frameType", &self.frame_type())?;
        s.serialize_field("channel", &self.channel())?;
        s.serialize_field("frameSeq", &self.frame_seq())?;
        s.serialize_field("fileOffset", &self.file_offset())?;
        s.serialize_field("frameSize", &self.frame_size())?;
        s.serialize_field("timestampUs", &self.micro_timestamp())?;
        s.serialize_field("unixTs", &self.unix_timestamp())?;
        s.end()
    }
}

/// An audio record projected out of the frame index, sorted by offset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AudioFrame {
    pub file_offset: u32,
    pub frame_size: u32,
    pub unix_timestamp: i64,
}

impl From<&FrameIndexRecord> for AudioFrame {
    fn from(r: &FrameIndexRecord) -> Self {
        AudioFrame {
            file_offset: r.file_offset(),
            frame_size: r.frame_size(),
            unix_timestamp: r.unix_timestamp(),
        }
    }
}

/// Filters and sorts the audio records of a frame index.
pub fn project_audio_frames(records: &[FrameIndexRecord]) -> Vec<AudioFrame> {
    let mut audio: Vec<AudioFrame> = records
        .iter()
        .filter(|r| r.is_audio())
        .map(AudioFrame::from)
        .collect();
    audio.sort_unstable_by_key(|a| a.file_offset);
    audio
}

/// Parses the trailing frame index of a container.
///
/// A missing magic in the search window is a valid empty result: some
/// containers are written but never indexed. Malformed trailing bytes stop
/// the scan at the last whole record.
pub fn parse_frame_index(path: &Path) -> Result<Vec<FrameIndexRecord>, Error> {
    let f = File::open(path).map_err(|e| {
        err!(
            Unavailable,
            msg("unable to open container {}", path.display()),
            source(e)
        )
    })?;
    let len = f
        .metadata()
        .map_err(|e| err!(Unavailable, source(e)))?
        .len();
    if len < u64::from(DATA_REGION_END) {
        bail!(
            FailedPrecondition,
            msg(
                "container {} is {} bytes, shorter than its data region",
                path.display(),
                len
            )
        );
    }

    let mut r = BufReader::with_capacity(1 << 16, f);
    r.seek(SeekFrom::Start(u64::from(DATA_REGION_END)))
        .map_err(|e| err!(Unavailable, source(e)))?;

    // Locate the first record magic within the search window.
    let mut window = vec![0u8; INDEX_SEARCH_LEN];
    let n = read_up_to(&mut r, &mut window).map_err(|e| err!(Unavailable, source(e)))?;
    let magic_bytes = FRAME_INDEX_MAGIC.to_le_bytes();
    let Some(rel) = memmem::find(&window[..n], &magic_bytes) else {
        return Ok(Vec::new());
    };
    let table_start = u64::from(DATA_REGION_END) + rel as u64;

    r.seek(SeekFrom::Start(table_start))
        .map_err(|e| err!(Unavailable, source(e)))?;
    let mut records = Vec::new();
    let mut buf = [0u8; std::mem::size_of::<RawIndexEntry>()];
    loop {
        match r.read_exact(&mut buf) {
            Ok(()) => {}
            Err(_) => break, // EOF mid-record.
        }
        let raw = RawIndexEntry::read_from_bytes(&buf[..]).expect("buf is entry-sized");
        if raw.magic.get() != FRAME_INDEX_MAGIC {
            break;
        }
        if i64::from(raw.unix_timestamp.get()) <= MIN_VALID_TIME
            || !is_recognized_channel(raw.channel.get())
        {
            continue;
        }
        records.push(FrameIndexRecord {
            frame_type: raw.frame_type,
            channel: raw.channel,
            frame_seq: raw.frame_seq,
            file_offset: raw.file_offset,
            frame_size: raw.frame_size,
            micro_timestamp: raw.micro_timestamp,
            unix_timestamp: raw.unix_timestamp,
        });
    }

    // On-disk order is newest-first.
    records.sort_unstable_by_key(|r| r.micro_timestamp());
    Ok(records)
}

/// Reads one frame's payload from a container.
pub fn read_frame(path: &Path, offset: u32, size: u32) -> Result<Vec<u8>, Error> {
    let mut f = File::open(path).map_err(|e| {
        err!(
            Unavailable,
            msg("unable to open container {}", path.display()),
            source(e)
        )
    })?;
    f.seek(SeekFrom::Start(u64::from(offset)))
        .map_err(|e| err!(Unavailable, source(e)))?;
    let mut data = vec![0u8; size as usize];
    f.read_exact(&mut data)
        .map_err(|e| err!(DataLoss, msg("short frame read at {offset:#x}"), source(e)))?;
    Ok(data)
}

/// Like `read_exact` but tolerates EOF, returning the bytes read.
fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, ContainerSpec, FrameSpec};

    #[test]
    fn parses_filters_and_sorts() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let spec = ContainerSpec {
            frames: vec![
                FrameSpec::video_key(CHANNEL_VIDEO_PRIMARY, 1_766_034_449, &[0xaa; 100]),
                FrameSpec::audio(1_766_034_449, &[0x55; 320]),
                FrameSpec::video_predicted(CHANNEL_VIDEO_PRIMARY, 1_766_034_450, &[0xbb; 60]),
                // Unrecognized channel and pre-2020 timestamp are dropped.
                FrameSpec::video_key(7, 1_766_034_451, &[0xcc; 50]),
                FrameSpec::audio(1_000, &[0x55; 320]),
            ],
            ..ContainerSpec::default()
        };
        let path = testutil::write_container(dir.path(), 0, &spec);

        let records = parse_frame_index(&path).unwrap();
        assert_eq!(records.len(), 3);
        // The fixture writes the table newest-first; parsing restores time order.
        assert!(records
            .windows(2)
            .all(|w| w[0].micro_timestamp() <= w[1].micro_timestamp()));
        for r in &records {
            assert!(is_recognized_channel(r.channel()));
            assert!(r.unix_timestamp() > MIN_VALID_TIME);
        }
        let audio = project_audio_frames(&records);
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].frame_size, 320);
    }

    #[test]
    fn missing_magic_is_empty() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let spec = ContainerSpec {
            write_index_table: false,
            ..ContainerSpec::default()
        };
        let path = testutil::write_container(dir.path(), 0, &spec);
        assert!(parse_frame_index(&path).unwrap().is_empty());
    }

    #[test]
    fn truncated_container_fails() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(container_name(0));
        std::fs::write(&path, [0u8; 1024]).unwrap();
        parse_frame_index(&path).unwrap_err();
    }

    #[test]
    fn frame_payload_round_trip() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let spec = ContainerSpec {
            frames: vec![FrameSpec::audio(1_766_034_449, &[0x12; 64])],
            ..ContainerSpec::default()
        };
        let path = testutil::write_container(dir.path(), 0, &spec);
        let records = parse_frame_index(&path).unwrap();
        let a = &records[0];
        let data = read_frame(&path, a.file_offset(), a.frame_size()).unwrap();
        assert_eq!(data, vec![0x12; 64]);
    }

    #[test]
    fn names() {
        assert_eq!(container_name(0), "TRec000000.tps");
        assert_eq!(container_name(37), "TRec000037.tps");
    }
}
