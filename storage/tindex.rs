// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Master segment index (`TIndex00.tps`) parsing.
//!
//! The index is a fixed-layout file written by the DVR firmware: a header with
//! two counters, then a table of 64-byte segment records starting at a fixed
//! offset. Each record slot corresponds to one `TRec######.tps` container; the
//! slot number doubles as the container's filename suffix, so discarded slots
//! still advance the numbering.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use base::{bail, err, time::MIN_VALID_TIME, Error};
use serde::Serialize;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

/// File name of the master index at the volume root.
pub const INDEX_FILE_NAME: &str = "TIndex00.tps";

/// Magic at offset 0 of the master index.
pub const INDEX_MAGIC: u32 = 0x1F2E_3D4C;

/// Byte offset of the segment table.
const SEGMENT_TABLE_OFFSET: u64 = 0x4FC;

/// Extra record slots read past `entry_count`, tolerating firmware padding.
const ENTRY_SLACK: u32 = 20;

/// Channel values marking a slot as unused.
const CHANNEL_UNUSED: u8 = 0;
const CHANNEL_DELETED: u8 = 0xFE;

/// On-disk segment record.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, Immutable, KnownLayout, Unaligned)]
#[allow(dead_code)] // some fields exist only to pin the layout.
struct RawSegmentEntry {
    file_offset: U32,
    channel: u8,
    flags: u8,
    frame_count: U16,
    start_time: U32,
    end_time: U32,
    reserved: [u8; 48],
}

const _: () = assert!(std::mem::size_of::<RawSegmentEntry>() == 0x40);

/// A recorded interval on one channel, backed by exactly one container file.
///
/// Immutable once parsed. Times are unix seconds; `frame_count` is the
/// firmware's hint, not a promise.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct Segment {
    /// Slot number in the master index; also the container's numeric suffix.
    pub file_index: u32,
    pub channel: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub frame_count: u32,
}

impl Segment {
    /// True if `[start_time, end_time]` contains `ts` (boundaries inclusive).
    pub fn contains(&self, ts: i64) -> bool {
        self.start_time <= ts && ts <= self.end_time
    }

    pub fn duration(&self) -> i64 {
        self.end_time - self.start_time
    }
}

/// Parse result: kept segments plus the header counters.
#[derive(Debug)]
pub struct MasterIndex {
    pub segments: Vec<Segment>,
    pub file_count: u32,
    pub entry_count: u32,
}

/// Parses `TIndex00.tps`, keeping only plausible records.
///
/// Records with an unused/deleted channel, a pre-2020 start, or a
/// non-positive duration are dropped silently; a table that ends mid-record
/// stops at the last whole one.
pub fn parse_master_index(path: &Path) -> Result<MasterIndex, Error> {
    let f = File::open(path).map_err(|e| {
        err!(
            FailedPrecondition,
            msg("unable to open master index {}", path.display()),
            source(e)
        )
    })?;
    let mut r = BufReader::new(f);

    let mut header = [0u8; 0x18];
    r.read_exact(&mut header)
        .map_err(|e| err!(DataLoss, msg("master index header truncated"), source(e)))?;
    let magic = u32::from_le_bytes(header[0..4].try_into().expect("4-byte slice"));
    if magic != INDEX_MAGIC {
        bail!(DataLoss, msg("bad master index magic {magic:#010x}"));
    }
    let file_count = u32::from_le_bytes(header[0x10..0x14].try_into().expect("4-byte slice"));
    let entry_count = u32::from_le_bytes(header[0x14..0x18].try_into().expect("4-byte slice"));

    r.seek(SeekFrom::Start(SEGMENT_TABLE_OFFSET))
        .map_err(|e| err!(Unavailable, msg("unable to seek to segment table"), source(e)))?;

    let mut segments = Vec::new();
    let mut buf = [0u8; std::mem::size_of::<RawSegmentEntry>()];
    for slot in 0..entry_count.saturating_add(ENTRY_SLACK) {
        match r.read_exact(&mut buf) {
            Ok(()) => {}
            Err(_) => break, // table ends mid-record; keep what we have.
        }
        let raw = RawSegmentEntry::read_from_bytes(&buf[..]).expect("buf is entry-sized");
        if raw.channel == CHANNEL_UNUSED || raw.channel == CHANNEL_DELETED {
            continue;
        }
        let start_time = i64::from(raw.start_time.get());
        let end_time = i64::from(raw.end_time.get());
        if start_time < MIN_VALID_TIME || end_time <= start_time {
            continue;
        }
        segments.push(Segment {
            file_index: slot,
            channel: u32::from(raw.channel),
            start_time,
            end_time,
            frame_count: u32::from(raw.frame_count.get()),
        });
    }

    Ok(MasterIndex {
        segments,
        file_count,
        entry_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, SegmentSpec};

    #[test]
    fn parses_and_filters() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        testutil::write_master_index(
            dir.path(),
            &[
                SegmentSpec::new(2, 1_766_034_449, 1_766_041_804),
                SegmentSpec::new(0, 1_766_034_449, 1_766_041_804), // unused slot
                SegmentSpec::new(0xFE, 1_766_034_449, 1_766_041_804), // deleted slot
                SegmentSpec::new(3, 1_000_000_000, 1_766_041_804), // pre-2020 start
                SegmentSpec::new(3, 1_766_041_804, 1_766_034_449), // inverted range
                SegmentSpec::new(3, 1_766_041_804, 1_766_048_000),
            ],
        );

        let idx = parse_master_index(&dir.path().join(INDEX_FILE_NAME)).unwrap();
        assert_eq!(idx.entry_count, 6);
        assert_eq!(idx.segments.len(), 2);
        // Discarded slots still consume file indices.
        assert_eq!(idx.segments[0].file_index, 0);
        assert_eq!(idx.segments[0].channel, 2);
        assert_eq!(idx.segments[1].file_index, 5);
        assert_eq!(idx.segments[1].channel, 3);
        for s in &idx.segments {
            assert!(s.start_time < s.end_time);
            assert!(s.start_time >= MIN_VALID_TIME);
        }
    }

    #[test]
    fn empty_table_is_ok() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        testutil::write_master_index(dir.path(), &[]);
        let idx = parse_master_index(&dir.path().join(INDEX_FILE_NAME)).unwrap();
        assert!(idx.segments.is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE_NAME);
        std::fs::write(&path, [0u8; 0x600]).unwrap();
        parse_master_index(&path).unwrap_err();
    }

    #[test]
    fn missing_file_fails() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        parse_master_index(&dir.path().join(INDEX_FILE_NAME)).unwrap_err();
    }
}
