// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The storage manager: one mounted TPS volume and its derived state.
//!
//! `load` parses the master index synchronously; everything per-container is
//! built lazily by `build_cache` on a small worker pool and kept in a
//! cached-segment map. Queries take read locks and return snapshots; the
//! builder takes the write lock only to insert one segment's results, so
//! lookups stay responsive while a 200-container volume is being scanned.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{mpsc, Arc};
use std::time::Instant;

use base::{err, strutil, Error};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::{self, CacheDir, MappedIndex, MmapManager};
use crate::hevc;
use crate::oracle::{self, Anchor};
use crate::reader::StreamReader;
use crate::tindex::{self, Segment};
use crate::trec::{self, AudioFrame, FrameIndexRecord, DATA_REGION_END};
use crate::vps;

/// Default worker count for cache construction. The expected medium is a USB
/// disk; more concurrent linear readers slow each other down.
const DEFAULT_BUILD_WORKERS: usize = 2;
const MAX_BUILD_WORKERS: usize = 4;

/// Window read when hunting for a decoder prologue near an offset.
const VIDEO_HEADER_WINDOW: usize = 512 << 10;

/// A frame index either mapped from the on-disk cache or freshly parsed.
enum FrameIndexView {
    Mapped(Arc<MappedIndex>),
    Owned(Vec<FrameIndexRecord>),
}

impl FrameIndexView {
    fn records(&self) -> &[FrameIndexRecord] {
        match self {
            FrameIndexView::Mapped(m) => m.records(),
            FrameIndexView::Owned(v) => v,
        }
    }
}

/// Everything derived from one segment's container: the sorted frame index,
/// VPS anchors with audio-derived times, and the audio-only projection.
pub struct CachedSegment {
    pub segment: Segment,
    frames: FrameIndexView,
    pub vps_positions: Vec<Anchor>,
    pub audio_frames: Vec<AudioFrame>,
}

impl CachedSegment {
    pub fn frames(&self) -> &[FrameIndexRecord] {
        self.frames.records()
    }
}

/// Snapshot of cache-construction progress.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStatus {
    pub building: bool,
    pub progress_percent: u32,
    pub total: u32,
    pub current: u32,
    pub cached_count: u32,
}

/// A decoder prologue located in a container.
#[derive(Clone, Debug)]
pub struct LocatedVideoHeader {
    pub vps: Vec<u8>,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
    pub idr: Vec<u8>,
    /// Absolute container offset just past the IDR.
    pub stream_start_pos: u64,
}

#[derive(Default)]
struct CacheState {
    cached: std::collections::BTreeMap<u32, Arc<CachedSegment>>,
    building: bool,
    progress_percent: u32,
    total: u32,
    current: u32,
}

/// One mounted volume: the parsed segment table plus lazily built caches.
pub struct StorageManager {
    volume_path: PathBuf,
    cache_dir: CacheDir,
    segments: Vec<Segment>,
    file_count: u32,
    entry_count: u32,
    state: RwLock<CacheState>,
}

impl StorageManager {
    /// Parses the volume's master index. Fails when `TIndex00.tps` is
    /// missing or unreadable (the volume is not ready).
    pub fn load(volume_path: &Path, cache_dir: CacheDir) -> Result<StorageManager, Error> {
        let index_path = volume_path.join(tindex::INDEX_FILE_NAME);
        let idx = tindex::parse_master_index(&index_path)?;
        info!(
            volume = %volume_path.display(),
            segments = idx.segments.len(),
            entries = idx.entry_count,
            "loaded master index"
        );
        Ok(StorageManager {
            volume_path: volume_path.to_owned(),
            cache_dir,
            segments: idx.segments,
            file_count: idx.file_count,
            entry_count: idx.entry_count,
            state: RwLock::new(CacheState::default()),
        })
    }

    pub fn volume_path(&self) -> &Path {
        &self.volume_path
    }

    /// Identity of the mounted volume, for deciding whether a retired
    /// manager for the same path can be reused.
    pub fn volume_signature(&self) -> Result<[u8; 16], Error> {
        cache::file_signature(&self.volume_path.join(tindex::INDEX_FILE_NAME))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn file_count(&self) -> u32 {
        self.file_count
    }

    /// Cached segments, ascending by file index.
    pub fn cached_segments(&self) -> Vec<Arc<CachedSegment>> {
        self.state.read().cached.values().cloned().collect()
    }

    pub fn cached_segment(&self, file_index: u32) -> Option<Arc<CachedSegment>> {
        self.state.read().cached.get(&file_index).cloned()
    }

    pub fn cache_status(&self) -> CacheStatus {
        let l = self.state.read();
        CacheStatus {
            building: l.building,
            progress_percent: l.progress_percent,
            total: l.total,
            current: l.current,
            cached_count: l.cached.len() as u32,
        }
    }

    /// Path of a segment's container, or `None` when the file is absent
    /// (ring wrapped, or the medium lost it).
    pub fn container_path(&self, file_index: u32) -> Option<PathBuf> {
        let p = self.volume_path.join(trec::container_name(file_index));
        p.is_file().then_some(p)
    }

    /// First segment whose interval contains `ts`, boundaries inclusive.
    ///
    /// `channel` of `None` matches any channel; `cached_only` restricts to
    /// segments with built caches (the surface the UI exposes).
    pub fn find_segment_by_time(
        &self,
        ts: i64,
        channel: Option<u32>,
        cached_only: bool,
    ) -> Option<Segment> {
        let matches =
            |s: &Segment| channel.map(|c| s.channel == c).unwrap_or(true) && s.contains(ts);
        if cached_only {
            let l = self.state.read();
            l.cached
                .values()
                .map(|c| c.segment)
                .find(|s| matches(s))
        } else {
            self.segments.iter().copied().find(|s| matches(s))
        }
    }

    pub fn segment_by_file_index(&self, file_index: u32) -> Option<Segment> {
        self.segments
            .iter()
            .copied()
            .find(|s| s.file_index == file_index)
    }

    /// I-frame positions for a segment: cached VPS anchors when available,
    /// else key-frame records of the requested channel from the frame index.
    pub fn i_frame_positions(&self, file_index: u32, channel: u32) -> Vec<Anchor> {
        let Some(cached) = self.cached_segment(file_index) else {
            return Vec::new();
        };
        if !cached.vps_positions.is_empty() {
            return cached.vps_positions.clone();
        }
        let mut anchors: Vec<Anchor> = cached
            .frames()
            .iter()
            .filter(|r| r.channel() == channel && r.is_key())
            .map(|r| Anchor {
                offset: r.file_offset(),
                time: r.unix_timestamp(),
            })
            .collect();
        anchors.sort_unstable_by_key(|a| a.offset);
        anchors
    }

    /// Reads a 512 KiB window at `near_offset` and extracts the decoder
    /// prologue, if one exists there.
    pub fn read_video_header(
        &self,
        file_index: u32,
        near_offset: u64,
    ) -> Result<Option<LocatedVideoHeader>, Error> {
        let Some(path) = self.container_path(file_index) else {
            return Ok(None);
        };
        let mut f = File::open(&path)
            .map_err(|e| err!(Unavailable, msg("unable to open {}", path.display()), source(e)))?;
        f.seek(SeekFrom::Start(near_offset))
            .map_err(|e| err!(Unavailable, source(e)))?;
        let mut window = vec![0u8; VIDEO_HEADER_WINDOW];
        let mut filled = 0;
        while filled < window.len() {
            match f.read(&mut window[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(err!(Unavailable, source(e))),
            }
        }
        window.truncate(filled);

        Ok(hevc::extract_video_header(&window).map(|h| LocatedVideoHeader {
            stream_start_pos: near_offset + h.resume_offset as u64,
            vps: h.vps,
            sps: h.sps,
            pps: h.pps,
            idr: h.idr,
        }))
    }

    /// Opens a reader for a streaming run. The reader owns its file handle;
    /// `interval_us` is shared with the session for live speed changes.
    pub fn open_stream_reader(
        &self,
        file_index: u32,
        start_offset: u64,
        start_time_ms: i64,
        channel: u32,
        interval_us: Arc<AtomicU64>,
    ) -> Result<StreamReader, Error> {
        let path = self
            .container_path(file_index)
            .ok_or_else(|| err!(NotFound, msg("container {file_index} is missing")))?;
        let f = File::open(&path)
            .map_err(|e| err!(Unavailable, msg("unable to open {}", path.display()), source(e)))?;
        let segment = self
            .segment_by_file_index(file_index)
            .ok_or_else(|| err!(NotFound, msg("no segment with file index {file_index}")))?;
        let anchors = self.i_frame_positions(file_index, channel);
        Ok(StreamReader::new(
            f,
            start_offset,
            start_time_ms,
            segment,
            anchors,
            interval_us,
        ))
    }

    /// Ensures a [`CachedSegment`] exists for each requested segment (all
    /// when `file_indices` is `None`). Already-cached segments are a no-op.
    ///
    /// Blocking; runs `workers` OS threads reading containers. Emits
    /// `(current, total, file_index)` after each segment completes and
    /// publishes an atomically readable status. Returns the number of newly
    /// cached segments.
    pub fn build_cache(
        &self,
        file_indices: Option<&[u32]>,
        on_progress: &(dyn Fn(u32, u32, u32) + Sync),
    ) -> u32 {
        self.build_cache_with_workers(file_indices, DEFAULT_BUILD_WORKERS, on_progress)
    }

    pub fn build_cache_with_workers(
        &self,
        file_indices: Option<&[u32]>,
        workers: usize,
        on_progress: &(dyn Fn(u32, u32, u32) + Sync),
    ) -> u32 {
        let targets: Vec<Segment> = {
            let l = self.state.read();
            self.segments
                .iter()
                .filter(|s| {
                    file_indices
                        .map(|wanted| wanted.contains(&s.file_index))
                        .unwrap_or(true)
                })
                .filter(|s| !l.cached.contains_key(&s.file_index))
                .copied()
                .collect()
        };
        let total = targets.len() as u32;
        if total == 0 {
            return 0;
        }
        let workers = workers
            .clamp(1, MAX_BUILD_WORKERS)
            .min(targets.len());

        info!(workers, segments = total, "cache build starting");
        let build_start = Instant::now();
        {
            let mut l = self.state.write();
            l.building = true;
            l.total = total;
            l.current = 0;
            l.progress_percent = 0;
        }

        let (work_tx, work_rx) = mpsc::channel::<Segment>();
        for t in &targets {
            work_tx.send(*t).expect("receiver lives until scope end");
        }
        drop(work_tx);
        let work_rx = Mutex::new(work_rx);

        let (result_tx, result_rx) = mpsc::channel::<(u32, Result<Option<CachedSegment>, Error>)>();

        let mut newly_cached = 0u32;
        std::thread::scope(|s| {
            for n in 0..workers {
                let result_tx = result_tx.clone();
                let work_rx = &work_rx;
                std::thread::Builder::new()
                    .name(format!("cache-build-{n}"))
                    .spawn_scoped(s, move || {
                        loop {
                            let seg = match work_rx.lock().recv() {
                                Ok(seg) => seg,
                                Err(_) => break,
                            };
                            let r = self.build_segment_cache(&seg);
                            if result_tx.send((seg.file_index, r)).is_err() {
                                break;
                            }
                        }
                    })
                    .expect("spawning cache-build worker should succeed");
            }
            drop(result_tx);

            let mut processed = 0u32;
            for (file_index, result) in result_rx {
                processed += 1;
                match result {
                    Ok(Some(info)) => {
                        let mut l = self.state.write();
                        l.cached.insert(file_index, Arc::new(info));
                        newly_cached += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(file_index, err = %e.chain(), "segment cache build failed");
                    }
                }
                {
                    let mut l = self.state.write();
                    l.current = processed;
                    l.progress_percent = processed * 100 / total;
                }
                on_progress(processed, total, file_index);
            }
        });

        {
            let mut l = self.state.write();
            l.building = false;
            l.progress_percent = 100;
        }
        let elapsed = build_start.elapsed();
        info!(
            cached = newly_cached,
            total,
            elapsed = ?elapsed,
            rate = format!("{:.1}/s", f64::from(newly_cached) / elapsed.as_secs_f64().max(1e-9)),
            "cache build finished"
        );
        newly_cached
    }

    fn build_segment_cache(&self, seg: &Segment) -> Result<Option<CachedSegment>, Error> {
        let Some(container) = self.container_path(seg.file_index) else {
            debug!(file_index = seg.file_index, "container missing; segment not cached");
            return Ok(None);
        };
        let build_start = Instant::now();

        // Frame index: mmap cache hit, else parse and persist.
        let view = match MmapManager::global().get_or_load(&self.cache_dir, &container)? {
            Some(mapped) => FrameIndexView::Mapped(mapped),
            None => {
                let records = trec::parse_frame_index(&container)?;
                if records.is_empty() {
                    return Ok(None);
                }
                if let Err(e) = self.cache_dir.save_frame_index(&container, &records) {
                    warn!(err = %e.chain(), "unable to persist frame index; keeping in memory");
                }
                match MmapManager::global().get_or_load(&self.cache_dir, &container)? {
                    Some(mapped) => FrameIndexView::Mapped(mapped),
                    None => FrameIndexView::Owned(records),
                }
            }
        };
        if view.records().is_empty() {
            return Ok(None);
        }
        let t_index = build_start.elapsed();

        let audio_start = Instant::now();
        let audio_frames = trec::project_audio_frames(view.records());
        let t_audio = audio_start.elapsed();

        // VPS positions: cache hit, else scan and persist. Each position is
        // stamped with the wall clock of the nearest preceding audio frame.
        let vps_start = Instant::now();
        let offsets = match self.cache_dir.load_vps_positions(&container)? {
            Some(offsets) => offsets,
            None => {
                let offsets = vps::scan_vps_positions(&container)?;
                if let Err(e) = self.cache_dir.save_vps_positions(&container, &offsets) {
                    warn!(err = %e.chain(), "unable to persist vps positions");
                }
                offsets
            }
        };
        let vps_positions: Vec<Anchor> = offsets
            .iter()
            .filter(|&&o| o < DATA_REGION_END)
            .map(|&o| Anchor {
                offset: o,
                time: oracle::audio_time_at_offset(&audio_frames, o, seg),
            })
            .collect();
        let t_vps = vps_start.elapsed();

        debug!(
            file_index = seg.file_index,
            frames = view.records().len(),
            vps = vps_positions.len(),
            audio = audio_frames.len(),
            t_index = ?t_index,
            t_audio = ?t_audio,
            t_vps = ?t_vps,
            t_total = ?build_start.elapsed(),
            "segment cache built"
        );

        Ok(Some(CachedSegment {
            segment: *seg,
            frames: view,
            vps_positions,
            audio_frames,
        }))
    }
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("volume_path", &self.volume_path)
            .field("segments", &self.segments.len())
            .field("cached", &self.state.read().cached.len())
            .finish()
    }
}

/// Pretty-logs a volume's size for operator messages.
pub fn describe_volume(mgr: &StorageManager) -> String {
    format!(
        "{} segments across {} ({} containers on disk)",
        mgr.segments().len(),
        mgr.volume_path().display(),
        strutil::encode_size(
            (mgr.segments().len() as i64) * (trec::CONTAINER_SIZE as i64)
        ),
    )
}
