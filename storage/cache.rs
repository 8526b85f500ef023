// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Persistent index caches.
//!
//! Parsing a container's frame index costs a seek into the trailing region;
//! scanning its VPS positions costs a linear read of the whole 249 MiB data
//! region. On the USB media these recordings live on, that's tens of seconds
//! per container. Both results are therefore persisted under
//! `<workdir>/.index_cache/` and mapped read-only on later runs.
//!
//! Cache files are named by a hash of the container's basename, mtime, and
//! first 4 KiB (the fixed 256 MiB size carries no information). Because the
//! name already binds the source identity, reads check only magic/version and
//! never touch the container again; the point is to avoid waking the USB
//! disk at all. A stale or torn cache file fails validation and is deleted;
//! the caller re-derives from source.
//!
//! Frame-index records are written in their in-memory layout
//! ([`FrameIndexRecord`] is `zerocopy`-safe), so a reader maps the file and
//! reinterprets the tail as a record slice without copying. The `version`
//! header field encodes that layout; mismatched readers must refuse.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use base::{bail, err, strutil, Error};
use memmap2::Mmap;
use parking_lot::RwLock;
use tracing::{debug, warn};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::trec::{FrameIndexRecord, FRAME_INDEX_RECORD_LEN};

pub const CACHE_DIR_NAME: &str = ".index_cache";

const SIDX_MAGIC: [u8; 4] = *b"SIDX";
/// Bump whenever [`FrameIndexRecord`]'s layout changes.
const SIDX_VERSION: u32 = 3;

const VPOS_MAGIC: [u8; 4] = *b"VPOS";
const VPOS_VERSION: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
struct CacheHeader {
    magic: [u8; 4],
    version: U32,
    record_count: U32,
    file_hash: [u8; 16],
    reserved: [u8; 4],
}

const CACHE_HEADER_LEN: usize = std::mem::size_of::<CacheHeader>();
const _: () = assert!(CACHE_HEADER_LEN == 32);

/// Identity of a source file for cache naming: basename + mtime + head bytes.
pub fn file_signature(path: &Path) -> Result<[u8; 16], Error> {
    let mut f = File::open(path)
        .map_err(|e| err!(Unavailable, msg("unable to open {}", path.display()), source(e)))?;
    let meta = f.metadata().map_err(|e| err!(Unavailable, source(e)))?;
    let mtime = meta
        .modified()
        .map_err(|e| err!(Unavailable, source(e)))?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut head = [0u8; 4096];
    let mut filled = 0;
    while filled < head.len() {
        match f.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(err!(Unavailable, source(e))),
        }
    }

    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut h = blake3::Hasher::new();
    h.update(basename.as_bytes());
    h.update(&mtime.to_le_bytes());
    h.update(&head[..filled]);
    let mut sig = [0u8; 16];
    sig.copy_from_slice(&h.finalize().as_bytes()[..16]);
    Ok(sig)
}

/// The on-disk cache directory for one process working directory.
#[derive(Clone, Debug)]
pub struct CacheDir {
    dir: PathBuf,
}

impl CacheDir {
    /// Opens (creating if needed) `<workdir>/.index_cache`.
    pub fn open(workdir: &Path) -> Result<Self, Error> {
        let dir = workdir.join(CACHE_DIR_NAME);
        std::fs::create_dir_all(&dir).map_err(|e| {
            err!(
                Unavailable,
                msg("unable to create cache dir {}", dir.display()),
                source(e)
            )
        })?;
        Ok(CacheDir { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn cache_path(&self, container: &Path, ext: &str) -> Result<PathBuf, Error> {
        let sig = file_signature(container)?;
        Ok(self.dir.join(format!("{}.{ext}", strutil::hex(&sig))))
    }

    pub fn sidx_path(&self, container: &Path) -> Result<PathBuf, Error> {
        self.cache_path(container, "sidx")
    }

    pub fn vpos_path(&self, container: &Path) -> Result<PathBuf, Error> {
        self.cache_path(container, "vpos")
    }

    /// Persists a container's parsed frame index. An empty index is not
    /// cached; re-deriving it is cheap and the container may gain an index
    /// later.
    pub fn save_frame_index(
        &self,
        container: &Path,
        records: &[FrameIndexRecord],
    ) -> Result<(), Error> {
        if records.is_empty() {
            return Ok(());
        }
        let path = self.sidx_path(container)?;
        let hash = file_signature(container)?;
        write_cache_file(
            &path,
            SIDX_MAGIC,
            SIDX_VERSION,
            hash,
            records.len(),
            records.as_bytes(),
        )?;
        debug!(
            file = %path.display(),
            count = records.len(),
            size = strutil::encode_size((CACHE_HEADER_LEN + records.as_bytes().len()) as i64),
            "wrote frame-index cache"
        );
        Ok(())
    }

    /// Persists a container's VPS offsets.
    pub fn save_vps_positions(&self, container: &Path, positions: &[u32]) -> Result<(), Error> {
        if positions.is_empty() {
            return Ok(());
        }
        let path = self.vpos_path(container)?;
        let hash = file_signature(container)?;
        let encoded: Vec<U32> = positions.iter().map(|&p| U32::new(p)).collect();
        write_cache_file(
            &path,
            VPOS_MAGIC,
            VPOS_VERSION,
            hash,
            encoded.len(),
            encoded.as_bytes(),
        )?;
        debug!(file = %path.display(), count = positions.len(), "wrote vps cache");
        Ok(())
    }

    /// Loads cached VPS offsets, or `None` if absent. A corrupt file is
    /// deleted and reported as absent.
    pub fn load_vps_positions(&self, container: &Path) -> Result<Option<Vec<u32>>, Error> {
        let path = self.vpos_path(container)?;
        let map = match map_cache_file(&path)? {
            None => return Ok(None),
            Some(m) => m,
        };
        let count = match validate_cache(&map, VPOS_MAGIC, VPOS_VERSION, 4) {
            Ok(c) => c,
            Err(e) => {
                discard_corrupt(&path, e);
                return Ok(None);
            }
        };
        let body = &map[CACHE_HEADER_LEN..CACHE_HEADER_LEN + count * 4];
        let encoded = <[U32]>::ref_from_bytes(body).expect("validated size/alignment");
        Ok(Some(encoded.iter().map(|p| p.get()).collect()))
    }

    /// Maps a cached frame index read-only, or `None` if absent. A corrupt
    /// file is deleted and reported as absent.
    pub fn load_frame_index(&self, container: &Path) -> Result<Option<MappedIndex>, Error> {
        let path = self.sidx_path(container)?;
        let map = match map_cache_file(&path)? {
            None => return Ok(None),
            Some(m) => m,
        };
        let count = match validate_cache(&map, SIDX_MAGIC, SIDX_VERSION, FRAME_INDEX_RECORD_LEN) {
            Ok(c) => c,
            Err(e) => {
                discard_corrupt(&path, e);
                return Ok(None);
            }
        };
        debug!(file = %path.display(), count, "mapped frame-index cache");
        Ok(Some(MappedIndex { map, count }))
    }
}

fn write_cache_file(
    path: &Path,
    magic: [u8; 4],
    version: u32,
    file_hash: [u8; 16],
    record_count: usize,
    body: &[u8],
) -> Result<(), Error> {
    let header = CacheHeader {
        magic,
        version: U32::new(version),
        record_count: U32::new(record_count as u32),
        file_hash,
        reserved: [0; 4],
    };
    let mut f = File::create(path)
        .map_err(|e| err!(Unavailable, msg("unable to create {}", path.display()), source(e)))?;
    f.write_all(header.as_bytes())
        .and_then(|()| f.write_all(body))
        .map_err(|e| err!(Unavailable, msg("unable to write {}", path.display()), source(e)))?;
    Ok(())
}

fn map_cache_file(path: &Path) -> Result<Option<Mmap>, Error> {
    let f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(err!(
                Unavailable,
                msg("unable to open cache {}", path.display()),
                source(e)
            ))
        }
    };
    // SAFETY: cache files are private to this process's workdir and never
    // truncated after creation; a shrinking mapped file would SIGBUS.
    let map = unsafe { Mmap::map(&f) }
        .map_err(|e| err!(Unavailable, msg("unable to map {}", path.display()), source(e)))?;
    Ok(Some(map))
}

/// Checks magic/version/size; returns the record count.
///
/// The source hash is deliberately not re-verified: the cache pathname is
/// derived from it, so a changed source selects a different cache file.
fn validate_cache(
    map: &Mmap,
    magic: [u8; 4],
    version: u32,
    record_len: usize,
) -> Result<usize, Error> {
    let Ok((header, _)) = CacheHeader::ref_from_prefix(&map[..]) else {
        bail!(DataLoss, msg("cache file shorter than its header"));
    };
    if header.magic != magic {
        bail!(DataLoss, msg("bad cache magic {:02x?}", header.magic));
    }
    if header.version.get() != version {
        bail!(
            DataLoss,
            msg(
                "cache version {} != expected {version}; refusing to interpret",
                header.version.get()
            )
        );
    }
    let count = header.record_count.get() as usize;
    let need = CACHE_HEADER_LEN + count * record_len;
    if map.len() < need {
        bail!(
            DataLoss,
            msg("cache file truncated: {} < {need} bytes", map.len())
        );
    }
    Ok(count)
}

fn discard_corrupt(path: &Path, e: Error) {
    warn!(file = %path.display(), err = %e.chain(), "discarding corrupt cache file");
    if let Err(e) = std::fs::remove_file(path) {
        warn!(file = %path.display(), %e, "unable to remove corrupt cache file");
    }
}

/// A read-only mapped frame-index cache.
///
/// [`records`](Self::records) is a zero-copy view into the mapping; callers
/// that need records beyond the mapping's lifetime must copy them.
pub struct MappedIndex {
    map: Mmap,
    count: usize,
}

impl MappedIndex {
    pub fn records(&self) -> &[FrameIndexRecord] {
        let body = &self.map[CACHE_HEADER_LEN..CACHE_HEADER_LEN + self.count * FRAME_INDEX_RECORD_LEN];
        <[FrameIndexRecord]>::ref_from_bytes(body).expect("validated size/alignment")
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Process-wide pool of open frame-index mappings, keyed by container path.
///
/// A mapping opened for one session is reused by every later session until
/// the volume it belongs to is released (on volume swap/unmount).
pub struct MmapManager {
    by_container: RwLock<HashMap<PathBuf, Arc<MappedIndex>>>,
}

static GLOBAL: std::sync::OnceLock<MmapManager> = std::sync::OnceLock::new();

impl MmapManager {
    pub fn global() -> &'static MmapManager {
        GLOBAL.get_or_init(|| MmapManager {
            by_container: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the live mapping for `container`, opening it from `cache` on
    /// first use. `None` means no usable cache file exists.
    pub fn get_or_load(
        &self,
        cache: &CacheDir,
        container: &Path,
    ) -> Result<Option<Arc<MappedIndex>>, Error> {
        if let Some(m) = self.by_container.read().get(container) {
            return Ok(Some(m.clone()));
        }
        let Some(mapped) = cache.load_frame_index(container)? else {
            return Ok(None);
        };
        let mapped = Arc::new(mapped);
        let mut l = self.by_container.write();
        let entry = l
            .entry(container.to_owned())
            .or_insert_with(|| mapped.clone());
        Ok(Some(entry.clone()))
    }

    /// Drops every mapping whose container lives under `volume`.
    pub fn release_volume(&self, volume: &Path) {
        let mut l = self.by_container.write();
        let before = l.len();
        l.retain(|path, _| !path.starts_with(volume));
        let released = before - l.len();
        if released > 0 {
            debug!(volume = %volume.display(), released, "released container mappings");
        }
    }

    pub fn open_count(&self) -> usize {
        self.by_container.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, ContainerSpec, FrameSpec};
    use crate::trec::{self, CHANNEL_VIDEO_PRIMARY};

    fn sample_records(dir: &Path) -> (PathBuf, Vec<FrameIndexRecord>) {
        let spec = ContainerSpec {
            frames: vec![
                FrameSpec::video_key(CHANNEL_VIDEO_PRIMARY, 1_766_034_449, &[0xaa; 64]),
                FrameSpec::audio(1_766_034_449, &[0x55; 320]),
                FrameSpec::video_predicted(CHANNEL_VIDEO_PRIMARY, 1_766_034_450, &[0xbb; 32]),
            ],
            ..ContainerSpec::default()
        };
        let path = testutil::write_container(dir, 0, &spec);
        let records = trec::parse_frame_index(&path).unwrap();
        (path, records)
    }

    #[test]
    fn frame_index_round_trip_is_bit_exact() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let (container, records) = sample_records(dir.path());
        let cache = CacheDir::open(dir.path()).unwrap();

        assert!(cache.load_frame_index(&container).unwrap().is_none());
        cache.save_frame_index(&container, &records).unwrap();
        let mapped = cache.load_frame_index(&container).unwrap().unwrap();
        assert_eq!(mapped.records(), &records[..]);
        assert_eq!(
            mapped.records().as_bytes(),
            records.as_bytes(),
            "cache round trip must be bit-exact"
        );
    }

    #[test]
    fn vps_round_trip() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let (container, _) = sample_records(dir.path());
        let cache = CacheDir::open(dir.path()).unwrap();

        assert!(cache.load_vps_positions(&container).unwrap().is_none());
        let positions = vec![0x40, 0x2000, 0x0F8F_0000];
        cache.save_vps_positions(&container, &positions).unwrap();
        assert_eq!(
            cache.load_vps_positions(&container).unwrap().unwrap(),
            positions
        );
    }

    #[test]
    fn corrupt_cache_self_heals() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let (container, records) = sample_records(dir.path());
        let cache = CacheDir::open(dir.path()).unwrap();
        cache.save_frame_index(&container, &records).unwrap();

        let path = cache.sidx_path(&container).unwrap();
        std::fs::write(&path, b"JUNKJUNKJUNKJUNK").unwrap();
        assert!(cache.load_frame_index(&container).unwrap().is_none());
        assert!(!path.exists(), "corrupt cache should have been deleted");
    }

    #[test]
    fn version_mismatch_refused() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let (container, records) = sample_records(dir.path());
        let cache = CacheDir::open(dir.path()).unwrap();
        cache.save_frame_index(&container, &records).unwrap();

        let path = cache.sidx_path(&container).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4] = 0x7f; // version field
        std::fs::write(&path, &bytes).unwrap();
        assert!(cache.load_frame_index(&container).unwrap().is_none());
    }

    #[test]
    fn signature_keys_on_name_mtime_and_head() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();

        let a = dir.path().join("TRec000000.tps");
        std::fs::write(&a, vec![1u8; 8192]).unwrap();
        let sig1 = file_signature(&a).unwrap();
        assert_eq!(sig1, file_signature(&a).unwrap(), "signature is stable");

        // Same content, different basename.
        let b = dir.path().join("TRec000001.tps");
        std::fs::write(&b, vec![1u8; 8192]).unwrap();
        assert_ne!(sig1, file_signature(&b).unwrap());

        // Different head content.
        let mut content = vec![1u8; 8192];
        content[100] = 2;
        std::fs::write(&a, &content).unwrap();
        assert_ne!(sig1, file_signature(&a).unwrap());
    }

    #[test]
    fn mmap_manager_reuses_and_releases() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let (container, records) = sample_records(dir.path());
        let cache = CacheDir::open(dir.path()).unwrap();
        cache.save_frame_index(&container, &records).unwrap();

        let mgr = MmapManager {
            by_container: RwLock::new(HashMap::new()),
        };
        let a = mgr.get_or_load(&cache, &container).unwrap().unwrap();
        let b = mgr.get_or_load(&cache, &container).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b), "mapping should be shared");
        assert_eq!(mgr.open_count(), 1);

        mgr.release_volume(dir.path());
        assert_eq!(mgr.open_count(), 0);
    }
}
