// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! VPS position scanning.
//!
//! The frame index alone cannot place I-frames precisely enough for seeking:
//! its key-frame offsets point at the firmware's frame records, while the
//! decoder needs the VPS that precedes each GOP. This scanner byte-searches
//! the whole data region for the Annex-B VPS start sequence. VPS repeats once
//! per GOP (7–12 s on this hardware), so a 249 MiB region yields a few
//! thousand positions at most.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use base::{err, Error};
use memchr::memmem;

use crate::trec::DATA_REGION_END;

/// Annex-B start code plus the VPS NAL header byte (type 32).
pub const VPS_PATTERN: [u8; 5] = [0x00, 0x00, 0x00, 0x01, 0x40];

/// Window size for the scan. Larger reads don't help on the USB media this
/// format lives on.
const WINDOW_LEN: usize = 4 << 20;

/// Overlap so a pattern straddling a window boundary is still found.
const OVERLAP_LEN: usize = VPS_PATTERN.len() - 1;

/// Scans the data region `[0, DATA_REGION_END)` of a container for VPS start
/// sequences, returning absolute byte offsets in ascending order.
///
/// Nothing is deduplicated; a VPS legitimately repeats once per GOP.
pub fn scan_vps_positions(path: &Path) -> Result<Vec<u32>, Error> {
    let mut f = File::open(path).map_err(|e| {
        err!(
            Unavailable,
            msg("unable to open container {}", path.display()),
            source(e)
        )
    })?;

    let scan_len = DATA_REGION_END as usize;
    let finder = memmem::Finder::new(&VPS_PATTERN);
    let mut positions = Vec::new();
    let mut window = vec![0u8; WINDOW_LEN + OVERLAP_LEN];
    let mut offset = 0usize;

    while offset < scan_len {
        let want = WINDOW_LEN.min(scan_len - offset);
        // Read a few bytes past the window for boundary matches, but never
        // past the data region.
        let extra = OVERLAP_LEN.min(scan_len - offset - want);
        f.seek(SeekFrom::Start(offset as u64))
            .map_err(|e| err!(Unavailable, source(e)))?;
        let n = read_up_to(&mut f, &mut window[..want + extra])
            .map_err(|e| err!(Unavailable, msg("read failed at {offset:#x}"), source(e)))?;
        if n == 0 {
            break;
        }

        // Accept matches starting inside [0, want); a match starting in the
        // overlap belongs to the next window.
        for idx in finder.find_iter(&window[..n]) {
            if idx < want {
                positions.push((offset + idx) as u32);
            }
        }
        offset += want;
    }

    Ok(positions)
}

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
