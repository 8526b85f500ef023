// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Decodes request paths.

use std::str::FromStr;

/// A decoded request path.
#[derive(Debug, Eq, PartialEq)]
pub(super) enum Path {
    Config,          // "/api/v1/config"
    CacheStatus,     // "/api/v1/cache/status"
    RecordingDates,  // "/api/v1/recordings/dates"
    Recordings,      // "/api/v1/recordings"
    FrameIndex(u32), // "/api/v1/frame_index/<file_index>"
    Audio(u32),      // "/api/v1/audio/<file_index>"
    Stream,          // "/api/v1/stream" (WebSocket)
    NotFound,
}

impl Path {
    /// Decodes a request path, notably not including any request parameters.
    pub(super) fn decode(path: &str) -> Self {
        let path = match path.strip_prefix("/api/v1/") {
            Some(p) => p,
            None => return Path::NotFound,
        };
        match path {
            "config" => return Path::Config,
            "cache/status" => return Path::CacheStatus,
            "recordings/dates" => return Path::RecordingDates,
            "recordings" => return Path::Recordings,
            "stream" => return Path::Stream,
            _ => {}
        }
        if let Some(rest) = path.strip_prefix("frame_index/") {
            return match u32::from_str(rest) {
                Ok(i) => Path::FrameIndex(i),
                Err(_) => Path::NotFound,
            };
        }
        if let Some(rest) = path.strip_prefix("audio/") {
            return match u32::from_str(rest) {
                Ok(i) => Path::Audio(i),
                Err(_) => Path::NotFound,
            };
        }
        Path::NotFound
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn paths() {
        use super::Path;
        assert_eq!(Path::decode("/api/v1/config"), Path::Config);
        assert_eq!(Path::decode("/api/v1/cache/status"), Path::CacheStatus);
        assert_eq!(Path::decode("/api/v1/recordings/dates"), Path::RecordingDates);
        assert_eq!(Path::decode("/api/v1/recordings"), Path::Recordings);
        assert_eq!(Path::decode("/api/v1/stream"), Path::Stream);
        assert_eq!(Path::decode("/api/v1/frame_index/42"), Path::FrameIndex(42));
        assert_eq!(Path::decode("/api/v1/frame_index/x"), Path::NotFound);
        assert_eq!(Path::decode("/api/v1/audio/7"), Path::Audio(7));
        assert_eq!(Path::decode("/api/v1/audio/"), Path::NotFound);
        assert_eq!(Path::decode("/api/v1/junk"), Path::NotFound);
        assert_eq!(Path::decode("/api/"), Path::NotFound);
        assert_eq!(Path::decode("/"), Path::NotFound);
    }
}
