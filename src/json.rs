// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JSON types for the HTTP API and the WebSocket control protocol.
//!
//! Wire names are camelCase; the browser UI predates this server and its
//! field names are load-bearing.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub storage_path: String,
    pub loaded: bool,
    pub timezone: String,
    pub path_history: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_count: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_status: Option<CacheStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequest {
    pub storage_path: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CacheStatus {
    pub status: &'static str,
    pub progress: u32,
    pub total: u32,
    pub current: u32,
    pub cached: u32,
}

impl CacheStatus {
    pub const NOT_LOADED: CacheStatus = CacheStatus {
        status: "not_loaded",
        progress: 0,
        total: 0,
        current: 0,
        cached: 0,
    };

    pub fn from_storage(s: storage::CacheStatus) -> Self {
        CacheStatus {
            status: if s.building { "building" } else { "ready" },
            progress: s.progress_percent,
            total: s.total,
            current: s.current,
            cached: s.cached_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecordingDates {
    pub dates: Vec<String>,
    pub channels: Vec<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub id: u32,
    pub channel: u32,
    /// Local `HH:MM:SS`, clipped to the requested day.
    pub start: String,
    pub end: String,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub duration: i64,
    pub frame_count: u32,
}

#[derive(Debug, Serialize)]
pub struct Recordings {
    pub recordings: Vec<Recording>,
}

#[derive(Debug, Serialize)]
pub struct TopLevelError<'a> {
    pub error: &'a str,
}

/// One client command on the stream WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    Play(PlayArgs),
    Seek(PlayArgs),
    Pause {},
    Speed { rate: f64 },
}

fn default_speed() -> f64 {
    1.0
}

fn default_audio() -> bool {
    true
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct PlayArgs {
    pub channel: u32,
    pub timestamp: i64,
    #[serde(default = "default_speed")]
    pub speed: f64,
    #[serde(default = "default_audio")]
    pub audio: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub channel: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub actual_start_time: i64,
    pub has_audio: bool,
    pub audio_format: &'static str,
    pub audio_sample_rate: u32,
}

#[derive(Debug, Serialize)]
pub struct StreamEnd {
    #[serde(rename = "type")]
    pub type_: &'static str,
}

/// Mid-run error: the run aborts, the socket stays open.
#[derive(Debug, Serialize)]
pub struct StreamError<'a> {
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub message: &'a str,
}
