// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! HTTP service: configuration, recording browser, and the stream WebSocket.

mod path;
mod session;
mod websocket;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use base::{bail, err, time as btime, Error, ErrorKind, ResultExt};
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use hyper::body::Bytes;
use parking_lot::RwLock;
use storage::cache::{self, CacheDir, MmapManager};
use storage::tindex;
use storage::StorageManager;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use url::form_urlencoded;

use self::path::Path;
use crate::json;

pub type Body = http_body_util::Full<Bytes>;

/// Retired volumes kept around for quick re-activation.
const RETIRED_CAP: usize = 4;

/// Paths remembered for the UI's path picker.
const PATH_HISTORY_CAP: usize = 8;

struct RetiredVolume {
    path: PathBuf,
    signature: [u8; 16],
    manager: Arc<StorageManager>,
}

#[derive(Default)]
struct State {
    active: Option<Arc<StorageManager>>,
    /// Most recent first.
    path_history: Vec<String>,
    /// Most recently retired first.
    retired: Vec<RetiredVolume>,
}

pub struct Service {
    cache_dir: CacheDir,
    state: RwLock<State>,
}

type ResponseResult = Result<Response<Body>, Error>;

fn json_response<T: serde::Serialize>(status: StatusCode, v: &T) -> Response<Body> {
    let body = serde_json::to_vec(v).expect("api types serialize");
    Response::builder()
        .status(status)
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
        .body(Body::new(body.into()))
        .expect("hardcoded head should be valid")
}

fn serve_json<T: serde::Serialize>(v: &T) -> ResponseResult {
    Ok(json_response(StatusCode::OK, v))
}

fn from_base_error(err: &Error) -> Response<Body> {
    use ErrorKind::*;
    let status_code = match err.kind() {
        Unauthenticated => StatusCode::UNAUTHORIZED,
        PermissionDenied => StatusCode::FORBIDDEN,
        InvalidArgument => StatusCode::BAD_REQUEST,
        FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_response(
        status_code,
        &json::TopLevelError {
            error: &err.to_string(),
        },
    )
}

/// The player UI is typically served from a dev server on another origin.
fn add_cors(response: &mut Response<Body>) {
    let h = response.headers_mut();
    h.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    h.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    h.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
}

fn query_param(req: &Request<hyper::body::Incoming>, name: &str) -> Option<String> {
    let q = req.uri().query()?;
    form_urlencoded::parse(q.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

impl Service {
    pub fn new(cache_dir: CacheDir) -> Self {
        Service {
            cache_dir,
            state: RwLock::new(State::default()),
        }
    }

    pub fn active_manager(&self) -> Option<Arc<StorageManager>> {
        self.state.read().active.clone()
    }

    /// Activates the volume at `path`, reusing a retired manager when its
    /// signature still matches, and kicks off cache construction.
    pub async fn load_volume(
        self: &Arc<Self>,
        path: PathBuf,
    ) -> Result<Arc<StorageManager>, Error> {
        let index_path = path.join(tindex::INDEX_FILE_NAME);
        let signature = {
            let index_path = index_path.clone();
            tokio::task::spawn_blocking(move || cache::file_signature(&index_path))
                .await
                .expect("signature task should not panic")
                .map_err(|e| e.map_kind(|_| ErrorKind::FailedPrecondition))?
        };

        let reused = {
            let mut l = self.state.write();
            match l
                .retired
                .iter()
                .position(|r| r.path == path && r.signature == signature)
            {
                Some(i) => {
                    let r = l.retired.remove(i);
                    info!(volume = %path.display(), "reusing retired volume");
                    Some(r.manager)
                }
                None => None,
            }
        };
        let mgr = match reused {
            Some(m) => m,
            None => {
                let cache_dir = self.cache_dir.clone();
                let load_path = path.clone();
                tokio::task::spawn_blocking(move || StorageManager::load(&load_path, cache_dir))
                    .await
                    .expect("load task should not panic")
                    .map(Arc::new)?
            }
        };

        self.install(mgr.clone(), &path);
        self.kick_build(mgr.clone());
        Ok(mgr)
    }

    /// Swaps in `mgr`, retiring the previous manager (bounded MRU) and
    /// releasing its container mappings.
    fn install(&self, mgr: Arc<StorageManager>, path: &FsPath) {
        let mut l = self.state.write();
        if let Some(old) = l.active.take() {
            MmapManager::global().release_volume(old.volume_path());
            match old.volume_signature() {
                Ok(signature) => {
                    l.retired.insert(
                        0,
                        RetiredVolume {
                            path: old.volume_path().to_owned(),
                            signature,
                            manager: old,
                        },
                    );
                    l.retired.truncate(RETIRED_CAP);
                }
                Err(e) => {
                    debug!(err = %e.chain(), "old volume unreadable; not retiring");
                }
            }
        }
        let display = path.display().to_string();
        l.path_history.retain(|p| p != &display);
        l.path_history.insert(0, display);
        l.path_history.truncate(PATH_HISTORY_CAP);
        l.active = Some(mgr);
    }

    fn kick_build(&self, mgr: Arc<StorageManager>) {
        tokio::task::spawn_blocking(move || {
            mgr.build_cache(None, &|current, total, file_index| {
                debug!(current, total, file_index, "cache build progress");
            });
        });
    }

    fn config_response(&self) -> json::ConfigResponse {
        let l = self.state.read();
        let mut resp = json::ConfigResponse {
            storage_path: l
                .active
                .as_ref()
                .map(|m| m.volume_path().display().to_string())
                .unwrap_or_default(),
            loaded: l.active.is_some(),
            timezone: btime::global_zone_name(),
            path_history: l.path_history.clone(),
            entry_count: None,
            file_count: None,
            cache_status: None,
            error: None,
        };
        if let Some(mgr) = &l.active {
            resp.entry_count = Some(mgr.entry_count());
            resp.file_count = Some(mgr.file_count());
            resp.cache_status = Some(json::CacheStatus::from_storage(mgr.cache_status()));
        }
        resp
    }

    fn get_config(&self) -> ResponseResult {
        serve_json(&self.config_response())
    }

    async fn post_config(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> ResponseResult {
        let body = http_body_util::BodyExt::collect(req.into_body())
            .await
            .map_err(|e| err!(Unavailable, msg("unable to read request body"), source(e)))?
            .to_bytes();
        let config: json::ConfigRequest = serde_json::from_slice(&body)
            .map_err(|e| err!(InvalidArgument, msg("无效的 JSON"), source(e)))?;

        if let Some(tz) = config.timezone.as_deref() {
            if btime::set_global_zone(tz).is_err() {
                return Ok(json_response(
                    StatusCode::BAD_REQUEST,
                    &json::TopLevelError {
                        error: &format!("无效的时区: {tz}"),
                    },
                ));
            }
            info!(timezone = tz, "time zone changed");
        }

        if let Some(p) = config.storage_path.as_deref().filter(|p| !p.is_empty()) {
            let path = PathBuf::from(p);
            if let Err(e) = self.load_volume(path).await {
                warn!(err = %e.chain(), path = p, "unable to load volume");
                return Ok(json_response(
                    StatusCode::BAD_REQUEST,
                    &json::ConfigResponse {
                        storage_path: p.to_owned(),
                        loaded: false,
                        timezone: btime::global_zone_name(),
                        path_history: self.state.read().path_history.clone(),
                        entry_count: None,
                        file_count: None,
                        cache_status: None,
                        error: Some("无法加载指定路径的 DVR 数据".to_owned()),
                    },
                ));
            }
        }

        serve_json(&self.config_response())
    }

    fn cache_status(&self) -> ResponseResult {
        match self.active_manager() {
            None => serve_json(&json::CacheStatus::NOT_LOADED),
            Some(mgr) => serve_json(&json::CacheStatus::from_storage(mgr.cache_status())),
        }
    }

    fn recording_dates(&self, req: &Request<hyper::body::Incoming>) -> ResponseResult {
        let channel: Option<u32> = query_param(req, "channel").and_then(|c| c.parse().ok());
        let Some(mgr) = self.active_manager() else {
            return serve_json(&json::RecordingDates { dates: Vec::new(), channels: Vec::new() });
        };

        let tz = btime::global_zone();
        let mut dates = BTreeSet::new();
        let mut channels = BTreeSet::new();
        for cached in mgr.cached_segments() {
            let seg = cached.segment;
            channels.insert(seg.channel);
            if channel.map(|c| seg.channel != c).unwrap_or(false) {
                continue;
            }
            // A segment touching local midnight contributes both dates.
            for ts in [seg.start_time, seg.end_time] {
                let z = btime::zoned(ts, &tz)?;
                dates.insert(z.strftime("%F").to_string());
            }
        }
        serve_json(&json::RecordingDates {
            dates: dates.into_iter().collect(),
            channels: channels.into_iter().collect(),
        })
    }

    fn recordings(&self, req: &Request<hyper::body::Incoming>) -> ResponseResult {
        let Some(date) = query_param(req, "date") else {
            bail!(InvalidArgument, msg("缺少 date 参数"));
        };
        let channel: Option<u32> = query_param(req, "channel").and_then(|c| c.parse().ok());
        let Some(mgr) = self.active_manager() else {
            return serve_json(&json::Recordings { recordings: Vec::new() });
        };

        let tz = btime::global_zone();
        let day: jiff::civil::Date = date
            .parse()
            .map_err(|e| err!(InvalidArgument, msg("bad date {date:?}"), source(e)))?;
        let day_start = day
            .to_zoned(tz.clone())
            .map_err(|e| err!(InvalidArgument, source(e)))?
            .timestamp()
            .as_second();
        let day_end = day
            .tomorrow()
            .and_then(|d| d.to_zoned(tz.clone()))
            .map_err(|e| err!(InvalidArgument, source(e)))?
            .timestamp()
            .as_second();

        let mut recordings = Vec::new();
        for cached in mgr.cached_segments() {
            let seg = cached.segment;
            if channel.map(|c| seg.channel != c).unwrap_or(false) {
                continue;
            }
            if seg.start_time >= day_end || seg.end_time <= day_start {
                continue;
            }
            let start = seg.start_time.max(day_start);
            let end = seg.end_time.min(day_end);
            recordings.push(json::Recording {
                id: seg.file_index,
                channel: seg.channel,
                start: btime::zoned(start, &tz)?.strftime("%H:%M:%S").to_string(),
                end: btime::zoned(end, &tz)?.strftime("%H:%M:%S").to_string(),
                start_timestamp: start,
                end_timestamp: end,
                duration: end - start,
                frame_count: seg.frame_count,
            });
        }
        recordings.sort_by_key(|r| r.start_timestamp);
        serve_json(&json::Recordings { recordings })
    }

    fn frame_index(&self, file_index: u32) -> ResponseResult {
        let cached = self
            .active_manager()
            .and_then(|mgr| mgr.cached_segment(file_index))
            .ok_or_else(|| err!(NotFound, msg("frame index not found")))?;
        serve_json(&cached.frames())
    }

    async fn audio(
        &self,
        file_index: u32,
        req: &Request<hyper::body::Incoming>,
    ) -> ResponseResult {
        let start: usize = query_param(req, "start")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let count: usize = query_param(req, "count")
            .and_then(|v| v.parse().ok())
            .filter(|&c| c > 0)
            .unwrap_or(50)
            .min(500);

        let mgr = self
            .active_manager()
            .ok_or_else(|| err!(FailedPrecondition, msg("DVR 未加载")))?;
        let cached = mgr
            .cached_segment(file_index)
            .ok_or_else(|| err!(NotFound, msg("frame index not found")))?;
        let container = mgr
            .container_path(file_index)
            .ok_or_else(|| err!(NotFound, msg("container {file_index} is missing")))?;
        let frames: Vec<storage::trec::AudioFrame> = cached
            .audio_frames
            .iter()
            .skip(start)
            .take(count)
            .copied()
            .collect();

        let wav = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, Error> {
            let mut pcm = Vec::new();
            for af in &frames {
                let data = storage::trec::read_frame(&container, af.file_offset, af.frame_size)?;
                pcm.extend_from_slice(&crate::audio::decode_to_pcm(&data));
            }
            Ok(crate::audio::wav_from_pcm(&pcm))
        })
        .await
        .expect("audio decode should not panic")?;

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("audio/wav"))
            .body(Body::new(wav.into()))
            .expect("hardcoded head should be valid"))
    }

    async fn serve_inner(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> ResponseResult {
        let path = Path::decode(req.uri().path());
        tracing::trace!(?path, "path");

        if *req.method() == Method::OPTIONS {
            return Ok(Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Body::new(Bytes::new()))
                .expect("hardcoded head should be valid"));
        }

        // The WebSocket endpoint is handled apart: errors there travel as
        // text messages over the protocol, not HTTP statuses.
        if path == Path::Stream {
            let svc = self.clone();
            return websocket::upgrade(req, move |ws| session::run(svc, ws));
        }

        match path {
            Path::Config if *req.method() == Method::POST => self.post_config(req).await,
            Path::Config => self.get_config(),
            Path::CacheStatus => self.cache_status(),
            Path::RecordingDates => self.recording_dates(&req),
            Path::Recordings => self.recordings(&req),
            Path::FrameIndex(i) => self.frame_index(i),
            Path::Audio(i) => self.audio(i, &req).await,
            Path::Stream => unreachable!("stream upgrade is handled above"),
            Path::NotFound => bail!(NotFound, msg("path not understood")),
        }
    }

    /// Serves one HTTP request, turning errors into responses and logging
    /// per-request spans with latency and status.
    pub async fn serve(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<Body>, std::convert::Infallible> {
        let span = tracing::info_span!(
            "request",
            http.client_ip = %client_addr.ip(),
            http.method = %req.method(),
            http.target = %req.uri(),
            http.status_code = tracing::field::Empty,
        );
        let start = std::time::Instant::now();
        let response = self.serve_inner(req).instrument(span.clone()).await;
        let (mut response, error) = match response {
            Ok(r) => (r, None),
            Err(e) => (from_base_error(&e), Some(e)),
        };
        add_cors(&mut response);
        span.record("http.status_code", response.status().as_u16());
        let latency = start.elapsed().as_secs_f32();
        if response.status().is_server_error() {
            tracing::error!(parent: &span, latency, error = error.map(tracing::field::display), "sent response");
        } else if response.status().is_client_error() {
            tracing::warn!(parent: &span, latency, error = error.map(tracing::field::display), "sent response");
        } else {
            tracing::debug!(parent: &span, latency, "sent response");
        }
        Ok(response)
    }
}

/// Accepts connections until `shutdown` fires.
pub async fn serve(
    service: Arc<Service>,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            r = listener.accept() => r.err_kind(ErrorKind::Unavailable)?,
        };
        let _ = tcp.set_nodelay(true);
        let io = hyper_util::rt::TokioIo::new(tcp);
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let svc_fn = hyper::service::service_fn(move |req| {
                Arc::clone(&service).serve(req, peer)
            });
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, svc_fn)
                .with_upgrades();
            if let Err(err) = conn.await {
                debug!(%err, "connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use storage::testutil::{self, TestVolume};
    use tokio_tungstenite::tungstenite::Message;

    const SEG_START: i64 = 1_766_034_449;
    const SEG_END: i64 = SEG_START + 20;

    struct Server {
        base_url: String,
        ws_url: String,
        _vol: TestVolume,
        _shutdown: tokio_util::sync::DropGuard,
    }

    /// Starts a server over a one-segment volume and waits for its cache.
    async fn start_server(vol: TestVolume) -> Server {
        testutil::init();
        let cache_dir = CacheDir::open(vol.path()).unwrap();
        let service = Arc::new(Service::new(cache_dir));
        service.load_volume(vol.path().to_owned()).await.unwrap();
        let mgr = service.active_manager().unwrap();
        let want = mgr.segments().len() as u32;
        for _ in 0..1000 {
            let status = mgr.cache_status();
            if !status.building && status.cached_count >= want {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(mgr.cache_status().cached_count, want, "cache build stalled");

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(service, listener, shutdown.clone()));
        Server {
            base_url: format!("http://{addr}"),
            ws_url: format!("ws://{addr}/api/v1/stream"),
            _vol: vol,
            _shutdown: shutdown.drop_guard(),
        }
    }

    fn single_segment_volume() -> TestVolume {
        TestVolume::builder().segment(2, SEG_START, SEG_END, 10).build()
    }

    async fn next_message<S>(ws: &mut S) -> Message
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("socket closed unexpectedly")
            .expect("socket errored")
    }

    async fn send_text<S, E>(ws: &mut S, text: &str)
    where
        S: futures::Sink<Message, Error = E> + Unpin,
        E: std::fmt::Debug,
    {
        ws.send(Message::Text(text.to_owned().into())).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_surface() {
        let s = start_server(single_segment_volume()).await;
        let cli = reqwest::Client::new();

        // Config reflects the loaded volume.
        let config: serde_json::Value = cli
            .get(format!("{}/api/v1/config", s.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(config["loaded"], true);
        assert_eq!(config["entryCount"], 1);
        assert!(config["pathHistory"].as_array().unwrap().len() == 1);
        assert_eq!(config["cacheStatus"]["status"], "ready");

        // Cache status endpoint agrees.
        let status: serde_json::Value = cli
            .get(format!("{}/api/v1/cache/status", s.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["status"], "ready");
        assert_eq!(status["cached"], 1);

        // Frame index dump.
        let records: serde_json::Value = cli
            .get(format!("{}/api/v1/frame_index/0", s.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!records.as_array().unwrap().is_empty());
        let resp = cli
            .get(format!("{}/api/v1/frame_index/9", s.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        // Audio decode produces a WAV.
        let resp = cli
            .get(format!("{}/api/v1/audio/0?start=0&count=4", s.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "audio/wav");
        let body = resp.bytes().await.unwrap();
        assert!(body.len() > 44);
        assert_eq!(&body[0..4], b"RIFF");

        // CORS preflight and unknown paths.
        let resp = cli
            .request(reqwest::Method::OPTIONS, format!("{}/api/v1/config", s.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
        let resp = cli
            .get(format!("{}/api/v1/junk", s.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        // Bad timezone is rejected; good one applies.
        let resp = cli
            .post(format!("{}/api/v1/config", s.base_url))
            .json(&serde_json::json!({"timezone": "Not/AZone"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dates_straddle_midnight() {
        // 2025-12-18T15:59:30Z .. 16:00:30Z: 23:59:30 .. 00:00:30 in Shanghai.
        let vol = TestVolume::builder()
            .segment(2, 1_766_073_570, 1_766_073_630, 4)
            .build();
        let s = start_server(vol).await;
        let cli = reqwest::Client::new();

        let resp = cli
            .post(format!("{}/api/v1/config", s.base_url))
            .json(&serde_json::json!({"timezone": "Asia/Shanghai"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        let dates: serde_json::Value = cli
            .get(format!("{}/api/v1/recordings/dates?channel=2", s.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            dates["dates"],
            serde_json::json!(["2025-12-18", "2025-12-19"])
        );
        assert_eq!(dates["channels"], serde_json::json!([2]));

        // The second local day sees the interval clipped to local midnight.
        let recordings: serde_json::Value = cli
            .get(format!(
                "{}/api/v1/recordings?date=2025-12-19&channel=2",
                s.base_url
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let r = &recordings["recordings"][0];
        assert_eq!(r["startTimestamp"], 1_766_073_600i64); // local midnight
        assert_eq!(r["endTimestamp"], 1_766_073_630i64);
        assert_eq!(r["duration"], 30);
        assert_eq!(r["start"], "00:00:00");
    }

    /// Decoded `H265`/`G711` wire frame for assertions.
    #[derive(Debug)]
    enum WireFrame {
        Video { timestamp_ms: i64, frame_type: u8 },
        Audio { timestamp_ms: i64 },
    }

    fn decode_wire(data: &[u8]) -> WireFrame {
        match &data[0..4] {
            b"H265" => WireFrame::Video {
                timestamp_ms: u64::from_be_bytes(data[4..12].try_into().unwrap()) as i64,
                frame_type: data[12],
            },
            b"G711" => WireFrame::Audio {
                timestamp_ms: u64::from_be_bytes(data[4..12].try_into().unwrap()) as i64,
            },
            other => panic!("unknown wire magic {other:02x?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ws_play_to_end() {
        let s = start_server(single_segment_volume()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&s.ws_url).await.unwrap();
        send_text(
            &mut ws,
            &format!(
                r#"{{"action":"play","channel":2,"timestamp":{SEG_START},"speed":4.0,"audio":true}}"#
            ),
        )
        .await;

        // stream_start first.
        let Message::Text(t) = next_message(&mut ws).await else {
            panic!("expected stream_start text");
        };
        let start: serde_json::Value = serde_json::from_str(t.as_str()).unwrap();
        assert_eq!(start["type"], "stream_start");
        assert_eq!(start["actualStartTime"], SEG_START);
        assert_eq!(start["startTime"], SEG_START);
        assert_eq!(start["endTime"], SEG_END);
        assert_eq!(start["hasAudio"], true);
        assert_eq!(start["audioFormat"], "g711-ulaw");
        assert_eq!(start["audioSampleRate"], 8000);

        // Then the prologue in order, then data until stream_end.
        let mut video_types = Vec::new();
        let mut audio_frames = 0usize;
        let mut last_video_ts = 0i64;
        loop {
            match next_message(&mut ws).await {
                Message::Binary(b) => match decode_wire(&b) {
                    WireFrame::Video { timestamp_ms, frame_type } => {
                        assert!(timestamp_ms >= last_video_ts || frame_type >= 2);
                        if frame_type <= 1 {
                            last_video_ts = timestamp_ms;
                        }
                        video_types.push(frame_type);
                    }
                    WireFrame::Audio { timestamp_ms } => {
                        assert!(timestamp_ms >= SEG_START * 1000);
                        audio_frames += 1;
                    }
                },
                Message::Text(t) => {
                    let v: serde_json::Value = serde_json::from_str(t.as_str()).unwrap();
                    assert_eq!(v["type"], "stream_end", "unexpected text {v}");
                    break;
                }
                Message::Close(_) => panic!("socket closed before stream_end"),
                _ => {}
            }
        }
        assert_eq!(&video_types[0..4], &[2, 3, 4, 1]);
        assert!(video_types[4..].iter().any(|&t| t == 0), "no P-frames seen");
        assert!(audio_frames > 0, "audio enabled but none flushed");
        // Video timestamps stay within the segment.
        assert!(last_video_ts <= (SEG_END + 1) * 1000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ws_seek_preempts_cleanly() {
        let s = start_server(single_segment_volume()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&s.ws_url).await.unwrap();
        send_text(
            &mut ws,
            &format!(
                r#"{{"action":"play","channel":2,"timestamp":{SEG_START},"speed":1.0,"audio":false}}"#
            ),
        )
        .await;

        // Let the first run get going: stream_start + a few frames.
        let Message::Text(_) = next_message(&mut ws).await else {
            panic!("expected first stream_start");
        };
        for _ in 0..5 {
            next_message(&mut ws).await;
        }

        let seek_to = SEG_START + 10;
        send_text(
            &mut ws,
            &format!(
                r#"{{"action":"seek","channel":2,"timestamp":{seek_to},"speed":4.0,"audio":false}}"#
            ),
        )
        .await;

        // Everything until the second stream_start belongs to the old run;
        // after it, only new-run frames may appear, starting with a fresh
        // prologue.
        let second_start = loop {
            match next_message(&mut ws).await {
                Message::Text(t) => {
                    let v: serde_json::Value = serde_json::from_str(t.as_str()).unwrap();
                    if v["type"] == "stream_start" {
                        break v;
                    }
                }
                _ => {}
            }
        };
        let actual = second_start["actualStartTime"].as_i64().unwrap();
        assert!(
            (actual - seek_to).abs() <= 3,
            "seek landed at {actual}, wanted ≈{seek_to}"
        );

        let mut types = Vec::new();
        for _ in 0..6 {
            if let Message::Binary(b) = next_message(&mut ws).await {
                if let WireFrame::Video { timestamp_ms, frame_type } = decode_wire(&b) {
                    types.push(frame_type);
                    // No frame from the pre-seek run may follow the new
                    // stream_start; pre-seek timestamps sit near SEG_START.
                    assert!(
                        timestamp_ms >= (seek_to - 3) * 1000,
                        "stale frame at {timestamp_ms}"
                    );
                }
            }
        }
        assert_eq!(&types[0..4], &[2, 3, 4, 1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ws_unknown_time_keeps_socket_open() {
        let s = start_server(single_segment_volume()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&s.ws_url).await.unwrap();

        send_text(
            &mut ws,
            r#"{"action":"play","channel":2,"timestamp":1000000000,"speed":1.0,"audio":true}"#,
        )
        .await;
        let Message::Text(t) = next_message(&mut ws).await else {
            panic!("expected error text");
        };
        let v: serde_json::Value = serde_json::from_str(t.as_str()).unwrap();
        assert_eq!(v["error"], "未找到指定时间的录像");

        // Malformed JSON is answered, not fatal.
        send_text(&mut ws, "{nope").await;
        let Message::Text(t) = next_message(&mut ws).await else {
            panic!("expected error text");
        };
        let v: serde_json::Value = serde_json::from_str(t.as_str()).unwrap();
        assert_eq!(v["error"], "invalid json");

        // The session still accepts a valid play.
        send_text(
            &mut ws,
            &format!(r#"{{"action":"play","channel":2,"timestamp":{SEG_START},"speed":4.0}}"#),
        )
        .await;
        let Message::Text(t) = next_message(&mut ws).await else {
            panic!("expected stream_start");
        };
        let v: serde_json::Value = serde_json::from_str(t.as_str()).unwrap();
        assert_eq!(v["type"], "stream_start");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ws_pause_stops_frames() {
        let s = start_server(single_segment_volume()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&s.ws_url).await.unwrap();
        send_text(
            &mut ws,
            &format!(
                r#"{{"action":"play","channel":2,"timestamp":{SEG_START},"speed":1.0,"audio":false}}"#
            ),
        )
        .await;
        next_message(&mut ws).await; // stream_start
        for _ in 0..3 {
            next_message(&mut ws).await;
        }

        send_text(&mut ws, r#"{"action":"pause"}"#).await;
        // Drain whatever was in flight; then the stream must go quiet.
        loop {
            match tokio::time::timeout(Duration::from_millis(300), ws.next()).await {
                Ok(Some(Ok(_))) => continue,
                Ok(_) => panic!("socket closed on pause"),
                Err(_) => break, // quiet
            }
        }

        // Back to streaming on demand.
        send_text(
            &mut ws,
            &format!(r#"{{"action":"play","channel":2,"timestamp":{SEG_START},"speed":4.0}}"#),
        )
        .await;
        let Message::Text(t) = next_message(&mut ws).await else {
            panic!("expected stream_start after pause");
        };
        let v: serde_json::Value = serde_json::from_str(t.as_str()).unwrap();
        assert_eq!(v["type"], "stream_start");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ws_speed_change_resends_nothing() {
        let s = start_server(single_segment_volume()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&s.ws_url).await.unwrap();
        send_text(
            &mut ws,
            &format!(
                r#"{{"action":"play","channel":2,"timestamp":{SEG_START},"speed":1.0,"audio":false}}"#
            ),
        )
        .await;
        next_message(&mut ws).await; // stream_start
        for _ in 0..4 {
            next_message(&mut ws).await; // prologue
        }

        send_text(&mut ws, r#"{"action":"speed","rate":4.0}"#).await;
        // The run continues with data frames only: no fresh parameter sets.
        let mut video = 0;
        while video < 5 {
            if let Message::Binary(b) = next_message(&mut ws).await {
                if let WireFrame::Video { frame_type, .. } = decode_wire(&b) {
                    assert!(frame_type <= 1, "parameter set resent on speed change");
                    video += 1;
                }
            }
        }
    }
}
