// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-WebSocket stream sessions.
//!
//! One session serves one client. The command loop stays on the socket so
//! `pause`/`seek`/`speed` are handled while a run is streaming; each run is a
//! separate task carrying a cancellation token and a process-unique
//! `stream_id`. Starting a run cancels the previous one, waits for it to
//! observe cancellation and exit, and only then installs the new id; and
//! every outbound write re-checks the installed id under the send mutex, so a
//! late frame from a cancelled run is dropped instead of interleaving on the
//! wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base::ErrorKind;
use byteorder::{BigEndian, WriteBytesExt};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use storage::hevc;
use storage::oracle;
use storage::trec::AudioFrame;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::websocket::WebSocketStream;
use super::Service;
use crate::audio;
use crate::json;

const BASE_FPS: f64 = 25.0;

/// Monotonically increasing across every run in the process.
static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

fn interval_us_for(speed: f64) -> u64 {
    (1_000_000.0 / (BASE_FPS * speed)) as u64
}

/// Wire `frame_type` byte for a video frame.
fn wire_frame_type(nal_type: u8) -> u8 {
    match nal_type {
        hevc::NAL_VPS => 2,
        hevc::NAL_SPS => 3,
        hevc::NAL_PPS => 4,
        hevc::NAL_IDR_W_RADL | hevc::NAL_IDR_N_LP => 1,
        _ => 0,
    }
}

/// `H265` framing: magic, timestamp_ms, frame_type, length, raw NAL payload.
/// Big-endian, unlike everything on disk.
fn video_frame(timestamp_ms: i64, nal_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(17 + payload.len());
    buf.extend_from_slice(b"H265");
    buf.write_u64::<BigEndian>(timestamp_ms as u64).unwrap();
    buf.push(wire_frame_type(nal_type));
    buf.write_u32::<BigEndian>(payload.len() as u32).unwrap();
    buf.extend_from_slice(payload);
    buf
}

/// `G711` framing: magic, timestamp_ms, sample rate, length, μ-law bytes.
fn audio_frame(timestamp_ms: i64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(18 + payload.len());
    buf.extend_from_slice(b"G711");
    buf.write_u64::<BigEndian>(timestamp_ms as u64).unwrap();
    buf.write_u16::<BigEndian>(audio::SAMPLE_RATE as u16).unwrap();
    buf.write_u32::<BigEndian>(payload.len() as u32).unwrap();
    buf.extend_from_slice(payload);
    buf
}

/// Send half of the socket plus the installed run id.
struct Shared {
    sink: tokio::sync::Mutex<SplitSink<WebSocketStream, Message>>,
    stream_id: AtomicU64,
}

impl Shared {
    /// Session-level message, not bound to a run.
    async fn send_json<T: Serialize>(&self, v: &T) -> bool {
        let text = serde_json::to_string(v).expect("wire types serialize");
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .is_ok()
    }

    /// Run-bound message; dropped (returning false) when `stream_id` is no
    /// longer the installed one.
    async fn send_json_for<T: Serialize>(&self, stream_id: u64, v: &T) -> bool {
        let text = serde_json::to_string(v).expect("wire types serialize");
        let mut sink = self.sink.lock().await;
        if self.stream_id.load(Ordering::Acquire) != stream_id {
            return false;
        }
        sink.send(Message::Text(text.into())).await.is_ok()
    }

    async fn send_binary(&self, stream_id: u64, frame: Vec<u8>) -> bool {
        let mut sink = self.sink.lock().await;
        if self.stream_id.load(Ordering::Acquire) != stream_id {
            return false;
        }
        sink.send(Message::Binary(frame.into())).await.is_ok()
    }
}

struct ActiveRun {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    interval_us: Arc<AtomicU64>,
}

/// Cancels the active run and waits for it to exit.
async fn stop(active: &mut Option<ActiveRun>) {
    if let Some(run) = active.take() {
        run.token.cancel();
        if let Err(err) = run.handle.await {
            warn!(%err, "streaming run panicked");
        }
    }
}

/// Runs one session until the client disconnects.
pub(super) async fn run(service: Arc<Service>, ws: WebSocketStream) {
    let (sink, mut messages) = ws.split();
    let shared = Arc::new(Shared {
        sink: tokio::sync::Mutex::new(sink),
        stream_id: AtomicU64::new(0),
    });
    let mut active: Option<ActiveRun> = None;
    info!("session opened");

    while let Some(msg) = messages.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(err) => {
                debug!(%err, "socket error");
                break;
            }
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        let cmd = match serde_json::from_str::<json::Command>(text.as_str()) {
            Ok(c) => c,
            Err(_) => {
                shared
                    .send_json(&json::TopLevelError { error: "invalid json" })
                    .await;
                continue;
            }
        };
        match cmd {
            json::Command::Play(mut args) | json::Command::Seek(mut args) => {
                if !(args.speed > 0.0) {
                    args.speed = 1.0;
                }
                debug!(
                    channel = args.channel,
                    timestamp = args.timestamp,
                    speed = args.speed,
                    "starting run"
                );
                // Preemption: cancel, wait for exit, then install the new id.
                stop(&mut active).await;
                active = Some(start(service.clone(), &shared, args));
            }
            json::Command::Pause {} => {
                stop(&mut active).await;
                debug!("paused");
            }
            json::Command::Speed { rate } => {
                if rate > 0.0 {
                    if let Some(run) = &active {
                        run.interval_us.store(interval_us_for(rate), Ordering::Relaxed);
                        debug!(rate, "speed changed");
                    }
                }
            }
        }
    }

    stop(&mut active).await;
    let _ = shared.sink.lock().await.close().await;
    info!("session closed");
}

fn start(service: Arc<Service>, shared: &Arc<Shared>, args: json::PlayArgs) -> ActiveRun {
    let stream_id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
    shared.stream_id.store(stream_id, Ordering::Release);
    let interval_us = Arc::new(AtomicU64::new(interval_us_for(args.speed)));
    let token = CancellationToken::new();
    let handle = tokio::spawn(
        run_stream(
            service,
            shared.clone(),
            stream_id,
            token.clone(),
            interval_us.clone(),
            args,
        )
        .instrument(tracing::info_span!("stream", id = stream_id)),
    );
    ActiveRun {
        token,
        handle,
        interval_us,
    }
}

async fn run_stream(
    service: Arc<Service>,
    shared: Arc<Shared>,
    stream_id: u64,
    token: CancellationToken,
    interval_us: Arc<AtomicU64>,
    args: json::PlayArgs,
) {
    let Some(mgr) = service.active_manager() else {
        shared
            .send_json_for(stream_id, &json::TopLevelError { error: "DVR 未加载" })
            .await;
        return;
    };

    // Seek resolution and the 512 KiB header hunt touch the medium; keep
    // them off the runtime workers.
    let setup = {
        let mgr = mgr.clone();
        let interval_us = interval_us.clone();
        tokio::task::spawn_blocking(move || -> Result<
            Option<(oracle::ResolvedSeek, storage::StreamReader)>,
            base::Error,
        > {
            let Some(resolved) = oracle::resolve_seek(&mgr, args.timestamp, args.channel)? else {
                return Ok(None);
            };
            let reader = mgr.open_stream_reader(
                resolved.segment.file_index,
                resolved.header.stream_start_pos,
                resolved.actual_start_time * 1_000,
                args.channel,
                interval_us,
            )?;
            Ok(Some((resolved, reader)))
        })
        .await
        .expect("seek resolution should not panic")
    };
    let (resolved, mut reader) = match setup {
        Ok(Some(x)) => x,
        Ok(None) => {
            shared
                .send_json_for(
                    stream_id,
                    &json::StreamError { type_: "error", message: "未找到视频头" },
                )
                .await;
            return;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(err = %e.chain(), "seek misses every cached segment");
            shared
                .send_json_for(stream_id, &json::TopLevelError { error: "未找到指定时间的录像" })
                .await;
            return;
        }
        Err(e) => {
            warn!(err = %e.chain(), "seek resolution failed");
            shared
                .send_json_for(
                    stream_id,
                    &json::StreamError { type_: "error", message: "无法创建流读取器" },
                )
                .await;
            return;
        }
    };

    let file_index = resolved.segment.file_index;
    let audio_frames: Vec<AudioFrame> = mgr
        .cached_segment(file_index)
        .map(|c| c.audio_frames.clone())
        .unwrap_or_default();
    let has_audio = !audio_frames.is_empty();
    debug!(
        file_index,
        start_pos = resolved.header.stream_start_pos,
        actual_start_time = resolved.actual_start_time,
        audio_frames = audio_frames.len(),
        "run resolved"
    );

    if token.is_cancelled() {
        debug!("cancelled before start");
        return;
    }

    if !shared
        .send_json_for(
            stream_id,
            &json::StreamStart {
                type_: "stream_start",
                channel: args.channel,
                start_time: resolved.segment.start_time,
                end_time: resolved.segment.end_time,
                actual_start_time: resolved.actual_start_time,
                has_audio,
                audio_format: "g711-ulaw",
                audio_sample_rate: audio::SAMPLE_RATE,
            },
        )
        .await
    {
        return;
    }

    // Decoder prologue first, always in VPS/SPS/PPS/IDR order.
    let header_ts = resolved.actual_start_time * 1_000;
    let h = &resolved.header;
    for (nal_type, payload) in [
        (hevc::NAL_VPS, &h.vps),
        (hevc::NAL_SPS, &h.sps),
        (hevc::NAL_PPS, &h.pps),
        (hevc::NAL_IDR_W_RADL, &h.idr),
    ] {
        if !shared
            .send_binary(stream_id, video_frame(header_ts, nal_type, payload))
            .await
        {
            return;
        }
    }

    // The run reads audio payloads through its own handle.
    let mut audio_file = None;
    if args.audio && has_audio {
        if let Some(path) = mgr.container_path(file_index) {
            match tokio::fs::File::open(&path).await {
                Ok(f) => audio_file = Some(f),
                Err(err) => warn!(%err, "unable to open container for audio; continuing without"),
            }
        }
    }
    let mut audio_idx = audio_frames
        .partition_point(|a| u64::from(a.file_offset) < resolved.header.stream_start_pos);

    let mut total_frames = 0u64;
    let mut window_frames = 0u64;
    let mut last_stats = Instant::now();
    loop {
        let nals = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(total_frames, "run cancelled");
                return;
            }
            r = reader.read_next_nals() => r,
        };
        let nals = match nals {
            Ok(n) => n,
            Err(e) => {
                warn!(err = %e.chain(), "stream read failed");
                shared
                    .send_json_for(
                        stream_id,
                        &json::StreamError { type_: "error", message: "读取录像数据失败" },
                    )
                    .await;
                return;
            }
        };
        if nals.is_empty() {
            info!(total_frames, "end of stream");
            shared
                .send_json_for(stream_id, &json::StreamEnd { type_: "stream_end" })
                .await;
            return;
        }

        for nal in &nals {
            if token.is_cancelled() {
                debug!(total_frames, "run cancelled mid-batch");
                return;
            }
            if !shared
                .send_binary(stream_id, video_frame(nal.timestamp_ms, nal.nal_type, &nal.data))
                .await
            {
                return;
            }
            if !hevc::is_video_frame(nal.nal_type) {
                continue;
            }
            total_frames += 1;
            window_frames += 1;

            // Flush audio up to this video frame's position.
            if let Some(f) = audio_file.as_mut() {
                while audio_idx < audio_frames.len()
                    && u64::from(audio_frames[audio_idx].file_offset) <= nal.file_offset
                {
                    let af = audio_frames[audio_idx];
                    audio_idx += 1;
                    match read_audio_payload(f, af).await {
                        Ok(payload) => {
                            let frame = audio_frame(af.unix_timestamp * 1_000, &payload);
                            if !shared.send_binary(stream_id, frame).await {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(%err, offset = af.file_offset, "audio read failed");
                        }
                    }
                }
            }

            // Cancellation-aware pacing.
            let interval = Duration::from_micros(interval_us.load(Ordering::Relaxed));
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(total_frames, "run cancelled during pacing");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if last_stats.elapsed() >= Duration::from_secs(1) {
            let fps = window_frames as f64 / last_stats.elapsed().as_secs_f64();
            debug!(
                fps = %format!("{fps:.1}"),
                audio = audio_idx,
                total_frames,
                "stream stats"
            );
            window_frames = 0;
            last_stats = Instant::now();
        }
    }
}

async fn read_audio_payload(
    f: &mut tokio::fs::File,
    af: AudioFrame,
) -> std::io::Result<Vec<u8>> {
    f.seek(std::io::SeekFrom::Start(u64::from(af.file_offset)))
        .await?;
    let mut payload = vec![0u8; af.frame_size as usize];
    f.read_exact(&mut payload).await?;
    Ok(payload)
}
