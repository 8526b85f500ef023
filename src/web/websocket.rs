// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! WebSocket upgrade plumbing for the stream endpoint.

use std::future::Future;

use base::err;
use http::{Request, Response};
use hyper::body::Bytes;
use tokio_tungstenite::tungstenite;
use tracing::Instrument;

use super::Body;

pub(super) type WebSocketStream =
    tokio_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

/// Upgrades to WebSocket and runs the supplied stream handler in a separate
/// tokio task.
///
/// The player UI may be served from another origin entirely (it commonly runs
/// off a dev server), so no `Origin` check is made; the API exposes recordings
/// read-only.
pub(super) fn upgrade<H, F>(
    req: Request<::hyper::body::Incoming>,
    handler: H,
) -> Result<Response<Body>, base::Error>
where
    H: FnOnce(WebSocketStream) -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let response =
        tungstenite::handshake::server::create_response_with_body(&req, || {
            Body::new(Bytes::new())
        })
        .map_err(|e| err!(InvalidArgument, msg("bad websocket handshake"), source(e)))?;
    let span = tracing::info_span!("websocket");
    tokio::spawn(
        async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(u) => u,
                Err(err) => {
                    tracing::error!(%err, "upgrade failed");
                    return;
                }
            };
            let upgraded = hyper_util::rt::TokioIo::new(upgraded);
            let ws = WebSocketStream::from_raw_socket(
                upgraded,
                tungstenite::protocol::Role::Server,
                None,
            )
            .await;
            handler(ws).await;
        }
        .instrument(span),
    );
    Ok(response)
}
