// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::path::PathBuf;
use std::sync::Arc;

use base::{err, Error, ErrorKind, ResultExt};
use bpaf::Bpaf;
use storage::cache::CacheDir;
use storage::manager::describe_volume;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod audio;
mod json;
mod web;

/// How many successive ports to try when the requested one is taken.
const PORT_SEARCH_RANGE: u16 = 100;

/// tpsdvr: serves TPS-format DVR recordings to a browser.
#[derive(Bpaf, Debug)]
#[bpaf(options, version)]
struct Args {
    /// TCP port to listen on; incremented when already in use.
    #[bpaf(long, argument("PORT"), fallback(8000))]
    port: u16,

    /// Initial DVR volume path; may also be set later through the web UI.
    #[bpaf(long, argument("PATH"))]
    path: Option<PathBuf>,

    /// Verbose logging.
    #[bpaf(long)]
    debug: bool,

    /// Don't open the browser automatically.
    #[bpaf(long("no-browser"))]
    no_browser: bool,
}

fn main() {
    let args = args().run();
    base::tracing_setup::install(if args.debug {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    });

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(%e, "unable to build tokio runtime");
            std::process::exit(1);
        }
    };
    let result = rt.block_on(async_run(args));

    // In the graceful path everything interesting has already stopped; don't
    // wait out in-flight streaming tasks.
    rt.shutdown_background();

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
    }
}

/// Binds the first free port in `[port, port + PORT_SEARCH_RANGE]`.
fn bind_listener(port: u16) -> Result<(tokio::net::TcpListener, u16), Error> {
    for p in port..=port.saturating_add(PORT_SEARCH_RANGE) {
        let Ok(l) = std::net::TcpListener::bind(("0.0.0.0", p)) else {
            continue;
        };
        l.set_nonblocking(true).err_kind(ErrorKind::Unavailable)?;
        let l = tokio::net::TcpListener::from_std(l).err_kind(ErrorKind::Unavailable)?;
        if p != port {
            info!(requested = port, bound = p, "requested port was busy");
        }
        return Ok((l, p));
    }
    Err(err!(
        Unavailable,
        msg("no free port in [{port}, {}]", port.saturating_add(PORT_SEARCH_RANGE))
    ))
}

fn open_browser(url: &str) {
    let result = match std::env::consts::OS {
        "macos" => std::process::Command::new("open").arg(url).spawn(),
        "windows" => std::process::Command::new("rundll32")
            .args(["url.dll,FileProtocolHandler", url])
            .spawn(),
        _ => std::process::Command::new("xdg-open").arg(url).spawn(),
    };
    if let Err(e) = result {
        warn!(%e, url, "unable to open browser; visit manually");
    }
}

async fn async_run(args: Args) -> Result<i32, Error> {
    let workdir = std::env::current_dir().err_kind(ErrorKind::FailedPrecondition)?;
    let cache_dir = CacheDir::open(&workdir)?;
    info!(cache_dir = %cache_dir.path().display(), "index caches");

    let service = Arc::new(web::Service::new(cache_dir));
    if let Some(path) = &args.path {
        match service.load_volume(path.clone()).await {
            Ok(mgr) => info!("loaded {}", describe_volume(&mgr)),
            Err(e) => warn!(err = %e.chain(), "unable to load initial volume; set one via the UI"),
        }
    }

    let (listener, port) = bind_listener(args.port)?;
    let url = format!("http://localhost:{port}");
    info!(version = env!("CARGO_PKG_VERSION"), %url, "tpsdvr ready");

    if !args.no_browser {
        let url = url.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            open_browser(&url);
        });
    }

    let shutdown = CancellationToken::new();
    let mut int = signal(SignalKind::interrupt()).err_kind(ErrorKind::Internal)?;
    let mut term = signal(SignalKind::terminate()).err_kind(ErrorKind::Internal)?;

    tokio::pin! {
        let serve = web::serve(service, listener, shutdown.clone());
    }

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown.cancel();
        }
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown.cancel();
        }
        r = &mut serve => {
            r?;
            return Ok(0);
        }
    }

    tokio::select! {
        _ = int.recv() => Err(err!(Aborted, msg("immediate shutdown due to second signal (SIGINT)"))),
        _ = term.recv() => Err(err!(Aborted, msg("immediate shutdown due to second signal (SIGTERM)"))),
        r = &mut serve => {
            r?;
            info!("exiting");
            Ok(0)
        }
    }
}
