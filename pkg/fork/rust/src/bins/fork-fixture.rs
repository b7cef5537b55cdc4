// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Small well-behaved server driven by `FIXTURE_*` environment variables,
//! supervised by the integration tests.

use anyhow::{Context, Result, bail};
use log::{info, warn};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::sleep;

#[derive(Debug, Default)]
struct Settings {
    listen: Option<String>,
    listen_delay: Duration,
    ignore_sigint: bool,
    exit_after: Option<Duration>,
    exit_code: i32,
}

impl Settings {
    fn from_env() -> Result<Self> {
        let mut settings = Settings {
            listen: std::env::var("FIXTURE_LISTEN").ok().filter(|s| !s.is_empty()),
            ..Settings::default()
        };
        if let Some(ms) = millis("FIXTURE_LISTEN_DELAY_MS")? {
            settings.listen_delay = ms;
        }
        settings.exit_after = millis("FIXTURE_EXIT_AFTER_MS")?;
        settings.ignore_sigint = match std::env::var("FIXTURE_ON_SIGINT").as_deref() {
            Err(_) | Ok("exit") => false,
            Ok("ignore") => true,
            Ok(other) => bail!("FIXTURE_ON_SIGINT must be 'exit' or 'ignore', got {other:?}"),
        };
        if let Ok(code) = std::env::var("FIXTURE_EXIT_CODE") {
            settings.exit_code = code
                .parse()
                .with_context(|| format!("parsing FIXTURE_EXIT_CODE={code}"))?;
        }
        Ok(settings)
    }
}

fn millis(var: &str) -> Result<Option<Duration>> {
    match std::env::var(var) {
        Ok(v) => {
            let ms: u64 = v.parse().with_context(|| format!("parsing {var}={v}"))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}

async fn serve(address: String, delay: Duration) {
    sleep(delay).await;
    let listener = match TcpListener::bind(&address).await {
        Ok(l) => l,
        Err(e) => {
            warn!("failed to listen on {address}: {e}");
            return;
        }
    };
    info!("listening on {address}");
    loop {
        match listener.accept().await {
            Ok((_conn, peer)) => info!("accepted connection from {peer}"),
            Err(e) => warn!("accept failed: {e}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;
    let settings = Settings::from_env()?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    println!("ready");
    eprintln!("fork-fixture started (pid={})", std::process::id());

    if let Some(address) = settings.listen.clone() {
        tokio::spawn(serve(address, settings.listen_delay));
    }

    let exit_after = async {
        match settings.exit_after {
            Some(after) => sleep(after).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(exit_after);

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                return Ok(());
            }
            _ = sigint.recv() => {
                if settings.ignore_sigint {
                    info!("received SIGINT, ignoring");
                    continue;
                }
                info!("received SIGINT");
                return Ok(());
            }
            () = &mut exit_after => {
                info!("exiting with code {}", settings.exit_code);
                std::process::exit(settings.exit_code);
            }
        }
    }
}
