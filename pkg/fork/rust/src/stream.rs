// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::errors::{Error, Result};
use log::{debug, warn};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, timeout};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Which child output stream to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    dropped: u64,
}

/// Append-only capture of one child output stream.
///
/// The pump appends and readers take copies; neither waits on the other
/// beyond the mutex. With a limit set, the oldest bytes are discarded so the
/// pump never stalls on a full buffer.
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    data: Arc<Mutex<Captured>>,
    limit: Option<usize>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl StreamBuffer {
    pub fn new(limit: Option<usize>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            data: Arc::new(Mutex::new(Captured::default())),
            limit,
            closed_tx: Arc::new(closed_tx),
        }
    }

    pub async fn append(&self, chunk: &[u8]) {
        let mut captured = self.data.lock().await;
        captured.bytes.extend_from_slice(chunk);
        if let Some(limit) = self.limit
            && captured.bytes.len() > limit
        {
            let excess = captured.bytes.len() - limit;
            captured.bytes.drain(..excess);
            captured.dropped += excess as u64;
        }
    }

    /// Copy of everything captured so far. `wait` bounds only the lock acquisition.
    pub async fn snapshot(&self, wait: Duration) -> Result<Vec<u8>> {
        let captured = timeout(wait, self.data.lock())
            .await
            .map_err(|_| Error::SnapshotTimeout)?;
        Ok(captured.bytes.clone())
    }

    /// Number of bytes discarded because of the capture limit.
    pub async fn dropped(&self) -> u64 {
        self.data.lock().await.dropped
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Wait until the pump has seen EOF. Returns false on timeout.
    pub async fn wait_closed(&self, wait: Duration) -> bool {
        let mut rx = self.closed_tx.subscribe();
        matches!(timeout(wait, rx.wait_for(|closed| *closed)).await, Ok(Ok(_)))
    }

    fn mark_closed(&self) {
        self.closed_tx.send_replace(true);
    }
}

/// Copy `reader` into `sink` until EOF. A read error ends the pump like EOF
/// does; the sink is marked closed either way.
pub async fn pump<R>(mut reader: R, sink: StreamBuffer, name: String)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                sink.append(buf.get(..n).unwrap_or_default()).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("[{name}] output pump stopped: {e}");
                break;
            }
        }
    }
    debug!("[{name}] output pump reached EOF after {total} byte(s)");
    sink.mark_closed();
}
