// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::process::TerminationResult;
use nix::sys::signal::Signal;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to launch {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process already started")]
    AlreadyStarted,

    #[error("process not started")]
    NotStarted,

    #[error(
        "{network} {address} not ready after {}ms{}",
        elapsed.as_millis(),
        last_error.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
    )]
    ReadinessTimeout {
        network: String,
        address: String,
        elapsed: Duration,
        #[source]
        last_error: Option<std::io::Error>,
    },

    #[error("process exited before becoming ready ({result})")]
    ProcessExited { result: TerminationResult },

    #[error("failed to send {signal}: {source}")]
    Signal {
        signal: Signal,
        #[source]
        source: nix::Error,
    },

    #[error("process still running {}s after forceful signal", elapsed.as_secs())]
    StopTimeout { elapsed: Duration },

    #[error("unsupported network: {0}")]
    InvalidNetwork(String),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("timed out waiting for the output buffer")]
    SnapshotTimeout,

    #[error("exit monitor stopped unexpectedly")]
    MonitorLost,
}

impl Error {
    /// True for failures caused by calling an operation in the wrong lifecycle state.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Error::AlreadyStarted | Error::NotStarted)
    }
}
