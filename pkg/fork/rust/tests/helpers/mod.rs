// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use dd_fork::{BackgroundProcess, Environment, ProcessConfig, Stream};
use std::net::TcpListener;
use std::time::{Duration, Instant};

pub const SNAPSHOT_WAIT: Duration = Duration::from_millis(500);

/// Port that nothing listens on right now.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind ephemeral port");
    listener.local_addr().unwrap().port()
}

/// Config for the fixture binary with the inherited environment plus `vars`.
pub fn fixture(vars: &[(&str, &str)]) -> ProcessConfig {
    let env = vars
        .iter()
        .fold(Environment::inherited(), |env, (k, v)| env.with(*k, *v));
    ProcessConfig::new(env!("CARGO_BIN_EXE_fork-fixture")).with_env(env)
}

/// Wait until `needle` shows up in the captured `which` stream.
pub async fn wait_for_output(
    proc: &BackgroundProcess,
    which: Stream,
    needle: &str,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let out = proc.snapshot(which, SNAPSHOT_WAIT).await.unwrap_or_default();
        if String::from_utf8_lossy(&out).contains(needle) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Dump both captured streams to the test output.
pub async fn log_output(proc: &BackgroundProcess) {
    eprintln!(
        "stderr:\n{}",
        String::from_utf8_lossy(&proc.stderr(SNAPSHOT_WAIT).await)
    );
    eprintln!(
        "stdout:\n{}",
        String::from_utf8_lossy(&proc.stdout(SNAPSHOT_WAIT).await)
    );
}
