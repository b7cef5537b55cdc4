// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::ProcessConfig;
use crate::env::Environment;
use crate::errors::{Error, Result};
use crate::port::PortWaiter;
use crate::state::ProcessState;
use crate::stream::{Stream, StreamBuffer, pump};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tokio::process::Command;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, timeout};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Final observable state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationResult {
    /// Exit code, or `128 + signal` when the process was killed by a signal.
    pub exit_code: i32,
    /// Terminating signal number, if any.
    pub signal: Option<i32>,
    /// The process had exited on its own before stop was called.
    pub already_finished: bool,
}

impl TerminationResult {
    fn from_status(status: ExitStatus) -> Self {
        let (exit_code, signal) = match (status.code(), status.signal()) {
            (Some(code), _) => (code, None),
            (None, Some(sig)) => (128 + sig, Some(sig)),
            (None, None) => (-1, None),
        };
        Self {
            exit_code,
            signal,
            already_finished: false,
        }
    }

    pub fn signaled(&self) -> bool {
        self.signal.is_some()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.signaled()
    }
}

impl fmt::Display for TerminationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal {
            Some(sig) => match Signal::try_from(sig) {
                Ok(sig) => write!(f, "killed by {sig}")?,
                Err(_) => write!(f, "killed by signal {sig}")?,
            },
            None => write!(f, "exit code {}", self.exit_code)?,
        }
        if self.already_finished {
            write!(f, ", already finished")?;
        }
        Ok(())
    }
}

type ExitWatch = watch::Receiver<Option<TerminationResult>>;

/// The one OS process owned by a started controller.
struct ProcessHandle {
    pid: Pid,
    started_at: SystemTime,
    exit_rx: ExitWatch,
    watcher: JoinHandle<()>,
}

struct Inner {
    state: ProcessState,
    handle: Option<ProcessHandle>,
}

/// Supervises one external executable: launch, readiness wait, output
/// capture and polite-then-forceful shutdown.
///
/// All methods take `&self`, so a controller can be shared (for instance in
/// an `Arc`) between the code driving the process and the code stopping it.
/// `start` must be called from within a tokio runtime.
pub struct BackgroundProcess {
    name: String,
    config: ProcessConfig,
    env: Environment,
    inner: Mutex<Inner>,
    stop_outcome: AsyncMutex<Option<TerminationResult>>,
    stdout: StreamBuffer,
    stderr: StreamBuffer,
}

impl BackgroundProcess {
    /// The environment is fixed here: `config.env` if set, otherwise a copy
    /// of the current environment taken now.
    pub fn new(config: ProcessConfig) -> Self {
        let name = Path::new(&config.command)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(&config.command)
            .to_string();
        let env = config.env.clone().unwrap_or_else(Environment::inherited);
        Self {
            name,
            env,
            inner: Mutex::new(Inner {
                state: ProcessState::Unstarted,
                handle: None,
            }),
            stop_outcome: AsyncMutex::new(None),
            stdout: StreamBuffer::new(config.capture_limit),
            stderr: StreamBuffer::new(config.capture_limit),
            config,
        }
    }

    pub fn command(path: impl Into<String>) -> Self {
        Self::new(ProcessConfig::new(path))
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn state(&self) -> ProcessState {
        let inner = self.lock_inner();
        match inner.handle {
            Some(ref handle) if handle.exit_rx.borrow().is_some() => ProcessState::Exited,
            _ => inner.state,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_inner()
            .handle
            .as_ref()
            .and_then(|h| u32::try_from(h.pid.as_raw()).ok())
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.lock_inner().handle.as_ref().map(|h| h.started_at)
    }

    /// Exit status if the process has been reaped, without waiting.
    pub fn exit_status(&self) -> Option<TerminationResult> {
        self.lock_inner()
            .handle
            .as_ref()
            .and_then(|h| *h.exit_rx.borrow())
    }

    /// Spawn the process with stdout/stderr piped into the capture buffers.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.state != ProcessState::Unstarted {
            return Err(Error::AlreadyStarted);
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .env_clear()
            .envs(self.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        if self.config.kill_mode.uses_process_group() {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| Error::Launch {
            command: self.config.command.clone(),
            source,
        })?;

        let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
            return Err(Error::Launch {
                command: self.config.command.clone(),
                source: std::io::Error::other("spawned process has no pid"),
            });
        };
        let pid = Pid::from_raw(pid);

        if let Some(out) = child.stdout.take() {
            tokio::spawn(pump(out, self.stdout.clone(), format!("{}:stdout", self.name)));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(pump(err, self.stderr.clone(), format!("{}:stderr", self.name)));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let name = self.name.clone();
        let watcher = tokio::spawn(async move {
            let result = match child.wait().await {
                Ok(status) => {
                    info!("[{name}] exited with {status}");
                    TerminationResult::from_status(status)
                }
                Err(e) => {
                    warn!("[{name}] failed to wait on pid={pid}: {e}");
                    TerminationResult {
                        exit_code: -1,
                        signal: None,
                        already_finished: false,
                    }
                }
            };
            exit_tx.send_replace(Some(result));
        });

        info!("[{}] spawned (pid={pid}, cmd={self})", self.name);
        inner.handle = Some(ProcessHandle {
            pid,
            started_at: SystemTime::now(),
            exit_rx,
            watcher,
        });
        Self::transition(&self.name, &mut inner, ProcessState::Running);
        Ok(())
    }

    /// Wait until `address` accepts connections over `network`, for at most `wait`.
    ///
    /// Fails early with [`Error::ProcessExited`] if the process dies first.
    /// Timing out leaves the process running.
    pub async fn wait_ready(&self, network: &str, address: &str, wait: Duration) -> Result<()> {
        let mut exit_rx = self.exit_watch()?;
        if let Some(result) = *exit_rx.borrow() {
            return Err(Error::ProcessExited { result });
        }

        let waiter = PortWaiter::new(self.config.poll_interval());
        tokio::select! {
            ready = waiter.wait(network, address, wait) => {
                ready?;
                info!("[{}] ready on {network} {address}", self.name);
                let mut inner = self.lock_inner();
                if inner.state == ProcessState::Running {
                    Self::transition(&self.name, &mut inner, ProcessState::ReadyConfirmed);
                }
                Ok(())
            }
            exited = exit_rx.wait_for(Option::is_some) => {
                let result = exited.ok().and_then(|r| *r).ok_or(Error::MonitorLost)?;
                warn!("[{}] exited before becoming ready ({result})", self.name);
                Err(Error::ProcessExited { result })
            }
        }
    }

    /// Send `primary`, give the process `stop_timeout` to exit, then send
    /// `force` and wait up to `kill_timeout` for the reap.
    ///
    /// A process that already exited is not an error: its recorded status is
    /// returned with `already_finished` set. Later and concurrent calls get
    /// the same result without sending any signal.
    pub async fn stop(&self, primary: Signal, force: Signal) -> Result<TerminationResult> {
        let mut outcome = self.stop_outcome.lock().await;
        if let Some(result) = *outcome {
            return Ok(result);
        }

        let (pid, mut exit_rx) = {
            let mut inner = self.lock_inner();
            let (pid, exit_rx) = match inner.handle {
                Some(ref handle) => (handle.pid, handle.exit_rx.clone()),
                None => return Err(Error::NotStarted),
            };
            if inner.state.can_transition_to(ProcessState::Stopping) {
                Self::transition(&self.name, &mut inner, ProcessState::Stopping);
            }
            (pid, exit_rx)
        };

        let recorded = *exit_rx.borrow();
        let result = match recorded {
            Some(result) => {
                debug!("[{}] already exited before stop ({result})", self.name);
                TerminationResult {
                    already_finished: true,
                    ..result
                }
            }
            None => self.terminate(pid, &mut exit_rx, primary, force).await?,
        };

        self.drain_output().await;
        {
            let mut inner = self.lock_inner();
            if inner.state != ProcessState::Exited {
                Self::transition(&self.name, &mut inner, ProcessState::Exited);
            }
        }
        *outcome = Some(result);
        Ok(result)
    }

    /// Bytes captured so far on `which`. `wait` bounds lock contention only.
    pub async fn snapshot(&self, which: Stream, wait: Duration) -> Result<Vec<u8>> {
        if !self.lock_inner().state.is_started() {
            return Err(Error::NotStarted);
        }
        self.buffer(which).snapshot(wait).await
    }

    /// Best-effort stdout snapshot; empty when nothing is available.
    pub async fn stdout(&self, wait: Duration) -> Vec<u8> {
        self.snapshot(Stream::Stdout, wait)
            .await
            .unwrap_or_default()
    }

    /// Best-effort stderr snapshot; empty when nothing is available.
    pub async fn stderr(&self, wait: Duration) -> Vec<u8> {
        self.snapshot(Stream::Stderr, wait)
            .await
            .unwrap_or_default()
    }

    async fn terminate(
        &self,
        pid: Pid,
        exit_rx: &mut ExitWatch,
        primary: Signal,
        force: Signal,
    ) -> Result<TerminationResult> {
        let stop_timeout = self.config.stop_timeout();
        let kill_timeout = self.config.kill_timeout();

        info!("[{}] sending {primary} (pid={pid})", self.name);
        if !self.deliver(pid, primary, exit_rx)? {
            let result = wait_reaped(exit_rx, kill_timeout).await?;
            return Ok(TerminationResult {
                already_finished: true,
                ..result
            });
        }
        if let Some(result) = wait_for_exit(exit_rx, stop_timeout).await? {
            return Ok(result);
        }

        warn!(
            "[{}] stop timeout ({}ms) reached, sending {force}",
            self.name,
            stop_timeout.as_millis()
        );
        if !self.deliver(pid, force, exit_rx)? {
            return wait_reaped(exit_rx, kill_timeout).await;
        }
        let started = Instant::now();
        match wait_for_exit(exit_rx, kill_timeout).await? {
            Some(result) => Ok(result),
            None => {
                warn!("[{}] still running after {force}, giving up", self.name);
                Err(Error::StopTimeout {
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// Returns false when the target no longer exists.
    ///
    /// Once the watcher has reaped the child its pid may be reused, so a
    /// recorded exit is checked right before the syscall and nothing is sent.
    /// What remains is the window between that check and the kill itself.
    fn deliver(&self, pid: Pid, signal: Signal, exit_rx: &ExitWatch) -> Result<bool> {
        if exit_rx.borrow().is_some() {
            debug!("[{}] pid={pid} already reaped, not sending {signal}", self.name);
            return Ok(false);
        }
        match self.config.kill_mode.send(pid, signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => {
                debug!("[{}] pid={pid} gone before {signal}", self.name);
                Ok(false)
            }
            Err(source) => {
                warn!("[{}] failed to send {signal}: {source}", self.name);
                Err(Error::Signal { signal, source })
            }
        }
    }

    /// Give the pumps a bounded chance to reach EOF so snapshots taken after
    /// stop hold the complete output.
    async fn drain_output(&self) {
        let drain = self.config.drain_timeout();
        let (out, err) = tokio::join!(
            self.stdout.wait_closed(drain),
            self.stderr.wait_closed(drain)
        );
        if !(out && err) {
            debug!(
                "[{}] output still open {}ms after exit (held by a descendant?)",
                self.name,
                drain.as_millis()
            );
        }
    }

    fn buffer(&self, which: Stream) -> &StreamBuffer {
        match which {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }

    fn exit_watch(&self) -> Result<ExitWatch> {
        self.lock_inner()
            .handle
            .as_ref()
            .map(|h| h.exit_rx.clone())
            .ok_or(Error::NotStarted)
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(name: &str, inner: &mut Inner, next: ProcessState) {
        if !inner.state.can_transition_to(next) {
            warn!("[{name}] unexpected transition {} -> {next}", inner.state);
        }
        debug!("[{name}] {} -> {next}", inner.state);
        inner.state = next;
    }
}

async fn wait_for_exit(exit_rx: &mut ExitWatch, wait: Duration) -> Result<Option<TerminationResult>> {
    match timeout(wait, exit_rx.wait_for(Option::is_some)).await {
        Ok(Ok(result)) => Ok(*result),
        Ok(Err(_)) => Err(Error::MonitorLost),
        Err(_) => Ok(None),
    }
}

/// The child is gone or going; its exit must be published within `wait`.
async fn wait_reaped(exit_rx: &mut ExitWatch, wait: Duration) -> Result<TerminationResult> {
    wait_for_exit(exit_rx, wait)
        .await?
        .ok_or(Error::StopTimeout { elapsed: wait })
}

impl fmt::Display for BackgroundProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.config.command)?;
        for arg in &self.config.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BackgroundProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundProcess")
            .field("command", &self.config.command)
            .field("args", &self.config.args)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = inner.handle.take() {
            if handle.exit_rx.borrow().is_none() {
                warn!(
                    "[{}] dropped while running, killing (pid={})",
                    self.name, handle.pid
                );
                let _ = self.config.kill_mode.send(handle.pid, Signal::SIGKILL);
            }
            handle.watcher.abort();
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::cast_possible_wrap
)]
mod tests {
    use super::*;
    use crate::kill_mode::KillMode;
    use nix::sys::signal;
    use nix::unistd::Uid;
    use tokio::net::TcpListener;

    const SNAPSHOT_WAIT: Duration = Duration::from_millis(500);

    fn sh(script: &str) -> ProcessConfig {
        ProcessConfig::new("/bin/sh").with_args(["-c", script])
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn wait_for_output(proc: &BackgroundProcess, which: Stream, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let out = proc.snapshot(which, SNAPSHOT_WAIT).await.unwrap();
            if String::from_utf8_lossy(&out).contains(needle) {
                return;
            }
            assert!(Instant::now() < deadline, "{needle:?} never showed up on {which}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn pid_is_alive(pid: u32) -> bool {
        let pid = pid as i32;
        if signal::kill(Pid::from_raw(pid), None).is_err() {
            return false;
        }
        // An unreaped zombie still answers kill(0).
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => !cfg!(target_os = "linux"),
        }
    }

    async fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !pid_is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_until_exited(proc: &BackgroundProcess) -> TerminationResult {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(result) = proc.exit_status() {
                return result;
            }
            assert!(Instant::now() < deadline, "process never exited");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_start_then_stop_uses_primary_signal() {
        let proc = BackgroundProcess::new(ProcessConfig::new("/bin/sleep").with_arg("60"));
        assert_eq!(proc.state(), ProcessState::Unstarted);

        proc.start().unwrap();
        assert_eq!(proc.state(), ProcessState::Running);
        assert!(proc.pid().is_some());
        assert!(proc.started_at().is_some());

        let result = proc.stop(Signal::SIGTERM, Signal::SIGKILL).await.unwrap();
        assert_eq!(result.signal, Some(Signal::SIGTERM as i32));
        assert_eq!(result.exit_code, 128 + Signal::SIGTERM as i32);
        assert!(!result.already_finished);
        assert!(!result.success());
        assert_eq!(proc.state(), ProcessState::Exited);
    }

    #[tokio::test]
    async fn test_start_twice_fails_without_second_spawn() {
        let proc = BackgroundProcess::new(ProcessConfig::new("/bin/sleep").with_arg("60"));
        proc.start().unwrap();
        let pid = proc.pid();

        let err = proc.start().unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));
        assert!(err.is_misuse());
        assert_eq!(proc.pid(), pid);

        proc.stop(Signal::SIGKILL, Signal::SIGKILL).await.unwrap();
        assert!(matches!(proc.start(), Err(Error::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_operations_before_start() {
        let proc = BackgroundProcess::command("/bin/true");
        assert!(matches!(
            proc.stop(Signal::SIGTERM, Signal::SIGKILL).await,
            Err(Error::NotStarted)
        ));
        assert!(matches!(
            proc.wait_ready("tcp", "8080", Duration::from_millis(10)).await,
            Err(Error::NotStarted)
        ));
        assert!(matches!(
            proc.snapshot(Stream::Stdout, SNAPSHOT_WAIT).await,
            Err(Error::NotStarted)
        ));
        assert!(proc.stdout(SNAPSHOT_WAIT).await.is_empty());
        assert!(proc.stderr(SNAPSHOT_WAIT).await.is_empty());
        assert!(proc.pid().is_none());
        assert!(proc.exit_status().is_none());
    }

    #[tokio::test]
    async fn test_launch_nonexistent_binary() {
        let proc = BackgroundProcess::command("/nonexistent/binary");
        match proc.start() {
            Err(Error::Launch { command, source }) => {
                assert_eq!(command, "/nonexistent/binary");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected launch error, got {other:?}"),
        }
        assert_eq!(proc.state(), ProcessState::Unstarted);
        assert!(proc.pid().is_none());
    }

    #[tokio::test]
    async fn test_launch_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.sh");
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();

        let proc = BackgroundProcess::command(path.to_str().unwrap());
        let err = proc.start().unwrap_err();
        assert!(matches!(err, Error::Launch { .. }), "{err}");
        assert!(!err.is_misuse());
    }

    #[tokio::test]
    async fn test_output_empty_before_anything_is_written() {
        let proc = BackgroundProcess::new(sh("sleep 60"));
        proc.start().unwrap();
        assert!(proc.stdout(SNAPSHOT_WAIT).await.is_empty());
        assert!(proc.snapshot(Stream::Stderr, SNAPSHOT_WAIT).await.unwrap().is_empty());
        proc.stop(Signal::SIGKILL, Signal::SIGKILL).await.unwrap();
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let proc = BackgroundProcess::new(sh("echo out; echo err >&2; echo more"));
        proc.start().unwrap();
        wait_until_exited(&proc).await;

        let result = proc.stop(Signal::SIGTERM, Signal::SIGKILL).await.unwrap();
        assert!(result.success());
        assert_eq!(proc.stdout(SNAPSHOT_WAIT).await, b"out\nmore\n");
        assert_eq!(proc.stderr(SNAPSHOT_WAIT).await, b"err\n");
        // Reading does not consume.
        assert_eq!(proc.stdout(SNAPSHOT_WAIT).await, b"out\nmore\n");
    }

    #[tokio::test]
    async fn test_env_replaces_inherited_environment() {
        let env = Environment::parse(["FOO=bar", "FOO=baz"]).unwrap();
        let proc = BackgroundProcess::new(sh("echo \"$FOO:${HOME:-unset}\"").with_env(env));
        proc.start().unwrap();
        assert!(wait_until_exited(&proc).await.success());
        proc.stop(Signal::SIGTERM, Signal::SIGKILL).await.unwrap();
        assert_eq!(proc.stdout(SNAPSHOT_WAIT).await, b"baz:unset\n");
    }

    #[tokio::test]
    async fn test_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let proc = BackgroundProcess::new(sh("pwd -P").with_working_dir(canonical.to_str().unwrap()));
        proc.start().unwrap();
        assert!(wait_until_exited(&proc).await.success());
        proc.stop(Signal::SIGTERM, Signal::SIGKILL).await.unwrap();
        let out = String::from_utf8(proc.stdout(SNAPSHOT_WAIT).await).unwrap();
        assert_eq!(out.trim(), canonical.to_str().unwrap());
    }

    #[tokio::test]
    async fn test_graceful_exit_on_primary_signal() {
        let proc = BackgroundProcess::new(sh(
            "trap 'echo bye; exit 0' TERM; echo armed; while :; do sleep 0.1; done",
        ));
        proc.start().unwrap();
        wait_for_output(&proc, Stream::Stdout, "armed").await;

        let result = proc.stop(Signal::SIGTERM, Signal::SIGKILL).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(!result.signaled());
        assert!(String::from_utf8_lossy(&proc.stdout(SNAPSHOT_WAIT).await).contains("bye"));
    }

    #[tokio::test]
    async fn test_escalates_to_force_signal() {
        let cfg = sh("trap '' INT TERM; echo armed; sleep 60")
            .with_stop_timeout(Duration::from_millis(300));
        let proc = BackgroundProcess::new(cfg);
        proc.start().unwrap();
        wait_for_output(&proc, Stream::Stdout, "armed").await;

        let started = Instant::now();
        let result = proc.stop(Signal::SIGINT, Signal::SIGKILL).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(result.signal, Some(Signal::SIGKILL as i32));
        assert_eq!(result.exit_code, 137);
    }

    #[tokio::test]
    async fn test_stop_twice_returns_same_result() {
        let proc = BackgroundProcess::new(ProcessConfig::new("/bin/sleep").with_arg("60"));
        proc.start().unwrap();

        let first = proc.stop(Signal::SIGTERM, Signal::SIGKILL).await.unwrap();
        let second = proc.stop(Signal::SIGINT, Signal::SIGKILL).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_concurrent_stops_share_one_outcome() {
        let cfg = sh("trap '' TERM; echo armed; sleep 60")
            .with_stop_timeout(Duration::from_millis(200));
        let proc = BackgroundProcess::new(cfg);
        proc.start().unwrap();
        wait_for_output(&proc, Stream::Stdout, "armed").await;

        let (a, b) = tokio::join!(
            proc.stop(Signal::SIGTERM, Signal::SIGKILL),
            proc.stop(Signal::SIGTERM, Signal::SIGKILL)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a, b);
        assert_eq!(a.signal, Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_stop_after_natural_exit_is_not_an_error() {
        let proc = BackgroundProcess::new(sh("exit 3"));
        proc.start().unwrap();
        wait_until_exited(&proc).await;
        assert_eq!(proc.state(), ProcessState::Exited);

        let result = proc.stop(Signal::SIGINT, Signal::SIGKILL).await.unwrap();
        assert!(result.already_finished);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.to_string(), "exit code 3, already finished");
    }

    #[tokio::test]
    async fn test_wait_ready_reports_early_exit() {
        let port = closed_port().await;
        let proc = BackgroundProcess::new(sh("sleep 0.1; exit 4"));
        proc.start().unwrap();

        let started = Instant::now();
        let err = proc
            .wait_ready("tcp", &format!("127.0.0.1:{port}"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            Error::ProcessExited { result } => assert_eq!(result.exit_code, 4),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_wait_ready_timeout_leaves_process_running() {
        let port = closed_port().await;
        let proc = BackgroundProcess::new(ProcessConfig::new("/bin/sleep").with_arg("60"));
        proc.start().unwrap();

        let err = proc
            .wait_ready("tcp", &port.to_string(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadinessTimeout { .. }), "{err}");
        assert_eq!(proc.state(), ProcessState::Running);
        assert!(proc.exit_status().is_none());

        let result = proc.stop(Signal::SIGTERM, Signal::SIGKILL).await.unwrap();
        assert!(!result.already_finished);
    }

    #[tokio::test]
    async fn test_wait_ready_marks_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proc = BackgroundProcess::new(ProcessConfig::new("/bin/sleep").with_arg("60"));
        proc.start().unwrap();

        proc.wait_ready("tcp", &addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(proc.state(), ProcessState::ReadyConfirmed);
        proc.stop(Signal::SIGTERM, Signal::SIGKILL).await.unwrap();
    }

    #[tokio::test]
    async fn test_process_kill_mode() {
        let cfg = ProcessConfig::new("/bin/sleep")
            .with_arg("60")
            .with_kill_mode(KillMode::Process);
        let proc = BackgroundProcess::new(cfg);
        proc.start().unwrap();
        let result = proc.stop(Signal::SIGINT, Signal::SIGKILL).await.unwrap();
        assert_eq!(result.signal, Some(Signal::SIGINT as i32));
    }

    #[tokio::test]
    async fn test_capture_limit_applies_to_controller() {
        let proc = BackgroundProcess::new(sh("printf 0123456789").with_capture_limit(4));
        proc.start().unwrap();
        assert!(wait_until_exited(&proc).await.success());
        let result = proc.stop(Signal::SIGTERM, Signal::SIGKILL).await.unwrap();
        assert!(result.already_finished);
        assert_eq!(proc.stdout(SNAPSHOT_WAIT).await, b"6789");
    }

    #[tokio::test]
    async fn test_drop_kills_running_process() {
        let proc = BackgroundProcess::new(ProcessConfig::new("/bin/sleep").with_arg("60"));
        proc.start().unwrap();
        let pid = proc.pid().unwrap();
        assert!(pid_is_alive(pid));

        drop(proc);
        assert!(
            wait_for_pid_gone(pid, Duration::from_secs(5)).await,
            "dropped controller left pid={pid} running"
        );
    }

    /// Start `sh` with one background `sleep` and return the sleep's pid.
    async fn spawn_with_grandchild(mode: KillMode) -> (BackgroundProcess, u32) {
        let cfg = sh("sleep 60 & echo $!; wait")
            .with_kill_mode(mode)
            .with_drain_timeout(Duration::from_millis(100));
        let proc = BackgroundProcess::new(cfg);
        proc.start().unwrap();
        wait_for_output(&proc, Stream::Stdout, "\n").await;
        let out = proc.stdout(SNAPSHOT_WAIT).await;
        let grandchild: u32 = String::from_utf8(out).unwrap().trim().parse().unwrap();
        assert!(pid_is_alive(grandchild));
        (proc, grandchild)
    }

    #[tokio::test]
    async fn test_process_group_mode_stops_grandchildren() {
        let (proc, grandchild) = spawn_with_grandchild(KillMode::ProcessGroup).await;

        let result = proc.stop(Signal::SIGTERM, Signal::SIGKILL).await.unwrap();
        assert_eq!(result.signal, Some(Signal::SIGTERM as i32));
        assert!(
            wait_for_pid_gone(grandchild, Duration::from_secs(5)).await,
            "grandchild pid={grandchild} outlived its process group"
        );
    }

    #[tokio::test]
    async fn test_process_mode_leaves_grandchildren() {
        let (proc, grandchild) = spawn_with_grandchild(KillMode::Process).await;

        let result = proc.stop(Signal::SIGTERM, Signal::SIGKILL).await.unwrap();
        assert_eq!(result.signal, Some(Signal::SIGTERM as i32));
        assert!(pid_is_alive(grandchild), "only the main pid should be signalled");

        signal::kill(Pid::from_raw(grandchild as i32), Signal::SIGKILL).unwrap();
        assert!(wait_for_pid_gone(grandchild, Duration::from_secs(5)).await);
    }

    #[test]
    fn test_deliver_skips_reaped_child() {
        let proc = BackgroundProcess::new(sh("exit 0"));
        let exited = TerminationResult {
            exit_code: 0,
            signal: None,
            already_finished: false,
        };
        let (_tx, rx) = watch::channel(Some(exited));
        // Pid 1 would refuse or take the signal; a reaped child must never reach it.
        let sent = proc.deliver(Pid::from_raw(1), Signal::SIGCONT, &rx).unwrap();
        assert!(!sent);
    }

    #[test]
    fn test_deliver_missing_pid_is_not_an_error() {
        let proc = BackgroundProcess::new(sh("exit 0").with_kill_mode(KillMode::Process));
        let (_tx, rx) = watch::channel(None);
        let sent = proc
            .deliver(Pid::from_raw(i32::MAX), Signal::SIGCONT, &rx)
            .unwrap();
        assert!(!sent);
    }

    #[test]
    fn test_deliver_refused_maps_to_signal_error() {
        if Uid::effective().is_root() {
            return;
        }
        let proc = BackgroundProcess::new(sh("exit 0").with_kill_mode(KillMode::Process));
        let (_tx, rx) = watch::channel(None);
        match proc.deliver(Pid::from_raw(1), Signal::SIGCONT, &rx) {
            Err(Error::Signal { signal, source }) => {
                assert_eq!(signal, Signal::SIGCONT);
                assert_eq!(source, Errno::EPERM);
            }
            // Pid 1 belongs to this user (single-user container); nothing to refuse.
            Ok(true) => {}
            other => panic!("expected a refused signal, got {other:?}"),
        }
    }

    #[test]
    fn test_display() {
        let proc = BackgroundProcess::new(sh("exit 0"));
        assert_eq!(proc.to_string(), "/bin/sh -c exit 0");
        assert!(format!("{proc:?}").contains("Unstarted"));
    }

    #[test]
    fn test_termination_result_display() {
        let killed = TerminationResult {
            exit_code: 137,
            signal: Some(9),
            already_finished: false,
        };
        assert_eq!(killed.to_string(), "killed by SIGKILL");
        assert!(killed.signaled());
    }
}
