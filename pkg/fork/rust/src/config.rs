// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::env::Environment;
use crate::kill_mode::KillMode;
use crate::port::DEFAULT_POLL_INTERVAL;
use crate::process::{DEFAULT_DRAIN_TIMEOUT, DEFAULT_KILL_TIMEOUT, DEFAULT_STOP_TIMEOUT};
use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Launch configuration for one background process.
///
/// Durations are seconds and may be fractional (`poll_interval: 0.05`).
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Replaces the inherited environment when set.
    #[serde(default)]
    pub env: Option<Environment>,
    /// Folded into `env` by [`load_config`].
    pub environment_file: Option<String>,
    pub working_dir: Option<String>,
    /// Grace window between the primary and the forceful stop signal.
    pub stop_timeout: Option<f64>,
    /// How long to wait for the reap after the forceful signal.
    pub kill_timeout: Option<f64>,
    /// How long stop waits for the output pumps to reach EOF after the reap.
    pub drain_timeout: Option<f64>,
    /// Delay between readiness probe attempts.
    pub poll_interval: Option<f64>,
    #[serde(default)]
    pub kill_mode: KillMode,
    /// Per-stream byte cap; the oldest output is dropped past it.
    pub capture_limit: Option<usize>,
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: None,
            environment_file: None,
            working_dir: None,
            stop_timeout: None,
            kill_timeout: None,
            drain_timeout: None,
            poll_interval: None,
            kill_mode: KillMode::default(),
            capture_limit: None,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout.as_secs_f64());
        self
    }

    #[must_use]
    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = Some(timeout.as_secs_f64());
        self
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout.as_secs_f64());
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval.as_secs_f64());
        self
    }

    #[must_use]
    pub fn with_kill_mode(mut self, mode: KillMode) -> Self {
        self.kill_mode = mode;
        self
    }

    #[must_use]
    pub fn with_capture_limit(mut self, bytes: usize) -> Self {
        self.capture_limit = Some(bytes);
        self
    }

    pub fn stop_timeout(&self) -> Duration {
        seconds_or("stop_timeout", self.stop_timeout, DEFAULT_STOP_TIMEOUT)
    }

    pub fn kill_timeout(&self) -> Duration {
        seconds_or("kill_timeout", self.kill_timeout, DEFAULT_KILL_TIMEOUT)
    }

    pub fn drain_timeout(&self) -> Duration {
        seconds_or("drain_timeout", self.drain_timeout, DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn poll_interval(&self) -> Duration {
        seconds_or("poll_interval", self.poll_interval, DEFAULT_POLL_INTERVAL).max(MIN_POLL_INTERVAL)
    }
}

fn seconds_or(field: &str, value: Option<f64>, default: Duration) -> Duration {
    match value {
        None => default,
        Some(secs) => Duration::try_from_secs_f64(secs).unwrap_or_else(|e| {
            warn!("invalid {field} ({secs}): {e}, using {}ms", default.as_millis());
            default
        }),
    }
}

/// Read a YAML process config. An `environment_file` is merged into `env`
/// here (on top of the inherited environment when `env` is absent), so the
/// returned config carries one explicit environment.
pub fn load_config(path: &Path) -> Result<ProcessConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut config: ProcessConfig =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;

    if let Some(file) = config.environment_file.take() {
        let base = config.env.take().unwrap_or_else(Environment::inherited);
        let env = base
            .with_file(&file)
            .with_context(|| format!("loading environment_file for {}", path.display()))?;
        config.env = Some(env);
    }

    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
command: /opt/agent/bin/agent
args:
  - run
  - --port
  - "8080"
env:
  - RESTORE=false
  - STORE_INTERVAL=300
working_dir: /tmp
stop_timeout: 2.5
kill_timeout: 3
drain_timeout: 0.5
poll_interval: 0.25
kill_mode: process
capture_limit: 65536
"#;
        let path = dir.path().join("agent.yaml");
        fs::write(&path, yaml).unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.command, "/opt/agent/bin/agent");
        assert_eq!(cfg.args, vec!["run", "--port", "8080"]);
        let env = cfg.env.as_ref().unwrap();
        assert_eq!(env.get("RESTORE"), Some("false"));
        assert_eq!(env.len(), 2, "explicit env must not be merged with the inherited one");
        assert_eq!(cfg.working_dir.as_deref(), Some("/tmp"));
        assert_eq!(cfg.stop_timeout(), Duration::from_millis(2500));
        assert_eq!(cfg.kill_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.drain_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.kill_mode, KillMode::Process);
        assert_eq!(cfg.capture_limit, Some(65536));
    }

    #[test]
    fn test_parse_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("minimal.yaml");
        fs::write(&path, "command: /usr/bin/true\n").unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.command, "/usr/bin/true");
        assert!(cfg.args.is_empty());
        assert!(cfg.env.is_none());
        assert_eq!(cfg.kill_mode, KillMode::ProcessGroup);
        assert_eq!(cfg.stop_timeout(), DEFAULT_STOP_TIMEOUT);
        assert_eq!(cfg.kill_timeout(), DEFAULT_KILL_TIMEOUT);
        assert_eq!(cfg.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert!(cfg.capture_limit.is_none());
    }

    #[test]
    fn test_environment_file_merged_after_env() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("agent.env");
        fs::write(&env_path, "ADDRESS=localhost:9090\nRESTORE='true'\n").unwrap();

        let path = dir.path().join("agent.yaml");
        fs::write(
            &path,
            format!(
                "command: /bin/true\nenv:\n  - RESTORE=false\nenvironment_file: {}\n",
                env_path.display()
            ),
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        let env = cfg.env.unwrap();
        assert_eq!(env.get("ADDRESS"), Some("localhost:9090"));
        assert_eq!(env.get("RESTORE"), Some("true"));
        assert!(cfg.environment_file.is_none());
    }

    #[test]
    fn test_missing_environment_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.yaml");
        fs::write(
            &path,
            "command: /bin/true\nenvironment_file: /nonexistent/agent.env\n",
        )
        .unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "not: valid: yaml: [").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_missing_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.yaml");
        fs::write(&path, "args: [a]\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_load_config_nonexistent_file() {
        assert!(load_config(Path::new("/nonexistent/agent.yaml")).is_err());
    }

    #[test]
    fn test_invalid_durations_fall_back() {
        let mut cfg = ProcessConfig::new("/bin/true");
        cfg.stop_timeout = Some(-1.0);
        cfg.kill_timeout = Some(f64::NAN);
        cfg.poll_interval = Some(0.0);
        assert_eq!(cfg.stop_timeout(), DEFAULT_STOP_TIMEOUT);
        assert_eq!(cfg.kill_timeout(), DEFAULT_KILL_TIMEOUT);
        assert_eq!(cfg.poll_interval(), MIN_POLL_INTERVAL);
    }

    #[test]
    fn test_builder() {
        let cfg = ProcessConfig::new("/bin/sh")
            .with_arg("-c")
            .with_args(["exit 0"])
            .with_env(Environment::empty().with("A", "1"))
            .with_working_dir("/tmp")
            .with_stop_timeout(Duration::from_millis(250))
            .with_kill_mode(KillMode::Process)
            .with_capture_limit(10);
        assert_eq!(cfg.args, vec!["-c", "exit 0"]);
        assert_eq!(cfg.stop_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.env.unwrap().get("A"), Some("1"));
        assert_eq!(cfg.working_dir.as_deref(), Some("/tmp"));
        assert_eq!(cfg.capture_limit, Some(10));
    }
}
