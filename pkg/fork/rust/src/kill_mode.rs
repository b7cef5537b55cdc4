// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use log::debug;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use std::fmt;

/// Which processes a stop signal is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(try_from = "String")]
pub enum KillMode {
    /// The child runs in its own process group and the whole group is signalled.
    /// Shell wrappers and whatever they launched go down together.
    #[default]
    ProcessGroup,

    /// Only the main pid is signalled. Its children may outlive it.
    Process,
}

impl KillMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "process-group" | "processgroup" | "group" => Some(Self::ProcessGroup),
            "process" | "main" => Some(Self::Process),
            _ => None,
        }
    }

    pub fn uses_process_group(self) -> bool {
        self == Self::ProcessGroup
    }

    /// Deliver `sig` to `pid` (or to the group it leads).
    pub(crate) fn send(self, pid: Pid, sig: Signal) -> nix::Result<()> {
        debug!("sending {sig} to pid={pid} (mode={self})");
        match self {
            Self::ProcessGroup => signal::killpg(pid, sig),
            Self::Process => signal::kill(pid, sig),
        }
    }
}

impl fmt::Display for KillMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ProcessGroup => "process-group",
            Self::Process => "process",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for KillMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| {
            format!("invalid kill mode: '{s}'. Valid options: process-group, process")
        })
    }
}

impl TryFrom<String> for KillMode {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        assert_eq!(KillMode::default(), KillMode::ProcessGroup);
        assert!(KillMode::default().uses_process_group());
    }

    #[test]
    fn test_parse() {
        assert_eq!(KillMode::parse("process-group"), Some(KillMode::ProcessGroup));
        assert_eq!(KillMode::parse("ProcessGroup"), Some(KillMode::ProcessGroup));
        assert_eq!(KillMode::parse("group"), Some(KillMode::ProcessGroup));
        assert_eq!(KillMode::parse("process"), Some(KillMode::Process));
        assert_eq!(KillMode::parse("main"), Some(KillMode::Process));
        assert_eq!(KillMode::parse("control-group"), None);
    }

    #[test]
    fn test_display_round_trips() {
        for mode in [KillMode::ProcessGroup, KillMode::Process] {
            assert_eq!(mode.to_string().parse::<KillMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_from_str_error_lists_options() {
        let err = "mixed".parse::<KillMode>().unwrap_err();
        assert!(err.contains("process-group"), "{err}");
    }

    #[test]
    fn test_deserialize() {
        let mode: KillMode = serde_yaml::from_str("process").unwrap();
        assert_eq!(mode, KillMode::Process);
        assert!(serde_yaml::from_str::<KillMode>("cgroup").is_err());
    }
}
