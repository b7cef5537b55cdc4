// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Configured, never started.
    Unstarted,
    /// Child process spawned and output pumps attached.
    Running,
    /// A readiness probe succeeded against the running child.
    ReadyConfirmed,
    /// A stop sequence is signalling the child.
    Stopping,
    /// Child reaped; the exit status is final.
    Exited,
}

impl ProcessState {
    pub fn is_started(self) -> bool {
        self != ProcessState::Unstarted
    }

    pub fn is_alive(self) -> bool {
        matches!(
            self,
            ProcessState::Running | ProcessState::ReadyConfirmed | ProcessState::Stopping
        )
    }

    pub(crate) fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Unstarted, Running)
                | (Running, ReadyConfirmed)
                | (Running, Stopping)
                | (Running, Exited)
                | (ReadyConfirmed, Stopping)
                | (ReadyConfirmed, Exited)
                | (Stopping, Exited)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Unstarted => write!(f, "unstarted"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::ReadyConfirmed => write!(f, "ready"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Exited => write!(f, "exited"),
        }
    }
}
