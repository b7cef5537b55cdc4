// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Run an external executable in the background for the duration of a test
//! or tool run: launch it, wait until it listens on a port, read what it
//! printed, and stop it with a polite signal followed by a forceful one.
//!
//! ```ignore
//! let proc = BackgroundProcess::new(ProcessConfig::new("/usr/bin/server").with_env(env));
//! proc.start()?;
//! proc.wait_ready("tcp", "8080", Duration::from_secs(20)).await?;
//! // ...
//! let result = proc.stop(Signal::SIGINT, Signal::SIGKILL).await?;
//! ```

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

pub mod config;
pub mod env;
mod errors;
pub mod kill_mode;
pub mod port;
pub mod process;
pub mod state;
pub mod stream;

pub use config::{ProcessConfig, load_config};
pub use env::Environment;
pub use errors::{Error, Result};
pub use kill_mode::KillMode;
pub use nix::sys::signal::Signal;
pub use port::{Network, PortWaiter};
pub use process::{BackgroundProcess, TerminationResult};
pub use state::ProcessState;
pub use stream::{Stream, StreamBuffer};
