// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, bail};
use log::debug;
use serde::Deserialize;
use std::fmt;

/// Ordered `KEY=VALUE` environment handed to a child process.
///
/// When a controller is given an `Environment` it replaces the inherited
/// environment entirely. Inheriting is opt-in through [`Environment::inherited`],
/// which copies the current process environment at the time it is called.
/// Later entries override earlier ones with the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct Environment {
    vars: Vec<(String, String)>,
}

impl Environment {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot of this process's environment. Non-UTF-8 entries are skipped.
    pub fn inherited() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self { vars }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Parse `KEY=VALUE` entries. The value may itself contain `=`.
    pub fn parse<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut vars = Vec::new();
        for entry in entries {
            let entry = entry.as_ref();
            let Some((key, value)) = entry.split_once('=') else {
                bail!("environment entry without '=': {entry}");
            };
            if key.is_empty() {
                bail!("environment entry with empty key: {entry}");
            }
            vars.push((key.to_string(), value.to_string()));
        }
        Ok(Self { vars })
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.push((key.into(), value.into()));
        self
    }

    /// Append the variables of a systemd-style environment file.
    pub fn with_file(mut self, path: &str) -> Result<Self> {
        let vars = parse_environment_file(path)?;
        debug!("loaded {} variable(s) from {path}", vars.len());
        self.vars.extend(vars);
        Ok(self)
    }

    /// Last value set for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries rendered as `KEY=VALUE`, in order.
    pub fn to_entries(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

impl TryFrom<Vec<String>> for Environment {
    type Error = anyhow::Error;

    fn try_from(entries: Vec<String>) -> Result<Self> {
        Self::parse(entries)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.to_entries().join(" "))
    }
}

/// Parse a systemd-style environment file into key-value pairs.
/// Supports `KEY=VALUE`, `KEY="VALUE"`, `KEY='VALUE'`, comments (#), and blank lines.
pub fn parse_environment_file(path: &str) -> Result<Vec<(String, String)>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading environment file: {path}"))?;
    let mut vars = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, raw_val)) = trimmed.split_once('=') {
            let val = raw_val
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .to_string();
            vars.push((key.trim().to_string(), val));
        }
    }
    Ok(vars)
}
