// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::state::SamplerState;

/// Failure of a single device query. Always recoverable: the sampler logs it
/// and skips the tick.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} did not finish within {}ms", timeout.as_millis())]
    Timeout { command: String, timeout: Duration },
    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("could not parse device query output: {0}")]
    Parse(String),
}

#[derive(Error, Debug)]
pub enum Error {
    /// The output format selector is not one of the supported formats.
    #[error("'{0}' is not a valid output format (expected one of: csv, json, table)")]
    UnsupportedFormat(String),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("no GPU memory samples recorded for worker {0}")]
    UnknownWorker(String),
    #[error("failed to write record to {}: {source}", path.display())]
    SinkWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sampler cannot go from {from} to {to}")]
    Lifecycle { from: SamplerState, to: SamplerState },
}

impl Error {
    /// True for errors that must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::UnsupportedFormat(_) | Error::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
