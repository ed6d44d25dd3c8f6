//! Error taxonomy for variant lifecycle control.
//!
//! Failures that belong to a single run (client timeout, client crash) are
//! not errors at this level; they are recorded on the `RunRecord` and the
//! sweep continues. Everything here is fatal for at least one variant.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while building, starting, probing or stopping a variant.
#[derive(Debug, Error)]
pub enum BenchError {
    /// A declared build step exited with a non-zero status.
    #[error("build step `{command}` for variant '{variant}' failed: {detail}")]
    BuildFailure {
        variant: String,
        command: String,
        detail: String,
    },

    /// The server never accepted a connection within its startup timeout.
    #[error("variant '{variant}' was not ready on port {port} after {waited:?}")]
    ReadinessTimeout {
        variant: String,
        port: u16,
        waited: Duration,
    },

    /// Something was already listening on the variant's port before start.
    #[error("port {port} is already in use; refusing to start variant '{variant}'")]
    AlreadyRunning { variant: String, port: u16 },

    /// Elevation is required but cannot be obtained without a prompt.
    #[error("variant '{variant}' needs privilege elevation but `sudo -n` is not usable: {detail}")]
    PrivilegeUnavailable { variant: String, detail: String },

    /// The server process exited while we were waiting for it.
    #[error("server for variant '{variant}' exited early with {status}")]
    ServerExited { variant: String, status: String },

    /// The port was still accepting connections after the server was stopped.
    #[error("port {port} still in use after stopping variant '{variant}'")]
    PortStillBound { variant: String, port: u16 },

    /// Readiness succeeded but a full client round trip did not.
    #[error("health check against variant '{variant}' failed: {detail}")]
    HealthCheck { variant: String, detail: String },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown variant '{name}' (known: {known})")]
    UnknownVariant { name: String, known: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An interrupt was observed; the caller must still stop live servers.
    #[error("benchmark cancelled by interrupt")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BenchError {
    /// Short lifecycle stage label used in reports.
    pub fn stage(&self) -> &'static str {
        match self {
            BenchError::BuildFailure { .. } => "build",
            BenchError::ReadinessTimeout { .. }
            | BenchError::ServerExited { .. }
            | BenchError::HealthCheck { .. } => "readiness",
            BenchError::AlreadyRunning { .. }
            | BenchError::PrivilegeUnavailable { .. }
            | BenchError::Spawn { .. } => "start",
            BenchError::PortStillBound { .. } => "stop",
            BenchError::UnknownVariant { .. } | BenchError::InvalidConfig(_) => "config",
            BenchError::Cancelled => "cancelled",
            BenchError::Io(_) => "io",
        }
    }
}

pub type BenchResult<T> = std::result::Result<T, BenchError>;
