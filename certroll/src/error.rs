//! Error types for the certificate update pipeline.

use std::time::Duration;

/// Failures raised by the configuration store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration store {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("failed to serialize configuration store: {0}")]
    Serialize(String),

    #[error("failed to lock configuration store {path}: {reason}")]
    Lock { path: String, reason: String },

    #[error("certificate rejected: {0}")]
    InvalidCertificate(String),

    #[error("private key rejected: {0}")]
    InvalidKey(String),

    #[error("no certificate record at position {0}")]
    NoRecord(usize),
}

impl StoreError {
    pub(crate) fn io(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// Failure to restart a single service.
#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited with status {code}: {stderr}")]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("`{program}` did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("cannot read PID file {path}: {reason}")]
    PidFile { path: String, reason: String },

    #[error("failed to send {signal} to PID {pid}: {reason}")]
    Signal {
        signal: String,
        pid: i32,
        reason: String,
    },

    #[error("invalid restart method: {0}")]
    InvalidMethod(String),
}

/// Terminal failures of the update half of the pipeline.
///
/// Restart failures are not here: they are collected into a report after the
/// update has already been persisted.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("no certificate with refid \"{refid}\" exists in the configuration store")]
    NotFound { refid: String },

    #[error("configuration store rejected the new material: {0}")]
    Rejected(#[source] StoreError),

    #[error("failed to persist the configuration store: {0}")]
    Persist(#[source] StoreError),
}
