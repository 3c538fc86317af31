//! Error taxonomy for the runner.
//!
//! `ConfigError` covers loading and validating the fleet configuration.
//! `TransportError` covers the remote session (connect, dispatch, transfer).
//! `RunError` is what a single target's run fails with; the fleet coordinator
//! turns it into a report entry and never lets it reach sibling targets.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used by the runner modules.
pub type Result<T> = std::result::Result<T, RunError>;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Problems found while locating, reading, or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no config found: pass --config, set SQLFLEET_CONF, or create ./sqlfleet.yaml")]
    NotFound,

    #[error("config: {0}")]
    Invalid(String),

    #[error("target '{target}': {message}")]
    Target { target: String, message: String },
}

impl ConfigError {
    pub(crate) fn target(target: &str, message: impl Into<String>) -> Self {
        ConfigError::Target {
            target: target.to_string(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

/// Failures of the remote session itself, as opposed to a remote program
/// exiting non-zero (which is a normal command result).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The session could not be established.
    #[error("cannot connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// A command could not be dispatched over an established session.
    #[error("cannot dispatch {label}: {reason}")]
    Command { label: String, reason: String },

    /// Writing or appending a remote file failed.
    #[error("transfer to {path} failed: {reason}")]
    Transfer { path: String, reason: String },
}

// ---------------------------------------------------------------------------
// RunError
// ---------------------------------------------------------------------------

/// Fatal failure of one target's run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The SQL client kept exiting non-zero until the retry budget ran out.
    /// Records of earlier rounds and attempts are already persisted remotely.
    #[error("round {round} failed after {attempts} attempts (exit {exit_code}): {stderr}")]
    RoundFailed {
        round: u32,
        attempts: u32,
        exit_code: i32,
        stderr: String,
    },

    #[error("script {path}: {reason}")]
    Script { path: PathBuf, reason: String },

    #[error("local mirror {path}: {source}")]
    Mirror {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl RunError {
    /// Short machine-friendly category, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Transport(TransportError::Connect { .. }) => "connection",
            RunError::Transport(TransportError::Command { .. }) => "command",
            RunError::Transport(TransportError::Transfer { .. }) => "transfer",
            RunError::RoundFailed { .. } => "round_failed",
            RunError::Script { .. } => "script",
            RunError::Mirror { .. } => "mirror",
            RunError::Encode { .. } => "encode",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
