//! Fleet configuration: process-wide runner settings and per-target records.
//!
//! `RunnerConfig` and `TargetConfig` are the validated, immutable records the
//! runner consumes. They are produced by [`load`] from a YAML document and are
//! shared read-only across every concurrent target run.

pub mod load;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use load::{discover, load_file, parse_str, FleetConfig};

/// Fixed idle-transaction timeout written into every wrapper script.
pub const IDLE_IN_TRANSACTION_TIMEOUT: &str = "5min";

/// Slack added on top of the statement timeout to derive the outer command
/// timeout, so the server-side cutoff always fires first.
pub const OUTER_TIMEOUT_SLACK_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// How the SSH client treats unknown or changed host keys.
///
/// There is no default: the configuration must name one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Only hosts already present in `known_hosts` are accepted.
    Strict,
    /// Trust on first use: unknown hosts are added, changed keys are refused.
    /// Only acceptable for controlled internal fleets.
    AcceptNew,
}

impl HostKeyPolicy {
    /// Value for OpenSSH's `StrictHostKeyChecking` option.
    pub fn ssh_option(self) -> &'static str {
        match self {
            HostKeyPolicy::Strict => "yes",
            HostKeyPolicy::AcceptNew => "accept-new",
        }
    }
}

/// How each round hands the script to the remote SQL client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// `psql --file=<wrapper.sql>`; the wrapper includes the uploaded script.
    #[default]
    Wrapper,
    /// The script is split into statements locally and piped over stdin.
    Streamed,
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::Wrapper => write!(f, "wrapper"),
            ExecMode::Streamed => write!(f, "streamed"),
        }
    }
}

/// What staging does when the configured local script does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingScriptPolicy {
    /// Upload a `SELECT 1;` placeholder and log a warning.
    #[default]
    Placeholder,
    /// Abort the target's run.
    Fail,
}

// ---------------------------------------------------------------------------
// RunnerConfig
// ---------------------------------------------------------------------------

/// Process-wide settings shared by every target run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Rounds per target, at least 1.
    pub repeat: u32,
    /// Extra attempts allowed per round after the first one fails.
    pub retry: u32,
    pub connect_timeout: Duration,
    /// Budget for the SSH banner exchange and authentication.
    pub handshake_timeout: Duration,
    pub statement_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    /// Base directory for run directories on the remote host.
    pub remote_tmp_dir: String,
    pub pre_checkpoint: bool,
    pub save_local: bool,
    /// Local directory receiving mirrored metadata when `save_local` is set.
    pub local_mirror_dir: PathBuf,
    pub host_key_policy: HostKeyPolicy,
    /// Worker count for the fleet; 0 means one worker per target.
    pub parallelism: usize,
    pub mode: ExecMode,
    pub missing_script: MissingScriptPolicy,
    /// Linear backoff step between attempts.
    pub backoff_step: Duration,
    /// Upper bound on any single backoff sleep.
    pub backoff_cap: Duration,
}

impl RunnerConfig {
    /// Defaults matching a fresh `runner:` section, with the given host key
    /// policy (which has no default).
    pub fn with_policy(host_key_policy: HostKeyPolicy) -> Self {
        RunnerConfig {
            repeat: 2,
            retry: 2,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            statement_timeout_ms: 300_000,
            lock_timeout_ms: 5_000,
            remote_tmp_dir: "/tmp".to_string(),
            pre_checkpoint: false,
            save_local: false,
            local_mirror_dir: PathBuf::from("runs"),
            host_key_policy,
            parallelism: 1,
            mode: ExecMode::Wrapper,
            missing_script: MissingScriptPolicy::Placeholder,
            backoff_step: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(10),
        }
    }

    /// Outer timeout for one SQL client invocation.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_ms / 1000 + OUTER_TIMEOUT_SLACK_SECS)
    }

    /// Remote base directory for a target, honouring its override.
    pub fn remote_base_dir<'a>(&'a self, target: &'a TargetConfig) -> &'a str {
        target
            .remote_tmp_dir
            .as_deref()
            .unwrap_or(self.remote_tmp_dir.as_str())
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// How the SSH session authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Password authentication; also exported to the SQL client as `PGPASSWORD`.
    Password(String),
    /// Public key authentication with an explicit private key.
    KeyFile(PathBuf),
    /// Whatever the local SSH agent and `~/.ssh/config` provide.
    Agent,
}

impl Credential {
    /// The password, if this credential carries one.
    pub fn password(&self) -> Option<&str> {
        match self {
            Credential::Password(p) if !p.is_empty() => Some(p.as_str()),
            _ => None,
        }
    }

    /// Label safe for logs and metadata.
    pub fn describe(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::KeyFile(_) => "key_file",
            Credential::Agent => "agent",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => write!(f, "Password(<redacted>)"),
            Credential::KeyFile(p) => f.debug_tuple("KeyFile").field(p).finish(),
            Credential::Agent => write!(f, "Agent"),
        }
    }
}

// ---------------------------------------------------------------------------
// TargetConfig
// ---------------------------------------------------------------------------

/// One database server reached over SSH.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetConfig {
    /// Unique key across the fleet.
    pub name: String,
    /// Hostname or IP address of the SSH endpoint.
    pub address: String,
    pub ssh_port: u16,
    pub user: String,
    pub credential: Credential,
    /// Port the SQL server listens on, appended to the invocation when it
    /// names none.
    pub pg_port: u16,
    /// Local SQL script to upload.
    pub script_path: PathBuf,
    /// Base SQL client command line, e.g. `psql -d benchmarksql`.
    pub psql_invocation: String,
    /// Command run after all rounds, typically stopping the server.
    pub close_command: Option<String>,
    /// Overrides `RunnerConfig::remote_tmp_dir` for this target.
    pub remote_tmp_dir: Option<String>,
}

impl TargetConfig {
    /// `user@address`, as used on the SSH command line.
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    /// `address:port`, identifying the session endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.ssh_port)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
