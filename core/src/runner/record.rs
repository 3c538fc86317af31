//! Records a run leaves behind: one `AttemptRecord` per SQL client invocation,
//! appended to `results.jsonl`, and one `RunMetadata` written to `meta.json`.

use serde::{Deserialize, Serialize};

use crate::config::{ExecMode, HostKeyPolicy, RunnerConfig, TargetConfig, IDLE_IN_TRANSACTION_TIMEOUT};
use crate::error::{Result, RunError};
use crate::transport::{CommandOutput, Session};

/// Upper bound on stored stderr, in characters.
pub const STDERR_LIMIT: usize = 4000;

// ---------------------------------------------------------------------------
// AttemptRecord
// ---------------------------------------------------------------------------

/// One invocation of the SQL client within a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub round: u32,
    pub attempt: u32,
    #[serde(rename = "exit")]
    pub exit_code: i32,
    pub elapsed_sec: f64,
    pub stderr: String,
}

impl AttemptRecord {
    pub fn from_output(round: u32, attempt: u32, output: &CommandOutput) -> Self {
        AttemptRecord {
            round,
            attempt,
            exit_code: output.exit_code,
            elapsed_sec: (output.elapsed.as_secs_f64() * 1000.0).round() / 1000.0,
            stderr: truncate_chars(&output.stderr, STDERR_LIMIT),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// The first `max` characters of `s`.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

// ---------------------------------------------------------------------------
// ResultLog
// ---------------------------------------------------------------------------

/// Append-only attempt log: each record goes to the remote `results.jsonl`
/// first and only then into memory.
#[derive(Debug, Clone)]
pub struct ResultLog {
    remote_path: String,
    records: Vec<AttemptRecord>,
}

impl ResultLog {
    pub fn new(remote_path: impl Into<String>) -> Self {
        ResultLog {
            remote_path: remote_path.into(),
            records: Vec::new(),
        }
    }

    pub fn append(&mut self, session: &mut dyn Session, record: AttemptRecord) -> Result<()> {
        debug_assert!(
            self.records
                .last()
                .map(|last| (last.round, last.attempt) < (record.round, record.attempt))
                .unwrap_or(true),
            "attempt records must be strictly increasing"
        );
        let mut line = serde_json::to_string(&record).map_err(|source| RunError::Encode {
            what: "attempt record",
            source,
        })?;
        line.push('\n');
        session.append_text(&self.remote_path, &line)?;
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<AttemptRecord> {
        self.records
    }
}

// ---------------------------------------------------------------------------
// AdvisoryOutcome
// ---------------------------------------------------------------------------

/// Result of a side action whose failure is logged but never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdvisoryOutcome {
    Ok,
    Failed { reason: String },
}

// ---------------------------------------------------------------------------
// RunMetadata
// ---------------------------------------------------------------------------

/// Settings and identity of a completed run. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub target: String,
    pub address: String,
    pub ssh_port: u16,
    pub user: String,
    pub auth: String,
    pub pg_port: u16,
    pub script_path: String,
    pub script_placeholder: bool,
    pub psql_invocation: String,
    pub mode: ExecMode,
    pub repeat: u32,
    pub retry: u32,
    pub statement_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub idle_in_transaction_timeout: String,
    pub host_key_policy: HostKeyPolicy,
    pub run_dir: String,
    pub started_at: String,
    pub finished_at: String,
    pub attempts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<AdvisoryOutcome>,
}

/// Run-specific values that go into [`RunMetadata`] beside the configuration.
#[derive(Debug, Clone)]
pub struct RunFacts {
    pub run_dir: String,
    pub script_placeholder: bool,
    pub started_at: String,
    pub finished_at: String,
    pub attempts: usize,
    pub checkpoint: Option<AdvisoryOutcome>,
}

impl RunMetadata {
    pub fn new(target: &TargetConfig, runner: &RunnerConfig, facts: RunFacts) -> Self {
        RunMetadata {
            target: target.name.clone(),
            address: target.address.clone(),
            ssh_port: target.ssh_port,
            user: target.user.clone(),
            auth: target.credential.describe().to_string(),
            pg_port: target.pg_port,
            script_path: target.script_path.display().to_string(),
            script_placeholder: facts.script_placeholder,
            psql_invocation: target.psql_invocation.clone(),
            mode: runner.mode,
            repeat: runner.repeat,
            retry: runner.retry,
            statement_timeout_ms: runner.statement_timeout_ms,
            lock_timeout_ms: runner.lock_timeout_ms,
            idle_in_transaction_timeout: IDLE_IN_TRANSACTION_TIMEOUT.to_string(),
            host_key_policy: runner.host_key_policy,
            run_dir: facts.run_dir,
            started_at: facts.started_at,
            finished_at: facts.finished_at,
            attempts: facts.attempts,
            checkpoint: facts.checkpoint,
        }
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|source| RunError::Encode {
            what: "run metadata",
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
