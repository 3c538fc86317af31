//! Staging the SQL script and its timeout wrapper in the run directory.
//!
//! The raw script is uploaded verbatim under its own file name. `wrapper.sql`
//! sets the lock, statement, and idle-transaction timeouts and then includes
//! the uploaded script, so every round is bounded whatever the script says.

use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, warn};

use super::split::split_statements;
use crate::config::{
    ExecMode, MissingScriptPolicy, RunnerConfig, TargetConfig, IDLE_IN_TRANSACTION_TIMEOUT,
};
use crate::error::{Result, RunError};
use crate::transport::{remote_join, Session};

pub const WRAPPER_FILE: &str = "wrapper.sql";
pub const RESULTS_FILE: &str = "results.jsonl";
pub const META_FILE: &str = "meta.json";

/// Uploaded in place of a script that does not exist locally.
pub const PLACEHOLDER_SCRIPT: &str = "-- placeholder script\nSELECT 1;\n";

const FALLBACK_SCRIPT_NAME: &str = "script.sql";

/// What staging left in the run directory.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedScript {
    pub remote_script: String,
    pub wrapper_path: String,
    /// Statements for streamed execution, empty in wrapper mode.
    pub statements: Vec<String>,
    /// The local script was missing and a placeholder was uploaded.
    pub placeholder: bool,
}

/// The three `SET` lines that open every wrapper, in fixed order.
pub fn settings_prelude(runner: &RunnerConfig) -> String {
    format!(
        "SET lock_timeout = '{}ms';\nSET statement_timeout = '{}ms';\nSET idle_in_transaction_session_timeout = '{}';\n",
        runner.lock_timeout_ms, runner.statement_timeout_ms, IDLE_IN_TRANSACTION_TIMEOUT
    )
}

/// Full wrapper text: the settings followed by an include of `remote_script`.
pub fn wrapper_text(runner: &RunnerConfig, remote_script: &str) -> String {
    format!(
        "{}\\i '{}'\n",
        settings_prelude(runner),
        remote_script.replace('\'', "''")
    )
}

/// Standard input for one streamed round: the settings, then every
/// statement terminated by `;`.
pub fn streamed_input(runner: &RunnerConfig, statements: &[String]) -> String {
    let mut out = settings_prelude(runner);
    for stmt in statements {
        out.push_str(stmt);
        // a trailing `--` comment would swallow the terminator
        if stmt.lines().last().map_or(false, |l| l.contains("--")) {
            out.push('\n');
        }
        out.push_str(";\n");
    }
    out
}

/// Remote file name for the uploaded script. Names that would clash with the
/// run's own files get a prefix.
pub fn remote_script_name(local: &Path) -> String {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| FALLBACK_SCRIPT_NAME.to_string());
    if [WRAPPER_FILE, RESULTS_FILE, META_FILE].contains(&name.as_str()) {
        format!("script_{}", name)
    } else {
        name
    }
}

/// Upload the target's script and the wrapper into `run_dir`.
pub fn stage(
    session: &mut dyn Session,
    target: &TargetConfig,
    runner: &RunnerConfig,
    run_dir: &str,
) -> Result<StagedScript> {
    let (bytes, placeholder) = read_script(target, runner.missing_script)?;

    let remote_script = remote_join(run_dir, &remote_script_name(&target.script_path));
    session.upload(&bytes, &remote_script)?;
    debug!(target = %target.name, path = %remote_script, bytes = bytes.len(), "script uploaded");

    let wrapper_path = remote_join(run_dir, WRAPPER_FILE);
    session.upload(wrapper_text(runner, &remote_script).as_bytes(), &wrapper_path)?;

    let statements = match runner.mode {
        ExecMode::Wrapper => Vec::new(),
        ExecMode::Streamed => split_statements(&String::from_utf8_lossy(&bytes)),
    };

    Ok(StagedScript {
        remote_script,
        wrapper_path,
        statements,
        placeholder,
    })
}

fn read_script(target: &TargetConfig, policy: MissingScriptPolicy) -> Result<(Vec<u8>, bool)> {
    match std::fs::read(&target.script_path) {
        Ok(bytes) => Ok((bytes, false)),
        Err(e) if e.kind() == ErrorKind::NotFound => match policy {
            MissingScriptPolicy::Placeholder => {
                warn!(
                    target = %target.name,
                    path = %target.script_path.display(),
                    "script not found, uploading a SELECT 1 placeholder"
                );
                Ok((PLACEHOLDER_SCRIPT.as_bytes().to_vec(), true))
            }
            MissingScriptPolicy::Fail => Err(RunError::Script {
                path: target.script_path.clone(),
                reason: "not found".into(),
            }),
        },
        Err(e) => Err(RunError::Script {
            path: target.script_path.clone(),
            reason: e.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
