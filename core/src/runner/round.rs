//! Round executor: run the SQL client until it exits 0 or the retry budget is
//! spent, appending one record per attempt to the result log.

use std::time::Duration;

use tracing::{debug, warn};

use super::record::{truncate_chars, AttemptRecord, ResultLog};
use super::retry::{Backoff, RoundState};
use crate::config::{ExecMode, RunnerConfig, TargetConfig};
use crate::error::{Result, RunError};
use crate::script::psql;
use crate::script::stage::{streamed_input, StagedScript};
use crate::transport::{command_label, Session};

/// Stderr excerpt kept in a `RoundFailed` error; the full text is in the log.
const ERROR_STDERR_EXCERPT: usize = 500;

/// Everything needed to repeat one SQL client invocation.
pub struct RoundExecutor<'a> {
    target: &'a TargetConfig,
    command: String,
    stdin: Option<String>,
    timeout: Duration,
    retry_limit: u32,
    backoff: Backoff,
    sleep: fn(Duration),
}

impl<'a> RoundExecutor<'a> {
    /// Build the invocation for `staged` according to the runner's mode.
    pub fn new(target: &'a TargetConfig, runner: &RunnerConfig, staged: &StagedScript) -> Self {
        let (command, stdin) = match runner.mode {
            ExecMode::Wrapper => (psql::file_command(target, &staged.wrapper_path), None),
            ExecMode::Streamed => (
                psql::stdin_command(target),
                Some(streamed_input(runner, &staged.statements)),
            ),
        };
        RoundExecutor {
            target,
            command,
            stdin,
            timeout: runner.attempt_timeout(),
            retry_limit: runner.retry,
            backoff: Backoff::new(runner.backoff_step, runner.backoff_cap),
            sleep: std::thread::sleep,
        }
    }

    /// Replace the function used to wait between attempts.
    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    /// Run round `round` to completion. Returns the round's records, the last
    /// of which exited 0, or `RoundFailed` after `retry_limit + 1` attempts.
    pub fn execute_round(
        &self,
        session: &mut dyn Session,
        round: u32,
        log: &mut ResultLog,
    ) -> Result<Vec<AttemptRecord>> {
        let env = psql::client_env(self.target);
        let mut records: Vec<AttemptRecord> = Vec::new();
        let mut state = RoundState::start();

        loop {
            let attempt = match state {
                RoundState::Attempting(n) => n,
                RoundState::Succeeded { .. } => return Ok(records),
                RoundState::Failed { attempts } => {
                    let (exit_code, stderr) = records
                        .last()
                        .map(|r| (r.exit_code, truncate_chars(&r.stderr, ERROR_STDERR_EXCERPT)))
                        .unwrap_or_default();
                    return Err(RunError::RoundFailed {
                        round,
                        attempts,
                        exit_code,
                        stderr,
                    });
                }
            };

            debug!(
                target = %self.target.name,
                round,
                attempt,
                command = %command_label(&self.command),
                "invoking sql client"
            );
            let output = session.run(
                &self.command,
                &env,
                self.stdin.as_deref().map(str::as_bytes),
                self.timeout,
            )?;
            let record = AttemptRecord::from_output(round, attempt, &output);
            let succeeded = record.succeeded();
            log.append(session, record.clone())?;
            records.push(record);

            state = state.after_attempt(succeeded, self.retry_limit);
            if let RoundState::Attempting(_) = state {
                let delay = self.backoff.delay(attempt);
                warn!(
                    target = %self.target.name,
                    round,
                    attempt,
                    exit = output.exit_code,
                    timed_out = output.timed_out,
                    delay_secs = delay.as_secs_f64(),
                    "attempt failed, retrying"
                );
                (self.sleep)(delay);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
