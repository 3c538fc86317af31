//! Run orchestrator: the full sequence for one target.
//!
//! connect, create the run directory, stage, optional checkpoint, rounds,
//! `meta.json`, optional shutdown command, optional local mirror. The session
//! is closed on every path out of [`run_target`], including errors.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{info, warn};

use super::mirror::write_mirror;
use super::record::{truncate_chars, AdvisoryOutcome, AttemptRecord, ResultLog, RunFacts, RunMetadata};
use super::round::RoundExecutor;
use crate::config::{RunnerConfig, TargetConfig};
use crate::error::{Result, TransportError};
use crate::script::psql;
use crate::script::stage::{stage, META_FILE, RESULTS_FILE};
use crate::transport::{remote_join, CommandOutput, Connector, Session};

/// Outer timeout for the checkpoint and shutdown commands.
pub const ADVISORY_TIMEOUT: Duration = Duration::from_secs(120);

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// What a successful run leaves behind.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub target: String,
    pub run_dir: String,
    pub attempts: usize,
    pub records: Vec<AttemptRecord>,
    pub meta: RunMetadata,
    pub shutdown: Option<AdvisoryOutcome>,
    pub mirror_dir: Option<PathBuf>,
}

/// `run_<stamp>_<epoch-ms>-<seq>`; unique within the process even for runs
/// started in the same millisecond.
pub fn run_dir_name(now: &DateTime<Local>) -> String {
    let seq = RUN_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "run_{}_{}-{}",
        now.format(STAMP_FORMAT),
        now.timestamp_millis(),
        seq
    )
}

/// Run `target` end to end over a session from `connector`.
pub fn run_target(
    connector: &dyn Connector,
    target: &TargetConfig,
    runner: &RunnerConfig,
) -> Result<RunResult> {
    let started = Local::now();
    info!(target = %target.name, endpoint = %target.endpoint(), "connecting");
    let mut session = connector.connect(target, runner)?;

    let outcome = drive(session.as_mut(), target, runner, started);
    session.close();

    match &outcome {
        Ok(result) => info!(
            target = %target.name,
            run_dir = %result.run_dir,
            attempts = result.attempts,
            "run finished"
        ),
        Err(e) => warn!(target = %target.name, kind = e.kind(), error = %e, "run failed"),
    }
    outcome
}

fn drive(
    session: &mut dyn Session,
    target: &TargetConfig,
    runner: &RunnerConfig,
    started: DateTime<Local>,
) -> Result<RunResult> {
    let run_dir = remote_join(runner.remote_base_dir(target), &run_dir_name(&started));
    session.make_dir(&run_dir)?;
    info!(target = %target.name, run_dir = %run_dir, "run directory ready");

    let staged = stage(session, target, runner, &run_dir)?;

    let checkpoint = if runner.pre_checkpoint {
        let result = session.run(
            &psql::checkpoint_command(target),
            &psql::client_env(target),
            None,
            ADVISORY_TIMEOUT,
        );
        Some(advisory(target, "checkpoint", result))
    } else {
        None
    };

    let executor = RoundExecutor::new(target, runner, &staged);
    let mut log = ResultLog::new(remote_join(&run_dir, RESULTS_FILE));
    for round in 1..=runner.repeat {
        let records = executor.execute_round(session, round, &mut log)?;
        info!(target = %target.name, round, attempts = records.len(), "round complete");
    }
    let records = log.into_records();

    let finished = Local::now();
    let meta = RunMetadata::new(
        target,
        runner,
        RunFacts {
            run_dir: run_dir.clone(),
            script_placeholder: staged.placeholder,
            started_at: started.to_rfc3339(),
            finished_at: finished.to_rfc3339(),
            attempts: records.len(),
            checkpoint,
        },
    );
    session.upload(meta.to_json_pretty()?.as_bytes(), &remote_join(&run_dir, META_FILE))?;

    let shutdown = target.close_command.as_deref().map(|cmd| {
        let result = session.run(cmd, &[], None, ADVISORY_TIMEOUT);
        advisory(target, "shutdown", result)
    });

    let mirror_dir = if runner.save_local {
        let stamp = finished.format(STAMP_FORMAT).to_string();
        let dir = write_mirror(&runner.local_mirror_dir, &stamp, &meta, &records)?;
        info!(target = %target.name, dir = %dir.display(), "mirrored locally");
        Some(dir)
    } else {
        None
    };

    Ok(RunResult {
        target: target.name.clone(),
        run_dir,
        attempts: records.len(),
        records,
        meta,
        shutdown,
        mirror_dir,
    })
}

/// Fold the result of a best-effort command into an outcome, logging failures.
fn advisory(
    target: &TargetConfig,
    action: &str,
    result: std::result::Result<CommandOutput, TransportError>,
) -> AdvisoryOutcome {
    let outcome = match result {
        Ok(out) if out.success() => AdvisoryOutcome::Ok,
        Ok(out) => AdvisoryOutcome::Failed {
            reason: format!(
                "exit {}: {}",
                out.exit_code,
                truncate_chars(out.stderr.trim(), 200)
            ),
        },
        Err(e) => AdvisoryOutcome::Failed {
            reason: e.to_string(),
        },
    };
    if let AdvisoryOutcome::Failed { reason } = &outcome {
        warn!(target = %target.name, action, reason = %reason, "advisory step failed, continuing");
    }
    outcome
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credential, HostKeyPolicy};
    use crate::error::RunError;
    use crate::transport::mock::{MockConnector, MockHost, Reply};

    fn target(name: &str) -> TargetConfig {
        TargetConfig {
            name: name.into(),
            address: "10.0.0.1".into(),
            ssh_port: 22,
            user: "postgres".into(),
            credential: Credential::Agent,
            pg_port: 5432,
            script_path: PathBuf::from("/nonexistent/queries/modify.sql"),
            psql_invocation: "psql -d bench".into(),
            close_command: None,
            remote_tmp_dir: None,
        }
    }

    fn runner(repeat: u32, retry: u32) -> RunnerConfig {
        let mut rc = RunnerConfig::with_policy(HostKeyPolicy::Strict);
        rc.repeat = repeat;
        rc.retry = retry;
        rc.backoff_step = Duration::ZERO;
        rc.backoff_cap = Duration::ZERO;
        rc
    }

    fn results(host: &MockHost, run_dir: &str) -> Vec<AttemptRecord> {
        host.file(&remote_join(run_dir, RESULTS_FILE))
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn only_run_dir(host: &MockHost) -> String {
        let dirs = host.dirs();
        assert_eq!(dirs.len(), 1, "expected one run directory, got {dirs:?}");
        dirs[0].clone()
    }

    #[test]
    fn run_dir_names_are_unique_and_prefixed() {
        let now = Local::now();
        let a = run_dir_name(&now);
        let b = run_dir_name(&now);
        assert_ne!(a, b);
        assert!(a.starts_with("run_"));
        assert!(a.contains(&now.timestamp_millis().to_string()));
    }

    #[test]
    fn retry_in_first_round_gives_three_attempts() {
        let mut connector = MockConnector::new();
        let host = connector.host("pg20");
        host.reply_to("wrapper.sql", vec![Reply::fail(1, "could not obtain lock")]);

        let result = run_target(&connector, &target("pg20"), &runner(2, 1)).unwrap();
        assert_eq!(result.attempts, 3);

        let got: Vec<(u32, u32, bool)> = results(&host, &result.run_dir)
            .iter()
            .map(|r| (r.round, r.attempt, r.succeeded()))
            .collect();
        assert_eq!(got, vec![(1, 1, false), (1, 2, true), (2, 1, true)]);
        assert_eq!(result.records.len(), 3);

        let meta: RunMetadata =
            serde_json::from_str(&host.file(&remote_join(&result.run_dir, META_FILE)).unwrap())
                .unwrap();
        assert_eq!(meta.attempts, 3);
        assert!(meta.script_placeholder);
        assert_eq!(host.sessions_closed(), 1);
    }

    #[test]
    fn record_bounds_hold_across_repeat_and_retry() {
        for repeat in 1..=3u32 {
            for retry in 0..=2u32 {
                // round r fails (r + retry) % (retry + 1) times before succeeding
                let failures = |r: u32| (r + retry) % (retry + 1);
                let mut replies = Vec::new();
                for r in 1..=repeat {
                    for _ in 0..failures(r) {
                        replies.push(Reply::fail(1, "transient"));
                    }
                    replies.push(Reply::ok());
                }

                let mut connector = MockConnector::new();
                let host = connector.host("pg");
                host.reply_to("wrapper.sql", replies);
                let result = run_target(&connector, &target("pg"), &runner(repeat, retry))
                    .unwrap_or_else(|e| panic!("R={repeat} K={retry}: {e}"));

                let records = results(&host, &result.run_dir);
                assert_eq!(records, result.records);
                let n = records.len() as u32;
                assert!(repeat <= n && n <= repeat * (retry + 1), "R={repeat} K={retry} n={n}");

                for r in 1..=repeat {
                    let round: Vec<&AttemptRecord> = records.iter().filter(|x| x.round == r).collect();
                    assert_eq!(round.len() as u32, failures(r) + 1, "R={repeat} K={retry} round {r}");
                    let attempts: Vec<u32> = round.iter().map(|x| x.attempt).collect();
                    assert_eq!(attempts, (1..=failures(r) + 1).collect::<Vec<_>>());
                    assert!(round.last().map_or(false, |x| x.succeeded()));
                }
                let rounds: Vec<u32> = records.iter().map(|x| x.round).collect();
                assert!(rounds.windows(2).all(|w| w[1] == w[0] || w[1] == w[0] + 1));
                assert_eq!(rounds.first(), Some(&1));
                assert_eq!(rounds.last(), Some(&repeat));
            }
        }
    }

    #[test]
    fn run_layout_on_remote_host() {
        let mut connector = MockConnector::new();
        let host = connector.host("pg");
        let result = run_target(&connector, &target("pg"), &runner(1, 0)).unwrap();

        assert!(result.run_dir.starts_with("/tmp/run_"));
        assert_eq!(only_run_dir(&host), result.run_dir);
        let mut expected: Vec<String> = ["meta.json", "modify.sql", "results.jsonl", "wrapper.sql"]
            .iter()
            .map(|f| remote_join(&result.run_dir, f))
            .collect();
        expected.sort();
        assert_eq!(host.files(), expected);
    }

    #[test]
    fn target_override_sets_remote_base() {
        let mut connector = MockConnector::new();
        let host = connector.host("pg");
        let mut t = target("pg");
        t.remote_tmp_dir = Some("/data/scratch/".into());
        let result = run_target(&connector, &t, &runner(1, 0)).unwrap();
        assert!(result.run_dir.starts_with("/data/scratch/run_"));
        assert_eq!(only_run_dir(&host), result.run_dir);
    }

    #[test]
    fn exhausted_round_aborts_remaining_rounds_and_closes() {
        let mut connector = MockConnector::new();
        let host = connector.host("pg");
        host.reply_to(
            "wrapper.sql",
            vec![Reply::fail(3, "syntax error"), Reply::fail(3, "syntax error")],
        );

        let err = run_target(&connector, &target("pg"), &runner(3, 1)).unwrap_err();
        assert!(matches!(err, RunError::RoundFailed { round: 1, attempts: 2, .. }));
        assert_eq!(host.commands_matching("wrapper.sql").len(), 2);

        let run_dir = only_run_dir(&host);
        assert_eq!(results(&host, &run_dir).len(), 2);
        assert!(host.file(&remote_join(&run_dir, META_FILE)).is_none());
        assert_eq!(host.sessions_closed(), 1);
    }

    #[test]
    fn advisory_failures_do_not_block_meta() {
        let mut connector = MockConnector::new();
        let host = connector.host("pg");
        host.reply_to("CHECKPOINT", vec![Reply::fail(2, "permission denied")]);
        host.reply_to("pg_ctl stop", vec![Reply::Dispatch("connection reset".into())]);

        let mut t = target("pg");
        t.close_command = Some("pg_ctl stop -m fast".into());
        let mut rc = runner(1, 0);
        rc.pre_checkpoint = true;

        let result = run_target(&connector, &t, &rc).unwrap();
        assert!(host.file(&remote_join(&result.run_dir, META_FILE)).is_some());
        assert!(matches!(
            result.meta.checkpoint,
            Some(AdvisoryOutcome::Failed { ref reason }) if reason.contains("permission denied")
        ));
        assert!(matches!(result.shutdown, Some(AdvisoryOutcome::Failed { .. })));
        assert_eq!(host.sessions_closed(), 1);
    }

    #[test]
    fn checkpoint_runs_before_first_round() {
        let mut connector = MockConnector::new();
        let host = connector.host("pg");
        let mut rc = runner(1, 0);
        rc.pre_checkpoint = true;
        run_target(&connector, &target("pg"), &rc).unwrap();

        let cmds: Vec<String> = host.commands().into_iter().map(|c| c.command).collect();
        assert_eq!(cmds.len(), 2);
        assert!(cmds[0].contains("CHECKPOINT"));
        assert!(cmds[1].contains("wrapper.sql"));
    }

    #[test]
    fn connection_refused_is_a_connection_error() {
        let mut connector = MockConnector::new();
        connector.refuse("pg", "Permission denied (publickey,password)");
        let err = run_target(&connector, &target("pg"), &runner(1, 0)).unwrap_err();
        assert_eq!(err.kind(), "connection");
    }

    #[test]
    fn staging_failure_still_closes_session() {
        let mut connector = MockConnector::new();
        let host = connector.host("pg");
        host.fail_writes_to("wrapper.sql");
        let err = run_target(&connector, &target("pg"), &runner(1, 0)).unwrap_err();
        assert_eq!(err.kind(), "transfer");
        assert!(host.commands().is_empty());
        assert_eq!(host.sessions_closed(), 1);
    }

    #[test]
    fn save_local_mirrors_meta_and_results() {
        let tmp = tempfile::tempdir().unwrap();
        let mut connector = MockConnector::new();
        connector.host("pg");
        let mut rc = runner(2, 0);
        rc.save_local = true;
        rc.local_mirror_dir = tmp.path().to_path_buf();

        let result = run_target(&connector, &target("pg"), &rc).unwrap();
        let dir = result.mirror_dir.unwrap();
        assert!(dir.starts_with(tmp.path()));
        assert!(dir.ends_with("pg"));
        let mirrored: Vec<AttemptRecord> =
            serde_json::from_str(&std::fs::read_to_string(dir.join("results.json")).unwrap())
                .unwrap();
        assert_eq!(mirrored, result.records);
        assert!(dir.join("meta.json").exists());
    }
}
