//! Fleet coordinator: run every target, isolate failures, report all of them.
//!
//! Workers are scoped threads pulling target indices from a shared cursor.
//! Each target gets its own session; the runner configuration is shared
//! read-only. Whatever happens to one target (connection failure, fatal
//! round, panic) becomes that target's report entry and nothing else.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use serde::Serialize;
use tracing::{error, info};

use crate::config::{RunnerConfig, TargetConfig};
use crate::runner::{run_target, RunResult};
use crate::transport::Connector;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Outcome of one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FleetEntry {
    Success {
        target: String,
        remote_dir: String,
        attempts: usize,
    },
    Failure {
        target: String,
        error: String,
    },
}

impl FleetEntry {
    pub fn target(&self) -> &str {
        match self {
            FleetEntry::Success { target, .. } | FleetEntry::Failure { target, .. } => target,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FleetEntry::Success { .. })
    }

    fn from_run(target: &str, result: crate::error::Result<RunResult>) -> Self {
        match result {
            Ok(run) => FleetEntry::Success {
                target: target.to_string(),
                remote_dir: run.run_dir,
                attempts: run.attempts,
            },
            Err(e) => FleetEntry::Failure {
                target: target.to_string(),
                error: e.to_string(),
            },
        }
    }
}

/// One entry per target, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FleetReport {
    pub entries: Vec<FleetEntry>,
}

impl FleetReport {
    pub fn has_failures(&self) -> bool {
        self.entries.iter().any(|e| !e.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &FleetEntry> {
        self.entries.iter().filter(|e| !e.is_success())
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Worker count for `targets` targets: 0 means one per target, and there are
/// never more workers than targets.
pub fn effective_workers(parallelism: usize, targets: usize) -> usize {
    let wanted = if parallelism == 0 { targets } else { parallelism };
    wanted.min(targets).max(1)
}

/// Run all `targets`. With one worker they run strictly in order on the
/// calling thread.
pub fn run_fleet(
    connector: &dyn Connector,
    targets: &[TargetConfig],
    runner: &RunnerConfig,
    parallelism: usize,
) -> FleetReport {
    if targets.is_empty() {
        return FleetReport::default();
    }
    let workers = effective_workers(parallelism, targets.len());
    info!(targets = targets.len(), workers, "fleet starting");

    let entries = if workers == 1 {
        targets
            .iter()
            .map(|t| run_isolated(connector, t, runner))
            .collect()
    } else {
        run_pooled(connector, targets, runner, workers)
    };

    let report = FleetReport { entries };
    info!(
        targets = report.entries.len(),
        failed = report.failures().count(),
        "fleet finished"
    );
    report
}

fn run_pooled(
    connector: &dyn Connector,
    targets: &[TargetConfig],
    runner: &RunnerConfig,
    workers: usize,
) -> Vec<FleetEntry> {
    let cursor = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<FleetEntry>>> = Mutex::new(vec![None; targets.len()]);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let idx = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(target) = targets.get(idx) else {
                    break;
                };
                let entry = run_isolated(connector, target, runner);
                slots.lock().unwrap_or_else(|p| p.into_inner())[idx] = Some(entry);
            });
        }
    });

    slots
        .into_inner()
        .unwrap_or_else(|p| p.into_inner())
        .into_iter()
        .zip(targets)
        .map(|(slot, target)| {
            slot.unwrap_or_else(|| FleetEntry::Failure {
                target: target.name.clone(),
                error: "target was never run".into(),
            })
        })
        .collect()
}

/// One target's run with panics turned into a failure entry.
fn run_isolated(connector: &dyn Connector, target: &TargetConfig, runner: &RunnerConfig) -> FleetEntry {
    match catch_unwind(AssertUnwindSafe(|| run_target(connector, target, runner))) {
        Ok(result) => FleetEntry::from_run(&target.name, result),
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!(target = %target.name, panic = %msg, "target run panicked");
            FleetEntry::Failure {
                target: target.name.clone(),
                error: format!("panicked: {msg}"),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credential, HostKeyPolicy};
    use crate::error::TransportError;
    use crate::transport::mock::{MockConnector, Reply};
    use crate::transport::Session;
    use std::path::PathBuf;
    use std::time::Duration;

    fn target(name: &str) -> TargetConfig {
        TargetConfig {
            name: name.into(),
            address: format!("{name}.internal"),
            ssh_port: 22,
            user: "postgres".into(),
            credential: Credential::Password("pw".into()),
            pg_port: 5432,
            script_path: PathBuf::from("/nonexistent/q.sql"),
            psql_invocation: "psql".into(),
            close_command: None,
            remote_tmp_dir: None,
        }
    }

    fn runner() -> RunnerConfig {
        let mut rc = RunnerConfig::with_policy(HostKeyPolicy::AcceptNew);
        rc.repeat = 2;
        rc.retry = 1;
        rc.backoff_step = Duration::ZERO;
        rc
    }

    #[test]
    fn worker_count_rules() {
        assert_eq!(effective_workers(0, 5), 5);
        assert_eq!(effective_workers(1, 5), 1);
        assert_eq!(effective_workers(8, 3), 3);
        assert_eq!(effective_workers(0, 0), 1);
    }

    #[test]
    fn empty_fleet_reports_nothing() {
        let report = run_fleet(&MockConnector::new(), &[], &runner(), 4);
        assert!(report.entries.is_empty());
        assert!(!report.has_failures());
    }

    #[test]
    fn unreachable_target_does_not_hide_healthy_one() {
        let mut connector = MockConnector::new();
        let healthy = connector.host("pg20");
        connector.refuse("pg21", "Permission denied (password)");
        let targets = vec![target("pg20"), target("pg21")];

        let report = run_fleet(&connector, &targets, &runner(), 2);
        assert_eq!(report.entries.len(), 2);
        assert!(report.has_failures());

        match &report.entries[0] {
            FleetEntry::Success { target, remote_dir, attempts } => {
                assert_eq!(target, "pg20");
                assert!(remote_dir.starts_with("/tmp/run_"));
                assert_eq!(*attempts, 2);
            }
            other => panic!("expected success, got {other:?}"),
        }
        match &report.entries[1] {
            FleetEntry::Failure { target, error } => {
                assert_eq!(target, "pg21");
                assert!(error.contains("Permission denied"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(healthy.sessions_closed(), 1);
    }

    #[test]
    fn sequential_run_preserves_order_and_isolates_round_failures() {
        let mut connector = MockConnector::new();
        let a = connector.host("a");
        let b = connector.host("b");
        let c = connector.host("c");
        b.reply_to("wrapper.sql", vec![Reply::fail(1, "x"), Reply::fail(1, "y")]);
        let targets = vec![target("a"), target("b"), target("c")];

        let report = run_fleet(&connector, &targets, &runner(), 1);
        let names: Vec<&str> = report.entries.iter().map(|e| e.target()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(report.entries[0].is_success());
        assert!(!report.entries[1].is_success());
        assert!(report.entries[2].is_success());

        for host in [&a, &b, &c] {
            assert_eq!(host.sessions_opened(), 1);
            assert_eq!(host.sessions_closed(), 1);
        }
    }

    #[test]
    fn pooled_run_keeps_configuration_order() {
        let mut connector = MockConnector::new();
        let names: Vec<String> = (0..6).map(|i| format!("pg{i}")).collect();
        for n in &names {
            connector.host(n);
        }
        let targets: Vec<TargetConfig> = names.iter().map(|n| target(n)).collect();

        let report = run_fleet(&connector, &targets, &runner(), 0);
        let got: Vec<&str> = report.entries.iter().map(|e| e.target()).collect();
        assert_eq!(got, names.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(!report.has_failures());
    }

    struct PanickingConnector;

    impl Connector for PanickingConnector {
        fn connect(
            &self,
            target: &TargetConfig,
            _runner: &RunnerConfig,
        ) -> Result<Box<dyn Session>, TransportError> {
            panic!("connector exploded for {}", target.name);
        }
    }

    #[test]
    fn panics_become_failure_entries() {
        let targets = vec![target("a"), target("b")];
        let report = run_fleet(&PanickingConnector, &targets, &runner(), 2);
        assert_eq!(report.entries.len(), 2);
        for entry in &report.entries {
            match entry {
                FleetEntry::Failure { error, .. } => assert!(error.contains("connector exploded")),
                other => panic!("expected failure, got {other:?}"),
            }
        }
    }

    #[test]
    fn report_serialises_as_array_of_flat_objects() {
        let report = FleetReport {
            entries: vec![
                FleetEntry::Success {
                    target: "a".into(),
                    remote_dir: "/tmp/run_1".into(),
                    attempts: 3,
                },
                FleetEntry::Failure {
                    target: "b".into(),
                    error: "cannot connect to b:22: refused".into(),
                },
            ],
        };
        let json: serde_json::Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();
        assert_eq!(json[0]["remote_dir"], "/tmp/run_1");
        assert_eq!(json[0]["attempts"], 3);
        assert_eq!(json[1]["error"], "cannot connect to b:22: refused");
        assert!(json[1].get("attempts").is_none());
    }
}
