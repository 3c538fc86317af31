//! Local copy of a finished run: `<dir>/<stamp>/<target>/{meta.json,results.json}`.

use std::fs;
use std::path::{Path, PathBuf};

use super::record::{AttemptRecord, RunMetadata};
use crate::error::{Result, RunError};

pub const LOCAL_RESULTS_FILE: &str = "results.json";
pub const LOCAL_META_FILE: &str = "meta.json";

/// Write `meta` and `records` under `base/stamp/target`, returning that
/// directory.
pub fn write_mirror(
    base: &Path,
    stamp: &str,
    meta: &RunMetadata,
    records: &[AttemptRecord],
) -> Result<PathBuf> {
    let dir = base.join(stamp).join(&meta.target);
    fs::create_dir_all(&dir).map_err(|source| RunError::Mirror {
        path: dir.clone(),
        source,
    })?;

    let results = serde_json::to_string_pretty(records).map_err(|source| RunError::Encode {
        what: "attempt records",
        source,
    })?;
    write_file(&dir.join(LOCAL_META_FILE), &meta.to_json_pretty()?)?;
    write_file(&dir.join(LOCAL_RESULTS_FILE), &results)?;
    Ok(dir)
}

fn write_file(path: &Path, text: &str) -> Result<()> {
    fs::write(path, text).map_err(|source| RunError::Mirror {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecMode, HostKeyPolicy};

    fn meta(target: &str) -> RunMetadata {
        RunMetadata {
            target: target.into(),
            address: "10.0.0.1".into(),
            ssh_port: 22,
            user: "postgres".into(),
            auth: "agent".into(),
            pg_port: 5432,
            script_path: "a.sql".into(),
            script_placeholder: false,
            psql_invocation: "psql".into(),
            mode: ExecMode::Wrapper,
            repeat: 1,
            retry: 0,
            statement_timeout_ms: 1000,
            lock_timeout_ms: 100,
            idle_in_transaction_timeout: "5min".into(),
            host_key_policy: HostKeyPolicy::Strict,
            run_dir: "/tmp/run_1".into(),
            started_at: "2026-10-19T10:00:00+00:00".into(),
            finished_at: "2026-10-19T10:00:01+00:00".into(),
            attempts: 1,
            checkpoint: None,
        }
    }

    #[test]
    fn writes_meta_and_results_under_stamp_and_target() {
        let tmp = tempfile::tempdir().unwrap();
        let records = vec![AttemptRecord {
            round: 1,
            attempt: 1,
            exit_code: 0,
            elapsed_sec: 0.5,
            stderr: String::new(),
        }];
        let dir = write_mirror(tmp.path(), "20261019-100001", &meta("pg20"), &records).unwrap();
        assert_eq!(dir, tmp.path().join("20261019-100001").join("pg20"));

        let meta_back: RunMetadata =
            serde_json::from_str(&fs::read_to_string(dir.join("meta.json")).unwrap()).unwrap();
        assert_eq!(meta_back.target, "pg20");
        let results_back: Vec<AttemptRecord> =
            serde_json::from_str(&fs::read_to_string(dir.join("results.json")).unwrap()).unwrap();
        assert_eq!(results_back, records);
    }

    #[test]
    fn unwritable_base_is_a_mirror_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let err = write_mirror(&blocker, "s", &meta("pg"), &[]).unwrap_err();
        assert_eq!(err.kind(), "mirror");
    }
}
