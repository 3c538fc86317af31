//! Loading and validating the fleet configuration file.
//!
//! The file is YAML with a `runner:` section and a `targets:` list. Raw serde
//! structs mirror the file; `validate` turns them into the immutable
//! [`RunnerConfig`] and [`TargetConfig`] records or reports the first problem.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::{
    Credential, ExecMode, HostKeyPolicy, MissingScriptPolicy, RunnerConfig, TargetConfig,
};
use crate::error::ConfigError;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "SQLFLEET_CONF";

/// File looked up in the working directory as a last resort.
pub const DEFAULT_CONFIG_FILE: &str = "sqlfleet.yaml";

/// A validated configuration: shared runner settings plus the target list.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub runner: RunnerConfig,
    pub targets: Vec<TargetConfig>,
}

impl FleetConfig {
    /// Keep only the named targets, in configuration order. An empty list
    /// keeps everything.
    pub fn select(mut self, names: &[String]) -> Result<FleetConfig, ConfigError> {
        if names.is_empty() {
            return Ok(self);
        }
        for name in names {
            if !self.targets.iter().any(|t| &t.name == name) {
                return Err(ConfigError::Invalid(format!("unknown target '{}'", name)));
            }
        }
        self.targets.retain(|t| names.contains(&t.name));
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Raw file shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    #[serde(default)]
    runner: RawRunner,
    #[serde(default)]
    targets: Vec<RawTarget>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawRunner {
    repeat: u32,
    retry: u32,
    connect_timeout_secs: u64,
    handshake_timeout_secs: u64,
    statement_timeout_ms: u64,
    lock_timeout_ms: u64,
    remote_tmp_dir: String,
    pre_checkpoint: bool,
    save_local: bool,
    local_mirror_dir: PathBuf,
    host_key_policy: Option<HostKeyPolicy>,
    parallelism: usize,
    mode: ExecMode,
    missing_script: MissingScriptPolicy,
    backoff_step_secs: u64,
    backoff_cap_secs: u64,
}

impl Default for RawRunner {
    fn default() -> Self {
        RawRunner {
            repeat: 2,
            retry: 2,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            statement_timeout_ms: 300_000,
            lock_timeout_ms: 5_000,
            remote_tmp_dir: "/tmp".into(),
            pre_checkpoint: false,
            save_local: false,
            local_mirror_dir: PathBuf::from("runs"),
            host_key_policy: None,
            parallelism: 1,
            mode: ExecMode::Wrapper,
            missing_script: MissingScriptPolicy::Placeholder,
            backoff_step_secs: 2,
            backoff_cap_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTarget {
    name: String,
    address: String,
    #[serde(default = "default_ssh_port")]
    ssh_port: u16,
    user: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    password_env: Option<String>,
    #[serde(default)]
    key_file: Option<PathBuf>,
    #[serde(default = "default_pg_port")]
    pg_port: u16,
    script_path: PathBuf,
    #[serde(default = "default_psql")]
    psql_invocation: String,
    #[serde(default)]
    close_command: Option<String>,
    #[serde(default)]
    remote_tmp_dir: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_pg_port() -> u16 {
    5432
}

fn default_psql() -> String {
    "psql".into()
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Resolve which config file to use: the explicit path, then `SQLFLEET_CONF`,
/// then `./sqlfleet.yaml`.
pub fn discover(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return Ok(local);
    }
    Err(ConfigError::NotFound)
}

/// Read and validate a config file.
pub fn load_file(path: &Path) -> Result<FleetConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawFile = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate(raw)
}

/// Parse and validate a config held in memory.
pub fn parse_str(content: &str) -> Result<FleetConfig, ConfigError> {
    let raw: RawFile = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
        path: PathBuf::from("<inline>"),
        source,
    })?;
    validate(raw)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(raw: RawFile) -> Result<FleetConfig, ConfigError> {
    let runner = validate_runner(raw.runner)?;

    if raw.targets.is_empty() {
        return Err(ConfigError::Invalid("no targets configured".into()));
    }

    let mut names = HashSet::new();
    let mut endpoints = HashSet::new();
    let mut targets = Vec::with_capacity(raw.targets.len());
    for rt in raw.targets {
        let target = validate_target(rt)?;
        if !names.insert(target.name.clone()) {
            return Err(ConfigError::target(&target.name, "duplicate target name"));
        }
        if !endpoints.insert(target.endpoint()) {
            return Err(ConfigError::target(
                &target.name,
                format!("endpoint {} already used by another target", target.endpoint()),
            ));
        }
        targets.push(target);
    }

    Ok(FleetConfig { runner, targets })
}

fn validate_runner(r: RawRunner) -> Result<RunnerConfig, ConfigError> {
    if r.repeat < 1 {
        return Err(ConfigError::Invalid("runner.repeat must be at least 1".into()));
    }
    if r.statement_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "runner.statement_timeout_ms must be positive".into(),
        ));
    }
    if r.backoff_cap_secs < r.backoff_step_secs {
        return Err(ConfigError::Invalid(
            "runner.backoff_cap_secs must not be below backoff_step_secs".into(),
        ));
    }
    if r.remote_tmp_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("runner.remote_tmp_dir is empty".into()));
    }
    let host_key_policy = r.host_key_policy.ok_or_else(|| {
        ConfigError::Invalid(
            "runner.host_key_policy must be set explicitly (strict or accept-new)".into(),
        )
    })?;

    Ok(RunnerConfig {
        repeat: r.repeat,
        retry: r.retry,
        connect_timeout: Duration::from_secs(r.connect_timeout_secs),
        handshake_timeout: Duration::from_secs(r.handshake_timeout_secs),
        statement_timeout_ms: r.statement_timeout_ms,
        lock_timeout_ms: r.lock_timeout_ms,
        remote_tmp_dir: r.remote_tmp_dir,
        pre_checkpoint: r.pre_checkpoint,
        save_local: r.save_local,
        local_mirror_dir: r.local_mirror_dir,
        host_key_policy,
        parallelism: r.parallelism,
        mode: r.mode,
        missing_script: r.missing_script,
        backoff_step: Duration::from_secs(r.backoff_step_secs),
        backoff_cap: Duration::from_secs(r.backoff_cap_secs),
    })
}

fn validate_target(rt: RawTarget) -> Result<TargetConfig, ConfigError> {
    let name = rt.name.trim().to_string();
    if name.is_empty() {
        return Err(ConfigError::Invalid("target with empty name".into()));
    }
    if rt.address.trim().is_empty() {
        return Err(ConfigError::target(&name, "address is empty"));
    }
    if rt.ssh_port == 0 {
        return Err(ConfigError::target(&name, "ssh_port must not be 0"));
    }
    if rt.user.trim().is_empty() {
        return Err(ConfigError::target(&name, "user is empty"));
    }
    if rt.psql_invocation.trim().is_empty() {
        return Err(ConfigError::target(&name, "psql_invocation is empty"));
    }

    let sources = [rt.password.is_some(), rt.password_env.is_some(), rt.key_file.is_some()]
        .iter()
        .filter(|set| **set)
        .count();
    if sources > 1 {
        return Err(ConfigError::target(
            &name,
            "set at most one of password, password_env, key_file",
        ));
    }
    let credential = if let Some(pw) = rt.password {
        Credential::Password(pw)
    } else if let Some(var) = rt.password_env {
        let pw = std::env::var(&var).map_err(|_| {
            ConfigError::target(&name, format!("password_env '{}' is not set", var))
        })?;
        Credential::Password(pw)
    } else if let Some(key) = rt.key_file {
        Credential::KeyFile(expand_home(&key))
    } else {
        Credential::Agent
    };

    Ok(TargetConfig {
        name,
        address: rt.address.trim().to_string(),
        ssh_port: rt.ssh_port,
        user: rt.user.trim().to_string(),
        credential,
        pg_port: rt.pg_port,
        script_path: expand_home(&rt.script_path),
        psql_invocation: rt.psql_invocation.trim().to_string(),
        close_command: rt.close_command.filter(|c| !c.trim().is_empty()),
        remote_tmp_dir: rt.remote_tmp_dir.filter(|d| !d.trim().is_empty()),
    })
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(rest),
            Err(_) => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
