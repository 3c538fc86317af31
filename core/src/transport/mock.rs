//! Recording test double for the session transport.
//!
//! A `MockHost` stands in for one remote machine: it keeps an in-memory file
//! system, records every command, and answers commands with scripted replies.
//! `MockConnector` maps target names to hosts (or to connection failures),
//! which makes orchestrator and fleet scenarios deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{CommandOutput, Connector, Session, TIMEOUT_EXIT_CODE};
use crate::config::{RunnerConfig, TargetConfig};
use crate::error::TransportError;

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// A scripted answer to a remote command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The remote program exited with this code and stderr.
    Exit { code: i32, stderr: String },
    /// The outer timeout fired.
    Timeout,
    /// The transport failed to dispatch the command.
    Dispatch(String),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Exit {
            code: 0,
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Reply::Exit {
            code,
            stderr: stderr.to_string(),
        }
    }
}

/// A command as the mock host received it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedCommand {
    pub command: String,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub timeout: Duration,
}

// ---------------------------------------------------------------------------
// MockHost
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct HostState {
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    commands: Vec<ExecutedCommand>,
    /// Scripted replies, matched by substring in registration order.
    replies: Vec<(String, VecDeque<Reply>)>,
    /// Paths whose writes fail.
    failing_paths: Vec<String>,
    sessions_opened: u32,
    sessions_closed: u32,
}

/// Shared handle to one simulated remote machine.
#[derive(Debug, Clone, Default)]
pub struct MockHost {
    state: Arc<Mutex<HostState>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        // A panicking test thread must not hide the host's state from others.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Answer commands containing `pattern` with `replies`, in order. Once the
    /// replies are used up, matching commands succeed.
    pub fn reply_to(&self, pattern: &str, replies: Vec<Reply>) {
        self.lock()
            .replies
            .push((pattern.to_string(), replies.into_iter().collect()));
    }

    /// Make uploads and appends to paths containing `pattern` fail.
    pub fn fail_writes_to(&self, pattern: &str) {
        self.lock().failing_paths.push(pattern.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    /// Paths of all files, sorted.
    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn dirs(&self) -> Vec<String> {
        self.lock().dirs.iter().cloned().collect()
    }

    pub fn commands(&self) -> Vec<ExecutedCommand> {
        self.lock().commands.clone()
    }

    /// Commands whose text contains `pattern`.
    pub fn commands_matching(&self, pattern: &str) -> Vec<ExecutedCommand> {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.command.contains(pattern))
            .cloned()
            .collect()
    }

    pub fn sessions_opened(&self) -> u32 {
        self.lock().sessions_opened
    }

    pub fn sessions_closed(&self) -> u32 {
        self.lock().sessions_closed
    }

    fn next_reply(state: &mut HostState, command: &str) -> Reply {
        for (pattern, queue) in state.replies.iter_mut() {
            if command.contains(pattern.as_str()) {
                return queue.pop_front().unwrap_or_else(Reply::ok);
            }
        }
        Reply::ok()
    }

    fn check_writable(state: &HostState, path: &str) -> Result<(), TransportError> {
        if state.failing_paths.iter().any(|p| path.contains(p.as_str())) {
            return Err(TransportError::Transfer {
                path: path.to_string(),
                reason: "mock: write refused".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockSession
// ---------------------------------------------------------------------------

/// A session on a [`MockHost`].
pub struct MockSession {
    host: MockHost,
    closed: bool,
}

impl MockSession {
    pub fn new(host: MockHost) -> Self {
        host.lock().sessions_opened += 1;
        MockSession {
            host,
            closed: false,
        }
    }

    fn ensure_open(&self, what: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Command {
                label: what.to_string(),
                reason: "session is closed".into(),
            });
        }
        Ok(())
    }
}

impl Session for MockSession {
    fn run(
        &mut self,
        command: &str,
        env: &[(&str, &str)],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        self.ensure_open(command)?;
        let mut state = self.host.lock();
        state.commands.push(ExecutedCommand {
            command: command.to_string(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            stdin: stdin.map(|b| String::from_utf8_lossy(b).into_owned()),
            timeout,
        });
        match MockHost::next_reply(&mut state, command) {
            Reply::Exit { code, stderr } => Ok(CommandOutput {
                exit_code: code,
                stdout: String::new(),
                stderr,
                elapsed: Duration::from_millis(5),
                timed_out: false,
            }),
            Reply::Timeout => Ok(CommandOutput {
                exit_code: TIMEOUT_EXIT_CODE,
                stdout: String::new(),
                stderr: format!("command timed out after {}s", timeout.as_secs()),
                elapsed: timeout,
                timed_out: true,
            }),
            Reply::Dispatch(reason) => Err(TransportError::Command {
                label: command.to_string(),
                reason,
            }),
        }
    }

    fn make_dir(&mut self, path: &str) -> Result<(), TransportError> {
        self.ensure_open("mkdir")?;
        let mut state = self.host.lock();
        MockHost::check_writable(&state, path)?;
        state.dirs.insert(path.to_string());
        Ok(())
    }

    fn upload(&mut self, bytes: &[u8], remote_path: &str) -> Result<(), TransportError> {
        self.ensure_open("upload")?;
        let mut state = self.host.lock();
        MockHost::check_writable(&state, remote_path)?;
        state.files.insert(
            remote_path.to_string(),
            String::from_utf8_lossy(bytes).into_owned(),
        );
        Ok(())
    }

    fn append_text(&mut self, remote_path: &str, text: &str) -> Result<(), TransportError> {
        self.ensure_open("append")?;
        let mut state = self.host.lock();
        MockHost::check_writable(&state, remote_path)?;
        state
            .files
            .entry(remote_path.to_string())
            .or_default()
            .push_str(text);
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.host.lock().sessions_closed += 1;
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// MockConnector
// ---------------------------------------------------------------------------

/// Connects targets by name to mock hosts.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    hosts: HashMap<String, MockHost>,
    refused: HashMap<String, String>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reachable host for `target`, returning its handle.
    pub fn host(&mut self, target: &str) -> MockHost {
        self.hosts
            .entry(target.to_string())
            .or_insert_with(MockHost::new)
            .clone()
    }

    /// Make connecting to `target` fail with `reason`.
    pub fn refuse(&mut self, target: &str, reason: &str) {
        self.refused.insert(target.to_string(), reason.to_string());
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        target: &TargetConfig,
        _runner: &RunnerConfig,
    ) -> Result<Box<dyn Session>, TransportError> {
        if let Some(reason) = self.refused.get(&target.name) {
            return Err(TransportError::Connect {
                endpoint: target.endpoint(),
                reason: reason.clone(),
            });
        }
        match self.hosts.get(&target.name) {
            Some(host) => Ok(Box::new(MockSession::new(host.clone()))),
            None => Err(TransportError::Connect {
                endpoint: target.endpoint(),
                reason: "mock: no route to host".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
