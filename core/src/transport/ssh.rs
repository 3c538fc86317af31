//! Session transport on top of the OpenSSH client.
//!
//! Connecting starts a control master (`ssh -M -S <socket> -N`) owned by the
//! session; every later command, upload, and append is a multiplexed client
//! on that socket, so authentication happens exactly once per session.
//! Password credentials go through `sshpass -e` with the secret in the
//! `SSHPASS` environment variable, never on the command line.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::process::{own_process_group, run_with_timeout, spawn_reader, terminate_group};
use super::{command_label, env_over_stdin, shell_quote, CommandOutput, Connector, Session};
use crate::config::{Credential, RunnerConfig, TargetConfig};
use crate::error::TransportError;

/// ssh's own exit status for connection and protocol failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
const READY_POLL: Duration = Duration::from_millis(100);

static SOCKET_SEQ: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// SshConnector
// ---------------------------------------------------------------------------

/// Production connector. Program names are configurable for unusual installs.
#[derive(Debug, Clone)]
pub struct SshConnector {
    pub ssh_program: PathBuf,
    pub sshpass_program: PathBuf,
    /// Directory for control sockets; must be short enough for `sun_path`.
    pub socket_dir: PathBuf,
}

impl Default for SshConnector {
    fn default() -> Self {
        SshConnector {
            ssh_program: PathBuf::from("ssh"),
            sshpass_program: PathBuf::from("sshpass"),
            socket_dir: std::env::temp_dir(),
        }
    }
}

impl SshConnector {
    fn control_path(&self, target: &TargetConfig) -> PathBuf {
        let seq = SOCKET_SEQ.fetch_add(1, Ordering::Relaxed);
        let name: String = target
            .name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(16)
            .collect();
        self.socket_dir
            .join(format!("sqlf-{}-{}-{}.sock", std::process::id(), seq, name))
    }

    /// Arguments for the control master, without the program name.
    pub fn master_args(
        &self,
        target: &TargetConfig,
        runner: &RunnerConfig,
        control_path: &str,
    ) -> Vec<String> {
        let mut args = vec![
            "-M".to_string(),
            "-S".to_string(),
            control_path.to_string(),
            "-N".to_string(),
            "-p".to_string(),
            target.ssh_port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", runner.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            format!("StrictHostKeyChecking={}", runner.host_key_policy.ssh_option()),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=4".to_string(),
        ];
        match &target.credential {
            Credential::Password(_) => {
                args.push("-o".to_string());
                args.push("PreferredAuthentications=password,keyboard-interactive".to_string());
                args.push("-o".to_string());
                args.push("NumberOfPasswordPrompts=1".to_string());
            }
            Credential::KeyFile(key) => {
                args.push("-o".to_string());
                args.push("BatchMode=yes".to_string());
                args.push("-o".to_string());
                args.push("IdentitiesOnly=yes".to_string());
                args.push("-i".to_string());
                args.push(key.display().to_string());
            }
            Credential::Agent => {
                args.push("-o".to_string());
                args.push("BatchMode=yes".to_string());
            }
        }
        args.push(target.user_at_host());
        args
    }

    fn master_command(&self, target: &TargetConfig, runner: &RunnerConfig, control_path: &str) -> Command {
        let args = self.master_args(target, runner, control_path);
        match target.credential.password() {
            Some(password) => {
                let mut cmd = Command::new(&self.sshpass_program);
                cmd.arg("-e").arg(&self.ssh_program).args(args);
                cmd.env("SSHPASS", password);
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.ssh_program);
                cmd.args(args);
                cmd
            }
        }
    }
}

impl Connector for SshConnector {
    fn connect(
        &self,
        target: &TargetConfig,
        runner: &RunnerConfig,
    ) -> Result<Box<dyn Session>, TransportError> {
        let endpoint = target.endpoint();
        let control = self.control_path(target);
        let control_str = control.display().to_string();

        let mut cmd = self.master_command(target, runner, &control_str);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        own_process_group(&mut cmd);

        debug!(target = %target.name, %endpoint, "starting ssh control master");
        let mut master = cmd.spawn().map_err(|e| TransportError::Connect {
            endpoint: endpoint.clone(),
            reason: format!("cannot start ssh: {}", e),
        })?;
        let stderr = spawn_reader(master.stderr.take());

        let mut session = SshSession {
            ssh_program: self.ssh_program.clone(),
            control_path: control,
            destination: target.user_at_host(),
            port: target.ssh_port,
            master: Some(master),
            master_stderr: stderr,
            closed: false,
        };

        let budget = runner.connect_timeout + runner.handshake_timeout;
        match session.wait_ready(budget) {
            Ok(()) => {
                debug!(target = %target.name, %endpoint, "ssh session ready");
                Ok(Box::new(session))
            }
            Err(reason) => {
                session.close();
                Err(TransportError::Connect { endpoint, reason })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SshSession
// ---------------------------------------------------------------------------

/// One authenticated control master plus the data needed to multiplex on it.
pub struct SshSession {
    ssh_program: PathBuf,
    control_path: PathBuf,
    destination: String,
    port: u16,
    master: Option<Child>,
    master_stderr: Option<JoinHandle<Vec<u8>>>,
    closed: bool,
}

impl SshSession {
    /// Arguments shared by every multiplexed client invocation.
    fn client_args(&self) -> Vec<String> {
        vec![
            "-S".to_string(),
            self.control_path.display().to_string(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            self.destination.clone(),
        ]
    }

    fn client(&self) -> Command {
        let mut cmd = Command::new(&self.ssh_program);
        cmd.args(self.client_args());
        cmd
    }

    fn control(&self, op: &str) -> Option<i32> {
        let mut cmd = Command::new(&self.ssh_program);
        cmd.arg("-S")
            .arg(&self.control_path)
            .arg("-O")
            .arg(op)
            .arg(&self.destination);
        run_with_timeout(cmd, None, CONTROL_TIMEOUT)
            .ok()
            .map(|out| out.exit_code)
    }

    /// Poll the control socket until the master is authenticated, the master
    /// dies, or `budget` runs out.
    fn wait_ready(&mut self, budget: Duration) -> Result<(), String> {
        let deadline = Instant::now() + budget;
        loop {
            let exited = match self.master.as_mut() {
                Some(child) => child.try_wait().map_err(|e| e.to_string())?,
                None => return Err("ssh master not running".into()),
            };
            if let Some(status) = exited {
                self.master = None;
                let stderr = self
                    .master_stderr
                    .take()
                    .and_then(|h| h.join().ok())
                    .unwrap_or_default();
                let text = String::from_utf8_lossy(&stderr);
                let reason = text
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .map(|l| l.trim().to_string())
                    .unwrap_or_else(|| format!("ssh exited with {}", status));
                return Err(reason);
            }
            if self.control("check") == Some(0) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "handshake not completed within {}s",
                    budget.as_secs()
                ));
            }
            thread::sleep(READY_POLL);
        }
    }

    fn transfer(&mut self, remote_cmd: &str, path: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let mut cmd = self.client();
        cmd.arg(remote_cmd);
        let out = run_with_timeout(cmd, Some(bytes), TRANSFER_TIMEOUT).map_err(|e| {
            TransportError::Transfer {
                path: path.to_string(),
                reason: e.to_string(),
            }
        })?;
        if out.exit_code != 0 {
            let stderr = out.stderr_lossy();
            let reason = if out.timed_out {
                format!("timed out after {}s", TRANSFER_TIMEOUT.as_secs())
            } else if stderr.trim().is_empty() {
                format!("exit status {}", out.exit_code)
            } else {
                stderr.trim().to_string()
            };
            return Err(TransportError::Transfer {
                path: path.to_string(),
                reason,
            });
        }
        Ok(())
    }
}

impl Session for SshSession {
    fn run(
        &mut self,
        command: &str,
        env: &[(&str, &str)],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let label = command_label(command);
        if self.closed {
            return Err(TransportError::Command {
                label,
                reason: "session is closed".into(),
            });
        }
        let (remote_cmd, input) = env_over_stdin(command, env, stdin).map_err(|reason| {
            TransportError::Command {
                label: label.clone(),
                reason,
            }
        })?;
        let mut cmd = self.client();
        cmd.arg(remote_cmd);
        debug!(command = %label, timeout_secs = timeout.as_secs(), "remote command");

        let out = run_with_timeout(cmd, input.as_deref(), timeout).map_err(|e| TransportError::Command {
            label: label.clone(),
            reason: e.to_string(),
        })?;
        if out.exit_code == SSH_TRANSPORT_EXIT {
            let stderr = out.stderr_lossy();
            return Err(TransportError::Command {
                label,
                reason: stderr.trim().to_string(),
            });
        }

        let mut stderr = out.stderr_lossy();
        if out.timed_out {
            stderr.push_str(&format!("\ncommand timed out after {}s", timeout.as_secs()));
        }
        Ok(CommandOutput {
            exit_code: out.exit_code,
            stdout: out.stdout_lossy(),
            stderr,
            elapsed: out.elapsed,
            timed_out: out.timed_out,
        })
    }

    fn make_dir(&mut self, path: &str) -> Result<(), TransportError> {
        let remote_cmd = format!("mkdir -p {}", shell_quote(path));
        self.transfer(&remote_cmd, path, b"")
    }

    fn upload(&mut self, bytes: &[u8], remote_path: &str) -> Result<(), TransportError> {
        let remote_cmd = format!("cat > {}", shell_quote(remote_path));
        self.transfer(&remote_cmd, remote_path, bytes)
    }

    fn append_text(&mut self, remote_path: &str, text: &str) -> Result<(), TransportError> {
        let remote_cmd = format!("cat >> {}", shell_quote(remote_path));
        self.transfer(&remote_cmd, remote_path, text.as_bytes())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.master.is_some() {
            let _ = self.control("exit");
        }
        if let Some(mut child) = self.master.take() {
            match child.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    if let Err(e) = terminate_group(&mut child) {
                        warn!(error = %e, "failed to stop ssh control master");
                    }
                }
            }
        }
        if let Some(handle) = self.master_stderr.take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.control_path);
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
