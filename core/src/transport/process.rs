//! Local process execution with a wall-clock deadline.
//!
//! Every child is started in its own process group so that a timeout can
//! terminate the whole group (`sshpass` and the `ssh` it wraps), first with
//! SIGTERM and then SIGKILL.

use std::io::{self, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::TIMEOUT_EXIT_CODE;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const TERM_GRACE: Duration = Duration::from_millis(500);

/// Captured result of a local process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code, [`TIMEOUT_EXIT_CODE`] on timeout, `128 + signal` when killed
    /// by a signal.
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Put the child into a fresh process group when it starts.
pub fn own_process_group(cmd: &mut Command) {
    // SAFETY: setpgid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Run `cmd` to completion, feeding `stdin` and capturing stdout/stderr,
/// terminating its process group once `timeout` has elapsed.
pub fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> io::Result<ProcessOutput> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    own_process_group(&mut cmd);

    let started = Instant::now();
    let mut child = cmd.spawn()?;

    let writer = match (stdin, child.stdin.take()) {
        (Some(bytes), Some(mut pipe)) => {
            let data = bytes.to_vec();
            // A broken pipe just means the program stopped reading early.
            Some(thread::spawn(move || {
                let _ = pipe.write_all(&data);
            }))
        }
        _ => None,
    };
    let out_reader = spawn_reader(child.stdout.take());
    let err_reader = spawn_reader(child.stderr.take());

    let deadline = started + timeout;
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            timed_out = true;
            break terminate_group(&mut child)?;
        }
        thread::sleep(POLL_INTERVAL);
    };

    if let Some(handle) = writer {
        let _ = handle.join();
    }
    let stdout = join_reader(out_reader);
    let stderr = join_reader(err_reader);

    Ok(ProcessOutput {
        exit_code: exit_code(status, timed_out),
        stdout,
        stderr,
        elapsed: started.elapsed(),
        timed_out,
    })
}

/// SIGTERM the child's process group, then SIGKILL it if it has not exited
/// within a short grace period.
pub fn terminate_group(child: &mut Child) -> io::Result<ExitStatus> {
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    let grace_end = Instant::now() + TERM_GRACE;
    while Instant::now() < grace_end {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        thread::sleep(POLL_INTERVAL);
    }
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    child.wait()
}

/// Drain a pipe on a background thread.
pub fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut p| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = p.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn exit_code(status: ExitStatus, timed_out: bool) -> i32 {
    if timed_out {
        return TIMEOUT_EXIT_CODE;
    }
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let out = run_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
        )
        .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout_lossy(), "out\n");
        assert_eq!(out.stderr_lossy(), "err\n");
        assert!(!out.timed_out);
    }

    #[test]
    fn feeds_stdin() {
        let out = run_with_timeout(sh("cat"), Some(b"SELECT 1;\n"), Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout_lossy(), "SELECT 1;\n");
    }

    #[test]
    fn timeout_kills_the_process_group() {
        let started = Instant::now();
        let out = run_with_timeout(sh("sleep 30; echo never"), None, Duration::from_millis(200))
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(out.stdout.is_empty());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn spawn_failure_is_an_io_error() {
        let cmd = Command::new("/nonexistent/definitely-not-a-program");
        assert!(run_with_timeout(cmd, None, Duration::from_secs(1)).is_err());
    }
}
