//! Session transport: authenticated command execution and file transfer on one
//! target host.
//!
//! `Connector` opens a `Session`; a `Session` runs commands and writes remote
//! files. `ssh::SshConnector` is the production implementation on top of the
//! OpenSSH client, `mock::MockConnector` the recording test double.
//!
//! A non-zero exit status of a remote program is a normal [`CommandOutput`];
//! only failures of the transport itself surface as [`TransportError`].

pub mod mock;
pub mod process;
pub mod ssh;

use std::time::Duration;

use crate::config::{RunnerConfig, TargetConfig};
use crate::error::TransportError;

/// Exit code reported when the outer timeout terminated a command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    /// Whether the outer timeout fired; `exit_code` is then
    /// [`TIMEOUT_EXIT_CODE`].
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An open, exclusively owned channel to one target.
///
/// `close` must be idempotent and safe after earlier failures. Implementations
/// also close on drop.
pub trait Session: Send {
    /// Run `command` through the remote shell. `env` pairs are exported to the
    /// command only and must never appear in an argument list; `stdin` is
    /// written to its standard input.
    fn run(
        &mut self,
        command: &str,
        env: &[(&str, &str)],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError>;

    /// Create `path` and its parents. Succeeds if it already exists.
    fn make_dir(&mut self, path: &str) -> Result<(), TransportError>;

    /// Write `bytes` to `remote_path`, replacing any previous content.
    fn upload(&mut self, bytes: &[u8], remote_path: &str) -> Result<(), TransportError>;

    /// Append `text` to `remote_path`, creating it when missing.
    fn append_text(&mut self, remote_path: &str, text: &str) -> Result<(), TransportError>;

    fn close(&mut self);
}

/// Opens sessions. Shared by all fleet workers, hence `Sync`.
pub trait Connector: Sync {
    fn connect(
        &self,
        target: &TargetConfig,
        runner: &RunnerConfig,
    ) -> Result<Box<dyn Session>, TransportError>;
}

/// Quote `s` as a single word for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Rewrite `command` so the remote shell reads each `env` value from a line
/// of standard input and exports it before running the command. Values never
/// appear in an argument list. Returns the command and its full stdin: the
/// value lines followed by `stdin`.
pub fn env_over_stdin(
    command: &str,
    env: &[(&str, &str)],
    stdin: Option<&[u8]>,
) -> Result<(String, Option<Vec<u8>>), String> {
    if env.is_empty() {
        return Ok((command.to_string(), stdin.map(<[u8]>::to_vec)));
    }
    let mut script = String::new();
    let mut input = Vec::new();
    for (key, value) in env {
        if !is_env_name(key) {
            return Err(format!("invalid environment variable name '{}'", key));
        }
        if value.contains('\n') {
            return Err(format!("value of {} contains a newline", key));
        }
        script.push_str(&format!("IFS= read -r {key} && export {key} && "));
        input.extend_from_slice(value.as_bytes());
        input.push(b'\n');
    }
    script.push_str(&format!("{{ {}\n}}", command));
    if let Some(bytes) = stdin {
        input.extend_from_slice(bytes);
    }
    Ok((script, Some(input)))
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Short, secret-free description of a command for logs and errors.
pub fn command_label(command: &str) -> String {
    const MAX: usize = 80;
    let single_line = command.lines().next().unwrap_or("");
    if single_line.chars().count() > MAX {
        let cut: String = single_line.chars().take(MAX).collect();
        format!("`{}...`", cut)
    } else {
        format!("`{}`", single_line)
    }
}

/// Join a remote directory and a file name with exactly one `/`.
pub fn remote_join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_words_are_not_quoted() {
        assert_eq!(shell_quote("/tmp/run_1/wrapper.sql"), "/tmp/run_1/wrapper.sql");
        assert_eq!(shell_quote("ON_ERROR_STOP=1"), "ON_ERROR_STOP=1");
    }

    #[test]
    fn special_characters_are_single_quoted() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn embedded_single_quotes_are_escaped() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn env_values_travel_on_stdin_not_in_command() {
        let (cmd, input) =
            env_over_stdin("psql --file=-", &[("PGPASSWORD", "p@ss word")], Some(b"SELECT 1;\n"))
                .unwrap();
        assert_eq!(
            cmd,
            "IFS= read -r PGPASSWORD && export PGPASSWORD && { psql --file=-\n}"
        );
        assert!(!cmd.contains("p@ss"));
        assert_eq!(input.unwrap(), b"p@ss word\nSELECT 1;\n".to_vec());
    }

    #[test]
    fn no_env_leaves_command_and_stdin_alone() {
        let (cmd, input) = env_over_stdin("ls", &[], None).unwrap();
        assert_eq!(cmd, "ls");
        assert!(input.is_none());
    }

    #[test]
    fn env_rejects_bad_names_and_multiline_values() {
        assert!(env_over_stdin("ls", &[("A B", "x")], None).is_err());
        assert!(env_over_stdin("ls", &[("PGPASSWORD", "a\nb")], None).is_err());
    }

    #[test]
    fn labels_are_truncated_to_first_line() {
        assert_eq!(command_label("mkdir -p /tmp/x\nrm -rf /"), "`mkdir -p /tmp/x`");
        let long = "x".repeat(200);
        let label = command_label(&long);
        assert!(label.ends_with("...`"));
        assert!(label.len() < 100);
    }

    #[test]
    fn remote_join_normalises_slashes() {
        assert_eq!(remote_join("/tmp/", "a.sql"), "/tmp/a.sql");
        assert_eq!(remote_join("/tmp", "a.sql"), "/tmp/a.sql");
    }
}
