//! Building remote SQL client command lines.

use crate::config::TargetConfig;
use crate::transport::shell_quote;

/// Flags that make psql non-interactive and stop at the first error.
pub const PSQL_ARGS: &str = "-X -q -At -v ON_ERROR_STOP=1 -P pager=off";

/// The target's invocation with the fixed flags and, when it names no port,
/// the target's SQL port.
pub fn base_command(target: &TargetConfig) -> String {
    let mut cmd = target.psql_invocation.trim().to_string();
    if !has_port_flag(&cmd) {
        cmd.push_str(&format!(" -p {}", target.pg_port));
    }
    if !cmd.contains(PSQL_ARGS) {
        cmd.push(' ');
        cmd.push_str(PSQL_ARGS);
    }
    cmd
}

/// Run a file: `<base> --file=<path>`.
pub fn file_command(target: &TargetConfig, remote_file: &str) -> String {
    format!("{} --file={}", base_command(target), shell_quote(remote_file))
}

/// Read the script from standard input.
pub fn stdin_command(target: &TargetConfig) -> String {
    format!("{} --file=-", base_command(target))
}

/// A single `CHECKPOINT` statement.
pub fn checkpoint_command(target: &TargetConfig) -> String {
    format!("{} -c {}", base_command(target), shell_quote("CHECKPOINT"))
}

/// Environment for the SQL client: the SSH password doubles as `PGPASSWORD`.
pub fn client_env(target: &TargetConfig) -> Vec<(&'static str, &str)> {
    match target.credential.password() {
        Some(pw) => vec![("PGPASSWORD", pw)],
        None => Vec::new(),
    }
}

fn has_port_flag(cmd: &str) -> bool {
    cmd.split_whitespace().any(|w| {
        if w == "-p" || w == "--port" || w.starts_with("--port=") {
            return true;
        }
        // attached form, e.g. `-p5432`
        match w.strip_prefix("-p") {
            Some(rest) => !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()),
            None => false,
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
