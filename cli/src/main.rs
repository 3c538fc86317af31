//! sqlfleet: run a SQL script against every configured PostgreSQL host.
//!
//! # Usage
//!
//! ```text
//! sqlfleet run --config fleet.yaml
//! sqlfleet run --target pg20 --target pg21 --parallelism 2 -v
//! sqlfleet check
//! sqlfleet split queries/modify_20.sql
//! ```
//!
//! `run` prints the fleet report as JSON on stdout and exits 1 when any target
//! failed. Configuration problems exit 2.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use sqlfleet_core::config::{self, FleetConfig};
use sqlfleet_core::error::ConfigError;
use sqlfleet_core::fleet::{effective_workers, run_fleet};
use sqlfleet_core::script::stage::{remote_script_name, wrapper_text};
use sqlfleet_core::script::{psql, split_statements};
use sqlfleet_core::transport::ssh::SshConnector;
use sqlfleet_core::transport::remote_join;

const LOG_ENV: &str = "SQLFLEET_LOG";

#[derive(Parser, Debug)]
#[command(name = "sqlfleet", version, about = "Run a SQL script on a fleet of PostgreSQL hosts over SSH")]
struct Cli {
    /// Log at debug level unless SQLFLEET_LOG or RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute the script on the selected targets
    Run {
        #[command(flatten)]
        selection: Selection,

        /// Concurrent targets; 0 means all at once. Overrides the config.
        #[arg(short, long)]
        parallelism: Option<usize>,
    },

    /// Validate the configuration and show the plan without connecting
    Check {
        #[command(flatten)]
        selection: Selection,
    },

    /// Print the statements a script splits into
    Split {
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
struct Selection {
    /// Configuration file (default: $SQLFLEET_CONF, then ./sqlfleet.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only these targets; repeatable
    #[arg(short, long = "target")]
    targets: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("sqlfleet: {e:#}");
            if e.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn dispatch(command: Command) -> Result<ExitCode> {
    match command {
        Command::Run {
            selection,
            parallelism,
        } => cmd_run(&selection, parallelism),
        Command::Check { selection } => cmd_check(&selection),
        Command::Split { file } => cmd_split(&file),
    }
}

fn load(selection: &Selection) -> Result<FleetConfig> {
    let path = config::discover(selection.config.as_deref())?;
    debug!(path = %path.display(), "loading config");
    let fleet = config::load_file(&path)?.select(&selection.targets)?;
    Ok(fleet)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_run(selection: &Selection, parallelism: Option<usize>) -> Result<ExitCode> {
    let fleet = load(selection)?;
    let parallelism = parallelism.unwrap_or(fleet.runner.parallelism);

    let connector = SshConnector::default();
    let report = run_fleet(&connector, &fleet.targets, &fleet.runner, parallelism);

    println!("{}", report.to_json_pretty().context("encoding fleet report")?);
    Ok(if report.has_failures() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn cmd_check(selection: &Selection) -> Result<ExitCode> {
    let fleet = load(selection)?;
    let runner = &fleet.runner;

    println!(
        "{} target(s), {} worker(s), mode {}, repeat {}, retry {}, host keys {}",
        fleet.targets.len(),
        effective_workers(runner.parallelism, fleet.targets.len()),
        runner.mode,
        runner.repeat,
        runner.retry,
        runner.host_key_policy.ssh_option(),
    );

    for target in &fleet.targets {
        let run_dir = remote_join(runner.remote_base_dir(target), "run_<stamp>");
        let script = remote_join(&run_dir, &remote_script_name(&target.script_path));
        let found = if target.script_path.exists() {
            "found"
        } else {
            "MISSING"
        };

        println!();
        println!("[{}] {} as {} ({})", target.name, target.endpoint(), target.user, target.credential.describe());
        println!("  script:  {} ({})", target.script_path.display(), found);
        println!("  command: {}", psql::file_command(target, &remote_join(&run_dir, "wrapper.sql")));
        if let Some(close) = &target.close_command {
            println!("  close:   {}", close);
        }
        println!("  wrapper:");
        for line in wrapper_text(runner, &script).lines() {
            println!("    {}", line);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_split(file: &Path) -> Result<ExitCode> {
    let sql = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let statements = split_statements(&sql);
    for (i, stmt) in statements.iter().enumerate() {
        println!("-- [{}]", i + 1);
        println!("{};", stmt);
    }
    debug!(count = statements.len(), "split complete");
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_repeated_targets() {
        let cli = Cli::try_parse_from([
            "sqlfleet", "run", "-t", "pg20", "--target", "pg21", "-p", "2", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Run {
                selection,
                parallelism,
            } => {
                assert_eq!(selection.targets, vec!["pg20", "pg21"]);
                assert_eq!(parallelism, Some(2));
                assert!(selection.config.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn check_takes_config_path() {
        let cli = Cli::try_parse_from(["sqlfleet", "check", "--config", "fleet.yaml"]).unwrap();
        match cli.command {
            Command::Check { selection } => {
                assert_eq!(selection.config, Some(PathBuf::from("fleet.yaml")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn missing_config_maps_to_config_error() {
        let selection = Selection {
            config: Some(PathBuf::from("/nonexistent/sqlfleet.yaml")),
            targets: Vec::new(),
        };
        let err = load(&selection).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }
}
