//! sqlfleet core: run a SQL script against a fleet of PostgreSQL hosts over
//! SSH, with per-round retries, timeout-bounded execution, and durable
//! per-attempt result logs on each host.

pub mod config;
pub mod error;
pub mod fleet;
pub mod runner;
pub mod script;
pub mod transport;

pub use config::{FleetConfig, RunnerConfig, TargetConfig};
pub use error::{ConfigError, RunError, TransportError};
pub use fleet::{run_fleet, FleetEntry, FleetReport};
pub use runner::{run_target, RunResult};
