//! Per-target execution: the bounded-retry round executor, the attempt and
//! metadata records, and the orchestrator that sequences one target's run.

pub mod mirror;
pub mod orchestrator;
pub mod record;
pub mod retry;
pub mod round;

pub use orchestrator::{run_target, RunResult};
pub use record::{AdvisoryOutcome, AttemptRecord, ResultLog, RunMetadata};
pub use retry::{Backoff, RoundState};
pub use round::RoundExecutor;
