//! Everything about the SQL script itself: building client command lines,
//! staging the script with its timeout wrapper, and statement splitting.

pub mod psql;
pub mod split;
pub mod stage;

pub use split::split_statements;
pub use stage::{stage, StagedScript};
