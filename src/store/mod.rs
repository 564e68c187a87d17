//! Persistence layer: libSQL-backed storage for problems, agents,
//! solutions, and the task ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ClaimOutcome, CompletionOutcome, Database, ProblemStats, SolutionFilter};
