//! Swarm engine: task assignment and hierarchical aggregation.
//!
//! Agents poll [`TaskAssigner::get_next_task`] and post results through
//! [`ResultSubmission::submit_result`]. All coordination state lives in the
//! store, so any number of handlers may run concurrently.

pub mod assigner;
pub mod convergence;
pub mod instructions;
pub mod model;
pub mod planner;
pub mod reclaim;
pub mod submission;

#[cfg(test)]
pub(crate) mod test_support;

pub use assigner::TaskAssigner;
pub use convergence::{ConvergenceState, convergence_state};
pub use instructions::{DefaultInstructions, InstructionProvider};
pub use planner::AggregationPlanner;
pub use submission::ResultSubmission;
