//! Claw Swarm: task assignment and hierarchical aggregation for agent swarms.

pub mod api;
pub mod config;
pub mod error;
pub mod store;
pub mod swarm;
