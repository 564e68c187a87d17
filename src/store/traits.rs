//! Unified `Database` trait: single async interface for the solution store
//! and the task ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::swarm::model::{
    AggregationSource, Agent, AgentSummary, LevelCount, Problem, ProblemPhase, Solution, Task,
};

/// Counters shown alongside the active problem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemStats {
    pub l1_solutions: u64,
    pub total_aggregations: u64,
    pub participating_agents: u64,
    pub highest_level: u32,
}

/// Result of an atomic batch claim.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// Task created and every source claimed. The task's `is_final` may have
    /// been downgraded if another final task was already in flight.
    Claimed(Task),
    /// At least one source was claimed concurrently. Nothing was written.
    Contended,
}

/// Result of closing a task with its output solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Completed,
    /// The task was no longer in progress. Nothing was written.
    NotInProgress,
    /// The task's problem is no longer the active one. Nothing was written.
    ProblemInactive,
}

/// Filter for solution listings.
#[derive(Debug, Clone, Default)]
pub struct SolutionFilter {
    /// Exact level.
    pub level: Option<u32>,
    /// Only levels strictly above this one.
    pub above_level: Option<u32>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Backend-agnostic database trait covering problems, agents, solutions and tasks.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Problems ────────────────────────────────────────────────────

    /// Insert a problem and make it the active one, atomically replacing the
    /// previous active problem.
    async fn create_problem(&self, problem: &Problem) -> Result<Problem, DatabaseError>;

    async fn get_problem(&self, id: Uuid) -> Result<Option<Problem>, DatabaseError>;

    /// The single active problem, if any.
    async fn get_active_problem(&self) -> Result<Option<Problem>, DatabaseError>;

    async fn is_problem_active(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Returns false if the problem does not exist.
    async fn update_problem_phase(
        &self,
        id: Uuid,
        phase: ProblemPhase,
    ) -> Result<bool, DatabaseError>;

    async fn problem_stats(&self, id: Uuid) -> Result<ProblemStats, DatabaseError>;

    // ── Agents ──────────────────────────────────────────────────────

    /// Insert an agent. A taken name yields `DatabaseError::Constraint`.
    async fn insert_agent(&self, agent: &Agent) -> Result<(), DatabaseError>;

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, DatabaseError>;

    async fn get_agent_by_api_key(&self, api_key: &str) -> Result<Option<Agent>, DatabaseError>;

    /// Stamp `last_active_at`.
    async fn touch_agent(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn list_agents(&self) -> Result<Vec<AgentSummary>, DatabaseError>;

    /// (solutions submitted, tasks completed) for one agent.
    async fn agent_stats(&self, id: Uuid) -> Result<(u64, u64), DatabaseError>;

    // ── Solutions ───────────────────────────────────────────────────

    async fn get_solution(&self, id: Uuid) -> Result<Option<Solution>, DatabaseError>;

    /// Solutions for the given ids, in the order of `ids`. Unknown ids are skipped.
    async fn get_solutions_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Solution>, DatabaseError>;

    /// Problem solutions matching `filter`, newest first.
    async fn list_solutions(
        &self,
        problem_id: Uuid,
        filter: &SolutionFilter,
    ) -> Result<Vec<Solution>, DatabaseError>;

    async fn count_solutions(
        &self,
        problem_id: Uuid,
        filter: &SolutionFilter,
    ) -> Result<u64, DatabaseError>;

    /// Solution counts per level, all states, ascending.
    async fn level_counts(&self, problem_id: Uuid) -> Result<Vec<LevelCount>, DatabaseError>;

    /// Unclaimed solution counts per level, ascending.
    async fn unclaimed_level_counts(
        &self,
        problem_id: Uuid,
    ) -> Result<Vec<LevelCount>, DatabaseError>;

    /// Up to `limit` unclaimed solutions at `level` not authored by
    /// `exclude_agent`, oldest first.
    async fn select_batch(
        &self,
        problem_id: Uuid,
        level: u32,
        exclude_agent: Uuid,
        limit: usize,
    ) -> Result<Vec<AggregationSource>, DatabaseError>;

    /// Sources for a batch, in the order of `ids`.
    async fn get_aggregation_sources(
        &self,
        ids: &[Uuid],
    ) -> Result<Vec<AggregationSource>, DatabaseError>;

    async fn get_final_solution(&self, problem_id: Uuid) -> Result<Option<Solution>, DatabaseError>;

    /// The most recent solution at the highest level.
    async fn get_highest_level_solution(
        &self,
        problem_id: Uuid,
    ) -> Result<Option<Solution>, DatabaseError>;

    /// Agent display names keyed by agent id, for the given agents.
    async fn agent_names(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, String)>, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    async fn find_in_progress_task(
        &self,
        agent_id: Uuid,
        problem_id: Uuid,
    ) -> Result<Option<Task>, DatabaseError>;

    /// Insert a task with no claims. A second in-progress task for the same
    /// (agent, problem) yields `DatabaseError::Constraint`.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Atomically insert an aggregate task and claim its sources.
    ///
    /// Only sources still unclaimed are claimed. If any was taken the whole
    /// unit is rolled back and `Contended` is returned.
    async fn claim_batch(&self, task: &Task) -> Result<ClaimOutcome, DatabaseError>;

    /// Atomically insert `solution`, resolve every claim held by the task
    /// into an aggregation link, and mark the task completed.
    async fn complete_task(
        &self,
        task_id: Uuid,
        solution: &Solution,
    ) -> Result<CompletionOutcome, DatabaseError>;

    /// Expire in-progress tasks created before `cutoff` and release their
    /// claims. Returns the number of tasks expired.
    async fn expire_stale_tasks(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError>;
}
