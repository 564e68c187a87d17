//! Swarm data model: problems, agents, solutions, tasks, and assignments.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Problems ────────────────────────────────────────────────────────────

/// Advisory lifecycle phase. Never enforced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemPhase {
    #[default]
    Collecting,
    Aggregating,
    Finalized,
}

impl std::fmt::Display for ProblemPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Collecting => write!(f, "collecting"),
            Self::Aggregating => write!(f, "aggregating"),
            Self::Finalized => write!(f, "finalized"),
        }
    }
}

impl std::str::FromStr for ProblemPhase {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collecting" => Ok(Self::Collecting),
            "aggregating" => Ok(Self::Aggregating),
            "finalized" => Ok(Self::Finalized),
            _ => Err(format!("Unknown phase: {}", s)),
        }
    }
}

/// An open problem the swarm works on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: Uuid,
    pub title: String,
    pub statement: String,
    pub hints: Vec<String>,
    pub phase: ProblemPhase,
    /// Derived from the active-problem pointer when read from the store.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Problem {
    pub fn new(title: impl Into<String>, statement: impl Into<String>, hints: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            statement: statement.into(),
            hints,
            phase: ProblemPhase::Collecting,
            is_active: false,
            created_at: Utc::now(),
        }
    }

    pub fn brief(&self) -> ProblemBrief {
        ProblemBrief {
            id: self.id,
            title: self.title.clone(),
            statement: self.statement.clone(),
            hints: self.hints.clone(),
        }
    }
}

/// The slice of a problem handed to agents with every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemBrief {
    pub id: Uuid,
    pub title: String,
    pub statement: String,
    pub hints: Vec<String>,
}

// ── Agents ──────────────────────────────────────────────────────────────

/// A registered worker.
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub api_key: SecretString,
    pub created_at: DateTime<Utc>,
    pub last_active_at: Option<DateTime<Utc>>,
}

impl Agent {
    /// Create an agent with a fresh API key carrying `key_prefix`.
    pub fn new(name: impl Into<String>, description: Option<String>, key_prefix: &str) -> Self {
        let api_key = format!("{key_prefix}{}", Uuid::new_v4().simple());
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description,
            api_key: SecretString::from(api_key),
            created_at: Utc::now(),
            last_active_at: None,
        }
    }
}

/// Public agent listing entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub solution_count: u64,
}

// ── Solutions ───────────────────────────────────────────────────────────

/// Where a solution stands as an aggregation source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceState {
    /// Available for the next batch.
    Unclaimed,
    /// Reserved by an in-progress aggregate task.
    ClaimedBy(Uuid),
    /// Consumed by a higher-level synthesis.
    Aggregated {
        solution_id: Uuid,
        at: DateTime<Utc>,
    },
}

impl SourceState {
    pub fn is_unclaimed(&self) -> bool {
        matches!(self, Self::Unclaimed)
    }

    /// The solution that consumed this one, once the claim is resolved.
    pub fn aggregated_into(&self) -> Option<Uuid> {
        match self {
            Self::Aggregated { solution_id, .. } => Some(*solution_id),
            _ => None,
        }
    }

    pub fn claimed_by(&self) -> Option<Uuid> {
        match self {
            Self::ClaimedBy(task_id) => Some(*task_id),
            _ => None,
        }
    }
}

/// A solve or synthesis output.
#[derive(Debug, Clone)]
pub struct Solution {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub problem_id: Uuid,
    /// 1 = raw solve, L > 1 = synthesis of level L-1 items.
    pub level: u32,
    pub content: String,
    pub answer: Option<String>,
    pub confidence: Option<Confidence>,
    pub parent_ids: Vec<Uuid>,
    pub state: SourceState,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

/// Confidence in `[0, 1]`.
///
/// Only constructible by clamping, so an out-of-range value can never reach
/// the store.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Confidence(f64);

impl Confidence {
    /// Clamp into `[0, 1]`. NaN carries no information and yields `None`.
    pub fn clamped(value: f64) -> Option<Self> {
        if value.is_nan() {
            None
        } else {
            Some(Self(value.clamp(0.0, 1.0)))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

/// A solution as presented to an aggregating agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationSource {
    pub id: Uuid,
    pub content: String,
    pub answer: Option<String>,
    pub confidence: Option<Confidence>,
    pub agent_name: String,
    pub level: u32,
}

/// Unclaimed solution count at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LevelCount {
    pub level: u32,
    pub count: usize,
}

// ── Tasks ───────────────────────────────────────────────────────────────

/// What the agent is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Solve,
    Aggregate,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Solve => write!(f, "solve"),
            Self::Aggregate => write!(f, "aggregate"),
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "solve" => Ok(Self::Solve),
            "aggregate" => Ok(Self::Aggregate),
            _ => Err(format!("Unknown task type: {}", s)),
        }
    }
}

/// Task lifecycle. `InProgress` moves to exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Completed,
    /// Lease ran out before a result arrived; claims were released.
    Expired,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Aggregate-task payload. Empty for solve tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(default)]
    pub source_ids: Vec<Uuid>,
    #[serde(default)]
    pub is_final: bool,
}

/// An assignment unit in the task ledger.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub problem_id: Uuid,
    pub kind: TaskKind,
    /// Target level of the synthesis. Aggregate tasks only.
    pub level: Option<u32>,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn solve(agent_id: Uuid, problem_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            problem_id,
            kind: TaskKind::Solve,
            level: None,
            status: TaskStatus::InProgress,
            payload: TaskPayload::default(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn aggregate(
        agent_id: Uuid,
        problem_id: Uuid,
        level: u32,
        source_ids: Vec<Uuid>,
        is_final: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            problem_id,
            kind: TaskKind::Aggregate,
            level: Some(level),
            status: TaskStatus::InProgress,
            payload: TaskPayload {
                source_ids,
                is_final,
            },
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Level the resulting solution will carry.
    pub fn output_level(&self) -> u32 {
        match self.kind {
            TaskKind::Solve => 1,
            TaskKind::Aggregate => self.level.unwrap_or(2),
        }
    }
}

/// What an agent receives from a poll.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignment {
    pub task_id: Uuid,
    pub kind: TaskKind,
    pub problem: ProblemBrief,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<AggregationSource>,
    pub is_final: bool,
    pub instruction: String,
    pub fresh_context_required: bool,
}

/// A result posted by an agent, already validated at the boundary.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub content: String,
    pub answer: Option<String>,
    pub confidence: Option<Confidence>,
}
