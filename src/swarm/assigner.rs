//! Task assigner: the entry point agents poll for work.
//!
//! Order of precedence for a poll:
//! 1. the agent's outstanding task on the active problem, unchanged;
//! 2. a freshly claimed aggregation batch;
//! 3. a new level-1 solve task.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::AggregationConfig;
use crate::error::{DatabaseError, SwarmError};
use crate::store::Database;
use crate::swarm::instructions::InstructionProvider;
use crate::swarm::model::{Problem, Task, TaskAssignment, TaskKind};
use crate::swarm::planner::{AggregationPlanner, aggregate_assignment};

pub struct TaskAssigner {
    db: Arc<dyn Database>,
    planner: AggregationPlanner,
    instructions: Arc<dyn InstructionProvider>,
}

impl TaskAssigner {
    pub fn new(
        db: Arc<dyn Database>,
        config: AggregationConfig,
        instructions: Arc<dyn InstructionProvider>,
    ) -> Self {
        let planner = AggregationPlanner::new(Arc::clone(&db), config, Arc::clone(&instructions));
        Self {
            db,
            planner,
            instructions,
        }
    }

    /// Next task for `agent_id`, or `None` when no problem is active.
    pub async fn get_next_task(
        &self,
        agent_id: Uuid,
    ) -> Result<Option<TaskAssignment>, SwarmError> {
        let Some(problem) = self.db.get_active_problem().await? else {
            debug!(agent_id = %agent_id, "No active problem");
            return Ok(None);
        };

        if let Some(task) = self.db.find_in_progress_task(agent_id, problem.id).await? {
            debug!(agent_id = %agent_id, task_id = %task.id, "Returning outstanding task");
            return self.rehydrate(&problem, &task).await.map(Some);
        }

        match self.assign_new(agent_id, &problem).await {
            Ok(assignment) => Ok(Some(assignment)),
            // A concurrent poll by the same agent took the in-progress slot.
            Err(SwarmError::Database(DatabaseError::Constraint(_))) => {
                let task = self
                    .db
                    .find_in_progress_task(agent_id, problem.id)
                    .await?
                    .ok_or_else(|| {
                        SwarmError::Conflict("Concurrent task assignment for agent".into())
                    })?;
                debug!(agent_id = %agent_id, task_id = %task.id, "Lost assignment race, returning winner");
                self.rehydrate(&problem, &task).await.map(Some)
            }
            Err(e) => Err(e),
        }
    }

    async fn assign_new(
        &self,
        agent_id: Uuid,
        problem: &Problem,
    ) -> Result<TaskAssignment, SwarmError> {
        if let Some(assignment) = self
            .planner
            .find_aggregation_opportunity(agent_id, problem.id)
            .await?
        {
            return Ok(assignment);
        }
        self.assign_solve_task(agent_id, problem).await
    }

    async fn assign_solve_task(
        &self,
        agent_id: Uuid,
        problem: &Problem,
    ) -> Result<TaskAssignment, SwarmError> {
        let task = Task::solve(agent_id, problem.id);
        self.db.insert_task(&task).await?;
        info!(task_id = %task.id, agent_id = %agent_id, "Solve task assigned");
        Ok(self.solve_assignment(problem, &task))
    }

    /// Rebuild the assignment for an existing task. Aggregate tasks re-read
    /// their sources.
    async fn rehydrate(&self, problem: &Problem, task: &Task) -> Result<TaskAssignment, SwarmError> {
        match task.kind {
            TaskKind::Solve => Ok(self.solve_assignment(problem, task)),
            TaskKind::Aggregate => {
                let sources = self
                    .db
                    .get_aggregation_sources(&task.payload.source_ids)
                    .await?;
                Ok(aggregate_assignment(
                    self.instructions.as_ref(),
                    problem,
                    task,
                    sources,
                ))
            }
        }
    }

    fn solve_assignment(&self, problem: &Problem, task: &Task) -> TaskAssignment {
        TaskAssignment {
            task_id: task.id,
            kind: TaskKind::Solve,
            problem: problem.brief(),
            level: None,
            sources: Vec::new(),
            is_final: false,
            instruction: self.instructions.solve_instructions(&problem.title),
            fresh_context_required: false,
        }
    }
}
