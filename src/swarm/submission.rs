//! Result submission: validates a task result and records it as a solution.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, SwarmError};
use crate::store::{CompletionOutcome, Database};
use crate::swarm::model::{Solution, SourceState, TaskResult, TaskStatus};

pub struct ResultSubmission {
    db: Arc<dyn Database>,
}

impl ResultSubmission {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Record `result` for `task_id` and return the new solution id.
    ///
    /// The solution insert, claim resolution, and task close happen in one
    /// store transaction.
    pub async fn submit_result(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        result: TaskResult,
    ) -> Result<Uuid, SwarmError> {
        if result.content.trim().is_empty() {
            return Err(SwarmError::Validation("Content is required".into()));
        }

        let task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or_else(|| SwarmError::not_found("Task", task_id))?;

        if task.agent_id != agent_id {
            return Err(SwarmError::Forbidden(
                "Task belongs to a different agent".into(),
            ));
        }

        match task.status {
            TaskStatus::InProgress => {}
            TaskStatus::Completed => {
                return Err(SwarmError::Conflict("Task already completed".into()));
            }
            TaskStatus::Expired => {
                return Err(SwarmError::Conflict(
                    "Task lease expired and its sources were released".into(),
                ));
            }
        }

        // Fast path. The store repeats this check inside the commit.
        if !self.db.is_problem_active(task.problem_id).await? {
            return Err(inactive_problem());
        }

        let solution = Solution {
            id: Uuid::new_v4(),
            agent_id,
            problem_id: task.problem_id,
            level: task.output_level(),
            content: result.content,
            answer: result.answer.filter(|a| !a.is_empty()),
            confidence: result.confidence,
            parent_ids: task.payload.source_ids.clone(),
            state: SourceState::Unclaimed,
            is_final: task.payload.is_final,
            created_at: Utc::now(),
        };

        match self.db.complete_task(task_id, &solution).await {
            Ok(CompletionOutcome::Completed) => {}
            Ok(CompletionOutcome::NotInProgress) => {
                return Err(SwarmError::Conflict(
                    "Task is no longer in progress".into(),
                ));
            }
            Ok(CompletionOutcome::ProblemInactive) => return Err(inactive_problem()),
            Err(DatabaseError::Constraint(msg)) => {
                warn!(task_id = %task_id, error = %msg, "Submission rejected by store constraint");
                return Err(SwarmError::Conflict(
                    "A final solution already exists for this problem".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            task_id = %task_id,
            agent_id = %agent_id,
            solution_id = %solution.id,
            level = solution.level,
            parents = solution.parent_ids.len(),
            is_final = solution.is_final,
            "Task completed"
        );
        Ok(solution.id)
    }
}

fn inactive_problem() -> SwarmError {
    SwarmError::Conflict(
        "Cannot submit solution for inactive problem. This problem has been closed or replaced."
            .into(),
    )
}
