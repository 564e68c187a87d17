//! Aggregation planner: finds an eligible batch of unclaimed solutions,
//! claims it, and turns it into an aggregate task.
//!
//! Levels are scanned bottom-up. The first level with enough sources not
//! authored by the caller wins. Claims are taken through
//! [`Database::claim_batch`], which only succeeds if every selected source
//! is still unclaimed; a lost race triggers a fresh scan.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AggregationConfig;
use crate::error::SwarmError;
use crate::store::{ClaimOutcome, Database};
use crate::swarm::instructions::InstructionProvider;
use crate::swarm::model::{AggregationSource, Problem, Task, TaskAssignment, TaskKind};

/// Scans attempted before giving up on a contended problem.
const MAX_CLAIM_ATTEMPTS: usize = 3;

enum ScanOutcome {
    Claimed(TaskAssignment),
    Contended,
    NothingEligible,
}

pub struct AggregationPlanner {
    db: Arc<dyn Database>,
    config: AggregationConfig,
    instructions: Arc<dyn InstructionProvider>,
}

impl AggregationPlanner {
    pub fn new(
        db: Arc<dyn Database>,
        config: AggregationConfig,
        instructions: Arc<dyn InstructionProvider>,
    ) -> Self {
        Self {
            db,
            config,
            instructions,
        }
    }

    /// Claim a batch for `agent_id` and return the aggregate assignment, or
    /// `None` when no level currently qualifies.
    pub async fn find_aggregation_opportunity(
        &self,
        agent_id: Uuid,
        problem_id: Uuid,
    ) -> Result<Option<TaskAssignment>, SwarmError> {
        let Some(problem) = self.db.get_problem(problem_id).await? else {
            return Ok(None);
        };

        if let Some(final_solution) = self.db.get_final_solution(problem_id).await? {
            debug!(
                problem_id = %problem_id,
                final_solution_id = %final_solution.id,
                "Problem converged, nothing left to aggregate"
            );
            return Ok(None);
        }

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            match self.scan(agent_id, &problem).await? {
                ScanOutcome::Claimed(assignment) => return Ok(Some(assignment)),
                ScanOutcome::NothingEligible => return Ok(None),
                ScanOutcome::Contended => {
                    warn!(
                        agent_id = %agent_id,
                        problem_id = %problem_id,
                        attempt,
                        "Batch claimed concurrently, rescanning"
                    );
                }
            }
        }

        warn!(
            agent_id = %agent_id,
            problem_id = %problem_id,
            "Giving up on aggregation after repeated contention"
        );
        Ok(None)
    }

    async fn scan(&self, agent_id: Uuid, problem: &Problem) -> Result<ScanOutcome, SwarmError> {
        let min = self.config.min_items_to_aggregate;
        let levels = self.db.unclaimed_level_counts(problem.id).await?;
        let total_unclaimed: usize = levels.iter().map(|l| l.count).sum();

        for stat in &levels {
            if stat.count < min {
                continue;
            }

            let batch_size = stat.count.min(self.config.target_items_to_aggregate);
            let batch = self
                .db
                .select_batch(problem.id, stat.level, agent_id, batch_size)
                .await?;

            if batch.len() < min {
                debug!(
                    level = stat.level,
                    eligible = batch.len(),
                    "Too few sources after excluding own work, trying next level"
                );
                continue;
            }

            let will_be_final =
                total_unclaimed <= self.config.max_items_to_aggregate && stat.level > 1;
            let source_ids: Vec<Uuid> = batch.iter().map(|s| s.id).collect();
            let task = Task::aggregate(
                agent_id,
                problem.id,
                stat.level + 1,
                source_ids,
                will_be_final,
            );

            return match self.db.claim_batch(&task).await? {
                ClaimOutcome::Claimed(task) => {
                    info!(
                        task_id = %task.id,
                        agent_id = %agent_id,
                        level = task.output_level(),
                        sources = batch.len(),
                        is_final = task.payload.is_final,
                        "Aggregation batch claimed"
                    );
                    Ok(ScanOutcome::Claimed(aggregate_assignment(
                        self.instructions.as_ref(),
                        problem,
                        &task,
                        batch,
                    )))
                }
                ClaimOutcome::Contended => Ok(ScanOutcome::Contended),
            };
        }

        Ok(ScanOutcome::NothingEligible)
    }
}

/// Build the agent-facing view of an aggregate task.
pub(crate) fn aggregate_assignment(
    instructions: &dyn InstructionProvider,
    problem: &Problem,
    task: &Task,
    sources: Vec<AggregationSource>,
) -> TaskAssignment {
    let level = task.output_level();
    TaskAssignment {
        task_id: task.id,
        kind: TaskKind::Aggregate,
        problem: problem.brief(),
        level: Some(level),
        instruction: instructions.aggregation_instructions(
            level,
            sources.len(),
            task.payload.is_final,
        ),
        sources,
        is_final: task.payload.is_final,
        fresh_context_required: true,
    }
}
