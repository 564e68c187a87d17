//! Convergence state of a problem, derived from the shape of its solutions.

use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;

/// Where a problem stands on its way to a single answer.
///
/// Nothing is stored; the state is recomputed from the solution store.
/// `Converged` is terminal for the problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConvergenceState {
    /// Only raw solutions so far, or none.
    Collecting,
    /// Syntheses exist but none is final.
    #[serde(rename_all = "camelCase")]
    Synthesizing { highest_level: u32 },
    #[serde(rename_all = "camelCase")]
    Converged { final_solution_id: Uuid },
}

impl ConvergenceState {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }
}

impl std::fmt::Display for ConvergenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Collecting => write!(f, "collecting"),
            Self::Synthesizing { .. } => write!(f, "synthesizing"),
            Self::Converged { .. } => write!(f, "converged"),
        }
    }
}

pub async fn convergence_state(
    db: &dyn Database,
    problem_id: Uuid,
) -> Result<ConvergenceState, DatabaseError> {
    if let Some(final_solution) = db.get_final_solution(problem_id).await? {
        return Ok(ConvergenceState::Converged {
            final_solution_id: final_solution.id,
        });
    }

    let highest_level = db
        .level_counts(problem_id)
        .await?
        .iter()
        .map(|l| l.level)
        .max()
        .unwrap_or(0);

    Ok(if highest_level > 1 {
        ConvergenceState::Synthesizing { highest_level }
    } else {
        ConvergenceState::Collecting
    })
}
