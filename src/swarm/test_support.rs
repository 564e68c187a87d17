//! Shared fixtures for swarm unit tests.

use std::sync::Arc;

use uuid::Uuid;

use crate::store::{CompletionOutcome, Database, LibSqlBackend};
use crate::swarm::model::{Agent, Confidence, Problem, Solution, SourceState, Task};

pub(crate) async fn memory_db() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

pub(crate) async fn active_problem(db: &Arc<dyn Database>) -> Problem {
    db.create_problem(&Problem::new(
        "Answer",
        "What is six times seven?",
        vec!["Multiply.".into()],
    ))
    .await
    .unwrap()
}

pub(crate) async fn agent(db: &Arc<dyn Database>, name: &str) -> Agent {
    let agent = Agent::new(name, None, "clawswarm_");
    db.insert_agent(&agent).await.unwrap();
    agent
}

/// Record a solution at `level` authored by `author`, bypassing the planner.
///
/// Levels above 1 get a synthetic completed aggregate task with no sources.
pub(crate) async fn seed_solution(
    db: &Arc<dyn Database>,
    author: &Agent,
    problem: &Problem,
    level: u32,
) -> Uuid {
    let task = if level == 1 {
        Task::solve(author.id, problem.id)
    } else {
        Task::aggregate(author.id, problem.id, level, vec![], false)
    };
    db.insert_task(&task).await.unwrap();

    let solution = Solution {
        id: Uuid::new_v4(),
        agent_id: author.id,
        problem_id: problem.id,
        level,
        content: format!("level {level} work by {}", author.name),
        answer: Some("42".into()),
        confidence: Confidence::clamped(0.7),
        parent_ids: vec![],
        state: SourceState::Unclaimed,
        is_final: false,
        created_at: chrono::Utc::now(),
    };
    let outcome = db.complete_task(task.id, &solution).await.unwrap();
    assert_eq!(outcome, CompletionOutcome::Completed);
    solution.id
}

/// One agent per name, each with one solution at `level`. Returns solution ids
/// oldest first.
pub(crate) async fn seed_authors(
    db: &Arc<dyn Database>,
    problem: &Problem,
    names: &[&str],
    level: u32,
) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for name in names {
        let author = agent(db, name).await;
        ids.push(seed_solution(db, &author, problem, level).await);
    }
    ids
}
