//! Task polling and result submission.

use axum::{
    Extension, Json,
    extract::{Path, State},
};
use serde::Deserialize;
use tracing::debug;

use super::auth::AuthenticatedAgent;
use super::{ApiError, ApiResult, AppState, parse_id};
use crate::swarm::model::{Confidence, TaskKind, TaskResult};

pub async fn next_task(
    State(state): State<AppState>,
    Extension(agent): Extension<AuthenticatedAgent>,
) -> ApiResult {
    let Some(task) = state.assigner.get_next_task(agent.id).await? else {
        debug!(agent = %agent.name, "No task available");
        return Ok(Json(serde_json::json!({
            "success": true,
            "status": "no_task_available",
            "message": "No tasks available. Either waiting for more solutions to aggregate, or you have completed all available tasks.",
            "retryAfterMs": state.config.aggregation.max_wait_time.as_millis() as u64,
        })));
    };

    let mut body = serde_json::json!({
        "success": true,
        "status": "task_assigned",
        "task": {
            "id": task.task_id,
            "type": task.kind,
            "problem": task.problem,
        },
        "instruction": task.instruction,
        "freshContextRequired": task.fresh_context_required,
    });

    if task.kind == TaskKind::Aggregate {
        body["task"]["level"] = serde_json::json!(task.level);
        body["task"]["sourceCount"] = serde_json::json!(task.sources.len());
        body["task"]["isFinal"] = serde_json::json!(task.is_final);
        body["sourcesFormatted"] =
            serde_json::json!(state.instructions.format_sources(&task.sources));
        body["sources"] = serde_json::json!(task.sources);
    }

    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    answer: Option<String>,
    /// Anything non-numeric is ignored.
    #[serde(default)]
    confidence: Option<serde_json::Value>,
}

pub async fn submit_task(
    State(state): State<AppState>,
    Extension(agent): Extension<AuthenticatedAgent>,
    Path(id): Path<String>,
    Json(body): Json<SubmitRequest>,
) -> ApiResult {
    let task_id = parse_id(&id, "task")?;
    let content = body
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| {
            ApiError::bad_request("Content is required")
                .with_hint("Provide your reasoning/solution in the content field")
        })?;

    let result = TaskResult {
        content,
        answer: body.answer,
        confidence: body
            .confidence
            .as_ref()
            .and_then(serde_json::Value::as_f64)
            .and_then(Confidence::clamped),
    };

    let solution_id = state
        .submission
        .submit_result(task_id, agent.id, result)
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Task completed successfully",
        "solutionId": solution_id,
        "nextStep": "Call GET /api/v1/tasks/next for your next task",
    })))
}

pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let task_id = parse_id(&id, "task")?;
    let task = state
        .db
        .get_task(task_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Task not found"))?;
    let problem = state.db.get_problem(task.problem_id).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "task": {
            "id": task.id,
            "type": task.kind,
            "level": task.level,
            "status": task.status,
            "problem": problem.map(|p| serde_json::json!({"id": p.id, "title": p.title})),
            "createdAt": task.created_at,
            "completedAt": task.completed_at,
        },
    })))
}
