//! Problem administration and the active-problem view.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use tracing::info;

use super::{ApiError, ApiResult, AppState, parse_id};
use crate::swarm::convergence_state;
use crate::swarm::model::{Problem, ProblemPhase};

pub async fn current_problem(State(state): State<AppState>) -> ApiResult {
    let problem = state
        .db
        .get_active_problem()
        .await?
        .ok_or_else(|| ApiError::not_found("No active problem"))?;
    let stats = state.db.problem_stats(problem.id).await?;
    let convergence = convergence_state(state.db.as_ref(), problem.id).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "problem": {
            "id": problem.id,
            "title": problem.title,
            "statement": problem.statement,
            "hints": problem.hints,
            "phase": problem.phase,
            "createdAt": problem.created_at,
        },
        "stats": stats,
        "convergence": convergence,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateProblemRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    statement: Option<String>,
    #[serde(default)]
    hints: Vec<String>,
}

pub async fn create_problem(
    State(state): State<AppState>,
    Json(body): Json<CreateProblemRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let (Some(title), Some(statement)) = (
        body.title.filter(|t| !t.trim().is_empty()),
        body.statement.filter(|s| !s.trim().is_empty()),
    ) else {
        return Err(ApiError::bad_request("Title and statement are required"));
    };

    let problem = state
        .db
        .create_problem(&Problem::new(title, statement, body.hints))
        .await?;
    info!(problem_id = %problem.id, "Active problem replaced");

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "success": true,
            "problem": problem,
        })),
    ))
}

pub async fn get_problem(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id(&id, "problem")?;
    let problem = state
        .db
        .get_problem(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Problem not found"))?;

    Ok(Json(serde_json::json!({
        "success": true,
        "problem": problem,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PhaseRequest {
    #[serde(default)]
    phase: String,
}

pub async fn update_phase(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PhaseRequest>,
) -> ApiResult {
    let id = parse_id(&id, "problem")?;
    let phase: ProblemPhase = body.phase.parse().map_err(|_| {
        ApiError::bad_request("Invalid phase. Must be: collecting, aggregating, or finalized")
    })?;

    if !state.db.update_problem_phase(id, phase).await? {
        return Err(ApiError::not_found("Problem not found"));
    }
    let problem = state
        .db
        .get_problem(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Problem not found"))?;

    Ok(Json(serde_json::json!({
        "success": true,
        "problem": {
            "id": problem.id,
            "title": problem.title,
            "phase": problem.phase,
        },
    })))
}
