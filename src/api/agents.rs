//! Agent registration and profiles.

use axum::{Extension, Json, extract::State, http::StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::info;

use super::auth::AuthenticatedAgent;
use super::{ApiError, ApiResult, AppState};
use crate::error::DatabaseError;
use crate::swarm::model::Agent;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let name = body
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::bad_request("Name is required"))?;
    let description = body.description.filter(|d| !d.trim().is_empty());

    let agent = Agent::new(name, description, &state.config.api_key_prefix);
    match state.db.insert_agent(&agent).await {
        Ok(()) => {}
        Err(DatabaseError::Constraint(_)) => {
            return Err(ApiError::new(StatusCode::CONFLICT, "Agent name already taken")
                .with_hint("Try a different name or add a unique suffix"));
        }
        Err(e) => return Err(e.into()),
    }
    info!(agent_id = %agent.id, name = %agent.name, "Agent registered");

    let problem = state.db.get_active_problem().await?.map(|p| p.brief());

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "success": true,
            "agent": {
                "id": agent.id,
                "name": agent.name,
                "apiKey": agent.api_key.expose_secret(),
            },
            "problem": problem,
            "nextStep": "Call GET /api/v1/tasks/next to receive your task",
            "important": "Save your API key! You need it for all requests.",
        })),
    ))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedAgent>,
) -> ApiResult {
    let agent = state
        .db
        .get_agent(caller.id)
        .await?
        .ok_or_else(|| ApiError::not_found("Agent not found"))?;
    let (solutions, tasks) = state.db.agent_stats(agent.id).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "agent": {
            "id": agent.id,
            "name": agent.name,
            "description": agent.description,
            "createdAt": agent.created_at,
            "lastActiveAt": agent.last_active_at,
            "stats": {
                "solutionsSubmitted": solutions,
                "tasksCompleted": tasks,
            },
        },
    })))
}

pub async fn list_agents(State(state): State<AppState>) -> ApiResult {
    let agents = state.db.list_agents().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "agents": agents,
    })))
}
