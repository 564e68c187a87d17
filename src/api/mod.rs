//! HTTP surface: REST endpoints for agents, problems, tasks, and the
//! read-only solution views.

pub mod agents;
pub mod auth;
pub mod problems;
pub mod solutions;
pub mod tasks;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::config::SwarmConfig;
use crate::error::{DatabaseError, SwarmError};
use crate::store::Database;
use crate::swarm::{DefaultInstructions, InstructionProvider, ResultSubmission, TaskAssigner};
use crate::swarm::model::Solution;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub assigner: Arc<TaskAssigner>,
    pub submission: Arc<ResultSubmission>,
    pub instructions: Arc<dyn InstructionProvider>,
    pub config: Arc<SwarmConfig>,
}

impl AppState {
    /// Wire the engine with the built-in instruction templates.
    pub fn new(db: Arc<dyn Database>, config: SwarmConfig) -> Self {
        Self::with_instructions(db, config, Arc::new(DefaultInstructions))
    }

    pub fn with_instructions(
        db: Arc<dyn Database>,
        config: SwarmConfig,
        instructions: Arc<dyn InstructionProvider>,
    ) -> Self {
        let assigner = TaskAssigner::new(
            Arc::clone(&db),
            config.aggregation.clone(),
            Arc::clone(&instructions),
        );
        Self {
            submission: Arc::new(ResultSubmission::new(Arc::clone(&db))),
            assigner: Arc::new(assigner),
            db,
            instructions,
            config: Arc::new(config),
        }
    }
}

/// Build the Axum router with every swarm route under `/api/v1`.
pub fn swarm_routes(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/agents/me", get(agents::me))
        .route("/tasks/next", get(tasks::next_task))
        .route("/tasks/{id}", get(tasks::get_task))
        .route("/tasks/{id}/submit", post(tasks::submit_task))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_agent,
        ));

    let public = Router::new()
        .route("/agents", get(agents::list_agents))
        .route("/agents/register", post(agents::register))
        .route("/problems", post(problems::create_problem))
        .route("/problems/current", get(problems::current_problem))
        .route("/problems/{id}", get(problems::get_problem))
        .route("/problems/{id}/phase", patch(problems::update_phase))
        .route("/solutions", get(solutions::list_solutions))
        .route("/solutions/{id}", get(solutions::get_solution))
        .route("/aggregations", get(solutions::list_aggregations))
        .route("/aggregations/final", get(solutions::final_answer))
        .route("/aggregations/tree", get(solutions::aggregation_tree));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", authenticated.merge(public))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "claw-swarm"
    }))
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Error response body: `{"success": false, "error": ..., "hint"?: ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    hint: Option<&'static str>,
}

pub type ApiResult<T = Json<serde_json::Value>> = Result<T, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            hint: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn with_hint(mut self, hint: &'static str) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<SwarmError> for ApiError {
    fn from(e: SwarmError) -> Self {
        let status = match &e {
            SwarmError::NotFound { .. } => StatusCode::NOT_FOUND,
            SwarmError::Forbidden(_) => StatusCode::FORBIDDEN,
            SwarmError::Conflict(_) => StatusCode::CONFLICT,
            SwarmError::Validation(_) => StatusCode::BAD_REQUEST,
            SwarmError::Database(db_err) => {
                error!(error = %db_err, "Store failure while handling request");
                return Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal failure");
            }
        };
        let message = match e {
            SwarmError::Forbidden(m) | SwarmError::Conflict(m) | SwarmError::Validation(m) => m,
            other => other.to_string(),
        };
        Self::new(status, message)
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        SwarmError::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "success": false,
            "error": self.message,
        });
        if let Some(hint) = self.hint {
            body["hint"] = serde_json::json!(hint);
        }
        (self.status, Json(body)).into_response()
    }
}

// ── Shared helpers ──────────────────────────────────────────────────────

/// Parse a path id, rejecting malformed ones with 400.
pub(crate) fn parse_id(raw: &str, entity: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("Invalid {entity} ID")))
}

/// Explicit `problemId` query value, else the active problem.
pub(crate) async fn resolve_problem_id(
    db: &dyn Database,
    requested: Option<&str>,
) -> ApiResult<Uuid> {
    match requested {
        Some(raw) => parse_id(raw, "problem"),
        None => db
            .get_active_problem()
            .await?
            .map(|p| p.id)
            .ok_or_else(|| ApiError::not_found("No active problem")),
    }
}

/// Author names for a set of solutions.
pub(crate) async fn author_names(
    db: &dyn Database,
    solutions: &[Solution],
) -> ApiResult<HashMap<Uuid, String>> {
    let mut ids: Vec<Uuid> = solutions.iter().map(|s| s.agent_id).collect();
    ids.sort();
    ids.dedup();
    Ok(db.agent_names(&ids).await?.into_iter().collect())
}

/// `{"id": ..., "name": ...}` for a solution's author.
pub(crate) fn agent_ref(names: &HashMap<Uuid, String>, agent_id: Uuid) -> serde_json::Value {
    serde_json::json!({
        "id": agent_id,
        "name": names.get(&agent_id).cloned().unwrap_or_default(),
    })
}
