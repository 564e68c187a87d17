//! Bearer API-key authentication for agent routes.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use tracing::debug;
use uuid::Uuid;

use super::{ApiError, AppState};

/// The agent behind a verified API key, inserted as a request extension.
#[derive(Debug, Clone)]
pub struct AuthenticatedAgent {
    pub id: Uuid,
    pub name: String,
}

/// Resolve `Authorization: Bearer <key>` to an agent and stamp its
/// last-active time. Anything else is 401.
pub async fn require_agent(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let api_key = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            ApiError::unauthorized("Missing or invalid Authorization header")
                .with_hint("Use: Authorization: Bearer YOUR_API_KEY")
        })?;

    let agent = state
        .db
        .get_agent_by_api_key(api_key)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid API key"))?;

    state.db.touch_agent(agent.id).await?;
    debug!(agent_id = %agent.id, "Agent authenticated");

    req.extensions_mut().insert(AuthenticatedAgent {
        id: agent.id,
        name: agent.name,
    });
    Ok(next.run(req).await)
}
