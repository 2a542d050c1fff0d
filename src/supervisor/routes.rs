//! HTTP route handlers for the control plane.

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent_engine::{CommandReceipt, ControlKind, RunStatus, Turn};
use crate::errors::SupervisorError;
use crate::supervisor::sse;
use crate::supervisor::Supervisor;

const DEFAULT_TURNS: usize = 20;

impl IntoResponse for SupervisorError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            SupervisorError::UnknownRun(_) => (StatusCode::NOT_FOUND, "unknown_run"),
            SupervisorError::InvalidCommand(_) => (StatusCode::BAD_REQUEST, "invalid_command"),
        };
        (status, Json(json!({ "error": code, "message": self.to_string() }))).into_response()
    }
}

/// Build the full router: `/health` plus the `/api` tree, guarded by `token` when set.
pub fn router(supervisor: Supervisor, token: Option<String>) -> Router {
    let mut api = api_router();
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        api = api.route_layer(middleware::from_fn_with_state(Arc::<str>::from(token), require_token));
    }
    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(supervisor)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn api_router() -> Router<Supervisor> {
    Router::new()
        .route("/runs", get(list_runs))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/turns", get(get_turns))
        .route("/runs/{run_id}/events", get(sse::events_handler))
        .route("/runs/{run_id}/commands", post(post_run_command))
        .route("/commands", post(post_command))
}

async fn health() -> &'static str {
    "ok"
}

async fn require_token(State(token): State<Arc<str>>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(&*token) {
        return next.run(request).await;
    }
    tracing::warn!(path = %request.uri().path(), "rejected control-plane request without valid token");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized", "message": "missing or invalid bearer token" })),
    )
        .into_response()
}

/// GET /api/runs
async fn list_runs(State(supervisor): State<Supervisor>) -> Json<Vec<RunStatus>> {
    Json(supervisor.list_runs().await)
}

/// GET /api/runs/{run_id}
async fn get_run(
    State(supervisor): State<Supervisor>,
    Path(run_id): Path<String>,
) -> Result<Json<RunStatus>, SupervisorError> {
    Ok(Json(supervisor.status(&run_id).await?))
}

#[derive(Debug, Deserialize)]
struct TurnsQuery {
    n: Option<usize>,
}

/// GET /api/runs/{run_id}/turns?n=
async fn get_turns(
    State(supervisor): State<Supervisor>,
    Path(run_id): Path<String>,
    Query(query): Query<TurnsQuery>,
) -> Result<Json<Vec<Turn>>, SupervisorError> {
    let n = query.n.unwrap_or(DEFAULT_TURNS);
    Ok(Json(supervisor.get_recent_turns(&run_id, n).await?))
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    #[serde(default)]
    run_id: Option<String>,
    command: String,
    #[serde(default)]
    payload: Option<String>,
}

fn parse_kind(name: &str) -> Result<ControlKind, SupervisorError> {
    match name {
        "pause" => Ok(ControlKind::Pause),
        "resume" => Ok(ControlKind::Resume),
        "stop" => Ok(ControlKind::Stop),
        "inject" => Ok(ControlKind::Inject),
        other => Err(SupervisorError::InvalidCommand(format!("unknown command `{other}`"))),
    }
}

/// POST /api/commands
async fn post_command(
    State(supervisor): State<Supervisor>,
    Json(body): Json<CommandBody>,
) -> Result<Json<CommandReceipt>, SupervisorError> {
    let run_id = body
        .run_id
        .ok_or_else(|| SupervisorError::InvalidCommand("run_id is required".into()))?;
    let kind = parse_kind(&body.command)?;
    Ok(Json(supervisor.submit(&run_id, kind, body.payload).await?))
}

/// POST /api/runs/{run_id}/commands
async fn post_run_command(
    State(supervisor): State<Supervisor>,
    Path(run_id): Path<String>,
    Json(body): Json<CommandBody>,
) -> Result<Json<CommandReceipt>, SupervisorError> {
    let kind = parse_kind(&body.command)?;
    Ok(Json(supervisor.submit(&run_id, kind, body.payload).await?))
}
