//! HTTP actions and the application router.
//!
//! Every action except `ping-time` resolves the caller from its bearer
//! token. Game rules live in [`AppState`]; handlers only translate between
//! JSON and the state calls.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::AuthUser;
use crate::error::GameResult;
use crate::protocol::LobbySession;
use crate::state::{AdvanceOutcome, AppState, GameStart, SubmissionOutcome, VoteOutcome};
use crate::types::*;
use crate::ws;

#[derive(Debug, Deserialize)]
pub struct SubmissionBody {
    #[serde(default)]
    pub artifact: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VoteBody {
    pub voted_for: String,
}

/// Build the full application: websocket rooms plus the `/api` actions
pub fn app(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/ping-time", get(ping_time))
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/{id}",
            axum::routing::patch(update_session).delete(delete_session),
        )
        .route("/sessions/{id}/join", post(join_session))
        .route("/sessions/{id}/leave", post(leave_session))
        .route("/sessions/{id}/start-game", post(start_game))
        .route("/sessions/{id}/pause-game", post(pause_game))
        .route("/sessions/{id}/rounds/{round}/start", post(start_round))
        .route("/sessions/{id}/rounds/{round}/pause", post(pause_round))
        .route("/sessions/{id}/rounds/{round}/submission", post(submit))
        .route("/sessions/{id}/rounds/{round}/vote", post(vote))
        .route("/sessions/{id}/rounds/{round}/advance", post(advance_round));

    Router::new()
        .route("/ws/{room}", get(ws::ws_handler))
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /api/ping-time
///
/// Server clock for countdown synchronisation.
pub async fn ping_time() -> Response {
    Json(json!({ "server_time": Utc::now() })).into_response()
}

/// GET /api/sessions
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
) -> GameResult<Json<Vec<LobbySession>>> {
    Ok(Json(state.list_active_sessions().await?))
}

/// POST /api/sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(settings): Json<SessionSettings>,
) -> GameResult<(StatusCode, Json<SessionRecord>)> {
    let session = state.create_session(&user, settings).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// PATCH /api/sessions/{id}
pub async fn update_session(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<SessionId>,
    Json(settings): Json<SessionSettings>,
) -> GameResult<Response> {
    let changed = state
        .update_session_details(session_id, &user, settings)
        .await?;
    Ok(Json(json!({ "changed": changed })).into_response())
}

/// DELETE /api/sessions/{id}
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<SessionId>,
) -> GameResult<StatusCode> {
    state.delete_session(session_id, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn join_session(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<SessionId>,
) -> GameResult<StatusCode> {
    state.join_session(session_id, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn leave_session(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<SessionId>,
) -> GameResult<StatusCode> {
    state.leave_session(session_id, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_game(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<SessionId>,
) -> GameResult<Json<GameStart>> {
    Ok(Json(state.start_game(session_id, &user).await?))
}

pub async fn pause_game(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<SessionId>,
) -> GameResult<Response> {
    let pause_at = state.pause_game(session_id, &user).await?;
    Ok(Json(json!({ "pause_at": pause_at })).into_response())
}

/// POST /api/sessions/{id}/rounds/{round}/start
///
/// Starts the round or resumes it after a pause. Any member may call it;
/// the first caller wins and later calls see the running round.
pub async fn start_round(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((session_id, round)): Path<(SessionId, RoundNo)>,
) -> GameResult<Json<RoundFlag>> {
    state.require_member(session_id, &user).await?;
    Ok(Json(state.start_round(session_id, round).await?))
}

pub async fn pause_round(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((session_id, round)): Path<(SessionId, RoundNo)>,
) -> GameResult<Json<RoundFlag>> {
    state.require_member(session_id, &user).await?;
    Ok(Json(state.pause_round(session_id, round).await?))
}

/// POST /api/sessions/{id}/rounds/{round}/submission
///
/// `artifact: null` records an explicit pass.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((session_id, round)): Path<(SessionId, RoundNo)>,
    Json(body): Json<SubmissionBody>,
) -> GameResult<Json<SubmissionOutcome>> {
    Ok(Json(
        state
            .record_submission(session_id, round, &user, body.artifact)
            .await?,
    ))
}

pub async fn vote(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((session_id, round)): Path<(SessionId, RoundNo)>,
    Json(body): Json<VoteBody>,
) -> GameResult<Json<VoteOutcome>> {
    Ok(Json(
        state
            .record_vote(session_id, round, &user, &body.voted_for)
            .await?,
    ))
}

pub async fn advance_round(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path((session_id, round)): Path<(SessionId, RoundNo)>,
) -> GameResult<Json<AdvanceOutcome>> {
    Ok(Json(state.advance_round(session_id, round, &user).await?))
}
