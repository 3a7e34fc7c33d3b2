//! Error taxonomy of game actions and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::llm::LlmError;
use crate::store::StoreError;

/// Result type for game actions
pub type GameResult<T> = Result<T, GameError>;

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("Session not found")]
    SessionNotFound,

    #[error("Round not found")]
    RoundNotFound,

    #[error("User not found")]
    UserNotFound,

    #[error("Only the host can {0}")]
    NotHost(&'static str),

    #[error("You are not a member of this session")]
    NotInSession,

    #[error("The session is no longer active.")]
    SessionInactive,

    #[error("Not every player is on the game page")]
    NotReady,

    #[error("Cannot start game. Some players are not connected correctly.")]
    PlayersNotReady(Vec<String>),

    #[error("{0}")]
    Precondition(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to generate statements: {0}")]
    PromptGeneration(#[from] LlmError),

    #[error("No statement generator is configured")]
    PromptGenerationUnavailable,
}

impl GameError {
    pub fn precondition(reason: impl Into<String>) -> Self {
        GameError::Precondition(reason.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GameError::SessionNotFound | GameError::RoundNotFound | GameError::UserNotFound => {
                StatusCode::NOT_FOUND
            }
            GameError::NotHost(_) | GameError::NotInSession | GameError::SessionInactive => {
                StatusCode::FORBIDDEN
            }
            GameError::NotReady | GameError::PlayersNotReady(_) => StatusCode::CONFLICT,
            GameError::Precondition(_) => StatusCode::BAD_REQUEST,
            GameError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GameError::PromptGeneration(_) | GameError::PromptGenerationUnavailable => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GameError::SessionNotFound => "SESSION_NOT_FOUND",
            GameError::RoundNotFound => "ROUND_NOT_FOUND",
            GameError::UserNotFound => "USER_NOT_FOUND",
            GameError::NotHost(_) => "NOT_HOST",
            GameError::NotInSession => "NOT_IN_SESSION",
            GameError::SessionInactive => "SESSION_INACTIVE",
            GameError::NotReady => "NOT_READY",
            GameError::PlayersNotReady(_) => "PLAYERS_NOT_READY",
            GameError::Precondition(_) => "PRECONDITION_FAILED",
            GameError::Store(_) => "STORE_ERROR",
            GameError::PromptGeneration(_) | GameError::PromptGenerationUnavailable => {
                "GENERATION_FAILED"
            }
        }
    }

    /// Message safe to show to clients
    pub fn public_detail(&self) -> String {
        match self {
            GameError::Store(_) => "Something went wrong, please try again.".to_string(),
            GameError::PromptGeneration(_) | GameError::PromptGenerationUnavailable => {
                "Failed to generate statements, please try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    players: Option<Vec<String>>,
}

impl IntoResponse for GameError {
    fn into_response(self) -> Response {
        match &self {
            GameError::Store(e) => tracing::error!("Store failure: {}", e),
            GameError::PromptGeneration(e) => tracing::error!("Statement generation failed: {}", e),
            GameError::PromptGenerationUnavailable => {
                tracing::error!("Statement generation requested but no provider is configured")
            }
            other => tracing::debug!("Rejected action: {}", other),
        }

        let players = match &self {
            GameError::PlayersNotReady(players) => Some(players.clone()),
            _ => None,
        };
        let body = ErrorBody {
            code: self.code(),
            detail: self.public_detail(),
            players,
        };
        (self.status(), Json(body)).into_response()
    }
}
