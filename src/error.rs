// src/error.rs
use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use thiserror::Error;

/// Failures talking to the homeserver. Never retried inside the room cache.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Homeserver returned {status}: {errcode} ({message})")]
    Matrix {
        status: StatusCode,
        errcode: String,
        message: String,
    },

    #[error("Homeserver returned an unexpected status: {0}")]
    Http(StatusCode),

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode homeserver response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid homeserver URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ApiError {
    /// True when the homeserver answered and refused the room, as opposed to
    /// being unreachable or failing internally. Rate limiting counts as transient.
    pub fn is_room_unavailable(&self) -> bool {
        match self {
            ApiError::Matrix { status, .. } => {
                status.is_client_error() && *status != StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// Visitor-facing explanation of a homeserver refusal.
    pub fn describe(&self) -> String {
        match self {
            ApiError::Matrix { errcode, message, .. } => match errcode.as_str() {
                "M_FORBIDDEN" => "This room is not world readable and requires membership to view.".to_string(),
                "M_GUEST_ACCESS_FORBIDDEN" => "This room does not allow guest access.".to_string(),
                "M_NOT_FOUND" => "This room could not be found.".to_string(),
                _ if !message.is_empty() => message.clone(),
                _ => errcode.clone(),
            },
            other => other.to_string(),
        }
    }
}

/// Outcome of a job that could not produce its normal reply.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Room {room_id} is unavailable: {reason}")]
    Unavailable { room_id: String, reason: String },

    #[error("Failed to reach the homeserver for {room_id}: {source}")]
    Transport { room_id: String, source: ApiError },

    #[error("Member {user_id} not found in {room_id}")]
    MemberNotFound { room_id: String, user_id: String },

    #[error("Event {anchor} not found in {room_id}")]
    AnchorNotFound { room_id: String, anchor: String },

    #[error("Room {room_id} is not loaded")]
    NotLoaded { room_id: String },

    #[error("Worker is not accepting jobs")]
    WorkerUnavailable,
}

impl RoomError {
    /// Splits homeserver errors into "room refused" and "transport failure".
    pub fn from_api(room_id: &str, err: ApiError) -> Self {
        if err.is_room_unavailable() {
            RoomError::Unavailable {
                room_id: room_id.to_owned(),
                reason: err.describe(),
            }
        } else {
            RoomError::Transport {
                room_id: room_id.to_owned(),
                source: err,
            }
        }
    }
}

// Errors surfaced by the HTTP layer
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Room(#[from] RoomError),

    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),

    #[error("Unable to resolve room alias {alias}: {reason}")]
    AliasNotFound { alias: String, reason: String },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, title, details) = match &self {
            AppError::InvalidRoomId(_) => (
                StatusCode::BAD_REQUEST,
                "Unable to Load Room.",
                "Room ID must start with a '!'".to_string(),
            ),
            AppError::AliasNotFound { reason, .. } => (
                StatusCode::NOT_FOUND,
                "Unable to resolve Room Alias.",
                reason.clone(),
            ),
            AppError::Room(RoomError::Unavailable { reason, .. }) => {
                (StatusCode::FORBIDDEN, "Unable to Join Room.", reason.clone())
            }
            AppError::Room(err @ RoomError::MemberNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "Member not found.", err.to_string())
            }
            AppError::Room(err @ RoomError::AnchorNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "Event not found.", err.to_string())
            }
            AppError::Room(RoomError::Transport { source, .. }) => {
                (StatusCode::BAD_GATEWAY, "Cannot Load Room.", source.describe())
            }
            AppError::Room(RoomError::NotLoaded { .. } | RoomError::WorkerUnavailable) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Cannot Load Room. Internal Server Error.",
                "The room cache is temporarily unavailable".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!("HTTP Handler Error: {}", self);
        } else {
            tracing::warn!("HTTP Handler Error: {}", self);
        }

        (
            status,
            Json(serde_json::json!({ "error": title, "details": details })),
        )
            .into_response()
    }
}
