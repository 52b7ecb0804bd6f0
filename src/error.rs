use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    /// Membership denials and missing entities share one message so a
    /// non-member cannot tell a forbidden entity from an absent one.
    #[error("Not found or access denied")]
    NotFoundOrDenied,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFoundOrDenied => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::AuthRequired => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::AuthFailed => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::Internal(detail) => {
                tracing::error!("internal error: {}", detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ServerError::Database(err) => {
                tracing::error!("database error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "success": false,
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
