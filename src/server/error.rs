use std::fmt::{Display, Formatter};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::job;
use crate::supervisor;

#[derive(Debug)]
pub struct Error(anyhow::Error);

/// Errors the API produces itself, before reaching the supervisor.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// also returned for every authorization failure, so that denied
    /// ids are indistinguishable from unknown ones
    #[error("job not found")]
    NotFound,
    #[error("invalid client identity")]
    Unauthenticated,
}

impl Error {
    pub fn not_found() -> Error {
        Error(ApiError::NotFound.into())
    }

    pub fn unauthenticated() -> Error {
        Error(ApiError::Unauthenticated.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let msg_str = self.0.to_string();
        let (status, message) = if let Some(e) = self.0.downcast_ref::<ApiError>() {
            match e {
                ApiError::NotFound => (StatusCode::NOT_FOUND, "job not found"),
                ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, "invalid client identity"),
            }
        } else if let Some(e) = self.0.downcast_ref::<supervisor::Error>() {
            match e {
                supervisor::Error::NotFound => (StatusCode::NOT_FOUND, "job not found"),
                supervisor::Error::NotCompleted => (StatusCode::CONFLICT, msg_str.as_str()),
                supervisor::Error::Job(job::Error::State(_)) => {
                    (StatusCode::CONFLICT, msg_str.as_str())
                }
                _ => {
                    error!("request failed: {}", msg_str);
                    (StatusCode::INTERNAL_SERVER_ERROR, msg_str.as_str())
                }
            }
        } else {
            error!("request failed: {}", msg_str);
            (StatusCode::INTERNAL_SERVER_ERROR, msg_str.as_str())
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

impl<T> From<T> for Error
where
    T: Into<anyhow::Error>,
{
    fn from(t: T) -> Self {
        Error(t.into())
    }
}

pub type AppResult<T> = Result<T, Error>;
