use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

/// Structured API error returned to clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<Vec<FieldError>>,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn validation(details: Vec<FieldError>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR".to_string(),
            message: "Validation failed".to_string(),
            details: Some(details),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Failures of the durable store behind [`crate::db::repository::Repository`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel_async::pooled_connection::deadpool::PoolError),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures surfaced by gateway operations.
///
/// Only `Authentication` is fatal to a connection; every other variant is
/// reported back to the originating client as an `error` event.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Authentication(&'static str),
    #[error("not authorized for room {0}")]
    Forbidden(String),
    #[error("{0}")]
    Validation(String),
    #[error("rate limit exceeded for {0} events")]
    RateLimited(&'static str),
    #[error("backplane unavailable: {0}")]
    BackplaneUnavailable(String),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Stable code carried in the `error` event and REST error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) => "AUTHENTICATION_FAILED",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::RateLimited(_) => "RATE_LIMITED",
            GatewayError::BackplaneUnavailable(_) => "BACKPLANE_UNAVAILABLE",
            GatewayError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }

    /// Message safe to show to the client. Store internals stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Persistence(_) => "The event could not be saved".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::not_found(format!("{what} not found")),
            other => {
                tracing::error!(err = %other, "store error");
                ApiError::internal("An internal error occurred")
            }
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BackplaneUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Persistence(e) => {
                tracing::error!(err = %e, "persistence error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.code(), err.client_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_map_to_http_status() {
        let cases = [
            (GatewayError::Authentication("bad token"), StatusCode::UNAUTHORIZED),
            (GatewayError::Forbidden("service:1".into()), StatusCode::FORBIDDEN),
            (GatewayError::validation("empty"), StatusCode::BAD_REQUEST),
            (GatewayError::RateLimited("chat"), StatusCode::TOO_MANY_REQUESTS),
            (
                GatewayError::Persistence(StoreError::Unavailable("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            let code = err.code();
            let api: ApiError = err.into();
            assert_eq!(api.status, status);
            assert_eq!(api.code, code);
        }
    }

    #[test]
    fn persistence_message_hides_store_details() {
        let err = GatewayError::Persistence(StoreError::Unavailable("pg at 10.0.0.3".into()));
        assert!(!err.client_message().contains("10.0.0.3"));
    }
}
