//! Gateway error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::{AuthError, FetchError};
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A required request input (token, section, identifier) is absent.
    #[error("missing {0}")]
    MissingInput(&'static str),

    /// Token validation failed.
    #[error("invalid token: {0}")]
    AuthInvalid(String),

    /// Entity has no WebSocket integration.
    #[error("entity {0} is not integrated")]
    NotIntegrated(String),

    /// Upstream REST fetch failed.
    #[error(transparent)]
    Upstream(#[from] FetchError),
}

impl From<AuthError> for GatewayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingToken => GatewayError::MissingInput("token"),
            AuthError::InvalidToken(reason) => GatewayError::AuthInvalid(reason),
        }
    }
}

impl GatewayError {
    /// Status used to reject a request before the WebSocket upgrade.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MissingInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::AuthInvalid(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NotIntegrated(_) => StatusCode::NOT_FOUND,
            GatewayError::Upstream(FetchError::Forbidden) => StatusCode::FORBIDDEN,
            GatewayError::Upstream(FetchError::NotFound | FetchError::Unsupported) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::Upstream(FetchError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            // Upstream internals are not echoed back to clients.
            GatewayError::AuthInvalid(_) => "invalid token".to_string(),
            GatewayError::Upstream(e) if !e.is_transient() => e.to_string(),
            GatewayError::Upstream(FetchError::Timeout) => FetchError::Timeout.to_string(),
            e if status == StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %e, "request failed");
                "internal error".to_string()
            }
            e => e.to_string(),
        };
        (status, message).into_response()
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::MissingInput("section").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::from(AuthError::InvalidToken("bad".into())).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::from(AuthError::MissingToken).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::NotIntegrated("boats".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::from(FetchError::Forbidden).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::from(FetchError::Unsupported).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::from(FetchError::Timeout).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::from(FetchError::Status(502)).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(GatewayError::MissingInput("token").to_string(), "missing token");
        assert_eq!(
            GatewayError::NotIntegrated("boats".into()).to_string(),
            "entity boats is not integrated"
        );
    }

    #[test]
    fn test_upstream_failures_do_not_leak_details() {
        let response = GatewayError::from(FetchError::Status(502)).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = GatewayError::from(FetchError::Forbidden).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
