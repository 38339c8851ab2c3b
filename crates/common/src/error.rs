//! Error types for upstream fetches and token validation.

use thiserror::Error;

/// Failure of an upstream REST fetch (section snapshots and analytics).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("snapshot fetch forbidden")]
    Forbidden,

    #[error("snapshot not found")]
    NotFound,

    #[error("entity or endpoint unsupported")]
    Unsupported,

    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("unexpected upstream response {0}")]
    Status(u16),

    #[error("decode upstream payload: {0}")]
    Decode(String),
}

impl FetchError {
    /// Errors that may be absorbed by serving a cached copy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout
                | FetchError::Transport(_)
                | FetchError::Status(_)
                | FetchError::Decode(_)
        )
    }
}

/// Token validation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::Status(502).is_transient());
        assert!(FetchError::Transport("refused".into()).is_transient());
        assert!(!FetchError::NotFound.is_transient());
        assert!(!FetchError::Forbidden.is_transient());
        assert!(!FetchError::Unsupported.is_transient());
    }
}
