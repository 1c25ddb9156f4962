/// Failures reported by an agent runtime. Every one of them fails the turn;
/// `is_retryable` tells the client whether resubmitting may help.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime rejected credentials: {0}")]
    AuthenticationFailed(String),
    #[error("runtime rejected request: {0}")]
    InvalidRequest(String),
    /// The handle names a conversation the runtime no longer knows.
    #[error("unknown conversation handle: {0}")]
    UnknownHandle(String),

    #[error("runtime rate limited")]
    RateLimited,
    #[error("runtime unavailable ({status}): {body}")]
    ServerError { status: u16, body: String },
    #[error("runtime unreachable: {0}")]
    NetworkError(String),
    #[error("runtime stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl RuntimeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::ServerError { .. }
                | Self::NetworkError(_)
                | Self::StreamInterrupted(_)
        )
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownHandle(_) => "unknown_handle",
            Self::RateLimited => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
        }
    }

    /// Map a non-success HTTP status from the runtime endpoint.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            429 => Self::RateLimited,
            500..=599 => Self::ServerError { status, body },
            400..=499 => Self::InvalidRequest(body),
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        assert!(RuntimeError::RateLimited.is_retryable());
        assert!(RuntimeError::NetworkError("connection reset".into()).is_retryable());
        assert!(RuntimeError::StreamInterrupted("idle".into()).is_retryable());
        assert!(!RuntimeError::UnknownHandle("conv_9".into()).is_retryable());
        assert!(!RuntimeError::AuthenticationFailed("bad key".into()).is_retryable());
    }

    #[test]
    fn status_codes_map_to_variants() {
        assert!(matches!(
            RuntimeError::from_status(403, "forbidden".into()),
            RuntimeError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            RuntimeError::from_status(422, "bad tools".into()),
            RuntimeError::InvalidRequest(_)
        ));
        assert!(RuntimeError::from_status(429, "slow down".into()).is_retryable());
        assert_eq!(
            RuntimeError::from_status(503, "down".into()).error_kind(),
            "server_error"
        );
        assert_eq!(RuntimeError::from_status(302, "moved".into()).error_kind(), "invalid_request");
    }
}
