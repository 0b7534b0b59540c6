use thiserror::Error;

/// Errors reported synchronously to the calling agent or client. A failed
/// call never leaves a partial mutation behind, except for the documented
/// overflow-with-EOF case of the startup log buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("startup logs exceed {limit} bytes (stored {stored}, batch {batch})")]
    PayloadTooLarge { stored: u64, batch: u64, limit: u64 },
    #[error("startup log stream is closed")]
    StreamClosed,
    #[error("invalid lifecycle state: {0:?}")]
    InvalidState(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentApiError {
    pub fn outdated_build() -> Self {
        AgentApiError::Conflict("build is outdated".to_string())
    }

    pub fn code(&self) -> &'static str {
        match self {
            AgentApiError::Unauthorized(_) => "unauthorized",
            AgentApiError::Conflict(_) => "conflict",
            AgentApiError::BadRequest(_) => "bad_request",
            AgentApiError::PayloadTooLarge { .. } => "payload_too_large",
            AgentApiError::StreamClosed => "stream_closed",
            AgentApiError::InvalidState(_) => "invalid_state",
            AgentApiError::NotFound(_) => "not_found",
            AgentApiError::Internal(_) => "internal",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            AgentApiError::Unauthorized(_) => 401,
            AgentApiError::Conflict(_) | AgentApiError::StreamClosed => 409,
            AgentApiError::BadRequest(_) | AgentApiError::InvalidState(_) => 400,
            AgentApiError::PayloadTooLarge { .. } => 413,
            AgentApiError::NotFound(_) => 404,
            AgentApiError::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outdated_build_mentions_build() {
        let err = AgentApiError::outdated_build();
        assert_eq!(err.http_status(), 409);
        assert!(err.to_string().contains("build is outdated"));
    }

    #[test]
    fn overflow_maps_to_entity_too_large() {
        let err = AgentApiError::PayloadTooLarge {
            stored: 10,
            batch: 1 << 20,
            limit: 1 << 20,
        };
        assert_eq!(err.http_status(), 413);
        assert_eq!(err.code(), "payload_too_large");
    }
}
