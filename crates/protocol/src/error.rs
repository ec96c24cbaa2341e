use serde::Serialize;

/// The error taxonomy shared by every subsystem and surfaced uniformly by the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("child process failed: {0}")]
    ChildProcessFailure(String),

    #[error("finalizing")]
    Finalizing,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::NotReady(_) => 503,
            AppError::InvalidParams(_) => 400,
            AppError::Conflict(_) => 409,
            AppError::ChildProcessFailure(_) => 500,
            AppError::Finalizing => 409,
            AppError::Timeout(_) => 504,
            AppError::Other(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotReady(_) => "not_ready",
            AppError::InvalidParams(_) => "invalid_params",
            AppError::Conflict(_) => "conflict",
            AppError::ChildProcessFailure(_) => "child_process_failure",
            AppError::Finalizing => "finalizing",
            AppError::Timeout(_) => "timeout",
            AppError::Other(_) => "internal",
        }
    }
}

/// Wire shape of an error response body: `{error, message}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl From<&AppError> for ErrorBody {
    fn from(e: &AppError) -> Self {
        Self {
            error: e.kind(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_maps_to_503() {
        let e = AppError::NotReady("upstream unknown".into());
        assert_eq!(e.status_code(), 503);
        assert_eq!(e.kind(), "not_ready");
    }

    #[test]
    fn conflict_maps_to_409() {
        let e = AppError::Conflict("id in use".into());
        assert_eq!(e.status_code(), 409);
    }

    #[test]
    fn finalizing_is_distinct_sentinel() {
        let e = AppError::Finalizing;
        assert_eq!(e.kind(), "finalizing");
        assert_eq!(e.status_code(), 409);
    }
}
