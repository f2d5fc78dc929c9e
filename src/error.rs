//! Error taxonomy for fetching and sync cycles.
use thiserror::Error;

/// Why a single fetch unit failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Network level failure: connect, timeout, truncated body.
    #[error("transport error for {target}: {message}")]
    Transport { target: String, message: String },
    /// Non-success status (or an error envelope) from the provider.
    #[error("provider returned {status} for {target}: {message}")]
    Provider {
        target: String,
        status: u16,
        message: String,
        permanent: bool,
    },
    /// The body did not match the expected schema.
    #[error("unexpected response from {target}: {message}")]
    SchemaViolation { target: String, message: String },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::Provider { permanent, .. } => !permanent,
            FetchError::SchemaViolation { .. } => false,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            FetchError::Transport { target, .. }
            | FetchError::Provider { target, .. }
            | FetchError::SchemaViolation { target, .. } => target,
        }
    }
}

/// Failure that aborts a whole sync cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        let transport = FetchError::Transport {
            target: "t".into(),
            message: "timed out".into(),
        };
        let busy = FetchError::Provider {
            target: "t".into(),
            status: 503,
            message: "busy".into(),
            permanent: false,
        };
        let denied = FetchError::Provider {
            target: "t".into(),
            status: 403,
            message: "invalid key".into(),
            permanent: true,
        };
        let shape = FetchError::SchemaViolation {
            target: "t".into(),
            message: "missing field `id`".into(),
        };
        assert!(transport.is_retryable());
        assert!(busy.is_retryable());
        assert!(!denied.is_retryable());
        assert!(!shape.is_retryable());
        assert_eq!(shape.target(), "t");
    }
}
