use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("config error: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("probe failed: {0}")]
    Probe(String),
}

/// Error surfaced by [`CircuitBreaker`](crate::upstream::CircuitBreaker) calls.
///
/// `Open` is never swallowed: callers must treat it as "do not attempt".
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },
    #[error("circuit breaker '{name}': call timed out after {after:?}")]
    Timeout { name: String, after: Duration },
    #[error("call failed: {0}")]
    Failed(E),
    #[error("blocking call panicked")]
    Panicked,
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// Unwrap the operation's own error, if that is what failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Failed(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_config() {
        assert_eq!(
            MeshError::Config("bad ttl".to_string()).to_string(),
            "config error: bad ttl"
        );
    }

    #[test]
    fn display_store() {
        assert_eq!(
            MeshError::Store("connection refused".to_string()).to_string(),
            "store error: connection refused"
        );
    }

    #[test]
    fn display_probe() {
        assert_eq!(
            MeshError::Probe("unexpected status 503".to_string()).to_string(),
            "probe failed: unexpected status 503"
        );
    }

    #[test]
    fn display_breaker_open() {
        let err: BreakerError<std::io::Error> = BreakerError::Open {
            name: "orders:a1".to_string(),
        };
        assert_eq!(err.to_string(), "circuit breaker 'orders:a1' is open");
        assert!(err.is_open());
    }

    #[test]
    fn display_breaker_timeout() {
        let err: BreakerError<std::io::Error> = BreakerError::Timeout {
            name: "orders:a1".to_string(),
            after: Duration::from_millis(250),
        };
        assert_eq!(
            err.to_string(),
            "circuit breaker 'orders:a1': call timed out after 250ms"
        );
        assert!(!err.is_open());
    }

    #[test]
    fn breaker_into_inner() {
        let err: BreakerError<&str> = BreakerError::Failed("boom");
        assert_eq!(err.into_inner(), Some("boom"));
        let open: BreakerError<&str> = BreakerError::Open { name: "x".into() };
        assert_eq!(open.into_inner(), None);
    }
}
