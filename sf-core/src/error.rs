use thiserror::Error;

/// Failure classification for task executors. The coordinator decides
/// between retry and terminal failure based on `is_retryable`.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Network, timeout, upstream 5xx. Retried in-place with backoff
    /// first; surfaces here once the in-worker budget is spent.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Supply eroded, price collapsed, nothing acquirable this round.
    #[error("market conditions changed: {0}")]
    MarketChanged(String),

    /// Ship or world not in the expected state; retrying cannot help.
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::Transient(_) | ExecutorError::MarketChanged(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ExecutorError::Transient("timeout".into()).is_retryable());
        assert!(ExecutorError::MarketChanged("supply dropped".into()).is_retryable());
        assert!(!ExecutorError::Precondition("no such waypoint".into()).is_retryable());
        assert!(!ExecutorError::Other(anyhow::anyhow!("boom")).is_retryable());
    }
}
