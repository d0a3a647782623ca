//! Broker error types.

/// How the caller must react to a broker error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Retry with backoff.
    Transient,
    /// Do not retry this call; the failure is specific to the request.
    Permanent,
    /// Abort and surface to the operator.
    Fatal,
}

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("not connected")]
    NotConnected,

    #[error("broker call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("rate limit exceeded")]
    RateLimit,

    #[error("order error: {0}")]
    Order(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("inconsistent broker data: {0}")]
    Inconsistent(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("fatal broker error: {0}")]
    Fatal(String),

    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// Classify the error for retry/abort decisions.
    pub fn severity(&self) -> Severity {
        match self {
            BrokerError::Connection(_)
            | BrokerError::NotConnected
            | BrokerError::Timeout(_)
            | BrokerError::RateLimit => Severity::Transient,
            BrokerError::Auth(_) | BrokerError::Fatal(_) => Severity::Fatal,
            BrokerError::Order(_)
            | BrokerError::InvalidSymbol(_)
            | BrokerError::Inconsistent(_)
            | BrokerError::Other(_) => Severity::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.severity() == Severity::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(BrokerError::NotConnected.is_transient());
        assert!(BrokerError::Timeout(std::time::Duration::from_secs(1)).is_transient());
        assert!(BrokerError::Auth("expired token".into()).is_fatal());
        assert_eq!(
            BrokerError::Order("bad qty".into()).severity(),
            Severity::Permanent
        );
    }
}
