//! Error types for the rebalancer.

use std::path::PathBuf;
use std::time::Duration;

use ledgerless_broker::BrokerError;

/// All errors that can abort a rebalance pass or a CLI command.
///
/// Per-order outcomes (rejections, timeouts, guard conflicts) are not errors:
/// they are recorded in the pass report.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid targets: {0}")]
    Target(String),

    #[error("failed to read target file {path}: {source}")]
    TargetRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse target JSON: {0}")]
    TargetParse(#[from] serde_json::Error),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("reconciliation failed: {0}")]
    Reconciliation(String),

    #[error("fatal broker error: {0}")]
    BrokerFatal(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("another rebalance pass is still running after {0:?}")]
    PassInProgress(Duration),

    #[error("risk check failed: {0}")]
    RiskFailed(String),

    #[error("execution aborted: {0}")]
    Aborted(String),

    #[error("audit log error: {0}")]
    Audit(#[from] std::io::Error),
}

impl Error {
    /// Map a broker error seen outside reconciliation.
    pub fn from_broker(err: BrokerError) -> Self {
        if err.is_fatal() {
            Error::BrokerFatal(err.to_string())
        } else {
            Error::Broker(err.to_string())
        }
    }

    /// Map a broker error seen while taking a snapshot.
    pub fn reconciliation(what: &str, err: BrokerError) -> Self {
        if err.is_fatal() {
            Error::BrokerFatal(err.to_string())
        } else {
            Error::Reconciliation(format!("{what}: {err}"))
        }
    }

    /// Errors that must stop the engine rather than wait for the next trigger.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::BrokerFatal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
