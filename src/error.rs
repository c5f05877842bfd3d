//! Error types for the reboot coordinator
//!
//! Blockers and checkers collapse backend failures into their boolean
//! contracts, so the errors that reach the orchestrator are either retry
//! signals consumed by the optimistic-concurrency loops or fatal conditions.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error that is not a conflict, throttle or missing object
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The object was modified concurrently (HTTP 409)
    #[error("Write conflict on {0}")]
    Conflict(String),

    /// The object does not exist (HTTP 404)
    #[error("Object not found: {0}")]
    NotFound(String),

    /// The API refused the request for now, e.g. an eviction blocked by a PodDisruptionBudget (HTTP 429)
    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Release or renewal attempted by a node that does not hold the lock
    #[error("Not lock holder: {0}")]
    NotLockHolder(String),

    /// The stored lock record could not be parsed
    #[error("Corrupt lock record: {0}")]
    CorruptLock(String),

    /// A held lease was lost before maintenance completed
    #[error("Lock lost: {0}")]
    LockLost(String),

    #[error("Drain failed: {0}")]
    DrainError(String),

    #[error("Command failed: {0}")]
    CommandError(String),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timed out: {0}")]
    Timeout(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the operation may succeed if simply tried again later
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_)
                | Error::TooManyRequests(_)
                | Error::Timeout(_)
                | Error::HttpError(_)
        )
    }

    /// Optimistic-concurrency rejection; the caller should re-read and retry
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Translate a kube error into the taxonomy above, keyed by HTTP status
    pub fn from_kube(err: kube::Error, object: &str) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 409 => {
                Error::Conflict(format!("{object}: {}", resp.message))
            }
            kube::Error::Api(ref resp) if resp.code == 404 => {
                Error::NotFound(format!("{object}: {}", resp.message))
            }
            kube::Error::Api(ref resp) if resp.code == 429 => {
                Error::TooManyRequests(format!("{object}: {}", resp.message))
            }
            other => Error::KubeError(other),
        }
    }
}
