//! Master error taxonomy.
//!
//! Precondition failures are returned to callers synchronously and never
//! retried. `CatalogUnavailable` makes an operation report "blocked" so the
//! control loop re-queues it. `RemoteCall` failures are retryable unless the
//! filesystem reachability check also fails, which promotes them to `Fatal`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MasterError>;

/// All payloads are strings so the error can cross the wire unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum MasterError {
    #[error("master is not running")]
    MasterNotRunning,

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("table {0} does not exist")]
    TableNotFound(String),

    #[error("invalid table name: {0}")]
    InvalidTableName(String),

    #[error("table {table} has no column family {family}")]
    ColumnNotFound { table: String, family: String },

    #[error("catalog regions are not yet online")]
    CatalogUnavailable,

    #[error("storage server {0} is already registered")]
    DuplicateServer(String),

    #[error("storage server {0} is not registered")]
    UnknownServer(String),

    #[error("remote call failed: {0}")]
    RemoteCall(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl MasterError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, MasterError::Fatal(_))
    }

    /// Errors the control loop may retry by putting the operation back on
    /// the queue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MasterError::RemoteCall(_) | MasterError::CatalogUnavailable
        )
    }
}

impl From<std::io::Error> for MasterError {
    fn from(err: std::io::Error) -> Self {
        MasterError::RemoteCall(err.to_string())
    }
}
