// KeyMux — pool error taxonomy.
//
// Upstream network errors never surface through the selector; they are
// absorbed into key-state transitions. What remains are the structural
// failures callers must handle.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has no keys loaded at all. Fatal to the caller.
    #[error("no API keys loaded in the {0} pool")]
    PoolEmpty(&'static str),

    /// The process-wide key manager has not been constructed yet.
    #[error("key manager is not initialised")]
    NotInitialized,

    /// A precheck pass is already running; only one may execute at a time.
    #[error("a precheck pass is already running, try again later")]
    PrecheckBusy,

    /// Manual precheck was requested while prechecking is switched off.
    #[error("prechecking is disabled")]
    PrecheckDisabled,

    /// The precheck pass did not finish inside the wait budget.
    #[error("precheck did not complete within {0:?}")]
    PrecheckTimeout(Duration),

    /// A precheck configuration parameter was out of range.
    #[error("invalid precheck configuration: {0}")]
    InvalidConfig(String),
}
