//! Error taxonomy for scan orchestration.
//!
//! `ScanError` is what sessions, pools and the scheduler surface to callers.
//! Storage collaborators report failures as `anyhow::Error`; they classify
//! them by embedding a [`StorageError`] so the engine can tell fatal resource
//! failures from transient I/O.

use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the scan engine.
#[derive(Debug, Clone, Error)]
pub enum ScanError {
    /// Acquire after the resource pool was closed.
    #[error("resource pool for table `{table}` is closed")]
    PoolClosed { table: String },

    /// A bounded acquire gave up before a resource became available.
    #[error("timed out after {waited_ms}ms acquiring a scan resource for table `{table}`")]
    AcquireTimeout { table: String, waited_ms: u64 },

    /// The continuation of a range would start at or past its end.
    ///
    /// Control-flow signal: the range has been fully consumed.
    #[error("range exhausted: continuation start is beyond the range end")]
    RangeExhausted,

    /// A range was built with its start after its end.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// The storage client could not open or seek a resource (table missing,
    /// authorizations rejected).
    #[error("failed to initialize scan resource for table `{table}`: {cause:#}")]
    ResourceInit {
        table: String,
        cause: Arc<anyhow::Error>,
    },

    /// Opening a scan resource failed transiently. Producers and the chunk
    /// scheduler retry it like a transient seek failure.
    #[error("scan resource for table `{table}` is temporarily unavailable: {cause:#}")]
    Unavailable {
        table: String,
        cause: Arc<anyhow::Error>,
    },

    /// A chunk scan used its time budget. Converted into a resubmission.
    #[error("scan of chunk exceeded its time budget of {budget_ms}ms")]
    ScanTimeout { budget_ms: u64 },

    /// Any other failure inside a session producer or chunk task.
    #[error("scan producer failed: {0:#}")]
    Producer(Arc<anyhow::Error>),

    /// A result could not be enqueued because the session is being closed.
    #[error("result queue refused entry during forced close")]
    QueueFullOnForceClose,

    /// `next()` was called without a preceding `has_next()` returning true.
    #[error("next() called with no buffered result")]
    NoBufferedResult,

    /// The orchestrator was locked down and refuses new sessions.
    #[error("scan orchestrator has been locked; no new sessions can be created")]
    FactoryLocked,

    /// The session cannot be (re)started from its current state.
    #[error("session {session} cannot start from state {state}")]
    InvalidState { session: u64, state: &'static str },

    /// A checkpoint could not be encoded or decoded.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration values were malformed or out of bounds.
    #[error("invalid scan configuration: {0}")]
    Config(String),
}

impl ScanError {
    /// Wraps an arbitrary error as a producer failure.
    pub fn producer(err: impl Into<anyhow::Error>) -> Self {
        Self::Producer(Arc::new(err.into()))
    }

    /// Wraps a collaborator error as a resource initialization failure.
    pub fn resource_init(table: &str, err: anyhow::Error) -> Self {
        Self::ResourceInit {
            table: table.to_string(),
            cause: Arc::new(err),
        }
    }

    /// Returns whether this error is a control-flow signal that must never
    /// reach a consumer.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Self::RangeExhausted | Self::ScanTimeout { .. })
    }

    /// Stable short name, used in logs and run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PoolClosed { .. } => "pool_closed",
            Self::AcquireTimeout { .. } => "acquire_timeout",
            Self::RangeExhausted => "range_exhausted",
            Self::InvalidRange(_) => "invalid_range",
            Self::ResourceInit { .. } => "resource_init",
            Self::Unavailable { .. } => "unavailable",
            Self::ScanTimeout { .. } => "scan_timeout",
            Self::Producer(_) => "producer",
            Self::QueueFullOnForceClose => "queue_full_on_force_close",
            Self::NoBufferedResult => "no_buffered_result",
            Self::FactoryLocked => "factory_locked",
            Self::InvalidState { .. } => "invalid_state",
            Self::Checkpoint(_) => "checkpoint",
            Self::Config(_) => "config",
        }
    }
}

/// Failure classes a storage client attaches to its `anyhow::Error`s.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("table `{0}` not found")]
    TableNotFound(String),
    #[error("authorizations rejected: {0}")]
    AuthRejected(String),
    #[error("transient storage failure: {0}")]
    Transient(String),
}

/// How the engine reacts to a collaborator error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureClass {
    Fatal,
    Transient,
    Other,
}

/// Classifies a collaborator error by looking for an embedded [`StorageError`]
/// anywhere in its cause chain.
pub(crate) fn classify(err: &anyhow::Error) -> FailureClass {
    for cause in err.chain() {
        if let Some(storage) = cause.downcast_ref::<StorageError>() {
            return match storage {
                StorageError::TableNotFound(_) | StorageError::AuthRejected(_) => {
                    FailureClass::Fatal
                }
                StorageError::Transient(_) => FailureClass::Transient,
            };
        }
    }
    FailureClass::Other
}

/// Maps a collaborator error raised while opening/seeking a resource.
pub(crate) fn storage_failure(table: &str, err: anyhow::Error) -> ScanError {
    match classify(&err) {
        FailureClass::Fatal => ScanError::resource_init(table, err),
        FailureClass::Transient | FailureClass::Other => ScanError::producer(err),
    }
}

/// Maps a collaborator error raised while opening a resource. Transient
/// failures stay retryable.
pub(crate) fn open_failure(table: &str, err: anyhow::Error) -> ScanError {
    match classify(&err) {
        FailureClass::Transient => ScanError::Unavailable {
            table: table.to_string(),
            cause: Arc::new(err),
        },
        _ => storage_failure(table, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_finds_storage_error_through_context() {
        let err: anyhow::Error = Err::<(), _>(StorageError::Transient("reset".into()))
            .context("seek tablet t1")
            .expect_err("error expected");
        assert_eq!(classify(&err), FailureClass::Transient);

        let fatal = anyhow::Error::new(StorageError::TableNotFound("shard".into()));
        assert_eq!(classify(&fatal), FailureClass::Fatal);
        assert!(matches!(
            storage_failure("shard", fatal),
            ScanError::ResourceInit { .. }
        ));

        let busy = anyhow::Error::new(StorageError::Transient("tserver busy".into()));
        assert!(matches!(
            open_failure("shard", busy),
            ScanError::Unavailable { .. }
        ));

        let other = anyhow::anyhow!("boom");
        assert_eq!(classify(&other), FailureClass::Other);
        assert!(matches!(storage_failure("shard", other), ScanError::Producer(_)));
    }

    #[test]
    fn control_flow_errors_are_flagged() {
        assert!(ScanError::RangeExhausted.is_control_flow());
        assert!(ScanError::ScanTimeout { budget_ms: 5 }.is_control_flow());
        assert!(!ScanError::producer(anyhow::anyhow!("x")).is_control_flow());
    }
}
