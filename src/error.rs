//! Engine error taxonomy.
//!
//! Lower layers (`db`, `api`) report plain string errors with embedded
//! `(HTTP nnn)` suffixes; the engine classifies those into this taxonomy at
//! its public boundary so callers can tell queue-and-retry apart from
//! surface-to-operator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-level failure. New operations fall back to queueing; queued
    /// operations retry on the next drain. Never fatal.
    #[error("network error: {0}")]
    Transient(String),

    /// The server rejected a well-formed request. Shown to the operator
    /// immediately; not silently retried without visibility.
    #[error("rejected by server: {0}")]
    Permanent(String),

    /// The local queue database is unusable. Offline capability is disabled;
    /// the terminal keeps working online-only.
    #[error("offline storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The persisted transaction counter is not a number. Requires operator
    /// intervention; auto-repair risks colliding with real server ids.
    #[error("transaction id counter corrupted: {0}")]
    IdCorruption(String),
}

impl EngineError {
    /// Short machine-readable kind, used in notification payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Transient(_) => "transient",
            EngineError::Permanent(_) => "permanent",
            EngineError::StorageUnavailable(_) => "storage_unavailable",
            EngineError::IdCorruption(_) => "id_corruption",
        }
    }
}
