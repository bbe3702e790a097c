//! Error types for the notification engine.

use thiserror::Error;

/// Main error type for connection and store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection was opened without an event queue, so it can never
    /// receive pushed notifications. Raised before any state is mutated.
    #[error("connection has no event queue: {0}")]
    NoEventQueue(&'static str),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("no write transaction is active")]
    NoActiveWrite,

    #[error("a write transaction is already active on this connection")]
    WriteInProgress,

    /// The entity's backing row was deleted; it no longer accepts listeners
    /// or mutations. Reads of a stale entity return defaults instead.
    #[error("entity is no longer valid")]
    StaleEntity,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
