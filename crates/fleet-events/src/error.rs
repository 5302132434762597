//! Partition event error types.

use thiserror::Error;

/// Errors surfaced by partition event coordination and cloud administration.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// A request that can never succeed as issued (unknown agent or server,
    /// deleting an active server, duplicate registration). Nothing was
    /// changed.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("state store error: {0}")]
    State(#[from] fleet_state::StateError),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

pub type PartitionResult<T> = Result<T, PartitionError>;
