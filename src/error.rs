use thiserror::Error;

use crate::config::ConfigError;
use crate::connection::ConnectionError;
use crate::model::EventError;
use crate::optimistic::MutationError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical subsystem errors.
/// Duplicate events and stale bulk-load responses are silent outcomes, not
/// errors, so they never appear here.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Connection(e) => e.transience(),
            Error::Mutation(e) => e.transience(),
            Error::Event(_) => Transience::Permanent,
            Error::Config(_) => Transience::Permanent,
        }
    }
}
