//! Error taxonomy for the task queue.
//!
//! Every fallible public operation returns [`Error`] (aliased as
//! [`Result`]) instead of a boxed trait object, so callers can match on
//! the specific failure kind — this mirrors the classification in the
//! broker/consumer design: configuration errors are fatal at
//! construction, broker I/O errors are surfaced or retried by the
//! caller, and handler/timeout errors drive the retry state machine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Conflicting or invalid options, e.g. both `eta` and `countdown` set.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The remote broker store is unreachable or a script call failed.
    #[error("broker error: {0}")]
    Broker(String),

    /// `Serializer::dumps` failed while publishing.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A handler returned an error. Carries enough to drive retry logic.
    #[error("handler error: {0}")]
    Handler(String),

    /// A handler invocation exceeded its configured timeout.
    #[error("handler timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// `Get`/`Cancel` found no record for the given id.
    #[error("task {id} not found in queue {queue}")]
    NotFound { queue: String, id: String },
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub fn broker<E: std::fmt::Display>(err: E) -> Self {
        Error::Broker(err.to_string())
    }
}
