use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by builders, endpoints, and the in-process transport.
///
/// Outcomes of suspending operations (cancellation, queue completion,
/// queue faults) are not represented here; those are reported as
/// [`crate::queue::QueueError`] values by the operations themselves.
#[derive(Debug, Error)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] cdr::Error),

    #[error("type not registered: {0}")]
    UnknownType(String),

    #[error("type mismatch on topic {topic}: expected {expected}, found {found}")]
    TypeMismatch {
        topic: String,
        expected: String,
        found: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("goal {0} already purged")]
    GoalPurged(String),
}
