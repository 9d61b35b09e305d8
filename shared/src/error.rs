//! Error types returned by the controller API and the serve loops.
//!
//! `DistwqError` is the closed set of errors a caller can match on;
//! infrastructure failures (file IO, TOML parsing) are reported as
//! `anyhow::Error` the way the rest of the workspace does, since callers
//! never need to branch on those.

use crate::protocol::TaskId;

/// Errors surfaced by the controller/worker/broker API.
#[derive(Debug, thiserror::Error)]
pub enum DistwqError {
    /// `submit_call` was given a `task_id` that is already in flight.
    #[error("task id {0} is already in the assigned queue")]
    DuplicateId(TaskId),

    /// `get_result` was called for a task that is not at the head of its
    /// assigned worker's queue.
    #[error("get_result({task_id}) called before get_result({expected}) for the same worker")]
    OutOfOrder { task_id: TaskId, expected: TaskId },

    /// An unknown message tag or collective-mode value was observed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A `RunnerConfig` failed validation.
    #[error("invalid runner configuration: {0}")]
    ConfigInvalid(String),

    /// Symbol resolution or the user callable itself failed.
    #[error("user callable failed: {0}")]
    UserFailure(String),
}

/// Result alias used by the protocol-level API.
pub type Result<T> = std::result::Result<T, DistwqError>;
