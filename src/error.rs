use std::{fmt, io, time::Duration};

use crate::common::{ParticipantId, TaskFailure, TaskKind};

/// The crate's result type.
pub type Result<T> = std::result::Result<T, OrchestraError>;

/// All errors that can occur while orchestrating a session.
#[derive(Debug)]
pub enum OrchestraError {
    /// Invalid configuration, caught before any round starts.
    InvalidConfig(String),
    /// The registry can't satisfy the minimum availability.
    InsufficientParticipants { required: usize, available: usize },
    /// A wait or a round deadline was exceeded.
    Timeout { what: &'static str, after: Duration },
    /// A participant couldn't be constructed.
    Instantiation {
        participant: ParticipantId,
        reason: String,
    },
    /// A dispatched task failed.
    TaskFailure(TaskFailure),
    /// Too few dispatched tasks of a round succeeded.
    InsufficientResults {
        kind: TaskKind,
        required: usize,
        received: usize,
    },
    /// The strategy couldn't produce a valid aggregate.
    Aggregation(String),
    /// A tensor's byte length doesn't match its declared element type.
    MalformedTensor { index: usize, len: usize },
    /// The session was cancelled.
    Cancelled,
    /// An underlying I/O error, only reachable while loading configuration.
    Io(io::Error),
    /// A configuration document couldn't be parsed.
    Json(serde_json::Error),
}

impl fmt::Display for OrchestraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::InsufficientParticipants {
                required,
                available,
            } => write!(
                f,
                "insufficient participants: required {required}, available {available}"
            ),
            Self::Timeout { what, after } => write!(f, "{what} timed out after {after:?}"),
            Self::Instantiation {
                participant,
                reason,
            } => write!(f, "failed to instantiate participant {participant}: {reason}"),
            Self::TaskFailure(failure) => write!(f, "task failure: {failure}"),
            Self::InsufficientResults {
                kind,
                required,
                received,
            } => write!(
                f,
                "insufficient {kind} results: required {required}, received {received}"
            ),
            Self::Aggregation(msg) => write!(f, "aggregation error: {msg}"),
            Self::MalformedTensor { index, len } => {
                write!(f, "malformed tensor at position {index}: {len} bytes")
            }
            Self::Cancelled => f.write_str("session cancelled"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl std::error::Error for OrchestraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OrchestraError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for OrchestraError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<TaskFailure> for OrchestraError {
    fn from(failure: TaskFailure) -> Self {
        Self::TaskFailure(failure)
    }
}
