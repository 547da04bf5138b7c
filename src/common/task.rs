use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Config, Metrics, ParameterSet};

/// Stable token identifying one logical participant within a session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<usize> for ParticipantId {
    fn from(value: usize) -> Self {
        Self(value.to_string())
    }
}

/// The kind of work dispatched to a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Fit,
    Evaluate,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fit => f.write_str("fit"),
            Self::Evaluate => f.write_str("evaluate"),
        }
    }
}

/// A single unit of work for one participant, built fresh for every dispatch.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub round: u64,
    pub kind: TaskKind,
    pub parameters: ParameterSet,
    pub config: Config,
}

/// What a participant hands back after training.
#[derive(Debug, Clone)]
pub struct FitRes {
    /// The locally updated parameters.
    pub parameters: ParameterSet,
    /// The amount of examples used for training, it weights this result on aggregation.
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// What a participant hands back after scoring the parameters.
#[derive(Debug, Clone)]
pub struct EvaluateRes {
    pub loss: f64,
    /// The amount of examples evaluated, it weights this result on aggregation.
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// A successful task result tagged with the participant that produced it.
#[derive(Debug, Clone)]
pub struct Reply<T> {
    pub participant: ParticipantId,
    pub res: T,
}

/// Normalized reason of a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// The participant couldn't be constructed.
    Instantiation(String),
    /// The participant's code returned an error.
    Raised(String),
    /// The participant's code panicked.
    Panicked(String),
    /// The task was still outstanding when the round deadline elapsed.
    TimedOut,
    /// The session was cancelled while the task was in flight.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instantiation(msg) => write!(f, "instantiation failed: {msg}"),
            Self::Raised(msg) => write!(f, "task raised: {msg}"),
            Self::Panicked(msg) => write!(f, "task panicked: {msg}"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A failed task tagged with the participant it was dispatched to.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub participant: ParticipantId,
    pub reason: FailureReason,
}

impl TaskFailure {
    pub fn new(participant: ParticipantId, reason: FailureReason) -> Self {
        Self {
            participant,
            reason,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "participant {}: {}", self.participant, self.reason)
    }
}

/// The outcome of a single dispatched task.
pub type TaskResult<T> = std::result::Result<Reply<T>, TaskFailure>;
