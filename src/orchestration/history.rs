use std::time::Duration;

use serde::Serialize;

use crate::{
    common::{Metrics, ParameterSet, ParticipantId, Reply, TaskFailure},
    error::OrchestraError,
};

/// A failed task as reported in the history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub participant: ParticipantId,
    pub reason: String,
}

impl From<&TaskFailure> for FailureRecord {
    fn from(failure: &TaskFailure) -> Self {
        Self {
            participant: failure.participant.clone(),
            reason: failure.reason.to_string(),
        }
    }
}

fn failure_records(failures: &[TaskFailure]) -> Vec<FailureRecord> {
    let mut records: Vec<FailureRecord> = failures.iter().map(FailureRecord::from).collect();
    records.sort_by(|a, b| a.participant.cmp(&b.participant));
    records
}

/// What happened during the fit stage of a round.
#[derive(Debug, Clone, Serialize)]
pub struct FitSummary {
    pub selected: usize,
    pub successes: usize,
    pub failures: Vec<FailureRecord>,
    pub metrics: Metrics,
}

impl FitSummary {
    pub(crate) fn new<T>(selected: usize, replies: &[Reply<T>], failures: &[TaskFailure]) -> Self {
        Self {
            selected,
            successes: replies.len(),
            failures: failure_records(failures),
            metrics: Metrics::new(),
        }
    }
}

/// What happened during the evaluate stage of a round.
///
/// Evaluation never aborts a session, whatever went wrong lands in `error`.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluateSummary {
    pub selected: usize,
    pub successes: usize,
    pub failures: Vec<FailureRecord>,
    pub loss: Option<f64>,
    pub metrics: Metrics,
    pub error: Option<String>,
}

impl EvaluateSummary {
    pub(crate) fn new<T>(selected: usize, replies: &[Reply<T>], failures: &[TaskFailure]) -> Self {
        Self {
            selected,
            successes: replies.len(),
            failures: failure_records(failures),
            loss: None,
            metrics: Metrics::new(),
            error: None,
        }
    }

    /// An evaluate stage that couldn't even be configured.
    pub(crate) fn unconfigured(error: &OrchestraError) -> Self {
        Self {
            selected: 0,
            successes: 0,
            failures: Vec::new(),
            loss: None,
            metrics: Metrics::new(),
            error: Some(error.to_string()),
        }
    }
}

/// The global parameters scored on the orchestrator itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CentralizedEvaluation {
    pub loss: f64,
    pub metrics: Metrics,
}

/// Everything recorded about one completed round.
#[derive(Debug, Clone, Serialize)]
pub struct RoundRecord {
    pub round: u64,
    pub fit: FitSummary,
    pub evaluate: Option<EvaluateSummary>,
    pub centralized: Option<CentralizedEvaluation>,
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
}

impl RoundRecord {
    /// The loss of this round, preferring the centralized one over the distributed one.
    pub fn loss(&self) -> Option<f64> {
        self.centralized
            .as_ref()
            .map(|eval| eval.loss)
            .or_else(|| self.evaluate.as_ref().and_then(|eval| eval.loss))
    }
}

fn as_secs<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

/// The ordered record of a session, only completed rounds are part of it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct History {
    /// Centralized evaluation of the initial parameters.
    pub initial: Option<CentralizedEvaluation>,
    pub rounds: Vec<RoundRecord>,
}

impl History {
    pub(crate) fn push(&mut self, record: RoundRecord) {
        self.rounds.push(record);
    }

    pub fn last(&self) -> Option<&RoundRecord> {
        self.rounds.last()
    }

    /// The loss of every round that has one, in round order.
    pub fn losses(&self) -> Vec<(u64, f64)> {
        self.rounds
            .iter()
            .filter_map(|record| Some((record.round, record.loss()?)))
            .collect()
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    /// The session stopped while `round` was in progress, 0 being the setup.
    Aborted { round: u64, reason: String },
}

/// What a session hands back to its caller, complete or not.
#[derive(Debug, Serialize)]
pub struct SessionReport {
    #[serde(flatten)]
    pub status: SessionStatus,
    /// The last round whose aggregation completed.
    pub rounds_completed: u64,
    pub history: History,
    /// The global parameters after `rounds_completed` rounds, if the session got that far.
    #[serde(skip)]
    pub parameters: Option<ParameterSet>,
    /// The error that aborted the session.
    #[serde(skip)]
    pub error: Option<OrchestraError>,
}

impl SessionReport {
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}
