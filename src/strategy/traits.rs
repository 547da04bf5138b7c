use super::SamplingOutcome;
use crate::{
    common::{EvaluateRes, FitRes, Metrics, ParameterSet, Reply, TaskFailure},
    error::Result,
    orchestration::{CentralizedEvaluation, RoundRecord},
    registry::{Criterion, ParticipantRegistry},
};

/// The outcome of aggregating a fit round.
#[derive(Debug, Clone)]
pub struct FitAggregate {
    pub parameters: ParameterSet,
    pub metrics: Metrics,
}

/// The outcome of aggregating an evaluate round.
#[derive(Debug, Clone)]
pub struct EvaluateAggregate {
    pub loss: f64,
    pub metrics: Metrics,
}

/// The federated learning algorithm driving a session.
///
/// Every decision works on read only views of the session, the orchestrator is the
/// only one that ever mutates the global parameters.
pub trait Strategy: Send + Sync {
    /// The global parameters to start from, if `None` they're requested from a participant.
    fn initialize_parameters(&self) -> Option<ParameterSet> {
        None
    }

    /// Filters which participants may be sampled outside of `configure_fit` and
    /// `configure_evaluate`, such as the one asked for the initial parameters.
    fn criterion(&self) -> Option<&dyn Criterion> {
        None
    }

    /// Selects the participants to train in `round` and their configuration.
    ///
    /// # Arguments
    /// * `round` - The round about to start.
    /// * `parameters` - The current global parameters.
    /// * `registry` - The participants that may be sampled.
    ///
    /// # Returns
    /// The sampling outcome or `InsufficientParticipants` if too few are available.
    fn configure_fit(
        &self,
        round: u64,
        parameters: &ParameterSet,
        registry: &ParticipantRegistry,
    ) -> Result<SamplingOutcome>;

    /// Reduces the successful fit results of `round` into new global parameters.
    ///
    /// Must yield the same output for any order of `results`.
    ///
    /// # Arguments
    /// * `round` - The round being aggregated.
    /// * `results` - The successful replies, in arrival order.
    /// * `failures` - The tasks that failed.
    ///
    /// # Returns
    /// The new global parameters and aggregated metrics, or an `Aggregation` error.
    fn aggregate_fit(
        &self,
        round: u64,
        results: &[Reply<FitRes>],
        failures: &[TaskFailure],
    ) -> Result<FitAggregate>;

    /// Selects the participants to evaluate in `round`, an empty selection skips evaluation.
    fn configure_evaluate(
        &self,
        round: u64,
        parameters: &ParameterSet,
        registry: &ParticipantRegistry,
    ) -> Result<SamplingOutcome>;

    /// Reduces the successful evaluate results of `round` into a loss and metrics.
    fn aggregate_evaluate(
        &self,
        round: u64,
        results: &[Reply<EvaluateRes>],
        failures: &[TaskFailure],
    ) -> Result<EvaluateAggregate>;

    /// Scores the global parameters on the orchestrator itself, `round` 0 being the initial ones.
    fn evaluate(&self, _round: u64, _parameters: &ParameterSet) -> Option<CentralizedEvaluation> {
        None
    }

    /// Whether another round should run after `round`, the round budget permitting.
    fn should_continue(&self, _round: u64, _record: &RoundRecord) -> bool {
        true
    }
}
