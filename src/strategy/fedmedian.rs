use super::{
    EvaluateAggregate, FedAvg, FitAggregate, SamplingOutcome, Strategy, coordinate_median,
    weighted_metrics,
};
use crate::{
    common::{EvaluateRes, FitRes, ParameterSet, Reply, TaskFailure},
    error::Result,
    orchestration::{CentralizedEvaluation, RoundRecord},
    registry::{Criterion, ParticipantRegistry},
};

/// Samples like `FedAvg` but aggregates parameters with their coordinate-wise median.
pub struct FedMedian {
    inner: FedAvg,
}

impl FedMedian {
    /// Creates a new `FedMedian` reusing every other decision of `inner`.
    pub fn new(inner: FedAvg) -> Self {
        Self { inner }
    }
}

impl Default for FedMedian {
    fn default() -> Self {
        Self::new(FedAvg::default())
    }
}

impl Strategy for FedMedian {
    fn initialize_parameters(&self) -> Option<ParameterSet> {
        self.inner.initialize_parameters()
    }

    fn criterion(&self) -> Option<&dyn Criterion> {
        self.inner.criterion()
    }

    fn configure_fit(
        &self,
        round: u64,
        parameters: &ParameterSet,
        registry: &ParticipantRegistry,
    ) -> Result<SamplingOutcome> {
        self.inner.configure_fit(round, parameters, registry)
    }

    fn aggregate_fit(
        &self,
        round: u64,
        results: &[Reply<FitRes>],
        failures: &[TaskFailure],
    ) -> Result<FitAggregate> {
        self.inner.check_failures(round, failures)?;

        Ok(FitAggregate {
            parameters: coordinate_median(results)?,
            metrics: weighted_metrics(results),
        })
    }

    fn configure_evaluate(
        &self,
        round: u64,
        parameters: &ParameterSet,
        registry: &ParticipantRegistry,
    ) -> Result<SamplingOutcome> {
        self.inner.configure_evaluate(round, parameters, registry)
    }

    fn aggregate_evaluate(
        &self,
        round: u64,
        results: &[Reply<EvaluateRes>],
        failures: &[TaskFailure],
    ) -> Result<EvaluateAggregate> {
        self.inner.aggregate_evaluate(round, results, failures)
    }

    fn evaluate(&self, round: u64, parameters: &ParameterSet) -> Option<CentralizedEvaluation> {
        self.inner.evaluate(round, parameters)
    }

    fn should_continue(&self, round: u64, record: &RoundRecord) -> bool {
        self.inner.should_continue(round, record)
    }
}
