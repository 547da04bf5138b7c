use log::{debug, warn};

use super::{
    EvaluateAggregate, FitAggregate, SamplingOutcome, Strategy, weighted_average, weighted_loss,
    weighted_metrics,
};
use crate::{
    common::{
        Config, EvaluateRes, FitRes, Metrics, ParameterSet, ParticipantId, Reply, TaskFailure,
    },
    config::SessionConfig,
    error::{OrchestraError, Result},
    orchestration::{CentralizedEvaluation, RoundRecord},
    registry::{Criterion, ParticipantRegistry},
};

/// Builds the configuration sent to every selected participant of a round.
pub type ConfigFn = dyn Fn(u64) -> Config + Send + Sync;

/// Scores the global parameters of a round on the orchestrator, returning loss and metrics.
pub type EvaluateFn = dyn Fn(u64, &ParameterSet) -> anyhow::Result<(f64, Metrics)> + Send + Sync;

/// Federated averaging: uniform sampling and sample-count weighted aggregation.
pub struct FedAvg {
    fraction_fit: f64,
    fraction_evaluate: f64,
    min_fit_participants: usize,
    min_evaluate_participants: usize,
    min_available_participants: usize,
    accept_failures: bool,
    initial_parameters: Option<ParameterSet>,
    on_fit_config: Option<Box<ConfigFn>>,
    on_evaluate_config: Option<Box<ConfigFn>>,
    evaluate_fn: Option<Box<EvaluateFn>>,
    criterion: Option<Box<dyn Criterion>>,
    target_loss: Option<f64>,
}

impl Default for FedAvg {
    fn default() -> Self {
        Self {
            fraction_fit: 0.1,
            fraction_evaluate: 0.1,
            min_fit_participants: 2,
            min_evaluate_participants: 2,
            min_available_participants: 2,
            accept_failures: true,
            initial_parameters: None,
            on_fit_config: None,
            on_evaluate_config: None,
            evaluate_fn: None,
            criterion: None,
            target_loss: None,
        }
    }
}

impl FedAvg {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `FedAvg` taking its sampling settings from a session configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            fraction_fit: config.fraction_fit,
            fraction_evaluate: config.fraction_evaluate,
            min_fit_participants: config.min_fit_participants,
            min_evaluate_participants: config.min_evaluate_participants,
            min_available_participants: config.min_available_participants,
            accept_failures: config.accept_failures,
            ..Self::default()
        }
    }

    pub fn with_fractions(mut self, fit: f64, evaluate: f64) -> Self {
        self.fraction_fit = fit;
        self.fraction_evaluate = evaluate;
        self
    }

    pub fn with_min_participants(mut self, fit: usize, evaluate: usize, available: usize) -> Self {
        self.min_fit_participants = fit;
        self.min_evaluate_participants = evaluate;
        self.min_available_participants = available;
        self
    }

    /// If `false`, a fit round with any failure isn't aggregated.
    pub fn with_accept_failures(mut self, accept: bool) -> Self {
        self.accept_failures = accept;
        self
    }

    pub fn with_initial_parameters(mut self, parameters: ParameterSet) -> Self {
        self.initial_parameters = Some(parameters);
        self
    }

    pub fn with_fit_config<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) -> Config + Send + Sync + 'static,
    {
        self.on_fit_config = Some(Box::new(f));
        self
    }

    pub fn with_evaluate_config<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) -> Config + Send + Sync + 'static,
    {
        self.on_evaluate_config = Some(Box::new(f));
        self
    }

    pub fn with_evaluate_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(u64, &ParameterSet) -> anyhow::Result<(f64, Metrics)> + Send + Sync + 'static,
    {
        self.evaluate_fn = Some(Box::new(f));
        self
    }

    /// Only participants accepted by `criterion` are ever sampled.
    pub fn with_criterion<C: Criterion + 'static>(mut self, criterion: C) -> Self {
        self.criterion = Some(Box::new(criterion));
        self
    }

    /// Stops the session once a round's loss drops below `loss`.
    ///
    /// The centralized loss is preferred over the distributed one when both exist.
    pub fn with_target_loss(mut self, loss: f64) -> Self {
        self.target_loss = Some(loss);
        self
    }

    /// The amount of participants to sample out of `available`.
    ///
    /// Never more than `available`, never less than `min_num` unless there aren't as many.
    fn sample_size(fraction: f64, min_num: usize, available: usize) -> usize {
        let wanted = (fraction * available as f64).ceil() as usize;
        wanted.max(min_num).min(available)
    }

    fn sample(
        &self,
        fraction: f64,
        min_num: usize,
        registry: &ParticipantRegistry,
    ) -> Result<Vec<ParticipantId>> {
        let available = registry.available_count();
        if available < self.min_available_participants {
            return Err(OrchestraError::InsufficientParticipants {
                required: self.min_available_participants,
                available,
            });
        }

        let n = Self::sample_size(fraction, min_num, available);
        let sampled = registry.sample(
            n,
            self.min_available_participants,
            self.criterion.as_deref(),
        )?;

        if sampled.is_empty() {
            return Err(OrchestraError::InsufficientParticipants {
                required: min_num.max(1),
                available,
            });
        }

        Ok(sampled)
    }

    /// Refuses to aggregate a round with failures unless failures are accepted.
    pub(crate) fn check_failures(&self, round: u64, failures: &[TaskFailure]) -> Result<()> {
        if !self.accept_failures && !failures.is_empty() {
            return Err(OrchestraError::Aggregation(format!(
                "round {round} had {} failures and failures aren't accepted",
                failures.len()
            )));
        }

        Ok(())
    }

    fn round_config(f: Option<&ConfigFn>, round: u64) -> Config {
        f.map(|f| f(round)).unwrap_or_default()
    }
}

impl Strategy for FedAvg {
    fn initialize_parameters(&self) -> Option<ParameterSet> {
        self.initial_parameters.clone()
    }

    fn criterion(&self) -> Option<&dyn Criterion> {
        self.criterion.as_deref()
    }

    fn configure_fit(
        &self,
        round: u64,
        _parameters: &ParameterSet,
        registry: &ParticipantRegistry,
    ) -> Result<SamplingOutcome> {
        let sampled = self.sample(self.fraction_fit, self.min_fit_participants, registry)?;
        debug!(round = round, sampled = sampled.len(); "configured fit");

        let config = Self::round_config(self.on_fit_config.as_deref(), round);
        Ok(SamplingOutcome::for_fit(sampled, config))
    }

    fn aggregate_fit(
        &self,
        round: u64,
        results: &[Reply<FitRes>],
        failures: &[TaskFailure],
    ) -> Result<FitAggregate> {
        self.check_failures(round, failures)?;

        Ok(FitAggregate {
            parameters: weighted_average(results)?,
            metrics: weighted_metrics(results),
        })
    }

    fn configure_evaluate(
        &self,
        round: u64,
        _parameters: &ParameterSet,
        registry: &ParticipantRegistry,
    ) -> Result<SamplingOutcome> {
        if self.fraction_evaluate == 0.0 {
            return Ok(SamplingOutcome::default());
        }

        let sampled = self.sample(
            self.fraction_evaluate,
            self.min_evaluate_participants,
            registry,
        )?;
        debug!(round = round, sampled = sampled.len(); "configured evaluate");

        let config = Self::round_config(self.on_evaluate_config.as_deref(), round);
        Ok(SamplingOutcome::for_evaluate(sampled, config))
    }

    fn aggregate_evaluate(
        &self,
        round: u64,
        results: &[Reply<EvaluateRes>],
        failures: &[TaskFailure],
    ) -> Result<EvaluateAggregate> {
        self.check_failures(round, failures)?;

        Ok(EvaluateAggregate {
            loss: weighted_loss(results)?,
            metrics: weighted_metrics(results),
        })
    }

    fn evaluate(&self, round: u64, parameters: &ParameterSet) -> Option<CentralizedEvaluation> {
        let evaluate_fn = self.evaluate_fn.as_ref()?;

        match evaluate_fn(round, parameters) {
            Ok((loss, metrics)) => Some(CentralizedEvaluation { loss, metrics }),
            Err(e) => {
                warn!("centralized evaluation of round {round} failed: {e:#}");
                None
            }
        }
    }

    fn should_continue(&self, round: u64, record: &RoundRecord) -> bool {
        let (Some(target), Some(loss)) = (self.target_loss, record.loss()) else {
            return true;
        };

        if loss < target {
            debug!("loss {loss} of round {round} reached the target {target}");
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_err;

    use super::*;
    use crate::common::{FailureReason, Scalar};

    fn registry(n: usize) -> ParticipantRegistry {
        let registry = ParticipantRegistry::new(Some(7));
        for i in 0..n {
            registry.register(i.into());
        }
        registry
    }

    fn fit_reply(id: &str, num_examples: u64, value: f32) -> Reply<FitRes> {
        Reply {
            participant: id.into(),
            res: FitRes {
                parameters: ParameterSet::from_f32(&[vec![value]]),
                num_examples,
                metrics: Metrics::new(),
            },
        }
    }

    #[test]
    fn sample_size_follows_fraction_and_minimum() {
        assert_eq!(FedAvg::sample_size(0.1, 2, 100), 10);
        assert_eq!(FedAvg::sample_size(0.1, 2, 5), 2);
        assert_eq!(FedAvg::sample_size(0.25, 2, 10), 3);
        assert_eq!(FedAvg::sample_size(1.0, 20, 10), 10);
        assert_eq!(FedAvg::sample_size(0.0, 0, 10), 0);
    }

    #[test]
    fn configure_fit_samples_distinct_participants() {
        let strategy = FedAvg::new()
            .with_fractions(0.5, 0.0)
            .with_fit_config(|round| {
                Config::from([("round".to_string(), Scalar::from(round as i64))])
            });

        let registry = registry(10);
        let params = ParameterSet::empty();
        let outcome = strategy.configure_fit(3, &params, &registry).unwrap();

        let mut sampled = outcome.fit.clone();
        sampled.sort();
        sampled.dedup();
        assert_eq!(sampled.len(), 5);
        assert_eq!(
            outcome.config_for(&outcome.fit[0]).get("round"),
            Some(&Scalar::Int(3))
        );
    }

    #[test]
    fn configure_fit_fails_below_min_available() {
        let strategy = FedAvg::new().with_min_participants(2, 2, 10);
        let err = assert_err!(strategy.configure_fit(1, &ParameterSet::empty(), &registry(5)));

        assert!(matches!(
            err,
            OrchestraError::InsufficientParticipants {
                required: 10,
                available: 5
            }
        ));
    }

    #[test]
    fn zero_selected_is_insufficient() {
        let strategy = FedAvg::new()
            .with_fractions(0.0, 0.0)
            .with_min_participants(0, 0, 0);

        let err = assert_err!(strategy.configure_fit(1, &ParameterSet::empty(), &registry(3)));
        assert!(matches!(
            err,
            OrchestraError::InsufficientParticipants { required: 1, .. }
        ));
    }

    #[test]
    fn criterion_filters_candidates() {
        let strategy = FedAvg::new()
            .with_fractions(1.0, 0.0)
            .with_min_participants(1, 0, 1)
            .with_criterion(|id: &ParticipantId| id.as_str().starts_with('1'));

        let outcome = strategy
            .configure_fit(1, &ParameterSet::empty(), &registry(12))
            .unwrap();

        let mut sampled: Vec<_> = outcome.fit.iter().map(ParticipantId::as_str).collect();
        sampled.sort();
        assert_eq!(sampled, ["1", "10", "11"]);
    }

    #[test]
    fn zero_evaluate_fraction_skips_evaluation() {
        let strategy = FedAvg::new().with_fractions(0.5, 0.0);
        let outcome = strategy
            .configure_evaluate(1, &ParameterSet::empty(), &registry(10))
            .unwrap();

        assert!(outcome.evaluate.is_empty());
    }

    #[test]
    fn failures_can_be_refused() {
        let results = [fit_reply("a", 10, 2.0), fit_reply("b", 20, 5.0)];
        let failures = [TaskFailure::new("c".into(), FailureReason::TimedOut)];

        let lenient = FedAvg::new();
        let aggregate = lenient.aggregate_fit(1, &results, &failures).unwrap();
        assert_eq!(aggregate.parameters.to_f32().unwrap(), vec![vec![4.0]]);

        let strict = FedAvg::new().with_accept_failures(false);
        assert!(matches!(
            strict.aggregate_fit(1, &results, &failures),
            Err(OrchestraError::Aggregation(_))
        ));
    }

    #[test]
    fn centralized_evaluation_errors_are_swallowed() {
        let strategy = FedAvg::new().with_evaluate_fn(|round, _| {
            if round == 0 {
                anyhow::bail!("no test set yet");
            }
            Ok((0.5, Metrics::new()))
        });

        let params = ParameterSet::empty();
        assert!(strategy.evaluate(0, &params).is_none());
        assert_eq!(strategy.evaluate(1, &params).map(|e| e.loss), Some(0.5));
    }
}
