use std::{sync::Arc, time::Duration};

use log::{error, info, warn};
use serde::Serialize;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use super::{
    EvaluateSummary, FitSummary, History, RoundRecord, SessionReport, SessionStatus,
    dispatch::{self, Collected},
};
use crate::{
    common::{EvaluateRes, FitRes, ParameterSet, TaskKind, TaskRequest},
    config::SessionConfig,
    error::{OrchestraError, Result},
    registry::ParticipantRegistry,
    simulation::ParticipantFactory,
    strategy::{SamplingOutcome, Strategy},
};

/// How long a configuration retry waits for participants when no timeout is configured.
const DEFAULT_AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    /// Running the given round, 0 while the initial parameters are being set up.
    Running(u64),
    Completed,
    Aborted,
}

/// The global model, owned by the orchestrator and only replaced at round boundaries.
#[derive(Debug, Clone)]
pub struct RoundState {
    round: u64,
    parameters: ParameterSet,
}

impl RoundState {
    fn new(parameters: ParameterSet) -> Self {
        Self {
            round: 0,
            parameters,
        }
    }

    /// The last round whose aggregation completed, 0 before the first one.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    /// Moves to `round` with its aggregated parameters, rounds only ever advance by one.
    fn advance(&mut self, round: u64, parameters: ParameterSet) {
        debug_assert_eq!(round, self.round + 1);
        self.round = round;
        self.parameters = parameters;
    }
}

/// Drives the round loop of a federated session.
pub struct RoundOrchestrator<S> {
    config: SessionConfig,
    registry: Arc<ParticipantRegistry>,
    factory: Arc<ParticipantFactory>,
    strategy: S,
    cancel: CancellationToken,
    phase: watch::Sender<Phase>,
    history: History,
}

impl<S: Strategy> RoundOrchestrator<S> {
    /// Creates a new `RoundOrchestrator`.
    ///
    /// # Arguments
    /// * `config` - The session's configuration.
    /// * `registry` - The participants that may be sampled.
    /// * `factory` - Materializes the sampled participants.
    /// * `strategy` - The federated learning algorithm.
    ///
    /// # Returns
    /// A new idle orchestrator or an `InvalidConfig` error.
    pub fn new(
        config: SessionConfig,
        registry: Arc<ParticipantRegistry>,
        factory: Arc<ParticipantFactory>,
        strategy: S,
    ) -> Result<Self> {
        config.validate()?;
        let (phase, _) = watch::channel(Phase::Idle);

        Ok(Self {
            config,
            registry,
            factory,
            strategy,
            cancel: CancellationToken::new(),
            phase,
            history: History::default(),
        })
    }

    /// A token that aborts the session once cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Subscribes to phase changes, the receiver outlives `run`.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Runs the session until the round budget is spent, the strategy stops it or it aborts.
    ///
    /// # Returns
    /// The session report, holding the history of every completed round either way.
    pub async fn run(mut self) -> SessionReport {
        info!(
            rounds = self.config.num_rounds,
            available = self.registry.available_count();
            "starting federated session"
        );
        self.phase.send_replace(Phase::Running(0));

        let mut state = match self.initialize().await {
            Ok(state) => state,
            Err(e) => return self.abort(None, 0, e).await,
        };

        match self.rounds(&mut state).await {
            Ok(()) => {
                info!(rounds = state.round; "session completed");
                self.phase.send_replace(Phase::Completed);
                self.report(Some(state), SessionStatus::Completed, None)
            }
            Err(e) => {
                let round = match self.phase() {
                    Phase::Running(round) => round,
                    _ => state.round + 1,
                };
                self.abort(Some(state), round, e).await
            }
        }
    }

    /// Sets up the initial global parameters and scores them.
    async fn initialize(&mut self) -> Result<RoundState> {
        let parameters = match self.strategy.initialize_parameters() {
            Some(parameters) => {
                info!("using the initial parameters provided by the strategy");
                parameters
            }
            None => {
                let participant = self
                    .with_retries(0, || {
                        self.check_available()?;
                        self.registry
                            .sample(1, 1, self.strategy.criterion())?
                            .pop()
                            .ok_or(OrchestraError::InsufficientParticipants {
                                required: 1,
                                available: 0,
                            })
                    })
                    .await?;

                info!("requesting initial parameters from participant {participant}");
                let deadline = self.deadline();
                dispatch::fetch_parameters(&self.factory, participant, deadline, &self.cancel).await?
            }
        };

        if let Some(evaluation) = self.strategy.evaluate(0, &parameters) {
            info!(loss = evaluation.loss; "initial parameters evaluated");
            self.history.initial = Some(evaluation);
        }

        Ok(RoundState::new(parameters))
    }

    async fn rounds(&mut self, state: &mut RoundState) -> Result<()> {
        for round in 1..=self.config.num_rounds {
            if self.cancel.is_cancelled() {
                return Err(OrchestraError::Cancelled);
            }

            self.phase.send_replace(Phase::Running(round));
            info!(round = round; "starting round");
            let start = Instant::now();

            let (parameters, fit) = self.fit_round(round, state.parameters()).await?;
            state.advance(round, parameters);

            let centralized = self.strategy.evaluate(round, state.parameters());
            let (evaluate, cancelled) = match self.evaluate_round(round, state.parameters()).await {
                Ok(evaluate) => (evaluate, false),
                Err(_) => (None, true),
            };

            let record = RoundRecord {
                round,
                fit,
                evaluate,
                centralized,
                elapsed: start.elapsed(),
            };

            info!(
                round = round,
                successes = record.fit.successes,
                failures = record.fit.failures.len();
                "round completed"
            );

            if cancelled {
                self.history.push(record);
                return Err(OrchestraError::Cancelled);
            }

            let proceed = self.strategy.should_continue(round, &record);
            self.history.push(record);

            if !proceed {
                info!("strategy stopped the session after round {round}");
                break;
            }
        }

        Ok(())
    }

    /// Samples, trains and aggregates, without touching the global state.
    ///
    /// # Returns
    /// The new global parameters and the fit summary, or the error that aborts the session.
    async fn fit_round(
        &self,
        round: u64,
        parameters: &ParameterSet,
    ) -> Result<(ParameterSet, FitSummary)> {
        let outcome = self.configure_fit(round, parameters).await?;

        let Collected { replies, failures } = dispatch::fan_out::<FitRes, _>(
            &self.factory,
            &outcome.fit,
            |participant| TaskRequest {
                round,
                kind: TaskKind::Fit,
                parameters: parameters.clone(),
                config: outcome.config_for(participant),
            },
            self.deadline(),
            &self.cancel,
        )
        .await?;

        let mut summary = FitSummary::new(outcome.fit.len(), &replies, &failures);
        if !failures.is_empty() {
            warn!(round = round, failures = failures.len(); "fit tasks failed");
        }

        let required = self.config.min_fit_participants;
        if replies.len() < required {
            return Err(OrchestraError::InsufficientResults {
                kind: TaskKind::Fit,
                required,
                received: replies.len(),
            });
        }

        let aggregate = self.strategy.aggregate_fit(round, &replies, &failures)?;
        summary.metrics = aggregate.metrics;
        Ok((aggregate.parameters, summary))
    }

    /// Asks the strategy for a fit sample, waiting for participants between retries.
    async fn configure_fit(&self, round: u64, parameters: &ParameterSet) -> Result<SamplingOutcome> {
        self.with_retries(round, || {
            self.check_available()?;

            let outcome = self.strategy.configure_fit(round, parameters, &self.registry)?;
            if outcome.fit.is_empty() {
                return Err(OrchestraError::InsufficientParticipants {
                    required: self.config.min_fit_participants.max(1),
                    available: self.registry.available_count(),
                });
            }

            Ok(outcome)
        })
        .await
    }

    /// Fails unless the registry holds the configured minimum of available participants.
    fn check_available(&self) -> Result<()> {
        let required = self.config.min_available_participants;
        let available = self.registry.available_count();

        if available < required {
            return Err(OrchestraError::InsufficientParticipants {
                required,
                available,
            });
        }

        Ok(())
    }

    /// Runs `attempt` until it stops failing for lack of participants, waiting for
    /// registrations in between, at most `max_configure_retries` times.
    async fn with_retries<T>(&self, round: u64, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
        let mut retries = 0;

        loop {
            let required = match attempt() {
                Err(OrchestraError::InsufficientParticipants { required, available })
                    if retries < self.config.max_configure_retries =>
                {
                    warn!(
                        round = round,
                        required = required,
                        available = available;
                        "not enough participants, waiting"
                    );
                    required
                }
                res => return res,
            };

            retries += 1;
            let timeout = self
                .config
                .availability_timeout()
                .unwrap_or(DEFAULT_AVAILABILITY_TIMEOUT);

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(OrchestraError::Cancelled),
                waited = self.registry.wait_until_available(required, timeout) => {
                    if let Err(e) = waited {
                        warn!("{e}");
                    }
                }
            }
        }
    }

    /// Evaluates the global parameters on a sample of participants.
    ///
    /// # Returns
    /// `None` if the strategy selected nobody, otherwise the evaluate summary. Only a
    /// cancellation is an error, anything else is recorded in the summary.
    async fn evaluate_round(
        &self,
        round: u64,
        parameters: &ParameterSet,
    ) -> Result<Option<EvaluateSummary>> {
        let outcome = match self.strategy.configure_evaluate(round, parameters, &self.registry) {
            Ok(outcome) if outcome.evaluate.is_empty() => return Ok(None),
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("skipping evaluation of round {round}: {e}");
                return Ok(Some(EvaluateSummary::unconfigured(&e)));
            }
        };

        let Collected { replies, failures } = dispatch::fan_out::<EvaluateRes, _>(
            &self.factory,
            &outcome.evaluate,
            |participant| TaskRequest {
                round,
                kind: TaskKind::Evaluate,
                parameters: parameters.clone(),
                config: outcome.config_for(participant),
            },
            self.deadline(),
            &self.cancel,
        )
        .await?;

        let mut summary = EvaluateSummary::new(outcome.evaluate.len(), &replies, &failures);
        let required = self.config.min_evaluate_participants;

        let aggregate = if replies.len() < required {
            Err(OrchestraError::InsufficientResults {
                kind: TaskKind::Evaluate,
                required,
                received: replies.len(),
            })
        } else {
            self.strategy.aggregate_evaluate(round, &replies, &failures)
        };

        match aggregate {
            Ok(aggregate) => {
                info!(round = round, loss = aggregate.loss; "round evaluated");
                summary.loss = Some(aggregate.loss);
                summary.metrics = aggregate.metrics;
            }
            Err(e) => {
                warn!("evaluation of round {round} failed: {e}");
                summary.error = Some(e.to_string());
            }
        }

        Ok(Some(summary))
    }

    fn deadline(&self) -> Option<Instant> {
        self.config.round_timeout().map(|timeout| Instant::now() + timeout)
    }

    /// Ends the session early, keeping whatever history was recorded.
    async fn abort(
        self,
        state: Option<RoundState>,
        round: u64,
        error: OrchestraError,
    ) -> SessionReport {
        if matches!(error, OrchestraError::Cancelled) {
            info!(in_use = self.factory.pool().in_use(); "waiting for participants to be released");
            self.factory.pool().drained().await;
        }

        error!(round = round; "session aborted: {error}");
        self.phase.send_replace(Phase::Aborted);

        let status = SessionStatus::Aborted {
            round,
            reason: error.to_string(),
        };
        self.report(state, status, Some(error))
    }

    fn report(
        self,
        state: Option<RoundState>,
        status: SessionStatus,
        error: Option<OrchestraError>,
    ) -> SessionReport {
        let (rounds_completed, parameters) = match state {
            Some(state) => (state.round, Some(state.parameters)),
            None => (0, None),
        };

        SessionReport {
            status,
            rounds_completed,
            history: self.history,
            parameters,
            error,
        }
    }
}
