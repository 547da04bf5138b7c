use std::{any::Any, fmt, time::Instant};

use log::{debug, warn};
use tokio::task::{self, JoinError};

use super::ParticipantProxy;
use crate::{
    common::{
        Config, EvaluateRes, FailureReason, FitRes, ParameterSet, ParticipantId, Reply,
        TaskFailure, TaskRequest, TaskResult,
    },
    simulation::{Materialized, Participant},
};

/// Proxy bound to a freshly materialized, single use participant instance.
///
/// The instance and its resource units live exactly as long as this proxy,
/// hand it back to `ParticipantFactory::release` (or drop it) once the task is done.
pub struct EphemeralProxy {
    participant: ParticipantId,
    slot: Option<Materialized>,
}

impl EphemeralProxy {
    pub(crate) fn new(participant: ParticipantId, materialized: Materialized) -> Self {
        Self {
            participant,
            slot: Some(materialized),
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Whether the underlying instance is gone, which only happens after it panicked.
    pub fn is_discarded(&self) -> bool {
        self.slot.is_none()
    }

    /// Runs `task` against the underlying instance on the blocking thread pool.
    ///
    /// # Arguments
    /// * `kind` - What's being run, for observability.
    /// * `task` - The call into the participant.
    ///
    /// # Returns
    /// The participant's reply, or a `TaskFailure` if it returned an error or panicked.
    /// A panicking instance is discarded together with its resources.
    async fn run<T, F>(&mut self, kind: &'static str, task: F) -> TaskResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Participant) -> anyhow::Result<T> + Send + 'static,
    {
        let Some(mut materialized) = self.slot.take() else {
            return Err(self.failure(FailureReason::Raised(
                "participant instance was already discarded".into(),
            )));
        };

        let start = Instant::now();
        let joined = task::spawn_blocking(move || {
            let res = task(materialized.instance.as_mut());
            (res, materialized)
        })
        .await;

        let reason = match joined {
            Ok((res, materialized)) => {
                self.slot = Some(materialized);

                match res {
                    Ok(res) => {
                        debug!(
                            "participant {} finished {kind} in {:?}",
                            self.participant,
                            start.elapsed()
                        );

                        return Ok(Reply {
                            participant: self.participant.clone(),
                            res,
                        });
                    }
                    Err(e) => FailureReason::Raised(format!("{e:#}")),
                }
            }
            Err(e) => join_failure(e),
        };

        let failure = self.failure(reason);
        warn!("{kind} failed: {failure}");
        Err(failure)
    }

    fn failure(&self, reason: FailureReason) -> TaskFailure {
        TaskFailure::new(self.participant.clone(), reason)
    }
}

impl fmt::Debug for EphemeralProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralProxy")
            .field("participant", &self.participant)
            .field("discarded", &self.is_discarded())
            .finish()
    }
}

#[async_trait::async_trait]
impl ParticipantProxy for EphemeralProxy {
    fn id(&self) -> &ParticipantId {
        &self.participant
    }

    async fn get_parameters(&mut self, config: Config) -> TaskResult<ParameterSet> {
        self.run("get_parameters", move |participant| {
            participant.get_parameters(&config)
        })
        .await
    }

    async fn fit(&mut self, request: TaskRequest) -> TaskResult<FitRes> {
        self.run("fit", move |participant| {
            participant.fit(&request.parameters, &request.config)
        })
        .await
    }

    async fn evaluate(&mut self, request: TaskRequest) -> TaskResult<EvaluateRes> {
        self.run("evaluate", move |participant| {
            participant.evaluate(&request.parameters, &request.config)
        })
        .await
    }
}

/// Normalizes a failed blocking task into a `FailureReason`.
pub(crate) fn join_failure(e: JoinError) -> FailureReason {
    if e.is_cancelled() {
        return FailureReason::Cancelled;
    }

    match e.try_into_panic() {
        Ok(payload) => FailureReason::Panicked(panic_message(payload.as_ref())),
        Err(e) => FailureReason::Raised(e.to_string()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        common::TaskKind,
        simulation::{ParticipantFactory, ResourceBudget},
    };

    /// Fails `fit` with an error, panics on `evaluate`.
    struct Faulty {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Faulty {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Participant for Faulty {
        fn fit(&mut self, _parameters: &ParameterSet, _config: &Config) -> anyhow::Result<FitRes> {
            anyhow::bail!("out of memory")
        }

        fn evaluate(
            &mut self,
            _parameters: &ParameterSet,
            _config: &Config,
        ) -> anyhow::Result<EvaluateRes> {
            panic!("division by zero")
        }
    }

    fn request(kind: TaskKind) -> TaskRequest {
        TaskRequest {
            round: 1,
            kind,
            parameters: ParameterSet::from_f32(&[vec![0.0]]),
            config: Config::new(),
        }
    }

    fn factory(drops: &Arc<AtomicUsize>) -> ParticipantFactory {
        let drops = Arc::clone(drops);
        let builder = move |_: &ParticipantId| -> anyhow::Result<Faulty> {
            Ok(Faulty {
                drops: Arc::clone(&drops),
            })
        };

        ParticipantFactory::with_budget(builder, &ResourceBudget::slots(2)).unwrap()
    }

    #[tokio::test]
    async fn errors_become_task_failures() {
        let drops = Arc::new(AtomicUsize::new(0));
        let factory = factory(&drops);

        let mut proxy = factory.acquire(&"7".into()).await.unwrap();
        let failure = proxy.fit(request(TaskKind::Fit)).await.unwrap_err();

        assert_eq!(failure.participant, "7".into());
        assert_eq!(
            failure.reason,
            FailureReason::Raised("out of memory".into())
        );
        assert!(!proxy.is_discarded());

        factory.release(proxy);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(factory.pool().in_use(), 0);
    }

    #[tokio::test]
    async fn panics_become_task_failures_and_discard_the_instance() {
        let drops = Arc::new(AtomicUsize::new(0));
        let factory = factory(&drops);

        let mut proxy = factory.acquire(&"3".into()).await.unwrap();
        let failure = proxy.evaluate(request(TaskKind::Evaluate)).await.unwrap_err();

        assert_eq!(
            failure.reason,
            FailureReason::Panicked("division by zero".into())
        );
        assert!(proxy.is_discarded());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(factory.pool().in_use(), 0);

        // The proxy is spent, later calls fail without reaching any instance.
        let failure = proxy.fit(request(TaskKind::Fit)).await.unwrap_err();
        assert!(matches!(failure.reason, FailureReason::Raised(_)));
        assert_eq!(
            format!("{proxy:?}"),
            r#"EphemeralProxy { participant: ParticipantId("3"), discarded: true }"#
        );
    }
}
