use std::{collections::BTreeMap, future::Future, sync::Arc};

use futures::future;
use log::{debug, warn};
use tokio::{
    task::{JoinError, JoinSet},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    common::{
        Config, EvaluateRes, FailureReason, FitRes, ParameterSet, ParticipantId, Reply,
        TaskFailure, TaskRequest, TaskResult,
    },
    error::{OrchestraError, Result},
    proxy::{EphemeralProxy, ParticipantProxy},
    simulation::ParticipantFactory,
};

/// A task result type the orchestrator knows how to dispatch.
pub(crate) trait TaskOutput: Send + Sized + 'static {
    fn dispatch(
        proxy: &mut EphemeralProxy,
        request: TaskRequest,
    ) -> impl Future<Output = TaskResult<Self>> + Send;
}

impl TaskOutput for FitRes {
    fn dispatch(
        proxy: &mut EphemeralProxy,
        request: TaskRequest,
    ) -> impl Future<Output = TaskResult<Self>> + Send {
        proxy.fit(request)
    }
}

impl TaskOutput for EvaluateRes {
    fn dispatch(
        proxy: &mut EphemeralProxy,
        request: TaskRequest,
    ) -> impl Future<Output = TaskResult<Self>> + Send {
        proxy.evaluate(request)
    }
}

/// The results of one fan-out, successes in arrival order.
pub(crate) struct Collected<T> {
    pub(crate) replies: Vec<Reply<T>>,
    pub(crate) failures: Vec<TaskFailure>,
}

enum Event<T> {
    Joined(Option<std::result::Result<(usize, TaskResult<T>), JoinError>>),
    Deadline,
    Cancelled,
}

/// Dispatches one task per participant concurrently and collects whatever comes back.
///
/// Every task materializes its participant through `factory`, so dispatches beyond the
/// resource budget queue until units free up.
///
/// # Arguments
/// * `factory` - Materializes the participants.
/// * `participants` - Who to dispatch to.
/// * `request` - Builds the request for each participant.
/// * `deadline` - When outstanding tasks are given up on and reported as timed out.
/// * `cancel` - Cancels every task of the session.
///
/// # Returns
/// The collected replies and failures, or `Cancelled` if the session was cancelled
/// in which case every task has been aborted.
pub(crate) async fn fan_out<T, F>(
    factory: &Arc<ParticipantFactory>,
    participants: &[ParticipantId],
    request: F,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<Collected<T>>
where
    T: TaskOutput,
    F: Fn(&ParticipantId) -> TaskRequest,
{
    let mut tasks = JoinSet::new();
    // Keyed by position, a participant selected twice runs and fails twice.
    let mut outstanding = BTreeMap::new();

    for (index, participant) in participants.iter().enumerate() {
        let factory = Arc::clone(factory);
        let request = request(participant);

        outstanding.insert(index, participant.clone());
        let task = run_task::<T>(factory, participant.clone(), request);
        tasks.spawn(async move { (index, task.await) });
    }

    let mut replies = Vec::with_capacity(participants.len());
    let mut failures = Vec::new();
    let mut timed_out = false;

    let expiry = async {
        match deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => future::pending().await,
        }
    };
    tokio::pin!(expiry);

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => Event::Cancelled,
            _ = &mut expiry => Event::Deadline,
            joined = tasks.join_next() => Event::Joined(joined),
        };

        match event {
            Event::Joined(None) => break,
            Event::Joined(Some(Ok((index, res)))) => {
                outstanding.remove(&index);
                match res {
                    Ok(reply) => replies.push(reply),
                    Err(failure) => failures.push(failure),
                }
            }
            Event::Joined(Some(Err(e))) => warn!("dispatch task terminated: {e}"),
            Event::Deadline => {
                warn!(outstanding = outstanding.len(); "round deadline elapsed");
                timed_out = true;
                tasks.shutdown().await;
                break;
            }
            Event::Cancelled => {
                debug!(outstanding = outstanding.len(); "cancelling in flight tasks");
                tasks.shutdown().await;
                return Err(OrchestraError::Cancelled);
            }
        }
    }

    for participant in outstanding.into_values() {
        let reason = if timed_out {
            FailureReason::TimedOut
        } else {
            FailureReason::Panicked("dispatch task terminated".into())
        };
        failures.push(TaskFailure::new(participant, reason));
    }

    Ok(Collected { replies, failures })
}

/// Materializes one participant, runs one task on it and discards it.
async fn run_task<T: TaskOutput>(
    factory: Arc<ParticipantFactory>,
    participant: ParticipantId,
    request: TaskRequest,
) -> TaskResult<T> {
    let mut proxy = acquire(&factory, participant).await?;
    let res = T::dispatch(&mut proxy, request).await;
    factory.release(proxy);
    res
}

async fn get_parameters(
    factory: &ParticipantFactory,
    participant: ParticipantId,
) -> TaskResult<ParameterSet> {
    let mut proxy = acquire(factory, participant).await?;
    let res = proxy.get_parameters(Config::new()).await;
    factory.release(proxy);
    res
}

async fn acquire(
    factory: &ParticipantFactory,
    participant: ParticipantId,
) -> std::result::Result<EphemeralProxy, TaskFailure> {
    match factory.acquire(&participant).await {
        Ok(proxy) => Ok(proxy),
        Err(OrchestraError::Instantiation { reason, .. }) => Err(TaskFailure::new(
            participant,
            FailureReason::Instantiation(reason),
        )),
        Err(OrchestraError::Cancelled) => {
            Err(TaskFailure::new(participant, FailureReason::Cancelled))
        }
        Err(e) => Err(TaskFailure::new(
            participant,
            FailureReason::Raised(e.to_string()),
        )),
    }
}

/// Asks a single participant for its parameters.
///
/// # Returns
/// The parameters, a `TaskFailure` error if the participant couldn't provide them,
/// `Timeout` if `deadline` elapsed first or `Cancelled`.
pub(crate) async fn fetch_parameters(
    factory: &ParticipantFactory,
    participant: ParticipantId,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<ParameterSet> {
    let start = Instant::now();
    let fetch = get_parameters(factory, participant);

    let fetched = tokio::select! {
        _ = cancel.cancelled() => return Err(OrchestraError::Cancelled),
        fetched = async {
            match deadline {
                Some(deadline) => time::timeout_at(deadline, fetch).await.ok(),
                None => Some(fetch.await),
            }
        } => fetched,
    };

    match fetched {
        Some(Ok(reply)) => Ok(reply.res),
        Some(Err(failure)) => Err(failure.into()),
        None => Err(OrchestraError::Timeout {
            what: "initial parameters request",
            after: start.elapsed(),
        }),
    }
}
