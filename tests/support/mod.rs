#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use federated_orchestra::{
    ParameterSet, Participant, ParticipantId,
    common::{Config, EvaluateRes, FitRes, Metrics, Scalar, TaskKind},
};

/// What a mock participant does when given a task.
#[derive(Debug, Clone, Copy)]
pub enum Action {
    Succeed,
    Fail,
    Panic,
    Sleep(Duration),
}

/// Decides the action of participant `id` for a task of `kind` in `round`.
pub type Plan = dyn Fn(TaskKind, u64, usize) -> Action + Send + Sync;

/// Counts mock instances as they come and go.
#[derive(Debug, Default)]
pub struct Tally {
    built: AtomicUsize,
    dropped: AtomicUsize,
    live: AtomicUsize,
    peak_live: AtomicUsize,
}

impl Tally {
    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }
}

/// Adds one to every parameter it's given, and reports a loss of 1.
pub struct Mock {
    id: usize,
    plan: Arc<Plan>,
    tally: Arc<Tally>,
}

impl Drop for Mock {
    fn drop(&mut self) {
        self.tally.live.fetch_sub(1, Ordering::SeqCst);
        self.tally.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl Mock {
    fn act(&self, kind: TaskKind, config: &Config) -> anyhow::Result<()> {
        let round = config
            .get("round")
            .and_then(Scalar::as_f64)
            .unwrap_or(0.0) as u64;

        match (self.plan)(kind, round, self.id) {
            Action::Succeed => Ok(()),
            Action::Fail => anyhow::bail!("participant {} failed {kind} in round {round}", self.id),
            Action::Panic => panic!("participant {} panicked", self.id),
            Action::Sleep(delay) => {
                thread::sleep(delay);
                Ok(())
            }
        }
    }
}

impl Participant for Mock {
    fn get_parameters(&mut self, _config: &Config) -> anyhow::Result<ParameterSet> {
        Ok(ParameterSet::from_f32(&[vec![10.0]]))
    }

    fn fit(&mut self, parameters: &ParameterSet, config: &Config) -> anyhow::Result<FitRes> {
        self.act(TaskKind::Fit, config)?;

        let tensors: Vec<Vec<f32>> = parameters
            .to_f32()?
            .into_iter()
            .map(|t| t.into_iter().map(|x| x + 1.0).collect())
            .collect();

        Ok(FitRes {
            parameters: ParameterSet::from_f32(&tensors),
            num_examples: 1,
            metrics: Metrics::new(),
        })
    }

    fn evaluate(
        &mut self,
        _parameters: &ParameterSet,
        config: &Config,
    ) -> anyhow::Result<EvaluateRes> {
        self.act(TaskKind::Evaluate, config)?;

        Ok(EvaluateRes {
            loss: 1.0,
            num_examples: 1,
            metrics: Metrics::new(),
        })
    }
}

/// Builds `Mock` participants following `plan`, failing to build the ids in `unbuildable`.
pub fn builder<P>(
    plan: P,
    tally: &Arc<Tally>,
    unbuildable: &'static [usize],
) -> impl Fn(&ParticipantId) -> anyhow::Result<Mock> + Send + Sync + 'static
where
    P: Fn(TaskKind, u64, usize) -> Action + Send + Sync + 'static,
{
    let plan: Arc<Plan> = Arc::new(plan);
    let tally = Arc::clone(tally);

    move |participant: &ParticipantId| -> anyhow::Result<Mock> {
        let id: usize = participant.as_str().parse()?;
        if unbuildable.contains(&id) {
            anyhow::bail!("participant {id} has no data");
        }

        tally.built.fetch_add(1, Ordering::SeqCst);
        let live = tally.live.fetch_add(1, Ordering::SeqCst) + 1;
        tally.peak_live.fetch_max(live, Ordering::SeqCst);

        Ok(Mock {
            id,
            plan: Arc::clone(&plan),
            tally: Arc::clone(&tally),
        })
    }
}

/// Per-round configuration telling mocks which round they're in.
pub fn round_config(round: u64) -> Config {
    Config::from([("round".to_string(), Scalar::Int(round as i64))])
}

pub fn single(value: f32) -> ParameterSet {
    ParameterSet::from_f32(&[vec![value]])
}
