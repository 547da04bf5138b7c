use std::{env, sync::Arc};

use anyhow::Context;
use log::{info, warn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Deserialize;
use tokio::signal;

use federated_orchestra::{
    FedAvg, FedMedian, ParameterSet, Participant, ParticipantFactory, ParticipantId,
    RoundOrchestrator, SessionConfig, SessionReport, Strategy,
    common::{Config, EvaluateRes, FitRes, Metrics, Scalar},
    registry::ParticipantRegistry,
};

const DEFAULT_PARTICIPANTS: usize = 10;
const SAMPLES_PER_PARTICIPANT: usize = 64;
const LEARNING_RATE: f32 = 0.05;

fn default_participants() -> usize {
    DEFAULT_PARTICIPANTS
}

/// The demo's configuration file, session options sit at the top level.
#[derive(Debug, Deserialize)]
struct DemoConfig {
    #[serde(default = "default_participants")]
    num_participants: usize,
    /// Aggregate with the coordinate-wise median instead of the weighted average.
    #[serde(default)]
    median: bool,
    #[serde(flatten)]
    session: SessionConfig,
}

/// A participant fitting `y = w * x + b` on its own synthetic shard.
struct LinearParticipant {
    xs: Vec<f32>,
    ys: Vec<f32>,
}

impl LinearParticipant {
    fn new(id: &ParticipantId) -> anyhow::Result<Self> {
        let seed: u64 = id.as_str().parse().context("participant ids must be numeric")?;
        let mut rng = StdRng::seed_from_u64(seed);

        let xs: Vec<f32> = (0..SAMPLES_PER_PARTICIPANT)
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();
        let ys = xs
            .iter()
            .map(|&x| 3.0 * x + 1.0 + rng.random_range(-0.1..0.1))
            .collect();

        Ok(Self { xs, ys })
    }

    fn unpack(parameters: &ParameterSet) -> anyhow::Result<(f32, f32)> {
        match parameters.to_f32()?.as_slice() {
            [t] if t.len() == 2 => Ok((t[0], t[1])),
            _ => anyhow::bail!("expected a single tensor with 2 values"),
        }
    }

    fn mse(&self, w: f32, b: f32) -> f32 {
        let sum: f32 = self
            .xs
            .iter()
            .zip(&self.ys)
            .map(|(x, y)| (w * x + b - y).powi(2))
            .sum();

        sum / self.xs.len() as f32
    }
}

impl Participant for LinearParticipant {
    fn get_parameters(&mut self, _config: &Config) -> anyhow::Result<ParameterSet> {
        Ok(ParameterSet::from_f32(&[vec![0.0, 0.0]]))
    }

    fn fit(&mut self, parameters: &ParameterSet, config: &Config) -> anyhow::Result<FitRes> {
        let (mut w, mut b) = Self::unpack(parameters)?;
        let epochs = config
            .get("epochs")
            .and_then(Scalar::as_f64)
            .unwrap_or(1.0) as usize;

        let n = self.xs.len() as f32;
        for _ in 0..epochs {
            let (mut gw, mut gb) = (0.0, 0.0);
            for (x, y) in self.xs.iter().zip(&self.ys) {
                let err = w * x + b - y;
                gw += 2.0 * err * x / n;
                gb += 2.0 * err / n;
            }

            w -= LEARNING_RATE * gw;
            b -= LEARNING_RATE * gb;
        }

        Ok(FitRes {
            parameters: ParameterSet::from_f32(&[vec![w, b]]),
            num_examples: self.xs.len() as u64,
            metrics: Metrics::from([("train_loss".to_string(), Scalar::from(self.mse(w, b)))]),
        })
    }

    fn evaluate(
        &mut self,
        parameters: &ParameterSet,
        _config: &Config,
    ) -> anyhow::Result<EvaluateRes> {
        let (w, b) = Self::unpack(parameters)?;

        Ok(EvaluateRes {
            loss: self.mse(w, b) as f64,
            num_examples: self.xs.len() as u64,
            metrics: Metrics::new(),
        })
    }
}

async fn run<S: Strategy>(
    demo: &DemoConfig,
    registry: Arc<ParticipantRegistry>,
    factory: Arc<ParticipantFactory>,
    strategy: S,
) -> anyhow::Result<SessionReport> {
    let orchestrator = RoundOrchestrator::new(demo.session.clone(), registry, factory, strategy)?;

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("received ctrl-c, cancelling the session");
            cancel.cancel();
        }
    });

    Ok(orchestrator.run().await)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let demo: DemoConfig = match env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {path}"))?;
            serde_json::from_str(&json).with_context(|| format!("invalid config file {path}"))?
        }
        None => DemoConfig {
            num_participants: DEFAULT_PARTICIPANTS,
            median: false,
            session: SessionConfig::default(),
        },
    };
    demo.session.validate()?;

    let registry = Arc::new(ParticipantRegistry::new(demo.session.seed));
    for i in 0..demo.num_participants {
        registry.register(ParticipantId::from(i));
    }

    let factory = Arc::new(ParticipantFactory::new(
        LinearParticipant::new,
        &demo.session.resource_budget(),
        demo.session.participant_demand(),
    )?);
    info!(
        participants = demo.num_participants,
        max_concurrency = factory.pool().max_concurrency();
        "simulation ready"
    );

    let strategy = FedAvg::from_config(&demo.session)
        .with_fit_config(|_| Config::from([("epochs".to_string(), Scalar::Int(5))]));

    let report = if demo.median {
        run(&demo, registry, factory, FedMedian::new(strategy)).await?
    } else {
        run(&demo, registry, factory, strategy).await?
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(parameters) = &report.parameters {
        info!("final parameters: {:?}", parameters.to_f32()?);
    }

    match report.error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
