use std::sync::Arc;

use log::info;

use super::{ParticipantBuilder, ParticipantFactory};
use crate::{
    common::ParticipantId,
    config::SessionConfig,
    error::Result,
    orchestration::{RoundOrchestrator, SessionReport},
    registry::ParticipantRegistry,
    strategy::Strategy,
};

/// Emulates `num_participants` participants on this host and runs a session over them.
///
/// Participants are identified as `"0"` through `num_participants - 1` and only
/// materialized, through `builder`, while they run a task.
///
/// # Arguments
/// * `builder` - Builds a fresh participant instance for a given identity.
/// * `num_participants` - How many logical participants to emulate.
/// * `strategy` - The federated learning algorithm.
/// * `config` - The session's configuration, including the resource budget.
///
/// # Returns
/// The session report, or an `InvalidConfig` error if the session couldn't start at all.
pub async fn start_simulation<B, S>(
    builder: B,
    num_participants: usize,
    strategy: S,
    config: SessionConfig,
) -> Result<SessionReport>
where
    B: ParticipantBuilder,
    S: Strategy,
{
    config.validate()?;

    let registry = Arc::new(ParticipantRegistry::new(config.seed));
    for i in 0..num_participants {
        registry.register(ParticipantId::from(i));
    }

    let budget = config.resource_budget();
    let factory = ParticipantFactory::new(builder, &budget, config.participant_demand())?;
    info!(
        participants = num_participants,
        max_concurrency = factory.pool().max_concurrency();
        "simulation ready"
    );

    let orchestrator = RoundOrchestrator::new(config, registry, Arc::new(factory), strategy)?;
    Ok(orchestrator.run().await)
}
