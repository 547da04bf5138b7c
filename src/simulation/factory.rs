use std::sync::Arc;

use log::{debug, warn};
use tokio::task;

use super::{Lease, Participant, ParticipantBuilder, ResourceBudget, ResourceDemand, ResourcePool};
use crate::{
    common::{FailureReason, ParticipantId},
    error::{OrchestraError, Result},
    proxy::{EphemeralProxy, join_failure},
};

/// A participant instance together with the resource units it holds.
///
/// The instance is dropped before its lease, so the units only go back to the
/// pool once the participant's state is actually gone.
pub(crate) struct Materialized {
    pub(crate) instance: Box<dyn Participant>,
    _lease: Lease,
}

/// Materializes ephemeral participants while keeping them within a resource budget.
pub struct ParticipantFactory {
    builder: Arc<dyn ParticipantBuilder>,
    pool: ResourcePool,
}

impl ParticipantFactory {
    /// Creates a new `ParticipantFactory`.
    ///
    /// # Arguments
    /// * `builder` - Builds a fresh participant instance given its identity.
    /// * `budget` - The resources available to materialized participants.
    /// * `demand` - The resources every participant instance consumes.
    ///
    /// # Returns
    /// A new factory or an `InvalidConfig` error if `demand` can't be satisfied by `budget`.
    pub fn new<B: ParticipantBuilder>(
        builder: B,
        budget: &ResourceBudget,
        demand: ResourceDemand,
    ) -> Result<Self> {
        Ok(Self {
            builder: Arc::new(builder),
            pool: ResourcePool::new(budget, demand)?,
        })
    }

    /// Creates a new `ParticipantFactory` where each participant takes one unit of every resource.
    pub fn with_budget<B: ParticipantBuilder>(builder: B, budget: &ResourceBudget) -> Result<Self> {
        Self::new(builder, budget, budget.unit_demand())
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Waits for free resources and materializes a new participant bound to a proxy.
    ///
    /// Construction runs on the blocking thread pool while holding the lease, so the
    /// units stay taken for as long as the instance may exist, even if this future is
    /// dropped halfway.
    ///
    /// # Arguments
    /// * `participant` - The identity of the participant to build.
    ///
    /// # Returns
    /// A proxy owning the new instance, or an `Instantiation` error if construction
    /// failed, in which case the units are already back in the pool.
    pub async fn acquire(&self, participant: &ParticipantId) -> Result<EphemeralProxy> {
        let lease = self.pool.acquire().await?;

        let builder = Arc::clone(&self.builder);
        let id = participant.clone();
        let built = task::spawn_blocking(move || match builder.build(&id) {
            Ok(instance) => Ok(Materialized {
                instance,
                _lease: lease,
            }),
            Err(e) => Err(format!("{e:#}")),
        })
        .await;

        let reason = match built {
            Ok(Ok(materialized)) => {
                debug!("participant {participant} materialized");
                return Ok(EphemeralProxy::new(participant.clone(), materialized));
            }
            Ok(Err(reason)) => reason,
            Err(e) => match join_failure(e) {
                FailureReason::Panicked(msg) => format!("builder panicked: {msg}"),
                other => other.to_string(),
            },
        };

        warn!("failed to instantiate participant {participant}: {reason}");
        Err(OrchestraError::Instantiation {
            participant: participant.clone(),
            reason,
        })
    }

    /// Discards the participant behind `proxy` and gives its resources back.
    ///
    /// Dropping the proxy has the same effect, this only makes the release explicit.
    pub fn release(&self, proxy: EphemeralProxy) {
        debug!("participant {} released", proxy.participant());
        drop(proxy);
    }
}
