use std::{collections::BTreeSet, time::Duration};

use log::{debug, info};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng, seq::IndexedRandom};
use tokio::{sync::watch, time};

use super::{AcceptAll, Criterion};
use crate::{
    common::ParticipantId,
    error::{OrchestraError, Result},
};

/// Tracks which participants currently exist and may be sampled.
///
/// Registration is advisory: a registered participant may still fail every task
/// it's given, that surfaces as a task failure and never as a registry error.
pub struct ParticipantRegistry {
    available: Mutex<BTreeSet<ParticipantId>>,
    count_tx: watch::Sender<usize>,
    rng: Mutex<StdRng>,
}

impl ParticipantRegistry {
    /// Creates a new `ParticipantRegistry`.
    ///
    /// # Arguments
    /// * `seed` - An optional seed for the sampling rng.
    ///
    /// # Returns
    /// A new empty `ParticipantRegistry` instance.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let (count_tx, _) = watch::channel(0);

        Self {
            available: Mutex::new(BTreeSet::new()),
            count_tx,
            rng: Mutex::new(rng),
        }
    }

    /// Marks a participant as available.
    ///
    /// # Returns
    /// `false` if the participant was already registered.
    pub fn register(&self, participant: ParticipantId) -> bool {
        let mut available = self.available.lock();
        let inserted = available.insert(participant);
        self.count_tx.send_replace(available.len());
        inserted
    }

    /// Removes a participant from the available set.
    ///
    /// # Returns
    /// `false` if the participant wasn't registered.
    pub fn unregister(&self, participant: &ParticipantId) -> bool {
        let mut available = self.available.lock();
        let removed = available.remove(participant);
        self.count_tx.send_replace(available.len());
        removed
    }

    /// The amount of participants currently available.
    pub fn available_count(&self) -> usize {
        self.available.lock().len()
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.available.lock().contains(participant)
    }

    /// A sorted copy of the currently available participants.
    pub fn snapshot(&self) -> Vec<ParticipantId> {
        self.available.lock().iter().cloned().collect()
    }

    /// Samples up to `n` distinct available participants uniformly at random, without replacement.
    ///
    /// # Arguments
    /// * `n` - The amount of participants wanted.
    /// * `min_num` - The minimum amount of eligible participants required to sample at all.
    /// * `criterion` - An optional filter, every participant is eligible if `None`.
    ///
    /// # Returns
    /// `min(n, eligible)` participants or `InsufficientParticipants` if there are
    /// fewer than `min_num` eligible participants.
    pub fn sample(
        &self,
        n: usize,
        min_num: usize,
        criterion: Option<&dyn Criterion>,
    ) -> Result<Vec<ParticipantId>> {
        let criterion = criterion.unwrap_or(&AcceptAll);

        let available = self.available.lock();
        let candidates: Vec<&ParticipantId> = available
            .iter()
            .filter(|participant| criterion.select(participant))
            .collect();

        if candidates.len() < min_num {
            return Err(OrchestraError::InsufficientParticipants {
                required: min_num,
                available: candidates.len(),
            });
        }

        let n = n.min(candidates.len());
        let mut rng = self.rng.lock();
        let sampled: Vec<ParticipantId> = candidates
            .choose_multiple(&mut *rng, n)
            .map(|participant| (*participant).clone())
            .collect();

        debug!(requested = n, eligible = candidates.len(); "sampled participants");
        Ok(sampled)
    }

    /// Waits until at least `min_count` participants are available.
    ///
    /// # Arguments
    /// * `min_count` - The availability threshold.
    /// * `timeout` - How long to wait before giving up.
    ///
    /// # Returns
    /// The amount of available participants once the threshold is met, or a `Timeout`
    /// error if it wasn't met in time.
    pub async fn wait_until_available(&self, min_count: usize, timeout: Duration) -> Result<usize> {
        let mut count_rx = self.count_tx.subscribe();

        info!(min_count = min_count; "waiting for participants");
        match time::timeout(timeout, count_rx.wait_for(|&count| count >= min_count)).await {
            Ok(Ok(count)) => Ok(*count),
            // The sender lives as long as `self`.
            Ok(Err(_)) => Err(OrchestraError::Cancelled),
            Err(_) => Err(OrchestraError::Timeout {
                what: "waiting for participants",
                after: timeout,
            }),
        }
    }
}
