use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use log::debug;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};

use crate::error::{OrchestraError, Result};

/// Units of every resource a single participant instantiation consumes.
pub type ResourceDemand = BTreeMap<String, u32>;

/// The capacity of every resource the host lends to materialized participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceBudget {
    capacity: BTreeMap<String, u32>,
}

impl ResourceBudget {
    /// Name of the single resource of a plain concurrency budget.
    pub const SLOTS: &'static str = "slots";

    /// A budget that allows at most `n` participants to be materialized at once.
    pub fn slots(n: u32) -> Self {
        Self::units(BTreeMap::from([(Self::SLOTS.to_string(), n)]))
    }

    /// A budget over arbitrary named resources.
    pub fn units(capacity: BTreeMap<String, u32>) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self, resource: &str) -> Option<u32> {
        self.capacity.get(resource).copied()
    }

    /// The demand of a participant that consumes one unit of every resource.
    pub fn unit_demand(&self) -> ResourceDemand {
        self.capacity.keys().map(|name| (name.clone(), 1)).collect()
    }

    /// Checks that this budget is usable and that `demand` can ever be satisfied by it.
    ///
    /// # Arguments
    /// * `demand` - What each participant instantiation consumes.
    ///
    /// # Returns
    /// An `InvalidConfig` error if the budget is empty, a demand is unknown to the
    /// budget, exceeds its capacity or doesn't consume anything at all.
    pub fn check(&self, demand: &ResourceDemand) -> Result<()> {
        if self.capacity.is_empty() || self.capacity.values().all(|&units| units == 0) {
            return Err(OrchestraError::InvalidConfig(
                "resource budget has no capacity".into(),
            ));
        }

        for (name, &units) in demand {
            let Some(capacity) = self.capacity(name) else {
                return Err(OrchestraError::InvalidConfig(format!(
                    "participant demands unknown resource `{name}`"
                )));
            };

            if units > capacity {
                return Err(OrchestraError::InvalidConfig(format!(
                    "participant demands {units} `{name}` but the budget only has {capacity}"
                )));
            }
        }

        if demand.values().all(|&units| units == 0) {
            return Err(OrchestraError::InvalidConfig(
                "participant demand doesn't consume any resource".into(),
            ));
        }

        Ok(())
    }
}

/// Lease bookkeeping shared between a pool and its outstanding leases.
#[derive(Debug)]
struct PoolStats {
    in_use: watch::Sender<usize>,
    peak: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl PoolStats {
    fn on_acquire(&self) {
        let mut now = 0;
        self.in_use.send_modify(|in_use| {
            *in_use += 1;
            now = *in_use;
        });
        self.peak.fetch_max(now, Ordering::AcqRel);
        self.acquired.fetch_add(1, Ordering::AcqRel);
    }

    fn on_release(&self) {
        self.released.fetch_add(1, Ordering::AcqRel);
        self.in_use.send_modify(|in_use| *in_use -= 1);
    }
}

/// Units of a `ResourcePool` held by one materialized participant.
///
/// The units go back to the pool when the lease is dropped, on every exit path.
#[derive(Debug)]
pub struct Lease {
    permits: Vec<OwnedSemaphorePermit>,
    stats: Arc<PoolStats>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.permits.clear();
        self.stats.on_release();
    }
}

/// Counting semaphores over a `ResourceBudget`, one per resource.
#[derive(Debug)]
pub struct ResourcePool {
    budget: ResourceBudget,
    semaphores: BTreeMap<String, Arc<Semaphore>>,
    demand: ResourceDemand,
    stats: Arc<PoolStats>,
}

impl ResourcePool {
    /// Creates a new `ResourcePool`.
    ///
    /// # Arguments
    /// * `budget` - The capacity of every resource.
    /// * `demand` - The units every lease takes from the pool.
    ///
    /// # Returns
    /// A new pool or an `InvalidConfig` error if `demand` can't be satisfied by `budget`.
    pub fn new(budget: &ResourceBudget, demand: ResourceDemand) -> Result<Self> {
        budget.check(&demand)?;

        let semaphores = budget
            .capacity
            .iter()
            .map(|(name, &units)| (name.clone(), Arc::new(Semaphore::new(units as usize))))
            .collect();

        let (in_use, _) = watch::channel(0);
        let stats = PoolStats {
            in_use,
            peak: AtomicUsize::new(0),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        };

        Ok(Self {
            budget: budget.clone(),
            semaphores,
            demand,
            stats: Arc::new(stats),
        })
    }

    /// Waits until the units of one lease are free and takes them.
    ///
    /// Resources are always taken in name order, so concurrent acquisitions over
    /// several resources can't deadlock each other. Dropping the returned future
    /// gives back whatever was already taken.
    ///
    /// # Returns
    /// A lease over the demanded units.
    pub async fn acquire(&self) -> Result<Lease> {
        let mut permits = Vec::with_capacity(self.demand.len());

        for (name, semaphore) in &self.semaphores {
            let units = self.demand.get(name).copied().unwrap_or(0);
            if units == 0 {
                continue;
            }

            let permit = Arc::clone(semaphore)
                .acquire_many_owned(units)
                .await
                .map_err(|_| OrchestraError::Cancelled)?;

            permits.push(permit);
        }

        self.stats.on_acquire();
        debug!(in_use = self.in_use(); "resource lease acquired");

        Ok(Lease {
            permits,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Waits until every lease handed out by this pool has been dropped.
    pub async fn drained(&self) {
        let mut in_use = self.stats.in_use.subscribe();
        // The sender lives as long as `self`.
        let _ = in_use.wait_for(|&n| n == 0).await;
    }

    /// The largest amount of leases that can be outstanding at once.
    pub fn max_concurrency(&self) -> usize {
        self.demand
            .iter()
            .filter(|&(_, &units)| units > 0)
            .filter_map(|(name, &units)| Some((self.budget.capacity(name)? / units) as usize))
            .min()
            .unwrap_or(0)
    }

    /// Free units of `resource`.
    pub fn available(&self, resource: &str) -> Option<usize> {
        self.semaphores
            .get(resource)
            .map(|semaphore| semaphore.available_permits())
    }

    /// Leases currently outstanding.
    pub fn in_use(&self) -> usize {
        *self.stats.in_use.borrow()
    }

    /// The most leases ever outstanding at the same time.
    pub fn peak_in_use(&self) -> usize {
        self.stats.peak.load(Ordering::Acquire)
    }

    pub fn total_acquired(&self) -> u64 {
        self.stats.acquired.load(Ordering::Acquire)
    }

    pub fn total_released(&self) -> u64 {
        self.stats.released.load(Ordering::Acquire)
    }
}
