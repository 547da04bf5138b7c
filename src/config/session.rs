use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{OrchestraError, Result},
    simulation::{ResourceBudget, ResourceDemand},
};

/// The host resources lent to materialized participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceSpec {
    /// At most this many participants materialized at once.
    Slots(u32),
    /// Capacity per named resource.
    Units(BTreeMap<String, u32>),
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self::Slots(1)
    }
}

/// Everything that drives a federated session, loadable from json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub num_rounds: u64,
    pub fraction_fit: f64,
    pub fraction_evaluate: f64,
    pub min_fit_participants: usize,
    pub min_evaluate_participants: usize,
    pub min_available_participants: usize,
    /// Deadline for collecting the results of one fit or evaluate fan-out.
    pub round_timeout_secs: Option<f64>,
    pub resource_budget: ResourceSpec,
    /// Units each participant instantiation takes, one of every budget resource if unset.
    pub participant_resources: Option<ResourceDemand>,
    /// How long to wait for participants each time a round can't be configured.
    pub availability_timeout_secs: Option<f64>,
    pub max_configure_retries: u32,
    pub accept_failures: bool,
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_rounds: 1,
            fraction_fit: 0.1,
            fraction_evaluate: 0.1,
            min_fit_participants: 2,
            min_evaluate_participants: 2,
            min_available_participants: 2,
            round_timeout_secs: None,
            resource_budget: ResourceSpec::default(),
            participant_resources: None,
            availability_timeout_secs: None,
            max_configure_retries: 0,
            accept_failures: true,
            seed: None,
        }
    }
}

impl SessionConfig {
    /// Parses and validates a configuration.
    ///
    /// # Arguments
    /// * `json` - The configuration as a json document, missing fields take their defaults.
    ///
    /// # Returns
    /// The configuration or an error if it's malformed or invalid.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a configuration file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks every option, so a session never starts with settings it can't honor.
    ///
    /// # Returns
    /// An `InvalidConfig` error describing the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.num_rounds == 0 {
            return Err(invalid("num_rounds must be positive"));
        }

        for (name, fraction) in [
            ("fraction_fit", self.fraction_fit),
            ("fraction_evaluate", self.fraction_evaluate),
        ] {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(invalid(format!("{name} must be within [0, 1], got {fraction}")));
            }
        }

        for (name, secs) in [
            ("round_timeout_secs", self.round_timeout_secs),
            ("availability_timeout_secs", self.availability_timeout_secs),
        ] {
            if let Some(secs) = secs
                && !Duration::try_from_secs_f64(secs).is_ok_and(|after| !after.is_zero())
            {
                return Err(invalid(format!("{name} must be a positive duration, got {secs}")));
            }
        }

        self.resource_budget().check(&self.participant_demand())
    }

    pub fn round_timeout(&self) -> Option<Duration> {
        self.round_timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn availability_timeout(&self) -> Option<Duration> {
        self.availability_timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn resource_budget(&self) -> ResourceBudget {
        match &self.resource_budget {
            ResourceSpec::Slots(n) => ResourceBudget::slots(*n),
            ResourceSpec::Units(units) => ResourceBudget::units(units.clone()),
        }
    }

    /// The units every participant instantiation takes from the budget.
    pub fn participant_demand(&self) -> ResourceDemand {
        match &self.participant_resources {
            Some(demand) => demand.clone(),
            None => self.resource_budget().unit_demand(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> OrchestraError {
    OrchestraError::InvalidConfig(msg.into())
}
