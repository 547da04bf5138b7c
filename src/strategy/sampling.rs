use std::collections::HashMap;

use crate::common::{Config, ParticipantId};

/// Which participants take part in a round and what each of them is told.
///
/// Produced fresh by the strategy every round and consumed right away.
#[derive(Debug, Clone, Default)]
pub struct SamplingOutcome {
    pub fit: Vec<ParticipantId>,
    pub evaluate: Vec<ParticipantId>,
    pub configs: HashMap<ParticipantId, Config>,
}

impl SamplingOutcome {
    /// Selects `participants` for training, all of them sharing `config`.
    pub fn for_fit(participants: Vec<ParticipantId>, config: Config) -> Self {
        let configs = Self::shared(&participants, config);
        Self {
            fit: participants,
            configs,
            ..Default::default()
        }
    }

    /// Selects `participants` for evaluation, all of them sharing `config`.
    pub fn for_evaluate(participants: Vec<ParticipantId>, config: Config) -> Self {
        let configs = Self::shared(&participants, config);
        Self {
            evaluate: participants,
            configs,
            ..Default::default()
        }
    }

    /// The configuration for `participant`, empty if none was decided.
    pub fn config_for(&self, participant: &ParticipantId) -> Config {
        self.configs.get(participant).cloned().unwrap_or_default()
    }

    fn shared(participants: &[ParticipantId], config: Config) -> HashMap<ParticipantId, Config> {
        participants
            .iter()
            .map(|participant| (participant.clone(), config.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Scalar;

    #[test]
    fn every_selected_participant_gets_the_shared_config() {
        let config = Config::from([("epochs".to_string(), Scalar::Int(3))]);
        let outcome = SamplingOutcome::for_fit(vec!["a".into(), "b".into()], config.clone());

        assert_eq!(outcome.fit.len(), 2);
        assert!(outcome.evaluate.is_empty());
        assert_eq!(outcome.config_for(&"b".into()), config);
        assert!(outcome.config_for(&"z".into()).is_empty());
    }
}
