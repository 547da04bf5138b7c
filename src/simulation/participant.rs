use crate::common::{Config, EvaluateRes, FitRes, ParameterSet, ParticipantId};

/// User supplied training and evaluation logic of one participant.
///
/// Instances are ephemeral: one is built for a single task and discarded right after,
/// so implementations must not rely on state surviving between tasks.
pub trait Participant: Send {
    /// Returns the participant's current local parameters.
    ///
    /// Only needed when the strategy doesn't provide the initial global parameters.
    fn get_parameters(&mut self, _config: &Config) -> anyhow::Result<ParameterSet> {
        anyhow::bail!("participant doesn't expose its parameters")
    }

    /// Trains on the local data starting from `parameters`.
    ///
    /// # Arguments
    /// * `parameters` - The current global parameters.
    /// * `config` - The round's configuration for this participant.
    ///
    /// # Returns
    /// The updated parameters, the amount of examples used and any metrics.
    fn fit(&mut self, parameters: &ParameterSet, config: &Config) -> anyhow::Result<FitRes>;

    /// Scores `parameters` on the local data.
    ///
    /// # Arguments
    /// * `parameters` - The current global parameters.
    /// * `config` - The round's configuration for this participant.
    ///
    /// # Returns
    /// The loss, the amount of examples evaluated and any metrics.
    fn evaluate(
        &mut self,
        parameters: &ParameterSet,
        config: &Config,
    ) -> anyhow::Result<EvaluateRes>;
}

impl<P: Participant + ?Sized> Participant for Box<P> {
    fn get_parameters(&mut self, config: &Config) -> anyhow::Result<ParameterSet> {
        (**self).get_parameters(config)
    }

    fn fit(&mut self, parameters: &ParameterSet, config: &Config) -> anyhow::Result<FitRes> {
        (**self).fit(parameters, config)
    }

    fn evaluate(
        &mut self,
        parameters: &ParameterSet,
        config: &Config,
    ) -> anyhow::Result<EvaluateRes> {
        (**self).evaluate(parameters, config)
    }
}

/// Builds a fresh participant instance for a given identity.
pub trait ParticipantBuilder: Send + Sync + 'static {
    fn build(&self, participant: &ParticipantId) -> anyhow::Result<Box<dyn Participant>>;
}

impl<F, P> ParticipantBuilder for F
where
    F: Fn(&ParticipantId) -> anyhow::Result<P> + Send + Sync + 'static,
    P: Participant + 'static,
{
    fn build(&self, participant: &ParticipantId) -> anyhow::Result<Box<dyn Participant>> {
        Ok(Box::new(self(participant)?))
    }
}
