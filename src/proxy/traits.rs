use crate::common::{
    Config, EvaluateRes, FitRes, ParameterSet, ParticipantId, TaskRequest, TaskResult,
};

/// The orchestrator's handle to one logical participant, wherever it actually runs.
///
/// Implementations never retry and never let a participant's failure escape as
/// anything but a `TaskFailure` tagged with the participant's identity.
#[async_trait::async_trait]
pub trait ParticipantProxy: Send {
    /// The identity of the participant behind this proxy.
    fn id(&self) -> &ParticipantId;

    /// Asks the participant for its current local parameters.
    ///
    /// # Arguments
    /// * `config` - Configuration forwarded to the participant.
    async fn get_parameters(&mut self, config: Config) -> TaskResult<ParameterSet>;

    /// Dispatches a training task.
    ///
    /// # Arguments
    /// * `request` - The round, global parameters and configuration to train with.
    async fn fit(&mut self, request: TaskRequest) -> TaskResult<FitRes>;

    /// Dispatches an evaluation task.
    ///
    /// # Arguments
    /// * `request` - The round, global parameters and configuration to evaluate with.
    async fn evaluate(&mut self, request: TaskRequest) -> TaskResult<EvaluateRes>;
}
