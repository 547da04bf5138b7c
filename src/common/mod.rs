mod parameters;
mod scalar;
mod task;

pub use parameters::{ParameterSet, TENSOR_F32, Tensor};
pub use scalar::{Config, Metrics, Scalar};
pub use task::{
    EvaluateRes, FailureReason, FitRes, ParticipantId, Reply, TaskFailure, TaskKind, TaskRequest,
    TaskResult,
};
