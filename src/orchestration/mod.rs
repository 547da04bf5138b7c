mod dispatch;
mod history;
mod orchestrator;

pub use history::{
    CentralizedEvaluation, EvaluateSummary, FailureRecord, FitSummary, History, RoundRecord,
    SessionReport, SessionStatus,
};
pub use orchestrator::{Phase, RoundOrchestrator, RoundState};
