pub mod common;
pub mod config;
pub mod error;
pub mod orchestration;
pub mod proxy;
pub mod registry;
pub mod simulation;
pub mod strategy;

pub use common::{ParameterSet, ParticipantId};
pub use config::SessionConfig;
pub use error::{OrchestraError, Result};
pub use orchestration::{RoundOrchestrator, SessionReport, SessionStatus};
pub use simulation::{Participant, ParticipantFactory, start_simulation};
pub use strategy::{FedAvg, FedMedian, Strategy};
