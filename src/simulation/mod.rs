mod app;
mod budget;
mod factory;
mod participant;

pub use app::start_simulation;
pub use budget::{Lease, ResourceBudget, ResourceDemand, ResourcePool};
pub(crate) use factory::Materialized;
pub use factory::ParticipantFactory;
pub use participant::{Participant, ParticipantBuilder};
