mod availability;
mod criterion;

pub use availability::ParticipantRegistry;
pub use criterion::{AcceptAll, Criterion};
