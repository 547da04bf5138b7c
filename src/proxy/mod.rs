mod ephemeral;
mod traits;

pub use ephemeral::EphemeralProxy;
pub(crate) use ephemeral::join_failure;
pub use traits::ParticipantProxy;
