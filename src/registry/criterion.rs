use crate::common::ParticipantId;

/// Decides whether a participant may be sampled.
pub trait Criterion: Send + Sync {
    /// Should return `true` if `participant` is eligible for sampling.
    fn select(&self, participant: &ParticipantId) -> bool;
}

impl<F> Criterion for F
where
    F: Fn(&ParticipantId) -> bool + Send + Sync,
{
    fn select(&self, participant: &ParticipantId) -> bool {
        self(participant)
    }
}

/// Every participant is eligible, the default criterion.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Criterion for AcceptAll {
    fn select(&self, _participant: &ParticipantId) -> bool {
        true
    }
}
