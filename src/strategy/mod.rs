mod aggregate;
mod fedavg;
mod fedmedian;
mod sampling;
mod traits;

pub use aggregate::{Weighted, coordinate_median, weighted_average, weighted_loss, weighted_metrics};
pub use fedavg::{ConfigFn, EvaluateFn, FedAvg};
pub use fedmedian::FedMedian;
pub use sampling::SamplingOutcome;
pub use traits::{EvaluateAggregate, FitAggregate, Strategy};
