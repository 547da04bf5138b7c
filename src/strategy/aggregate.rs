use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::{
    common::{EvaluateRes, FitRes, Metrics, ParameterSet, Reply, Scalar},
    error::{OrchestraError, Result},
};

/// A task result that carries a sample count and metrics.
pub trait Weighted {
    fn num_examples(&self) -> u64;
    fn metrics(&self) -> &Metrics;
}

impl Weighted for FitRes {
    fn num_examples(&self) -> u64 {
        self.num_examples
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl Weighted for EvaluateRes {
    fn num_examples(&self) -> u64 {
        self.num_examples
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

/// Orders replies by participant, then weight, so reductions never see arrival order.
fn canonical<T: Weighted>(replies: &[Reply<T>]) -> Vec<&Reply<T>> {
    let mut sorted: Vec<_> = replies.iter().collect();
    sorted.sort_by(|a, b| {
        a.participant
            .cmp(&b.participant)
            .then_with(|| a.res.num_examples().cmp(&b.res.num_examples()))
    });
    sorted
}

/// Like `canonical` but ties are broken by the tensor bytes too.
fn canonical_fit(replies: &[Reply<FitRes>]) -> Vec<&Reply<FitRes>> {
    let mut sorted: Vec<_> = replies.iter().collect();
    sorted.sort_by(|a, b| {
        a.participant
            .cmp(&b.participant)
            .then_with(|| a.res.num_examples.cmp(&b.res.num_examples))
            .then_with(|| a.res.parameters.tensors().cmp(b.res.parameters.tensors()))
    });
    sorted
}

/// Sums the sample counts of a round.
///
/// # Returns
/// The total, or an `Aggregation` error if it's zero or doesn't fit in a `u64`.
fn total_weight(weights: impl IntoIterator<Item = u64>) -> Result<u64> {
    let total = weights
        .into_iter()
        .try_fold(0u64, u64::checked_add)
        .ok_or_else(|| OrchestraError::Aggregation("total weight overflows".into()))?;

    if total == 0 {
        return Err(OrchestraError::Aggregation("total weight is zero".into()));
    }

    Ok(total)
}

/// Decodes the parameters of every reply, checking they all share the same layout.
fn decode(replies: &[&Reply<FitRes>]) -> Result<Vec<Vec<Vec<f32>>>> {
    let Some(first) = replies.first() else {
        return Err(OrchestraError::Aggregation("no results to aggregate".into()));
    };

    let tensor_type = first.res.parameters.tensor_type();
    let decoded = replies
        .iter()
        .map(|reply| {
            if reply.res.parameters.tensor_type() != tensor_type {
                return Err(OrchestraError::Aggregation(format!(
                    "participant {} sent `{}` tensors, expected `{tensor_type}`",
                    reply.participant,
                    reply.res.parameters.tensor_type()
                )));
            }

            reply.res.parameters.to_f32()
        })
        .collect::<Result<Vec<_>>>()?;

    let shape: Vec<usize> = decoded[0].iter().map(Vec::len).collect();
    for (reply, tensors) in replies.iter().zip(&decoded) {
        if !tensors.iter().map(Vec::len).eq(shape.iter().copied()) {
            return Err(OrchestraError::Aggregation(format!(
                "participant {} sent parameters with a different shape",
                reply.participant
            )));
        }
    }

    Ok(decoded)
}

/// Sample-count weighted average of the parameters of every reply.
///
/// Each tensor position is reduced independently in `f64` following a canonical
/// order of the replies, so the same set of replies always yields the same bits.
///
/// # Arguments
/// * `replies` - Successful fit results.
///
/// # Returns
/// The averaged parameters, or an `Aggregation` error if there's nothing to average,
/// the total weight is zero or the parameters don't share a layout.
pub fn weighted_average(replies: &[Reply<FitRes>]) -> Result<ParameterSet> {
    let sorted = canonical_fit(replies);
    let decoded = decode(&sorted)?;

    let weights: Vec<f64> = sorted
        .iter()
        .map(|reply| reply.res.num_examples as f64)
        .collect();

    let total = total_weight(sorted.iter().map(|reply| reply.res.num_examples))? as f64;

    let tensors: Vec<Vec<f32>> = (0..decoded[0].len())
        .into_par_iter()
        .map(|pos| {
            let mut acc = vec![0f64; decoded[0][pos].len()];

            for (weight, tensors) in weights.iter().zip(&decoded) {
                acc.iter_mut()
                    .zip(&tensors[pos])
                    .for_each(|(a, &x)| *a += weight * x as f64);
            }

            acc.into_iter().map(|a| (a / total) as f32).collect()
        })
        .collect();

    Ok(ParameterSet::from_f32(&tensors))
}

/// Coordinate-wise median of the parameters of every reply, sample counts are ignored.
///
/// # Returns
/// The median parameters, or an `Aggregation` error if there's nothing to reduce or
/// the parameters don't share a layout.
pub fn coordinate_median(replies: &[Reply<FitRes>]) -> Result<ParameterSet> {
    let sorted = canonical_fit(replies);
    let decoded = decode(&sorted)?;

    let tensors: Vec<Vec<f32>> = (0..decoded[0].len())
        .into_par_iter()
        .map(|pos| {
            let mut column = Vec::with_capacity(decoded.len());

            (0..decoded[0][pos].len())
                .map(|i| {
                    column.clear();
                    column.extend(decoded.iter().map(|tensors| tensors[pos][i]));
                    column.sort_by(f32::total_cmp);
                    median(&column)
                })
                .collect()
        })
        .collect();

    Ok(ParameterSet::from_f32(&tensors))
}

fn median(sorted: &[f32]) -> f32 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        ((sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0) as f32
    }
}

/// Sample-count weighted average of the reported losses.
///
/// # Returns
/// The averaged loss, or an `Aggregation` error if there's nothing to average or the
/// total weight is zero.
pub fn weighted_loss(replies: &[Reply<EvaluateRes>]) -> Result<f64> {
    if replies.is_empty() {
        return Err(OrchestraError::Aggregation("no results to aggregate".into()));
    }

    let mut sorted: Vec<_> = replies.iter().collect();
    sorted.sort_by(|a, b| {
        a.participant
            .cmp(&b.participant)
            .then_with(|| a.res.num_examples.cmp(&b.res.num_examples))
            .then_with(|| a.res.loss.total_cmp(&b.res.loss))
    });

    let total = total_weight(sorted.iter().map(|reply| reply.res.num_examples))?;

    let sum: f64 = sorted
        .iter()
        .map(|reply| reply.res.num_examples as f64 * reply.res.loss)
        .sum();

    Ok(sum / total as f64)
}

/// Sample-count weighted average of every numeric metric.
///
/// Each key is averaged over the replies that reported it, non numeric values are
/// dropped, as are keys whose reporters have no examples at all.
pub fn weighted_metrics<T: Weighted>(replies: &[Reply<T>]) -> Metrics {
    let mut sums: BTreeMap<&str, (f64, u128)> = BTreeMap::new();

    for reply in canonical(replies) {
        let weight = reply.res.num_examples();

        for (key, value) in reply.res.metrics() {
            if let Some(value) = value.as_f64() {
                let (sum, total) = sums.entry(key.as_str()).or_default();
                *sum += weight as f64 * value;
                *total += u128::from(weight);
            }
        }
    }

    sums.into_iter()
        .filter(|&(_, (_, total))| total > 0)
        .map(|(key, (sum, total))| (key.to_string(), Scalar::Float(sum / total as f64)))
        .collect()
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

    use super::*;
    use crate::common::{ParticipantId, TENSOR_F32};

    fn fit_reply(id: &str, num_examples: u64, tensors: &[Vec<f32>]) -> Reply<FitRes> {
        Reply {
            participant: id.into(),
            res: FitRes {
                parameters: ParameterSet::from_f32(tensors),
                num_examples,
                metrics: Metrics::new(),
            },
        }
    }

    fn evaluate_reply(id: &str, num_examples: u64, loss: f64, accuracy: f64) -> Reply<EvaluateRes> {
        Reply {
            participant: ParticipantId::new(id),
            res: EvaluateRes {
                loss,
                num_examples,
                metrics: Metrics::from([("accuracy".to_string(), Scalar::Float(accuracy))]),
            },
        }
    }

    #[test]
    fn weighted_average_weights_by_sample_count() {
        let replies = [
            fit_reply("a", 10, &[vec![2.0]]),
            fit_reply("b", 20, &[vec![5.0]]),
        ];

        let aggregate = weighted_average(&replies).unwrap();
        assert_eq!(aggregate.to_f32().unwrap(), vec![vec![4.0]]);
    }

    #[test]
    fn weighted_average_is_order_independent() {
        let mut replies: Vec<_> = (0..12)
            .map(|i| {
                let x = 0.1 * i as f32 + 1.0 / 3.0;
                fit_reply(
                    &format!("p{i}"),
                    (i as u64 * 7) % 5 + 1,
                    &[vec![x, x * x, -x], vec![1e-3 * x]],
                )
            })
            .collect();

        let expected = weighted_average(&replies).unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..20 {
            replies.shuffle(&mut rng);
            let aggregate = weighted_average(&replies).unwrap();
            assert_eq!(aggregate.tensors(), expected.tensors());
        }
    }

    #[test]
    fn weighted_average_rejects_degenerate_input() {
        assert!(matches!(
            weighted_average(&[]),
            Err(OrchestraError::Aggregation(_))
        ));

        let zero = [fit_reply("a", 0, &[vec![1.0]]), fit_reply("b", 0, &[vec![2.0]])];
        assert!(matches!(
            weighted_average(&zero),
            Err(OrchestraError::Aggregation(_))
        ));

        let mismatched = [
            fit_reply("a", 1, &[vec![1.0, 2.0]]),
            fit_reply("b", 1, &[vec![1.0]]),
        ];
        assert!(matches!(
            weighted_average(&mismatched),
            Err(OrchestraError::Aggregation(_))
        ));
    }

    #[test]
    fn weighted_average_propagates_malformed_tensors() {
        let mut reply = fit_reply("a", 1, &[vec![1.0]]);
        reply.res.parameters = ParameterSet::new(vec![vec![0; 5]], TENSOR_F32);

        assert!(matches!(
            weighted_average(&[reply]),
            Err(OrchestraError::MalformedTensor { index: 0, len: 5 })
        ));
    }

    #[test]
    fn coordinate_median_ignores_outliers() {
        let replies = [
            fit_reply("a", 1, &[vec![1.0, 10.0]]),
            fit_reply("b", 100, &[vec![2.0, 20.0]]),
            fit_reply("c", 1, &[vec![1000.0, -1000.0]]),
        ];

        let aggregate = coordinate_median(&replies).unwrap();
        assert_eq!(aggregate.to_f32().unwrap(), vec![vec![2.0, 10.0]]);

        let even = [
            fit_reply("a", 1, &[vec![1.0]]),
            fit_reply("b", 1, &[vec![4.0]]),
        ];
        assert_eq!(
            coordinate_median(&even).unwrap().to_f32().unwrap(),
            vec![vec![2.5]]
        );
    }

    #[test]
    fn losses_and_metrics_are_weighted() {
        let replies = [
            evaluate_reply("a", 10, 2.0, 0.5),
            evaluate_reply("b", 30, 6.0, 0.9),
        ];

        assert_eq!(weighted_loss(&replies).unwrap(), 5.0);

        let metrics = weighted_metrics(&replies);
        let accuracy = metrics["accuracy"].as_f64().unwrap();
        assert!((accuracy - 0.8).abs() < 1e-12);
    }

    #[test]
    fn overflowing_weights_are_an_aggregation_error() {
        let huge = u64::MAX / 2 + 1;

        let fit = [fit_reply("a", huge, &[vec![1.0]]), fit_reply("b", huge, &[vec![3.0]])];
        assert!(matches!(
            weighted_average(&fit),
            Err(OrchestraError::Aggregation(_))
        ));

        let evaluate = [
            evaluate_reply("a", huge, 1.0, 0.25),
            evaluate_reply("b", huge, 3.0, 0.75),
        ];
        assert!(matches!(
            weighted_loss(&evaluate),
            Err(OrchestraError::Aggregation(_))
        ));

        let accuracy = weighted_metrics(&evaluate)["accuracy"].as_f64().unwrap();
        assert!((accuracy - 0.5).abs() < 1e-12);
    }

    #[test]
    fn losses_and_metrics_are_order_independent() {
        let mut replies: Vec<_> = (0..12)
            .map(|i| {
                let x = 0.1 * i as f64 + 1.0 / 3.0;
                evaluate_reply(&format!("p{i}"), (i as u64 * 7) % 5 + 1, x * x, 1.0 / x)
            })
            .collect();

        let loss = weighted_loss(&replies).unwrap();
        let metrics = weighted_metrics(&replies);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..20 {
            replies.shuffle(&mut rng);
            assert_eq!(weighted_loss(&replies).unwrap().to_bits(), loss.to_bits());
            assert_eq!(weighted_metrics(&replies), metrics);
        }
    }

    #[test]
    fn non_numeric_metrics_are_dropped() {
        let mut reply = evaluate_reply("a", 1, 1.0, 0.5);
        reply
            .res
            .metrics
            .insert("device".to_string(), Scalar::from("cpu"));

        let metrics = weighted_metrics(&[reply]);
        assert!(metrics.contains_key("accuracy"));
        assert!(!metrics.contains_key("device"));
    }
}
