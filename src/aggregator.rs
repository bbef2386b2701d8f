//! Aggregation of the updates collected in a round.

use std::error::Error;

use thiserror::Error;

use crate::message::{Payload, Update};

/// Combines local results into a new global model.
///
/// Results are added one at a time as they are collected, then aggregated
/// once. Aggregating resets the aggregator for the next round.
pub trait Aggregator: Send + 'static {
    type Weights;
    type Error: Error + Send + Sync + 'static;

    fn add_local_result(&mut self, update: Update<Self::Weights>) -> Result<(), Self::Error>;

    fn aggregate(&mut self) -> Result<Payload<Self::Weights>, Self::Error>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FedAvgError {
    #[error("no local results to aggregate")]
    Empty,
    #[error("update of client #{client} does not have the shape of the other updates")]
    ShapeMismatch { client: u32 },
}

/// Federated averaging of flat `f32` models.
///
/// Each update weighs as much as the number of samples it was trained on. If
/// no update reports any sample, all updates weigh the same.
#[derive(Debug, Default)]
pub struct FedAvg {
    results: Vec<(u64, Payload<Vec<f32>>)>,
}

impl FedAvg {
    pub fn new() -> Self {
        Default::default()
    }
}

fn same_shape(a: &Payload<Vec<f32>>, b: &Payload<Vec<f32>>) -> bool {
    match (a, b) {
        (Payload::Single(a), Payload::Single(b)) => a.len() == b.len(),
        (Payload::Sequence(a), Payload::Sequence(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| a.len() == b.len())
        }
        _ => false,
    }
}

fn accumulate(sum: &mut [f32], weights: &[f32], factor: f32) {
    for (s, w) in sum.iter_mut().zip(weights.iter()) {
        *s += w * factor;
    }
}

impl Aggregator for FedAvg {
    type Weights = Vec<f32>;
    type Error = FedAvgError;

    fn add_local_result(&mut self, update: Update<Vec<f32>>) -> Result<(), FedAvgError> {
        if let Some((_, first)) = self.results.first() {
            if !same_shape(first, &update.payload) {
                return Err(FedAvgError::ShapeMismatch {
                    client: update.client_id.get(),
                });
            }
        }
        self.results.push((update.report.num_samples, update.payload));
        Ok(())
    }

    fn aggregate(&mut self) -> Result<Payload<Vec<f32>>, FedAvgError> {
        let results = std::mem::take(&mut self.results);
        let total: u64 = results.iter().map(|(samples, _)| samples).sum();
        let count = results.len();

        let mut results = results.into_iter();
        let (samples, first) = results.next().ok_or(FedAvgError::Empty)?;
        let factor = |samples: u64| {
            if total == 0 {
                1.0 / count as f32
            } else {
                samples as f32 / total as f32
            }
        };

        let first_factor = factor(samples);
        let mut sum = first.map(|weights| {
            weights
                .iter()
                .map(|w| w * first_factor)
                .collect::<Vec<f32>>()
        });
        for (samples, payload) in results {
            let f = factor(samples);
            match (&mut sum, payload) {
                (Payload::Single(sum), Payload::Single(weights)) => accumulate(sum, &weights, f),
                (Payload::Sequence(sum), Payload::Sequence(chunks)) => {
                    for (sum, weights) in sum.iter_mut().zip(chunks.iter()) {
                        accumulate(sum, weights, f);
                    }
                }
                // shapes are checked when results are added
                _ => unreachable!(),
            }
        }
        Ok(sum)
    }
}
