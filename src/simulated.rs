//! A learner that pretends to train.
//!
//! It holds no data and computes nothing: training waits for the configured
//! duration and nudges the weights at random. It lets the `client` binary take
//! part in rounds without a machine learning backend.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::time::delay_for;

use crate::{
    learner::Learner,
    message::{ClientId, Payload, Report},
    settings::SimulationSettings,
};

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("training started before the data was loaded")]
    NoData,
}

pub struct SimulatedLearner {
    id: ClientId,
    samples: u64,
    training_time: Duration,
    model_length: usize,
    data_loaded: bool,
    model: Option<Payload<Vec<f32>>>,
}

impl SimulatedLearner {
    pub fn new(id: ClientId, settings: &SimulationSettings) -> Self {
        Self {
            id,
            samples: settings.samples,
            training_time: Duration::from_millis(settings.training_time),
            model_length: settings.model_length,
            data_loaded: false,
            model: None,
        }
    }

    pub fn model(&self) -> Option<&Payload<Vec<f32>>> {
        self.model.as_ref()
    }
}

fn nudge(model: &mut Payload<Vec<f32>>) -> f64 {
    let mut rng = rand::thread_rng();
    let mut step = |weight: &mut f32| *weight += rng.gen_range(-0.1..0.1);
    match model {
        Payload::Single(weights) => weights.iter_mut().for_each(&mut step),
        Payload::Sequence(chunks) => chunks.iter_mut().flatten().for_each(&mut step),
    }
    rng.gen_range(0.5..1.0)
}

#[async_trait]
impl Learner for SimulatedLearner {
    type Weights = Vec<f32>;
    type Error = SimulationError;

    async fn load_data(&mut self) -> Result<(), SimulationError> {
        debug!("client #{}: loading {} samples", self.id, self.samples);
        self.data_loaded = true;
        Ok(())
    }

    async fn load_payload(&mut self, payload: Payload<Vec<f32>>) -> Result<(), SimulationError> {
        self.model = Some(payload);
        Ok(())
    }

    async fn train(&mut self) -> Result<(Report, Payload<Vec<f32>>), SimulationError> {
        if !self.data_loaded {
            return Err(SimulationError::NoData);
        }
        delay_for(self.training_time).await;

        let model_length = self.model_length;
        let model = self
            .model
            .get_or_insert_with(|| Payload::Single(vec![0.0; model_length]));
        let accuracy = nudge(model);
        Ok((Report::new(self.samples, accuracy), model.clone()))
    }
}
