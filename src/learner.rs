//! The local workload of a client.

use std::error::Error;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::message::{Payload, Report, Selection};

/// The operations a [`Client`](crate::client::Client) needs from the machine
/// learning side.
///
/// The training itself, the data and the model all live behind this trait.
/// Implementations are selected when the process starts: a leaf client runs
/// an actual trainer, an edge server runs an
/// [`EdgeRelay`](crate::edge::EdgeRelay).
#[async_trait]
pub trait Learner: Send + 'static {
    /// Type of the values carried by payload frames.
    type Weights: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Error: Error + Send + Sync + 'static;

    /// Prepare the learner, before the client connects.
    async fn configure(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Load the local training data. Called once, when the client is
    /// selected for the first time.
    async fn load_data(&mut self) -> Result<(), Self::Error>;

    /// Apply a payload received from the server to the local model.
    async fn load_payload(&mut self, payload: Payload<Self::Weights>) -> Result<(), Self::Error>;

    /// Train the local model. This may take a long time.
    ///
    /// The client runs this on a dedicated thread with a runtime of its own,
    /// so it may block for as long as it needs.
    ///
    /// `num_samples` in the report must be the exact number of examples used
    /// in this round.
    async fn train(&mut self) -> Result<(Report, Payload<Self::Weights>), Self::Error>;

    /// Called for every selection addressed to this client, before anything
    /// else happens in the round.
    fn process_selection(&mut self, _selection: &Selection) {}
}
