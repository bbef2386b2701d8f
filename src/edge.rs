//! Edge servers.
//!
//! An edge server is a client of the central server like any other, but its
//! "training" consists of running rounds over its own leaf clients and
//! aggregating their updates. [`EdgeRelay`] is the [`Learner`] doing that, so
//! the edge server runs the very same [`Client`](crate::client::Client) state
//! machine as the leaf clients.

use std::error::Error;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{
    aggregator::Aggregator,
    learner::Learner,
    message::{Payload, Report},
    server::{RoundServer, ServerError},
    settings::Settings,
    topology::{edge_server_id, Topology, TopologyError},
};

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("no global model to start the local rounds from")]
    NoGlobalModel,
    #[error("local round failed: {0}")]
    Server(#[from] ServerError),
    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),
    #[error("aggregation failed: {0}")]
    Aggregation(Box<dyn Error + Send + Sync>),
}

fn aggregation_error<E: Error + Send + Sync + 'static>(e: E) -> EdgeError {
    EdgeError::Aggregation(Box::new(e))
}

pub struct EdgeRelay<A: Aggregator> {
    server: RoundServer<A::Weights>,
    aggregator: A,
    local_rounds: u32,
    global: Option<Payload<A::Weights>>,
    /// Local rounds run so far.
    rounds: u32,
}

impl<A> EdgeRelay<A>
where
    A: Aggregator,
    A::Weights: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Start listening for the leaf clients of this edge server.
    ///
    /// Only the leaf clients mapped onto this edge server are registered.
    pub async fn bind(settings: &Settings, aggregator: A) -> Result<Self, EdgeError> {
        let edge = settings.edge.clone().unwrap_or_default();
        let id = settings.client_id();
        let total_clients = settings.client.total_clients;
        let total_silos = settings.algorithm.total_silos;

        let addr = Topology::edge_listen_address(settings)?;
        let server = RoundServer::bind(addr.as_str(), edge.per_round)
            .await?
            .admit(move |leaf| {
                edge_server_id(leaf, total_clients, total_silos).map_or(false, |edge| edge == id)
            });

        Ok(Self {
            server,
            aggregator,
            local_rounds: edge.local_rounds,
            global: None,
            rounds: 0,
        })
    }

    pub fn server(&self) -> &RoundServer<A::Weights> {
        &self.server
    }
}

#[async_trait]
impl<A> Learner for EdgeRelay<A>
where
    A: Aggregator,
    A::Weights: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Weights = A::Weights;
    type Error = EdgeError;

    /// Leaf clients hold the data.
    async fn load_data(&mut self) -> Result<(), EdgeError> {
        Ok(())
    }

    async fn load_payload(&mut self, payload: Payload<A::Weights>) -> Result<(), EdgeError> {
        self.global = Some(payload);
        Ok(())
    }

    /// Run the local rounds, each one starting from the aggregate of the
    /// previous one. The report covers the updates of the last local round.
    async fn train(&mut self) -> Result<(Report, Payload<A::Weights>), EdgeError> {
        let mut model = self.global.clone().ok_or(EdgeError::NoGlobalModel)?;
        let mut reports = Vec::new();

        for _ in 0..self.local_rounds {
            let updates = self.server.run_round(self.rounds, &model).await?;
            self.rounds += 1;

            reports = updates.iter().map(|update| update.report).collect();
            for update in updates {
                self.aggregator
                    .add_local_result(update)
                    .map_err(aggregation_error)?;
            }
            model = self.aggregator.aggregate().map_err(aggregation_error)?;
        }

        self.global = Some(model.clone());
        Ok((Report::combine(&reports), model))
    }
}
