//! The client coordination state machine.
//!
//! A [`Client`] connects to its server (the central server, or an edge server
//! in a cross-silo topology), registers, and then serves rounds until the
//! server closes the session:
//!
//! ```text
//! Disconnected -> Connecting -> Registered -> AwaitingSelection
//!     -> Selected [-> LoadingPayload] -> Training -> Reporting -> AwaitingSelection
//! ```
//!
//! Any error moves the client to [`State::Failed`] and ends [`Client::run`].
//! Reconnecting is left to whoever supervises the process.

use std::{error::Error, io, thread, time::Duration};

use derive_more::Display;
use thiserror::Error;
use tokio::{runtime, sync::oneshot};
use tracing::Span;
use tracing_futures::Instrument;

use crate::{
    codec::{recv_message, send_message, CodecError, PayloadCodec},
    heartbeat::HeartbeatReporter,
    learner::Learner,
    message::{ClientId, ClientReport, Payload, Registration, Report, Selection, TooManyChunks},
    settings::Settings,
    topology::{LogTag, Role, Topology, TopologyError},
    transport::{Session, TransportError},
};

#[cfg(test)]
mod tests;

type BoxError = Box<dyn Error + Send + Sync>;

/// State of a [`Client`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Registered,
    AwaitingSelection,
    Selected,
    LoadingPayload,
    Training,
    Reporting,
    Failed,
}

/// The server did not follow the protocol.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("received a selection for client #{received}, expected #{expected}")]
    ForeignSelection {
        expected: ClientId,
        received: ClientId,
    },
    #[error("failed to decode frame: {0}")]
    Decode(bincode::Error),
    #[error("failed to encode frame: {0}")]
    Encode(bincode::Error),
    #[error("payload announced but only {received} of {expected} frames arrived")]
    MissingPayload { expected: u32, received: u32 },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),
    #[error("learner failed: {0}")]
    Learner(BoxError),
    #[error("training failed: {0}")]
    Training(BoxError),
    #[error("failed to start the training thread: {0}")]
    TrainingThread(io::Error),
    #[error("the training thread ended without a result")]
    TrainingAborted,
    #[error("the learner was lost with an aborted training thread")]
    LearnerLost,
    #[error("invalid update: {0}")]
    Update(#[from] TooManyChunks),
}

impl From<CodecError> for ClientError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Transport(e) => ClientError::Transport(e),
            CodecError::Decode(e) => ProtocolViolation::Decode(e).into(),
            CodecError::Encode(e) => ProtocolViolation::Encode(e).into(),
            CodecError::Incomplete { expected, received } => {
                ProtocolViolation::MissingPayload { expected, received }.into()
            }
            CodecError::TooManyChunks(e) => ClientError::Update(e),
        }
    }
}

fn learner_error<E: Error + Send + Sync + 'static>(e: E) -> ClientError {
    ClientError::Learner(Box::new(e))
}

/// A federated learning client, driving a [`Learner`] through rounds.
pub struct Client<L: Learner> {
    id: ClientId,
    tag: LogTag,
    topology: Topology,
    heartbeat_max_interval: Duration,
    state: State,
    data_loaded: bool,
    learner: Option<L>,
}

impl<L: Learner> Client<L> {
    pub fn new(settings: &Settings, learner: L) -> Result<Self, ClientError> {
        let id = settings.client_id();
        let topology = Topology::from_settings(settings)?;
        Ok(Self {
            id,
            tag: topology.role.tag(id),
            topology,
            heartbeat_max_interval: settings.client.heartbeat_max_interval(),
            state: State::Disconnected,
            data_loaded: false,
            learner: Some(learner),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Serve rounds until the server closes the session, or until something
    /// fails.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let span = info_span!("client", client_id = %self.id);
        async move {
            let result = self.drive().await;
            if let Err(e) = &result {
                if let ClientError::Transport(_) = e {
                    info!("[{}] Connection to the server failed.", self.tag);
                }
                error!("[{}] Failed in state {}: {}", self.tag, self.state, e);
                self.transition(State::Failed);
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) -> Result<(), ClientError> {
        self.learner()?.configure().await.map_err(learner_error)?;
        let mut session = self.connect().await?;

        loop {
            self.transition(State::AwaitingSelection);
            info!("[{}] Waiting to be selected.", self.tag);
            let selection: Selection = match recv_message(&mut session).await? {
                Some(selection) => selection,
                None => {
                    info!("[{}] Connection closed by the server.", self.tag);
                    self.transition(State::Disconnected);
                    return Ok(());
                }
            };

            self.select(&selection).await?;
            if selection.declares_payload() {
                self.load_payload(&mut session, &selection).await?;
            }
            let (report, payload) = self.train().await?;
            self.report(&mut session, report, &payload).await?;
        }
    }

    async fn connect(&mut self) -> Result<Session, ClientError> {
        self.transition(State::Connecting);
        match self.topology.role {
            Role::LeafClient { edge_server } => {
                info!("[{}] Contacting Edge server #{}.", self.tag, edge_server)
            }
            Role::Client | Role::EdgeServer => {
                info!("[{}] Contacting the central server.", self.tag)
            }
        }
        let mut session = Session::connect(self.topology.target.as_str()).await?;

        info!("[{}] Signing in at the server.", self.tag);
        send_message(&mut session, &Registration { id: self.id }).await?;
        self.transition(State::Registered);
        Ok(session)
    }

    async fn select(&mut self, selection: &Selection) -> Result<(), ClientError> {
        if selection.id != self.id {
            return Err(ProtocolViolation::ForeignSelection {
                expected: self.id,
                received: selection.id,
            }
            .into());
        }
        self.transition(State::Selected);
        info!("[{}] Selected by the server.", self.tag);

        let learner = self.learner.as_mut().ok_or(ClientError::LearnerLost)?;
        learner.process_selection(selection);
        if !self.data_loaded {
            learner.load_data().await.map_err(learner_error)?;
            self.data_loaded = true;
        }
        Ok(())
    }

    async fn load_payload(
        &mut self,
        session: &mut Session,
        selection: &Selection,
    ) -> Result<(), ClientError> {
        self.transition(State::LoadingPayload);
        info!("[{}] Receiving payload data from the server.", self.tag);
        let (payload, received): (Payload<L::Weights>, _) =
            PayloadCodec::receive(session, selection.payload_length).await?;
        info!(
            "[{}] Received {} of payload data from the server.",
            self.tag, received
        );
        self.learner()?
            .load_payload(payload)
            .await
            .map_err(learner_error)
    }

    /// Train on a dedicated thread, with a heartbeat reporter running
    /// alongside on the runtime of the client.
    async fn train(&mut self) -> Result<(Report, Payload<L::Weights>), ClientError> {
        self.transition(State::Training);
        let learner = self.learner.take().ok_or(ClientError::LearnerLost)?;

        let heartbeat = HeartbeatReporter::new(
            self.id,
            self.tag,
            self.topology.central.as_str(),
            self.heartbeat_max_interval,
        )
        .spawn();
        let finished = match spawn_training(self.id, learner) {
            Ok(done) => done.await.map_err(|_| ClientError::TrainingAborted),
            Err(e) => Err(ClientError::TrainingThread(e)),
        };
        heartbeat.cancel().await;

        let (learner, outcome) = finished?;
        self.learner = Some(learner);
        let trained = outcome.map_err(|e| ClientError::Training(Box::new(e)))?;

        match self.tag {
            LogTag::Server(_) => info!(
                "[{}] Model aggregated on edge server (client #{}).",
                self.tag, self.id
            ),
            LogTag::Client(_) => info!("[{}] Model trained.", self.tag),
        }
        Ok(trained)
    }

    async fn report(
        &mut self,
        session: &mut Session,
        report: Report,
        payload: &Payload<L::Weights>,
    ) -> Result<(), ClientError> {
        self.transition(State::Reporting);
        let announcement = ClientReport::new(self.id, report, payload)?;
        send_message(session, &announcement).await?;
        let sent = PayloadCodec::send(session, payload).await?;
        info!("[{}] Sent {} of payload data to the server.", self.tag, sent);
        Ok(())
    }

    fn learner(&mut self) -> Result<&mut L, ClientError> {
        self.learner.as_mut().ok_or(ClientError::LearnerLost)
    }

    fn transition(&mut self, next: State) {
        debug!("[{}] {} -> {}", self.tag, self.state, next);
        self.state = next;
    }
}

type Trained<L> = (
    L,
    Result<(Report, Payload<<L as Learner>::Weights>), <L as Learner>::Error>,
);

/// Run `learner.train()` on a new thread, on a runtime of its own. Blocking
/// learners cannot starve the heartbeats this way.
///
/// The receiver fails if the thread dies before training returned, in which
/// case the learner is gone too.
fn spawn_training<L: Learner>(
    id: ClientId,
    mut learner: L,
) -> io::Result<oneshot::Receiver<Trained<L>>> {
    let (tx, rx) = oneshot::channel();
    let span = Span::current();
    thread::Builder::new()
        .name(format!("training-{}", id))
        .spawn(move || {
            let mut runtime = match runtime::Builder::new()
                .basic_scheduler()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("failed to start the training runtime: {}", e);
                    return;
                }
            };
            let outcome = runtime.block_on(learner.train().instrument(span));
            if tx.send((learner, outcome)).is_err() {
                debug!("client #{} stopped waiting for its training", id);
            }
        })?;
    Ok(rx)
}
