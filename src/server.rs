//! The server half of the round protocol.
//!
//! A [`RoundServer`] accepts sessions, registers the clients that identify
//! themselves on them, and runs rounds: select clients at random, send them
//! the global model, and collect their reports and updates. It is used by the
//! central coordinator and by edge servers for their leaf clients.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    marker::PhantomData,
    net::SocketAddr,
    time::{Duration, Instant},
};

use futures::{
    future::{abortable, join_all, AbortHandle},
    FutureExt,
};
use rand::seq::IteratorRandom;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::{
    net::ToSocketAddrs,
    sync::mpsc,
    time::{delay_for, interval, timeout},
};
use tracing_futures::Instrument;

use crate::{
    codec::{recv_message, send_message, CodecError, EncodedPayload, PayloadCodec},
    message::{ClientId, ClientReport, Payload, Registration, Selection, Update},
    topology::LogTag,
    transport::{Listener, Session, TransportError},
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("the listener stopped accepting connections")]
    ListenerClosed,
    #[error("client #{id} closed the session during the round")]
    Disconnected { id: ClientId },
    #[error("received a report for client #{received} from client #{expected}")]
    ForeignReport {
        expected: ClientId,
        received: ClientId,
    },
    #[error("client #{id} reported without a payload")]
    MissingPayload { id: ClientId },
    #[error("no client completed round {round}")]
    NoUpdates { round: u32 },
}

/// How long a new connection may stay silent before it is dropped.
pub const IDENTIFICATION_TIMEOUT: Duration = Duration::from_secs(30);

/// A session on which a client identified itself.
struct Incoming {
    id: ClientId,
    session: Session,
}

type Admission = Box<dyn Fn(ClientId) -> bool + Send + Sync>;

pub struct RoundServer<W> {
    tag: LogTag,
    local_addr: SocketAddr,
    per_round: usize,
    admission: Admission,
    heartbeat_timeout: Option<Duration>,
    incoming: mpsc::UnboundedReceiver<Incoming>,
    /// Registered clients that are not taking part in a round.
    idle: HashMap<ClientId, Session>,
    /// Clients taking part in the current round.
    busy: HashSet<ClientId>,
    last_seen: HashMap<ClientId, Instant>,
    acceptor: AbortHandle,
    weights: PhantomData<fn() -> W>,
}

impl<W> fmt::Debug for RoundServer<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundServer")
            .field("local_addr", &self.local_addr)
            .field("per_round", &self.per_round)
            .field("idle", &self.idle.len())
            .field("busy", &self.busy.len())
            .finish()
    }
}

impl<W> RoundServer<W>
where
    W: Serialize + DeserializeOwned + Send + 'static,
{
    /// Listen on `addr` and select `per_round` clients in each round.
    ///
    /// All clients are admitted, see [`RoundServer::admit`].
    pub async fn bind<A>(addr: A, per_round: usize) -> Result<Self, ServerError>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        let listener = Listener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let tag = LogTag::server();
        let (tx, rx) = mpsc::unbounded_channel();

        let span = debug_span!("accept", %local_addr);
        let (accept_loop, acceptor) = abortable(accept(listener, tx, tag).instrument(span));
        tokio::spawn(accept_loop);
        info!("[{}] Listening on {}.", tag, local_addr);

        Ok(Self {
            tag,
            local_addr,
            per_round,
            admission: Box::new(|_| true),
            heartbeat_timeout: None,
            incoming: rx,
            idle: HashMap::new(),
            busy: HashSet::new(),
            last_seen: HashMap::new(),
            acceptor,
            weights: PhantomData,
        })
    }

    /// Only register the clients for which `admission` returns `true`.
    ///
    /// The other ids can still reach the server with heartbeats: their
    /// connections are recorded as heartbeats and dropped.
    pub fn admit<F>(mut self, admission: F) -> Self
    where
        F: Fn(ClientId) -> bool + Send + Sync + 'static,
    {
        self.admission = Box::new(admission);
        self
    }

    /// Evict the clients of a round that did not send a heartbeat for longer
    /// than `timeout`.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of clients available for selection.
    pub fn registered(&self) -> usize {
        self.idle.len()
    }

    /// When `id` was last heard of, through a registration, a heartbeat or a
    /// selection.
    pub fn last_seen(&self, id: ClientId) -> Option<Instant> {
        self.last_seen.get(&id).copied()
    }

    /// Run a round: wait until enough clients are registered, select them,
    /// send them `global` and collect their updates.
    ///
    /// Clients that fail are evicted. The round fails only if no client
    /// completed it.
    pub async fn run_round(
        &mut self,
        round: u32,
        global: &Payload<W>,
    ) -> Result<Vec<Update<W>>, ServerError> {
        self.drain();
        while self.idle.len() < self.per_round {
            info!(
                "[{}] Waiting for clients: {} of {} registered.",
                self.tag,
                self.idle.len(),
                self.per_round
            );
            let incoming = self.incoming.recv().await.ok_or(ServerError::ListenerClosed)?;
            self.handle(incoming);
            self.drain();
        }

        let encoded = PayloadCodec::encode(global)?;
        let selected = self
            .idle
            .keys()
            .copied()
            .choose_multiple(&mut rand::thread_rng(), self.per_round);
        info!(
            "[{}] Round {}: selected {} clients, sending {} of payload data to each.",
            self.tag,
            round,
            selected.len(),
            encoded.size()
        );

        let now = Instant::now();
        let mut handles = HashMap::new();
        let mut exchanges = Vec::with_capacity(selected.len());
        for id in selected {
            if let Some(session) = self.idle.remove(&id) {
                self.busy.insert(id);
                self.last_seen.insert(id, now);
                let (task, handle) = abortable(exchange::<W>(id, session, &encoded, self.tag));
                handles.insert(id, handle);
                exchanges.push(task.map(move |result| (id, result)));
            }
        }

        let mut collect = join_all(exchanges);
        let mut checks = interval(
            self.heartbeat_timeout
                .map_or(Duration::from_secs(1), |timeout| timeout / 2)
                .max(Duration::from_millis(1)),
        );
        let results = loop {
            tokio::select! {
                results = &mut collect => break results,
                incoming = self.incoming.recv() => match incoming {
                    Some(incoming) => self.handle(incoming),
                    None => warn!("[{}] The listener stopped accepting connections.", self.tag),
                },
                _ = checks.tick(), if self.heartbeat_timeout.is_some() => {
                    for id in self.stalled() {
                        if let Some(handle) = handles.remove(&id) {
                            warn!("[{}] No heartbeat from client #{}.", self.tag, id);
                            handle.abort();
                        }
                    }
                }
            }
        };

        let mut updates = Vec::with_capacity(results.len());
        for (id, result) in results {
            self.busy.remove(&id);
            match result {
                Ok(Ok((session, update))) => {
                    self.idle.insert(id, session);
                    updates.push(update);
                }
                Ok(Err(e)) => self.evict(id, &e),
                Err(_) => self.evict(id, &"stalled"),
            }
        }
        self.drain();

        if updates.is_empty() {
            return Err(ServerError::NoUpdates { round });
        }
        info!(
            "[{}] Round {}: collected {} updates.",
            self.tag,
            round,
            updates.len()
        );
        Ok(updates)
    }

    fn drain(&mut self) {
        while let Ok(incoming) = self.incoming.try_recv() {
            self.handle(incoming);
        }
    }

    /// Register the client, or record a heartbeat if it is already known or
    /// not admitted.
    fn handle(&mut self, Incoming { id, session }: Incoming) {
        self.last_seen.insert(id, Instant::now());
        if self.idle.contains_key(&id) || self.busy.contains(&id) || !(self.admission)(id) {
            debug!("[{}] Heartbeat from client #{}.", self.tag, id);
            return;
        }
        info!("[{}] Client #{} signed in.", self.tag, id);
        self.idle.insert(id, session);
    }

    fn stalled(&self) -> Vec<ClientId> {
        let timeout = match self.heartbeat_timeout {
            Some(timeout) => timeout,
            None => return Vec::new(),
        };
        self.busy
            .iter()
            .copied()
            .filter(|id| {
                self.last_seen
                    .get(id)
                    .map_or(true, |seen| seen.elapsed() > timeout)
            })
            .collect()
    }

    fn evict(&mut self, id: ClientId, reason: &dyn fmt::Display) {
        warn!("[{}] Client #{} evicted: {}", self.tag, id, reason);
        self.last_seen.remove(&id);
    }
}

impl<W> Drop for RoundServer<W> {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

/// Accept connections and forward them once their first frame identified the
/// client.
async fn accept(mut listener: Listener, incoming: mpsc::UnboundedSender<Incoming>, tag: LogTag) {
    loop {
        let mut session = match listener.accept().await {
            Ok(session) => session,
            Err(e) => {
                warn!("[{}] Failed to accept a connection: {}", tag, e);
                delay_for(Duration::from_millis(100)).await;
                continue;
            }
        };
        let incoming = incoming.clone();
        tokio::spawn(async move {
            let identification = timeout(
                IDENTIFICATION_TIMEOUT,
                recv_message::<Registration>(&mut session),
            );
            match identification.await {
                Ok(Ok(Some(Registration { id }))) => {
                    if incoming.send(Incoming { id, session }).is_err() {
                        debug!("[{}] Server gone, dropping client #{}.", tag, id);
                    }
                }
                Ok(Ok(None)) => debug!("[{}] Connection closed before identification.", tag),
                Ok(Err(e)) => warn!(
                    "[{}] Failed to identify {:?}: {}",
                    tag,
                    session.peer_addr(),
                    e
                ),
                Err(_) => warn!(
                    "[{}] Dropping {:?}: no identification within {:?}.",
                    tag,
                    session.peer_addr(),
                    IDENTIFICATION_TIMEOUT
                ),
            }
        });
    }
}

async fn exchange<W>(
    id: ClientId,
    mut session: Session,
    payload: &EncodedPayload,
    tag: LogTag,
) -> Result<(Session, Update<W>), ServerError>
where
    W: DeserializeOwned,
{
    let selection = Selection {
        id,
        payload: Some(true),
        payload_length: payload.chunk_count(),
    };
    send_message(&mut session, &selection).await?;
    PayloadCodec::send_encoded(&mut session, payload).await?;

    let report: ClientReport = recv_message(&mut session)
        .await?
        .ok_or(ServerError::Disconnected { id })?;
    if report.id != id {
        return Err(ServerError::ForeignReport {
            expected: id,
            received: report.id,
        });
    }
    if !report.payload {
        return Err(ServerError::MissingPayload { id });
    }
    let (payload, received) = PayloadCodec::receive(&mut session, report.payload_length).await?;
    info!(
        "[{}] Received {} of payload data from client #{}.",
        tag, received, id
    );
    Ok((
        session,
        Update {
            client_id: id,
            report: report.report,
            payload,
        },
    ))
}
