//! Messages exchanged between clients, edge servers and the coordinator.
//!
//! Every message travels in its own frame (see [`crate::transport`]) and is
//! serialized with `bincode`. Payload elements are not messages: they are
//! opaque values owned by the [`Learner`](crate::learner::Learner) and are
//! framed by the [`PayloadCodec`](crate::codec::PayloadCodec).

use std::convert::TryFrom;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A sequence too long for its length to be announced in a `u32`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot announce a payload of {0} chunks")]
pub struct TooManyChunks(pub usize);

fn announce(chunks: usize) -> Result<u32, TooManyChunks> {
    u32::try_from(chunks).map_err(|_| TooManyChunks(chunks))
}

#[derive(
    Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone, Display, From, Serialize, Deserialize,
)]
/// A client identifier, assigned by configuration and unique within a run.
pub struct ClientId(u32);

impl ClientId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

/// First frame sent on the main session, right after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: ClientId,
}

/// Liveness signal, sent on a dedicated short-lived connection.
///
/// It has the same shape as a [`Registration`], a server tells them apart by
/// whether the id is already registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub id: ClientId,
}

/// Sent by a server to the client it selects for a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// The client this selection is addressed to.
    pub id: ClientId,
    /// Whether payload frames follow this message.
    pub payload: Option<bool>,
    /// Number of payload chunks that follow. `None` means a single frame.
    pub payload_length: Option<u32>,
}

impl Selection {
    /// Select `id` without sending a model along.
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            payload: None,
            payload_length: None,
        }
    }

    /// Select `id` and announce the given payload.
    pub fn with_payload<W>(id: ClientId, payload: &Payload<W>) -> Result<Self, TooManyChunks> {
        Ok(Self {
            id,
            payload: Some(true),
            payload_length: payload.chunk_count()?,
        })
    }

    pub fn declares_payload(&self) -> bool {
        self.payload == Some(true)
    }
}

/// Per-round statistics used for aggregation weighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Exact number of examples used for training in this round.
    pub num_samples: u64,
    pub accuracy: f64,
}

impl Report {
    pub fn new(num_samples: u64, accuracy: f64) -> Self {
        Self {
            num_samples,
            accuracy,
        }
    }

    /// Combine several reports: samples are summed, accuracies are averaged
    /// with the sample counts as weights.
    ///
    /// When no samples were reported at all, the accuracies are averaged
    /// uniformly instead.
    pub fn combine<'a, I>(reports: I) -> Self
    where
        I: IntoIterator<Item = &'a Report>,
    {
        let reports: Vec<&Report> = reports.into_iter().collect();
        if reports.is_empty() {
            return Self::new(0, 0.0);
        }

        let num_samples: u64 = reports.iter().map(|r| r.num_samples).sum();
        let accuracy = if num_samples == 0 {
            reports.iter().map(|r| r.accuracy).sum::<f64>() / reports.len() as f64
        } else {
            reports
                .iter()
                .map(|r| r.accuracy * r.num_samples as f64)
                .sum::<f64>()
                / num_samples as f64
        };
        Self::new(num_samples, accuracy)
    }
}

/// Metadata frame announcing that payload frames follow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientReport {
    pub id: ClientId,
    pub report: Report,
    pub payload: bool,
    /// Number of payload chunks that follow. `None` means a single frame.
    pub payload_length: Option<u32>,
}

impl ClientReport {
    pub fn new<W>(
        id: ClientId,
        report: Report,
        payload: &Payload<W>,
    ) -> Result<Self, TooManyChunks> {
        Ok(Self {
            id,
            report,
            payload: true,
            payload_length: payload.chunk_count()?,
        })
    }
}

/// A model update or a global model, as handed to and produced by learners.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<W> {
    /// Sent as exactly one frame.
    Single(W),
    /// Sent as one frame per element. Receivers reassemble by position.
    Sequence(Vec<W>),
}

impl<W> Payload<W> {
    /// The value of `payload_length` announcing this payload.
    pub fn chunk_count(&self) -> Result<Option<u32>, TooManyChunks> {
        match self {
            Payload::Single(_) => Ok(None),
            Payload::Sequence(chunks) => announce(chunks.len()).map(Some),
        }
    }

    /// Number of frames needed to transfer this payload.
    pub fn frame_count(&self) -> usize {
        match self {
            Payload::Single(_) => 1,
            Payload::Sequence(chunks) => chunks.len(),
        }
    }

    pub fn map<U, F>(self, mut f: F) -> Payload<U>
    where
        F: FnMut(W) -> U,
    {
        match self {
            Payload::Single(value) => Payload::Single(f(value)),
            Payload::Sequence(chunks) => Payload::Sequence(chunks.into_iter().map(f).collect()),
        }
    }
}

/// A client's contribution to a round, as collected by a server.
#[derive(Debug, Clone, PartialEq)]
pub struct Update<W> {
    pub client_id: ClientId,
    pub report: Report,
    pub payload: Payload<W>,
}
