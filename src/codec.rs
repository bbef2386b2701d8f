//! Serialization of messages and (possibly chunked) payloads onto a
//! [`Session`].

use std::fmt;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{
    message::{Payload, TooManyChunks},
    transport::{Session, TransportError},
};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode frame: {0}")]
    Encode(bincode::Error),
    #[error("failed to decode frame: {0}")]
    Decode(bincode::Error),
    #[error(transparent)]
    TooManyChunks(#[from] TooManyChunks),
    #[error("connection closed after {received} of {expected} payload frames")]
    Incomplete { expected: u32, received: u32 },
}

/// Number of bytes moved over a session. Only used for reporting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transferred(pub u64);

impl Transferred {
    pub fn add(&mut self, frame_len: usize) {
        self.0 += frame_len as u64;
    }

    pub fn megabytes(self) -> f64 {
        self.0 as f64 / (1024.0 * 1024.0)
    }
}

impl fmt::Display for Transferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} MB", self.megabytes())
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(CodecError::Encode)
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(frame).map_err(CodecError::Decode)
}

/// Send a single message frame.
pub async fn send_message<T: Serialize>(
    session: &mut Session,
    message: &T,
) -> Result<Transferred, CodecError> {
    let frame = encode(message)?;
    let size = frame.len();
    session.send_frame(frame).await?;
    Ok(Transferred(size as u64))
}

/// Receive a single message frame. `Ok(None)` means the peer closed the
/// connection before sending anything.
pub async fn recv_message<T: DeserializeOwned>(
    session: &mut Session,
) -> Result<Option<T>, CodecError> {
    match session.recv_frame().await? {
        Some(frame) => decode(&frame).map(Some),
        None => Ok(None),
    }
}

/// Payload frames ready to be sent, possibly to several peers.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    frames: Vec<Bytes>,
    chunk_count: Option<u32>,
}

impl EncodedPayload {
    /// The value of `payload_length` announcing this payload.
    pub fn chunk_count(&self) -> Option<u32> {
        self.chunk_count
    }

    pub fn size(&self) -> Transferred {
        Transferred(self.frames.iter().map(|f| f.len() as u64).sum())
    }
}

/// Converts payloads to frames and back.
pub struct PayloadCodec;

impl PayloadCodec {
    /// Encode each element of a sequence into its own frame, or the whole
    /// value into a single frame.
    pub fn encode<W: Serialize>(payload: &Payload<W>) -> Result<EncodedPayload, CodecError> {
        let frames = match payload {
            Payload::Single(value) => vec![encode(value)?],
            Payload::Sequence(chunks) => chunks.iter().map(encode).collect::<Result<_, _>>()?,
        };
        Ok(EncodedPayload {
            frames,
            chunk_count: payload.chunk_count()?,
        })
    }

    pub async fn send<W: Serialize>(
        session: &mut Session,
        payload: &Payload<W>,
    ) -> Result<Transferred, CodecError> {
        let encoded = Self::encode(payload)?;
        Self::send_encoded(session, &encoded).await
    }

    /// Send frames in order. The frames are reference counted, sending them
    /// does not copy the payload.
    pub async fn send_encoded(
        session: &mut Session,
        payload: &EncodedPayload,
    ) -> Result<Transferred, CodecError> {
        let mut transferred = Transferred::default();
        for frame in payload.frames.iter() {
            transferred.add(frame.len());
            session.send_frame(frame.clone()).await?;
        }
        Ok(transferred)
    }

    /// Receive exactly `expected_chunks` frames as a sequence, or exactly one
    /// frame if no count is given.
    ///
    /// The count comes from the peer, so chunks are only stored as they arrive.
    pub async fn receive<W: DeserializeOwned>(
        session: &mut Session,
        expected_chunks: Option<u32>,
    ) -> Result<(Payload<W>, Transferred), CodecError> {
        let mut transferred = Transferred::default();
        match expected_chunks {
            Some(expected) => {
                let mut chunks = Vec::new();
                for received in 0..expected {
                    let frame = Self::next_frame(session, expected, received).await?;
                    transferred.add(frame.len());
                    chunks.push(decode(&frame)?);
                }
                Ok((Payload::Sequence(chunks), transferred))
            }
            None => {
                let frame = Self::next_frame(session, 1, 0).await?;
                transferred.add(frame.len());
                Ok((Payload::Single(decode(&frame)?), transferred))
            }
        }
    }

    async fn next_frame(
        session: &mut Session,
        expected: u32,
        received: u32,
    ) -> Result<Bytes, CodecError> {
        match session.recv_frame().await {
            Ok(Some(frame)) => Ok(frame.freeze()),
            Ok(None) | Err(TransportError::Closed) => {
                Err(CodecError::Incomplete { expected, received })
            }
            Err(e) => Err(e.into()),
        }
    }
}
