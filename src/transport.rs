//! Framed, message-oriented TCP sessions.
//!
//! A [`Session`] carries opaque binary frames, each prefixed with its length.
//! It knows nothing about the protocol running on top of it.

use std::{fmt, io, net::SocketAddr};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest frame a session accepts. Model payloads can be big.
pub const MAX_FRAME_LENGTH: usize = 1 << 30;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by the peer")]
    Closed,
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// A bidirectional connection to one remote endpoint.
pub struct Session {
    frames: Framed<TcpStream, LengthDelimitedCodec>,
    peer: Option<SocketAddr>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("peer", &self.peer).finish()
    }
}

impl Session {
    /// Open a new session to `addr`.
    pub async fn connect<A>(addr: A) -> Result<Self, TransportError>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already established connection.
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY: {}", e);
        }
        Self {
            frames: Framed::new(stream, codec()),
            peer,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.frames.send(frame).await?;
        Ok(())
    }

    /// Wait for the next frame. `Ok(None)` means that the peer closed the
    /// connection at a frame boundary.
    pub async fn recv_frame(&mut self) -> Result<Option<BytesMut>, TransportError> {
        match self.frames.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) if is_disconnect(&e) => Err(TransportError::Closed),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Flush pending frames and shut the connection down.
    pub async fn close(mut self) -> Result<(), TransportError> {
        SinkExt::<Bytes>::close(&mut self.frames).await?;
        Ok(())
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Accepts incoming sessions.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind<A>(addr: A) -> Result<Self, TransportError>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        let inner = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.local_addr()?)
    }

    pub async fn accept(&mut self) -> Result<Session, TransportError> {
        let (stream, _) = self.inner.accept().await?;
        Ok(Session::from_stream(stream))
    }
}
