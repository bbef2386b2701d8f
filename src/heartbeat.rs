//! Liveness reporting while a client trains.
//!
//! Training can block the round for a long time. Meanwhile, a
//! [`HeartbeatReporter`] regularly opens a short-lived connection to the
//! central server and announces the client id, so that the server can evict
//! clients that stalled without waiting for the training to return.

use std::time::Duration;

use futures::future::{abortable, AbortHandle, Aborted};
use rand::Rng;
use tokio::{task::JoinHandle, time::delay_for};
use tracing_futures::Instrument;

use crate::{
    codec::{send_message, CodecError},
    message::{ClientId, Heartbeat},
    topology::LogTag,
    transport::Session,
};

pub struct HeartbeatReporter {
    id: ClientId,
    tag: LogTag,
    addr: String,
    max_interval: Duration,
}

impl HeartbeatReporter {
    /// Create a reporter that sends heartbeats to `addr`, pausing for a
    /// random duration in `[0, max_interval)` between two heartbeats.
    pub fn new(id: ClientId, tag: LogTag, addr: impl Into<String>, max_interval: Duration) -> Self {
        Self {
            id,
            tag,
            addr: addr.into(),
            max_interval,
        }
    }

    /// Start sending heartbeats in the background.
    pub fn spawn(self) -> HeartbeatHandle {
        let span = debug_span!("heartbeat", client_id = %self.id);
        let (task, abort) = abortable(self.run().instrument(span));
        HeartbeatHandle {
            abort,
            task: Some(tokio::spawn(task)),
        }
    }

    /// Send heartbeats until one of them fails.
    pub(crate) async fn run(self) {
        loop {
            if let Err(e) = self.beat().await {
                info!(
                    "[{}] Connection to the server failed while sending heartbeats.",
                    self.tag
                );
                error!("[{}] {}", self.tag, e);
                return;
            }
            delay_for(self.pause()).await;
        }
    }

    async fn beat(&self) -> Result<(), CodecError> {
        let mut session = Session::connect(self.addr.as_str()).await?;
        info!("[{}] Sending a heartbeat to the server.", self.tag);
        send_message(&mut session, &Heartbeat { id: self.id }).await?;
        session.close().await?;
        Ok(())
    }

    fn pause(&self) -> Duration {
        self.max_interval.mul_f64(rand::thread_rng().gen::<f64>())
    }
}

/// Handle to a running [`HeartbeatReporter`].
///
/// Dropping the handle stops the reporter.
pub struct HeartbeatHandle {
    abort: AbortHandle,
    task: Option<JoinHandle<Result<(), Aborted>>>,
}

impl HeartbeatHandle {
    /// Stop the reporter immediately and wait until its task is gone. A
    /// heartbeat that is being sent may or may not reach the server.
    pub async fn cancel(mut self) {
        self.abort.abort();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Ok(())) => debug!("heartbeat reporter had already stopped"),
                Ok(Err(Aborted)) => debug!("heartbeat reporter cancelled"),
                Err(e) => warn!("heartbeat reporter task failed: {}", e),
            }
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}
