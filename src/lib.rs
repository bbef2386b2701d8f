//! Round-based federated learning over TCP.
//!
//! Clients register with a server, wait to be selected, receive the global
//! model, train on their local data and send their update back. With
//! cross-silo aggregation, leaf clients report to edge servers which aggregate
//! their updates and report to the central server in turn.
//!
//! The crate is organized bottom-up:
//!
//! - [`transport`]: length-delimited frames over TCP.
//! - [`codec`]: messages and (possibly chunked) payloads over frames.
//! - [`heartbeat`]: liveness reporting while a client trains.
//! - [`client`]: the client state machine, driving a [`learner::Learner`].
//! - [`server`] and [`edge`]: the server half of the protocol, and edge
//!   servers built on top of it.

#[macro_use]
extern crate tracing;

pub mod aggregator;
pub mod client;
pub mod codec;
pub mod edge;
pub mod heartbeat;
pub mod learner;
pub mod logging;
pub mod message;
pub mod server;
pub mod settings;
pub mod simulated;
pub mod topology;
pub mod transport;
