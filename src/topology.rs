//! Mapping of clients onto edge servers and ports.
//!
//! With cross-silo aggregation enabled, leaf clients are spread over
//! `total_silos` edge servers. Edge servers get the ids following the leaf
//! clients (`total_clients + 1 ..= total_clients + total_silos`) and listen on
//! `base_port + edge_server_id`.

use std::{fmt, process};

use thiserror::Error;

use crate::{message::ClientId, settings::Settings};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("client #{id} is outside of [1, {total_clients}]")]
    UnknownClient { id: u32, total_clients: u32 },
    #[error("edge server #{id} is outside of [{}, {}]", .total_clients + 1, .total_clients + .total_silos)]
    UnknownEdgeServer {
        id: u32,
        total_clients: u32,
        total_silos: u32,
    },
    #[error("cross-silo aggregation needs at least one silo")]
    NoSilos,
    #[error("port {base} + {offset} does not fit in a port number")]
    PortOverflow { base: u16, offset: u32 },
}

/// Index in `[1, total_silos]` of the edge server in charge of `client`.
pub fn edge_index(
    client: ClientId,
    total_clients: u32,
    total_silos: u32,
) -> Result<u32, TopologyError> {
    let id = client.get();
    if total_silos == 0 {
        return Err(TopologyError::NoSilos);
    }
    if id == 0 || id > total_clients {
        return Err(TopologyError::UnknownClient { id, total_clients });
    }
    Ok((id - 1) % total_silos + 1)
}

/// Identity of the edge server in charge of `client`.
pub fn edge_server_id(
    client: ClientId,
    total_clients: u32,
    total_silos: u32,
) -> Result<ClientId, TopologyError> {
    let index = edge_index(client, total_clients, total_silos)?;
    Ok(ClientId::new(total_clients + index))
}

/// Whether `id` is one of the edge server ids following the leaf clients.
pub fn is_edge_server(id: ClientId, total_clients: u32, total_silos: u32) -> bool {
    id.get() > total_clients && id.get() - total_clients <= total_silos
}

/// Port an edge server listens on.
pub fn server_port(base_port: u16, edge_server: ClientId) -> Result<u16, TopologyError> {
    let offset = edge_server.get();
    let port = u32::from(base_port) + offset;
    if port > u32::from(u16::MAX) {
        return Err(TopologyError::PortOverflow {
            base: base_port,
            offset,
        });
    }
    Ok(port as u16)
}

/// The part a process plays in the aggregation topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A client talking directly to the central server.
    Client,
    /// A leaf client reporting to one of the edge servers.
    LeafClient { edge_server: ClientId },
    /// An edge server: a server for leaf clients and a client of the central
    /// server.
    EdgeServer,
}

impl Role {
    /// How log lines of a process playing this role are prefixed.
    pub fn tag(self, id: ClientId) -> LogTag {
        match self {
            Role::EdgeServer => LogTag::server(),
            Role::Client | Role::LeafClient { .. } => LogTag::Client(id),
        }
    }
}

/// Prefix of log lines, so that edge server activity can be told apart from
/// client activity in shared logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    Client(ClientId),
    /// A server, identified by its process id.
    Server(u32),
}

impl LogTag {
    pub fn server() -> Self {
        LogTag::Server(process::id())
    }
}

impl fmt::Display for LogTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTag::Client(id) => write!(f, "Client #{}", id),
            LogTag::Server(pid) => write!(f, "Server #{}", pid),
        }
    }
}

/// Where a process connects to, and where edge servers listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub role: Role,
    /// Address of the main session.
    pub target: String,
    /// Address of the central server, where heartbeats go.
    pub central: String,
}

impl Topology {
    pub fn from_settings(settings: &Settings) -> Result<Self, TopologyError> {
        let id = settings.client_id();
        let total_clients = settings.client.total_clients;
        let address = &settings.server.address;
        let base_port = settings.server.port;
        let central = format!("{}:{}", address, base_port);

        let role = if settings.is_edge_server() {
            let total_silos = settings.algorithm.total_silos;
            if !is_edge_server(id, total_clients, total_silos) {
                return Err(TopologyError::UnknownEdgeServer {
                    id: id.get(),
                    total_clients,
                    total_silos,
                });
            }
            Role::EdgeServer
        } else if settings.algorithm.cross_silo {
            Role::LeafClient {
                edge_server: edge_server_id(id, total_clients, settings.algorithm.total_silos)?,
            }
        } else {
            Role::Client
        };

        let target = match role {
            Role::LeafClient { edge_server } => {
                format!("{}:{}", address, server_port(base_port, edge_server)?)
            }
            Role::Client | Role::EdgeServer => central.clone(),
        };

        Ok(Self {
            role,
            target,
            central,
        })
    }

    /// Address an edge server listens on for its leaf clients.
    pub fn edge_listen_address(settings: &Settings) -> Result<String, TopologyError> {
        let port = server_port(settings.server.port, settings.client_id())?;
        Ok(format!("{}:{}", settings.server.address, port))
    }
}
