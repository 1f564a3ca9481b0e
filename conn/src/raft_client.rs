//! Raft client implementation
//!
//! This module provides the connections used to ship raft batches to other
//! nodes in the cluster. The transmitter only sees the [`RaftTransport`] and
//! [`PeerConn`] traits; [`GrpcTransport`] is the tonic-backed implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;

use crate::pb::raft_client::RaftClient;
use crate::pb::RaftBatch;

/// How long a connection marked unhealthy is withheld from senders.
const UNHEALTHY_COOLDOWN: Duration = Duration::from_secs(2);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer cannot be reached at all right now.
    #[error("peer {addr} unreachable: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("no connection to {0}")]
    NoConnection(String),

    #[error("connection to {0} is unhealthy")]
    Unhealthy(String),

    #[error("rpc failed: {0}")]
    Rpc(String),
}

impl TransportError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, TransportError::Unreachable { .. })
    }
}

/// A connection to one peer address.
#[tonic::async_trait]
pub trait PeerConn: Send + Sync {
    fn addr(&self) -> &str;

    /// Delivers one framed raft batch.
    async fn raft_message(&self, batch: RaftBatch) -> Result<(), TransportError>;

    fn set_unhealthy(&self);
}

/// Connection pools keyed by address.
pub trait RaftTransport: Send + Sync {
    fn connect(&self, addr: &str);

    fn get(&self, addr: &str) -> Result<Arc<dyn PeerConn>, TransportError>;
}

/// Client for a single peer node
pub struct GrpcPeer {
    addr: String,
    client: RaftClient<Channel>,
    /// Set while the peer is considered unhealthy.
    unhealthy_since: Mutex<Option<Instant>>,
}

impl GrpcPeer {
    /// Creates a lazily connected client for `addr`.
    fn new(addr: &str) -> Result<Self, TransportError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| TransportError::Rpc(e.to_string()))?;
        Ok(GrpcPeer {
            addr: addr.to_string(),
            client: RaftClient::new(endpoint.connect_lazy()),
            unhealthy_since: Mutex::new(None),
        })
    }

    fn is_healthy(&self) -> bool {
        let mut since = self
            .unhealthy_since
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match *since {
            Some(at) if at.elapsed() < UNHEALTHY_COOLDOWN => false,
            Some(_) => {
                *since = None;
                true
            }
            None => true,
        }
    }
}

#[tonic::async_trait]
impl PeerConn for GrpcPeer {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn raft_message(&self, batch: RaftBatch) -> Result<(), TransportError> {
        let mut client = self.client.clone();
        client
            .raft_message(tonic::Request::new(batch))
            .await
            .map(|_| ())
            .map_err(|status| classify(&self.addr, status))
    }

    fn set_unhealthy(&self) {
        *self
            .unhealthy_since
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }
}

/// Connection failures that tonic cannot attribute to a code arrive as
/// `Unknown`; those are as unreachable as a refused connection.
fn classify(addr: &str, status: tonic::Status) -> TransportError {
    let unreachable = match status.code() {
        Code::Unavailable => true,
        Code::Unknown => {
            let msg = status.message();
            msg.starts_with("Service was not ready") || msg.starts_with("transport error")
        }
        _ => false,
    };
    if unreachable {
        TransportError::Unreachable {
            addr: addr.to_string(),
            reason: status.message().to_string(),
        }
    } else {
        TransportError::Rpc(status.to_string())
    }
}

/// Client for managing connections to all peer nodes
#[derive(Default)]
pub struct GrpcTransport {
    /// Map of peer addresses to their respective clients
    peers: Mutex<HashMap<String, Arc<GrpcPeer>>>,
}

impl GrpcTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftTransport for GrpcTransport {
    fn connect(&self, addr: &str) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if peers.contains_key(addr) {
            return;
        }
        match GrpcPeer::new(addr) {
            Ok(peer) => {
                log::info!("Connected to raft peer at {}", addr);
                peers.insert(addr.to_string(), Arc::new(peer));
            }
            Err(e) => log::error!("Failed to create peer client for {}: {}", addr, e),
        }
    }

    fn get(&self, addr: &str) -> Result<Arc<dyn PeerConn>, TransportError> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let peer = peers
            .get(addr)
            .ok_or_else(|| TransportError::NoConnection(addr.to_string()))?;
        if !peer.is_healthy() {
            return Err(TransportError::Unhealthy(addr.to_string()));
        }
        Ok(peer.clone())
    }
}
