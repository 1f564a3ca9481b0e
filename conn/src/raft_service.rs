//! Inbound side of the raft transport.
//!
//! Implements the generated `pb.Raft` service and steps every received
//! batch into the local node.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::error::Error;
use crate::node::Node;
use crate::pb::raft_server::{Raft, RaftServer};
use crate::pb::{Payload, RaftBatch};

pub struct RaftService {
    node: Arc<Node>,
}

impl RaftService {
    pub fn new(node: Arc<Node>) -> Self {
        RaftService { node }
    }

    /// Wraps the service for `tonic::transport::Server::add_service`.
    pub fn into_server(self) -> RaftServer<Self> {
        RaftServer::new(self)
    }
}

#[tonic::async_trait]
impl Raft for RaftService {
    async fn raft_message(&self, request: Request<RaftBatch>) -> Result<Response<Payload>, Status> {
        raft_message(&self.node, request.into_inner()).await
    }
}

async fn raft_message(node: &Node, batch: RaftBatch) -> Result<Response<Payload>, Status> {
    if let Some(rc) = batch.context.as_ref() {
        if rc.group != node.raft_context.group {
            return Err(Status::invalid_argument(format!(
                "batch for group {} sent to group {}",
                rc.group, node.raft_context.group
            )));
        }
        if rc.id != 0 && !rc.addr.is_empty() {
            if let Err(e) = node.connect(rc.id, &rc.addr) {
                log::warn!("Unable to connect back to {:#x}: {}", rc.id, e);
            }
        }
    }
    match node.on_raft_batch(&batch).await {
        Ok(()) => Ok(Response::new(Payload::default())),
        Err(e @ Error::NoNode) | Err(e @ Error::Stopped) => Err(Status::unavailable(e.to_string())),
        Err(e @ Error::CorruptBatch(_)) | Err(e @ Error::Protobuf(_)) => {
            log::warn!("Rejecting raft batch: {}", e);
            Err(Status::invalid_argument(e.to_string()))
        }
        Err(e) => Err(Status::internal(e.to_string())),
    }
}
