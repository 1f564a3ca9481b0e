//! Consensus engine seam.
//!
//! The node never touches raft-rs directly: it talks to the engine through a
//! [`RaftHandle`] and to the durable store through a
//! [`storage::DurableStore`]. [`driver::RaftDriver`] is the raft-rs backed
//! implementation.

use raft::eraftpb::{ConfChange, Message};

use crate::error::Result;

pub mod driver;
pub mod request;
pub mod storage;

/// Application state fed with committed entries.
pub trait StateMachine {
    fn apply(&mut self, index: u64, data: &[u8]);
    fn on_snapshot(&mut self, last_index: u64, last_term: u64, data: &[u8]);
}

/// Operations the node issues against the consensus engine.
///
/// Each call returns once the engine has accepted (or rejected) the request;
/// commitment is reported asynchronously.
#[tonic::async_trait]
pub trait RaftHandle: Send + Sync {
    async fn propose(&self, data: Vec<u8>) -> Result<()>;

    async fn propose_conf_change(&self, cc: ConfChange) -> Result<()>;

    /// Requests a read index tagged with `rctx`. The answer arrives as a
    /// `ReadState` carrying the same context.
    async fn read_index(&self, rctx: Vec<u8>) -> Result<()>;

    async fn step(&self, msg: Message) -> Result<()>;

    async fn report_unreachable(&self, id: u64);
}
