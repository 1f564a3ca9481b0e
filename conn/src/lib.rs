//! Raft group plumbing for a node of a replicated store.
//!
//! [`Node`] batches outbound raft traffic to peers, coordinates membership
//! changes, serves linearizable reads through raft's read index, and tracks
//! how far local state has applied the log. The consensus engine itself is
//! raft-rs, driven by [`engine::driver::RaftDriver`].

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod node;
pub mod pb;
pub mod peers;
pub mod raft_client;
pub mod raft_service;
pub mod watermark;

mod conf_change;
mod read_index;
mod transmit;

#[cfg(test)]
mod testutil;

pub use conf_change::CONF_CHANGE_TIMEOUT;
pub use context::{Context, ContextError};
pub use error::{Error, Result};
pub use node::Node;
pub use read_index::READ_INDEX_TIMEOUT;
pub use transmit::{decode_frames, write_frame, MESSAGE_BATCH_SOFT_LIMIT, SEND_TIMEOUT};
