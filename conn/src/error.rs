//! Error types for the raft connection layer.

use thiserror::Error;

use crate::context::ContextError;
use crate::raft_client::TransportError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no node has been set up yet")]
    NoNode,

    #[error("raft node has already been set")]
    RaftAlreadySet,

    #[error("node {0:#x} not part of group")]
    NotPartOfGroup(u64),

    #[error("unable to find address for peer {0:#x}")]
    UnknownPeer(u64),

    #[error("peer {0:#x} has an empty address")]
    EmptyAddr(u64),

    #[error("sending raft message to itself")]
    SendToSelf,

    #[error("cannot get linearized read (time expired or no configured leader)")]
    ReadIndexUnavailable,

    #[error("no leader is known to the raft node")]
    NoLeader,

    #[error("raft node has stopped")]
    Stopped,

    #[error("{0} has already been started")]
    AlreadyStarted(&'static str),

    #[error("conf change failed: {0}")]
    ConfChange(String),

    #[error("corrupt raft batch: {0}")]
    CorruptBatch(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("raft error: {0}")]
    Raft(#[from] raft::Error),

    #[error("protobuf error: {0}")]
    Protobuf(#[from] protobuf::ProtobufError),

    #[error("metrics encoding failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::NotPartOfGroup(0x2a).to_string(),
            "node 0x2a not part of group"
        );
        assert!(Error::ReadIndexUnavailable
            .to_string()
            .contains("cannot get linearized read"));
        let err: Error = ContextError::DeadlineExceeded.into();
        assert!(matches!(err, Error::Context(ContextError::DeadlineExceeded)));
        let err: Error = prometheus::Error::Msg("bad text".to_string()).into();
        assert!(matches!(err, Error::Metrics(_)));
        assert_eq!(err.to_string(), "metrics encoding failed: bad text");
    }
}
