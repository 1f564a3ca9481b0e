use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;

use raft::eraftpb::{ConfChange, Message};

use crate::error::Result;

/// Work handed to the raft driver task.
pub enum Request {
    Propose {
        data: Vec<u8>,
        done: Sender<Result<()>>,
    },
    ProposeConfChange {
        cc: ConfChange,
        done: Sender<Result<()>>,
    },
    ReadIndex {
        rctx: Vec<u8>,
        done: Sender<Result<()>>,
    },
    Step(Message),
    ReportUnreachable(u64),
}

impl Request {
    pub fn propose(data: Vec<u8>) -> (Self, Receiver<Result<()>>) {
        let (done, rx) = oneshot::channel();
        (Request::Propose { data, done }, rx)
    }

    pub fn conf_change(cc: ConfChange) -> (Self, Receiver<Result<()>>) {
        let (done, rx) = oneshot::channel();
        (Request::ProposeConfChange { cc, done }, rx)
    }

    pub fn read_index(rctx: Vec<u8>) -> (Self, Receiver<Result<()>>) {
        let (done, rx) = oneshot::channel();
        (Request::ReadIndex { rctx, done }, rx)
    }
}
