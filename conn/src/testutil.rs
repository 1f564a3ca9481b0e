//! In-memory engine and transport doubles for unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use raft::eraftpb::{ConfChange, Message};
use raft::ReadState;
use tokio::sync::mpsc;

use crate::engine::storage::MemStore;
use crate::engine::RaftHandle;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::pb::{RaftBatch, RaftContext};
use crate::raft_client::{PeerConn, RaftTransport, TransportError};

/// What the fake engine does with the next conf change.
pub enum ConfChangeScript {
    /// Accept it and report `result` as applied.
    Commit(Result<()>),
    /// Accept it and never report back.
    Drop,
    /// Never return from the proposal.
    Hang,
    /// Refuse the proposal.
    Reject,
}

/// What the fake engine does with the next read-index request.
pub enum ReadIndexScript {
    Respond(u64),
    /// Answer with a read state for some other request.
    Stale(u64),
    Drop,
    Fail,
}

#[derive(Default)]
struct FakeRaftState {
    conf_changes: Vec<ConfChange>,
    conf_change_script: VecDeque<ConfChangeScript>,
    read_indexes: Vec<Vec<u8>>,
    read_index_script: VecDeque<ReadIndexScript>,
    read_states: Option<mpsc::Sender<ReadState>>,
    stepped: Vec<Message>,
    unreachable: Vec<u64>,
}

/// Records every call. Conf changes commit and reads answer with index 1
/// unless scripted otherwise.
#[derive(Default)]
pub struct FakeRaft {
    node: Mutex<Weak<Node>>,
    state: Mutex<FakeRaftState>,
}

impl FakeRaft {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeRaftState> {
        self.state.lock().unwrap()
    }

    pub fn attach(&self, node: &Arc<Node>) {
        *self.node.lock().unwrap() = Arc::downgrade(node);
    }

    pub fn script_conf_change(&self, script: ConfChangeScript) {
        self.state().conf_change_script.push_back(script);
    }

    pub fn script_read_index(&self, script: ReadIndexScript) {
        self.state().read_index_script.push_back(script);
    }

    /// Channel on which read-index answers are delivered.
    pub fn read_states(&self) -> mpsc::Receiver<ReadState> {
        let (tx, rx) = mpsc::channel(16);
        self.state().read_states = Some(tx);
        rx
    }

    pub fn conf_changes(&self) -> Vec<ConfChange> {
        self.state().conf_changes.clone()
    }

    pub fn read_indexes(&self) -> Vec<Vec<u8>> {
        self.state().read_indexes.clone()
    }

    pub fn stepped(&self) -> Vec<Message> {
        self.state().stepped.clone()
    }

    pub fn unreachable(&self) -> Vec<u64> {
        self.state().unreachable.clone()
    }

    /// Delivers a read state no request asked for.
    pub fn push_read_state(&self, index: u64, request_ctx: Vec<u8>) {
        self.answer(index, request_ctx);
    }

    fn answer(&self, index: u64, request_ctx: Vec<u8>) {
        if let Some(tx) = self.state().read_states.as_ref() {
            let _ = tx.try_send(ReadState { index, request_ctx });
        }
    }
}

#[tonic::async_trait]
impl RaftHandle for FakeRaft {
    async fn propose(&self, _data: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn propose_conf_change(&self, cc: ConfChange) -> Result<()> {
        let script = {
            let mut state = self.state();
            state.conf_changes.push(cc.clone());
            state
                .conf_change_script
                .pop_front()
                .unwrap_or(ConfChangeScript::Commit(Ok(())))
        };
        match script {
            ConfChangeScript::Commit(result) => {
                let node = self.node.lock().unwrap().clone();
                tokio::spawn(async move {
                    if let Some(node) = node.upgrade() {
                        node.done_conf_change(cc.id, result);
                    }
                });
                Ok(())
            }
            ConfChangeScript::Drop => Ok(()),
            ConfChangeScript::Hang => std::future::pending().await,
            ConfChangeScript::Reject => Err(Error::NoLeader),
        }
    }

    async fn read_index(&self, rctx: Vec<u8>) -> Result<()> {
        let script = {
            let mut state = self.state();
            state.read_indexes.push(rctx.clone());
            state
                .read_index_script
                .pop_front()
                .unwrap_or(ReadIndexScript::Respond(1))
        };
        match script {
            ReadIndexScript::Respond(index) => self.answer(index, rctx),
            ReadIndexScript::Stale(index) => self.answer(index, b"stale".to_vec()),
            ReadIndexScript::Drop => {}
            ReadIndexScript::Fail => return Err(Error::NoLeader),
        }
        Ok(())
    }

    async fn step(&self, msg: Message) -> Result<()> {
        self.state().stepped.push(msg);
        Ok(())
    }

    async fn report_unreachable(&self, id: u64) {
        self.state().unreachable.push(id);
    }
}

#[derive(Default)]
struct FakeTransportState {
    connects: Vec<String>,
    batches: Vec<(String, RaftBatch)>,
    unreachable: HashSet<String>,
    unhealthy: HashSet<String>,
}

/// Accepts batches for every dialed address and keeps them.
#[derive(Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeTransportState>>,
}

impl FakeTransport {
    pub fn connects(&self) -> Vec<String> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn batches(&self) -> Vec<(String, RaftBatch)> {
        self.state.lock().unwrap().batches.clone()
    }

    /// Polls until at least `n` batches were delivered.
    pub async fn wait_for_batches(&self, n: usize) -> Vec<(String, RaftBatch)> {
        for _ in 0..1000 {
            let batches = self.batches();
            if batches.len() >= n {
                return batches;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} batches, got {}", n, self.batches().len());
    }

    pub fn set_unreachable(&self, addr: &str) {
        self.state
            .lock()
            .unwrap()
            .unreachable
            .insert(addr.to_string());
    }

    pub fn is_unhealthy(&self, addr: &str) -> bool {
        self.state.lock().unwrap().unhealthy.contains(addr)
    }
}

impl RaftTransport for FakeTransport {
    fn connect(&self, addr: &str) {
        self.state.lock().unwrap().connects.push(addr.to_string());
    }

    fn get(&self, addr: &str) -> std::result::Result<Arc<dyn PeerConn>, TransportError> {
        if !self.state.lock().unwrap().connects.iter().any(|a| a == addr) {
            return Err(TransportError::NoConnection(addr.to_string()));
        }
        Ok(Arc::new(FakeConn {
            addr: addr.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct FakeConn {
    addr: String,
    state: Arc<Mutex<FakeTransportState>>,
}

#[tonic::async_trait]
impl PeerConn for FakeConn {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn raft_message(&self, batch: RaftBatch) -> std::result::Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable.contains(&self.addr) {
            return Err(TransportError::Unreachable {
                addr: self.addr.clone(),
                reason: "connection refused".to_string(),
            });
        }
        state.batches.push((self.addr.clone(), batch));
        Ok(())
    }

    fn set_unhealthy(&self) {
        self.state
            .lock()
            .unwrap()
            .unhealthy
            .insert(self.addr.clone());
    }
}

fn context(id: u64) -> RaftContext {
    RaftContext {
        id,
        group: 1,
        addr: format!("n{}:7080", id),
    }
}

/// A node at `n<id>:7080` in group 1 with no engine attached.
pub fn node_without_raft(id: u64) -> (Arc<Node>, Arc<FakeTransport>) {
    let transport = Arc::new(FakeTransport::default());
    let node = Node::new(
        context(id),
        Arc::new(MemStore::new()),
        transport.clone(),
        100,
    )
    .unwrap();
    (node, transport)
}

/// A node at `n<id>:7080` in group 1 driven by a [`FakeRaft`].
pub fn node(id: u64) -> (Arc<Node>, Arc<FakeRaft>, Arc<FakeTransport>) {
    let (node, transport) = node_without_raft(id);
    let raft = Arc::new(FakeRaft::default());
    raft.attach(&node);
    node.set_raft(raft.clone()).unwrap();
    (node, raft, transport)
}
