//! Raft node driver
//!
//! Runs a raft-rs `RawNode` inside a tokio task: ticks it, feeds it the
//! requests issued through [`DriverHandle`], and turns each `Ready` into
//! persistence, outbound messages, applied entries and read states.

#![allow(clippy::field_reassign_with_default)]

use std::sync::Arc;

use prost::Message as _;
use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, ConfChangeType, Entry, EntryType, Message, Snapshot};
use raft::{RawNode, ReadState, INVALID_ID};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::request::Request;
use super::storage::MemStore;
use super::{RaftHandle, StateMachine};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::logger;
use crate::node::Node;
use crate::pb::RaftContext;

const REQUEST_QUEUE_SIZE: usize = 1000;
const READ_STATE_QUEUE_SIZE: usize = 64;

/// Handle to a running driver. Cheap to share.
pub struct DriverHandle {
    requests: Sender<Request>,
}

impl DriverHandle {
    async fn call(&self, request: Request, rx: tokio::sync::oneshot::Receiver<Result<()>>) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)?
    }
}

#[tonic::async_trait]
impl RaftHandle for DriverHandle {
    async fn propose(&self, data: Vec<u8>) -> Result<()> {
        let (request, rx) = Request::propose(data);
        self.call(request, rx).await
    }

    async fn propose_conf_change(&self, cc: ConfChange) -> Result<()> {
        let (request, rx) = Request::conf_change(cc);
        self.call(request, rx).await
    }

    async fn read_index(&self, rctx: Vec<u8>) -> Result<()> {
        let (request, rx) = Request::read_index(rctx);
        self.call(request, rx).await
    }

    async fn step(&self, msg: Message) -> Result<()> {
        self.requests
            .send(Request::Step(msg))
            .await
            .map_err(|_| Error::Stopped)
    }

    async fn report_unreachable(&self, id: u64) {
        let _ = self.requests.send(Request::ReportUnreachable(id)).await;
    }
}

pub struct RaftDriver<S: StateMachine> {
    raw: RawNode<MemStore>, // The core Raft node implementation
    store: MemStore,
    node: Arc<Node>,
    requests: Receiver<Request>,
    read_states: Sender<ReadState>, // Read states for the read-index loop
    state_machine: S,
    tick_interval: Duration,
}

impl<S: StateMachine + Send + 'static> RaftDriver<S> {
    /// Wires `node` to a new raft-rs node and starts every worker: the
    /// driver itself, the message transmitter and the read-index loop.
    pub fn start(
        node: Arc<Node>,
        store: MemStore,
        state_machine: S,
        config: &NodeConfig,
        closer: CancellationToken,
    ) -> Result<(Arc<DriverHandle>, JoinHandle<()>)> {
        let logger = logger::raft_logger(config.log_format, node.id);
        let raft_config = config.raft_config(node.applied.done_until())?;
        let raw = RawNode::new(&raft_config, store.clone(), &logger)?;

        let (requests_tx, requests) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let handle = Arc::new(DriverHandle {
            requests: requests_tx,
        });
        node.set_raft(handle.clone())?;

        let (read_states, read_states_rx) = mpsc::channel(READ_STATE_QUEUE_SIZE);
        node.spawn_read_index_loop(closer.clone(), read_states_rx)?;
        node.spawn_transmitter(closer.clone())?;

        let driver = RaftDriver {
            raw,
            store,
            node,
            requests,
            read_states,
            state_machine,
            tick_interval: config.tick_interval(),
        };
        let task = tokio::spawn(driver.run(closer));
        Ok((handle, task))
    }

    async fn run(mut self, closer: CancellationToken) {
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = closer.cancelled() => {
                    log::info!("[{:#x}] Raft driver stopped", self.node.id);
                    return;
                }
                Some(request) = self.requests.recv() => {
                    self.handle_request(request);
                    while let Ok(request) = self.requests.try_recv() {
                        self.handle_request(request);
                    }
                }
                _ = ticker.tick() => {
                    self.raw.tick();
                }
            }

            self.on_ready().await;
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Propose { data, done } => {
                let _ = done.send(self.raw.propose(vec![], data).map_err(Error::from));
            }
            Request::ProposeConfChange { cc, done } => {
                let _ = done.send(self.raw.propose_conf_change(vec![], cc).map_err(Error::from));
            }
            Request::ReadIndex { rctx, done } => {
                if self.raw.raft.leader_id == INVALID_ID {
                    let _ = done.send(Err(Error::NoLeader));
                    return;
                }
                self.raw.read_index(rctx);
                let _ = done.send(Ok(()));
            }
            Request::Step(msg) => {
                let from = msg.from;
                if let Err(e) = self.raw.step(msg) {
                    log::debug!("Failed to step message from {:#x}: {}", from, e);
                }
            }
            Request::ReportUnreachable(id) => self.raw.report_unreachable(id),
        }
    }

    async fn on_ready(&mut self) {
        if !self.raw.has_ready() {
            return;
        }

        let mut ready = self.raw.ready();

        // Step 1: Send messages that need no persistence first
        if !ready.messages().is_empty() {
            Self::send_messages(&self.node, ready.take_messages()).await;
        }

        // Step 2: Install snapshot if any
        if *ready.snapshot() != Snapshot::default() {
            self.apply_snapshot(ready.snapshot().clone()).await;
        }

        // Step 3: Hand read states to the read-index loop
        self.forward_read_states(ready.take_read_states());

        // Step 4: Apply committed entries
        self.handle_committed_entries(ready.take_committed_entries());

        // Step 5: Persist raft state
        self.node
            .save_to_storage(ready.hs(), ready.entries(), None)
            .await;
        if !ready.persisted_messages().is_empty() {
            Self::send_messages(&self.node, ready.take_persisted_messages()).await;
        }

        // Step 6: Advance raft state
        let mut light_rd = self.raw.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.store.set_commit(commit);
        }
        Self::send_messages(&self.node, light_rd.take_messages()).await;
        self.handle_committed_entries(light_rd.take_committed_entries());
        self.raw.advance_apply();
    }

    // Borrows only the node so the state machine need not be `Sync`.
    async fn send_messages(node: &Node, messages: Vec<Message>) {
        for msg in messages {
            if let Err(e) = node.send(msg).await {
                log::error!("Failed to queue raft message: {}", e);
            }
        }
    }

    fn forward_read_states(&self, read_states: Vec<ReadState>) {
        for rs in read_states {
            if let Err(e) = self.read_states.try_send(rs) {
                // The read-index loop times out and asks again.
                log::warn!("Dropping read state: {}", e);
            }
        }
    }

    async fn apply_snapshot(&mut self, snapshot: Snapshot) {
        let metadata = snapshot.get_metadata().clone();
        self.node.save_to_storage(None, &[], Some(&snapshot)).await;
        self.node.set_conf_state(metadata.get_conf_state().clone());
        self.state_machine
            .on_snapshot(metadata.index, metadata.term, snapshot.get_data());
        self.node.applied.set_done_until(metadata.index);
        log::info!(
            "[{:#x}] Applied snapshot at index {} term {}",
            self.node.id,
            metadata.index,
            metadata.term
        );
    }

    fn handle_committed_entries(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            if !entry.data.is_empty() {
                match entry.get_entry_type() {
                    EntryType::EntryConfChange => self.apply_conf_change(&entry),
                    EntryType::EntryNormal => self.state_machine.apply(entry.index, &entry.data),
                    EntryType::EntryConfChangeV2 => {
                        log::warn!("Ignoring joint conf change at index {}", entry.index)
                    }
                }
            }
            self.node.applied.done(entry.index);
        }
    }

    fn apply_conf_change(&mut self, entry: &Entry) {
        let mut cc = ConfChange::default();
        if let Err(e) = cc.merge_from_bytes(&entry.data) {
            log::error!("Corrupt conf change at index {}: {}", entry.index, e);
            return;
        }

        let result = match self.raw.apply_conf_change(&cc) {
            Ok(cs) => {
                self.store.set_conf_state(cs.clone());
                self.node.set_conf_state(cs);
                self.update_peers(&cc);
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to apply conf change {:#x}: {}", cc.id, e);
                Err(Error::ConfChange(e.to_string()))
            }
        };
        self.node.done_conf_change(cc.id, result);
    }

    fn update_peers(&self, cc: &ConfChange) {
        match cc.get_change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                if cc.context.is_empty() {
                    return;
                }
                match RaftContext::decode(&cc.context[..]) {
                    Ok(rc) => {
                        if let Err(e) = self.node.connect(cc.node_id, &rc.addr) {
                            log::warn!("Unable to connect to {:#x}: {}", cc.node_id, e);
                        }
                    }
                    Err(e) => log::warn!("Bad raft context for {:#x}: {}", cc.node_id, e),
                }
            }
            ConfChangeType::RemoveNode => self.node.delete_peer(cc.node_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::context::Context;
    use crate::testutil::FakeTransport;

    /// Keeps its own position in a `Cell`, so it is `Send` but not `Sync`.
    struct CellMachine {
        last: Cell<u64>,
        applied: Arc<AtomicU64>,
    }

    impl StateMachine for CellMachine {
        fn apply(&mut self, index: u64, data: &[u8]) {
            self.last.set(index);
            if data == b"cell" {
                self.applied.store(self.last.get(), Ordering::SeqCst);
            }
        }

        fn on_snapshot(&mut self, last_index: u64, _last_term: u64, _data: &[u8]) {
            self.last.set(last_index);
        }
    }

    #[tokio::test]
    async fn test_driver_runs_state_machine_without_sync() {
        let config = NodeConfig {
            id: 1,
            group: 1,
            tick_interval_ms: 10,
            ..Default::default()
        };
        let store = MemStore::bootstrap(&[1]).unwrap();
        let node = Node::new(
            config.raft_context(),
            Arc::new(store.clone()),
            Arc::new(FakeTransport::default()),
            config.message_queue_size,
        )
        .unwrap();
        let applied = Arc::new(AtomicU64::new(0));
        let machine = CellMachine {
            last: Cell::new(0),
            applied: applied.clone(),
        };
        let closer = CancellationToken::new();
        let (handle, driver) = RaftDriver::start(
            node.clone(),
            store,
            machine,
            &config,
            closer.clone(),
        )
        .unwrap();

        let mut elected = false;
        for _ in 0..200 {
            let ctx = Context::background().with_timeout(Duration::from_secs(5));
            if node.wait_linearizable_read(&ctx).await.is_ok() {
                elected = true;
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(elected, "no leader elected");

        handle.propose(b"cell".to_vec()).await.unwrap();
        for _ in 0..200 {
            if applied.load(Ordering::SeqCst) > 0 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(applied.load(Ordering::SeqCst) > 1);

        closer.cancel();
        driver.await.unwrap();
    }
}
