//! Raft group membership of this process.
//!
//! `Node` owns everything the rest of the database needs around the
//! consensus engine: the peer directory, the outbound message queue, pending
//! conf changes, the read-index request queue and the applied watermark.
//! The behaviour is split across `transmit`, `conf_change` and `read_index`.
//!
//! Lock discipline: every lock below guards one field, is never held across
//! an `.await` and is never taken while another is held.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use tokio::sync::mpsc;

use crate::conf_change::PendingConfChanges;
use crate::engine::storage::DurableStore;
use crate::engine::RaftHandle;
use crate::error::{Error, Result};
use crate::pb::RaftContext;
use crate::peers::PeerDirectory;
use crate::raft_client::RaftTransport;
use crate::read_index::{LinReadReq, READ_REQUEST_QUEUE_SIZE};
use crate::transmit::SendMsg;
use crate::watermark::WaterMark;

const SAVE_RETRY_INTERVAL: Duration = Duration::from_millis(10);

pub struct Node {
    // Never changed after construction.
    pub id: u64,
    pub my_addr: String,
    pub raft_context: RaftContext,
    /// Highest log index applied to local state.
    pub applied: WaterMark,

    pub(crate) peers: PeerDirectory,
    pub(crate) conf_changes: PendingConfChanges,
    pub(crate) transport: Arc<dyn RaftTransport>,
    store: Arc<dyn DurableStore>,

    // Set after construction.
    raft: RwLock<Option<Arc<dyn RaftHandle>>>,
    conf_state: RwLock<Option<ConfState>>,

    pub(crate) messages: mpsc::Sender<SendMsg>,
    pub(crate) outbound: Mutex<Option<mpsc::Receiver<SendMsg>>>,
    pub(crate) requests: mpsc::Sender<LinReadReq>,
    pub(crate) pending_reads: Mutex<Option<mpsc::Receiver<LinReadReq>>>,
}

impl Node {
    pub fn new(
        rc: RaftContext,
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn RaftTransport>,
        message_queue_size: usize,
    ) -> Result<Arc<Node>> {
        let snapshot = store.snapshot()?;
        let (messages, outbound) = mpsc::channel(message_queue_size.max(1));
        let (requests, pending_reads) = mpsc::channel(READ_REQUEST_QUEUE_SIZE);

        let node = Node {
            id: rc.id,
            my_addr: rc.addr.clone(),
            applied: WaterMark::new("Applied watermark"),
            peers: PeerDirectory::new(rc.id),
            conf_changes: PendingConfChanges::default(),
            transport,
            store,
            raft: RwLock::new(None),
            conf_state: RwLock::new(None),
            messages,
            outbound: Mutex::new(Some(outbound)),
            requests,
            pending_reads: Mutex::new(Some(pending_reads)),
            raft_context: rc,
        };
        // Matches the applied index handed to the engine config.
        node.applied.set_done_until(snapshot.get_metadata().index);
        log::info!(
            "[{:#x}] Node created in group {} at {}, applied until {}",
            node.id,
            node.raft_context.group,
            node.my_addr,
            node.applied.done_until()
        );
        Ok(Arc::new(node))
    }

    /// Attaches the consensus engine. Fails if one is already attached.
    pub fn set_raft(&self, raft: Arc<dyn RaftHandle>) -> Result<()> {
        let mut slot = self.raft.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(Error::RaftAlreadySet);
        }
        *slot = Some(raft);
        Ok(())
    }

    pub fn raft(&self) -> Option<Arc<dyn RaftHandle>> {
        self.raft.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stores the latest membership produced by an applied conf change.
    pub fn set_conf_state(&self, cs: ConfState) {
        log::info!("[{:#x}] Setting conf state to {:?}", self.id, cs);
        *self.conf_state.write().unwrap_or_else(|e| e.into_inner()) = Some(cs);
    }

    pub fn conf_state(&self) -> Option<ConfState> {
        self.conf_state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn peer(&self, pid: u64) -> Option<String> {
        self.peers.get(pid)
    }

    pub fn peer_ids(&self) -> Vec<u64> {
        self.peers.ids()
    }

    /// `addr` must not be empty.
    pub fn set_peer(&self, pid: u64, addr: &str) -> Result<()> {
        self.peers.set(pid, addr)
    }

    /// Records `addr` for `pid` and opens a connection to it.
    pub fn connect(&self, pid: u64, addr: &str) -> Result<()> {
        if pid == self.id {
            return Ok(());
        }
        if addr.is_empty() {
            return Err(Error::EmptyAddr(pid));
        }
        if self.peer(pid).as_deref() == Some(addr) {
            return Ok(());
        }
        if addr == self.my_addr {
            log::info!("Peer {:#x} claims same host as me", pid);
            return self.set_peer(pid, addr);
        }
        self.transport.connect(addr);
        self.set_peer(pid, addr)
    }

    pub fn delete_peer(&self, pid: u64) {
        self.peers.delete(pid);
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        self.store.snapshot()
    }

    /// Persists a raft update, retrying until the store accepts it.
    pub async fn save_to_storage(
        &self,
        hs: Option<&HardState>,
        entries: &[Entry],
        snapshot: Option<&Snapshot>,
    ) {
        loop {
            match self.store.save(hs, entries, snapshot) {
                Ok(()) => return,
                Err(e) => {
                    log::error!("While trying to save Raft update: {}. Retrying...", e);
                    tokio::time::sleep(SAVE_RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Inspects the store for state left by a previous run.
    ///
    /// Returns the latest snapshot index and whether this is a restart.
    pub fn past_life(&self) -> Result<(u64, bool)> {
        let mut restart = false;
        let mut index = 0;

        let snapshot = self.store.snapshot()?;
        if snapshot.get_metadata().index > 0 {
            log::info!("Found Snapshot.Metadata: {:?}", snapshot.get_metadata());
            restart = true;
            index = snapshot.get_metadata().index;
        }

        let hs = self.store.hard_state()?;
        if hs != HardState::default() {
            log::info!("Found hardstate: {:?}", hs);
            restart = true;
        }

        let num = self.store.num_entries()?;
        log::info!(
            "Group {} found {} entries",
            self.raft_context.group,
            num
        );
        if num > 0 {
            restart = true;
        }
        Ok((index, restart))
    }
}
