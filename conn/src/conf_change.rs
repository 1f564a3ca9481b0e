//! Membership changes with caller-visible results.
//!
//! A conf change commits asynchronously; the proposer parks on a one-shot
//! channel keyed by the change id until the engine reports the change
//! applied through [`Node::done_conf_change`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use prost::Message as _;
use raft::eraftpb::{ConfChange, ConfChangeType};
use tokio::sync::oneshot;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::metrics;
use crate::node::Node;
use crate::pb::RaftContext;

pub const CONF_CHANGE_TIMEOUT: Duration = Duration::from_secs(3);

/// Result of a single proposal attempt.
#[derive(Debug)]
pub(crate) enum ProposeOutcome {
    /// The attempt timed out. It may or may not have been accepted, so the
    /// whole proposal must be made again.
    Retry,
    Done(Result<()>),
}

#[derive(Default)]
pub(crate) struct PendingConfChanges {
    inner: Mutex<HashMap<u64, oneshot::Sender<Result<()>>>>,
}

impl PendingConfChanges {
    /// Registers `tx` under a fresh, non-zero id.
    fn store(&self, tx: oneshot::Sender<Result<()>>) -> u64 {
        let mut pending = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut id = rand::random::<u64>();
        while id == 0 || pending.contains_key(&id) {
            id = rand::random::<u64>();
        }
        pending.insert(id, tx);
        id
    }

    fn take(&self, id: u64) -> Option<oneshot::Sender<Result<()>>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Node {
    /// Reports the outcome of an applied conf change. Unknown ids belong to
    /// proposers that already gave up and are ignored.
    pub fn done_conf_change(&self, id: u64, result: Result<()>) {
        if let Some(tx) = self.conf_changes.take(id) {
            let _ = tx.send(result);
        }
    }

    pub(crate) async fn propose_conf_change(&self, ctx: &Context, mut cc: ConfChange) -> ProposeOutcome {
        let raft = match self.raft() {
            Some(raft) => raft,
            None => return ProposeOutcome::Done(Err(Error::NoNode)),
        };
        let cctx = ctx.with_timeout(CONF_CHANGE_TIMEOUT);

        let (tx, rx) = oneshot::channel();
        let id = self.conf_changes.store(tx);
        cc.set_id(id);

        let outcome = match cctx.run(raft.propose_conf_change(cc)).await {
            Ok(Ok(())) => {
                tokio::select! {
                    biased;
                    res = rx => match res {
                        Ok(res) => ProposeOutcome::Done(res),
                        Err(_) => ProposeOutcome::Done(Err(Error::Stopped)),
                    },
                    err = ctx.done() => ProposeOutcome::Done(Err(err.into())),
                    _ = cctx.done() => ProposeOutcome::Retry,
                }
            }
            Ok(Err(e)) if cctx.err().is_none() => {
                log::warn!("Error while proposing conf change: {}", e);
                ProposeOutcome::Done(Err(e))
            }
            _ => match ctx.err() {
                Some(err) => ProposeOutcome::Done(Err(err.into())),
                None => ProposeOutcome::Retry,
            },
        };
        // A late callback for this id finds nothing and is dropped.
        self.conf_changes.take(id);
        outcome
    }

    async fn propose_until_done(&self, ctx: &Context, cc: ConfChange) -> Result<()> {
        loop {
            match self.propose_conf_change(ctx, cc.clone()).await {
                ProposeOutcome::Done(res) => return res,
                ProposeOutcome::Retry => {
                    metrics::CONF_CHANGE_RETRIES.inc();
                    log::info!(
                        "[{:#x}] Retrying conf change for node {:#x}",
                        self.id,
                        cc.node_id
                    );
                }
            }
        }
    }

    /// Adds `pid` to the group. Its address must already be known.
    pub async fn add_to_cluster(&self, ctx: &Context, pid: u64) -> Result<()> {
        let addr = self.peer(pid).ok_or(Error::UnknownPeer(pid))?;
        let rc = RaftContext {
            addr: addr.clone(),
            group: self.raft_context.group,
            id: pid,
        };

        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.set_node_id(pid);
        cc.set_context(rc.encode_to_vec().into());

        log::info!("Trying to add {:#x} to cluster. Addr: {}", pid, addr);
        log::info!(
            "Current confstate at {:#x}: {:?}",
            self.id,
            self.conf_state()
        );
        self.propose_until_done(ctx, cc).await
    }

    /// Removes `id` from the group. `id` must be a known peer or this node.
    pub async fn propose_peer_removal(&self, ctx: &Context, id: u64) -> Result<()> {
        if self.raft().is_none() {
            return Err(Error::NoNode);
        }
        if !self.peers.contains(id) && id != self.raft_context.id {
            return Err(Error::NotPartOfGroup(id));
        }

        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::RemoveNode);
        cc.set_node_id(id);
        self.propose_until_done(ctx, cc).await
    }
}
