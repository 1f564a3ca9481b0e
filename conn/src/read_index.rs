//! Linearizable reads on top of raft's read index.
//!
//! Callers queue a [`LinReadReq`] and a single task answers every request
//! that arrived together with one read-index round trip.

use std::sync::Arc;
use std::time::Duration;

use raft::ReadState;
use tokio::sync::mpsc::Receiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::{Context, ContextError};
use crate::error::{Error, Result};
use crate::metrics;
use crate::node::Node;

pub(crate) const READ_REQUEST_QUEUE_SIZE: usize = 256;
pub const READ_INDEX_TIMEOUT: Duration = Duration::from_secs(3);

pub(crate) struct LinReadReq {
    /// Receives the committed index, or 0 when none could be obtained.
    index_tx: oneshot::Sender<u64>,
}

enum ReadAttempt {
    Index(u64),
    Retry,
}

impl Node {
    /// Blocks until local state reflects every write committed before the
    /// call.
    pub async fn wait_linearizable_read(&self, ctx: &Context) -> Result<()> {
        let (index_tx, index_rx) = oneshot::channel();
        ctx.run(self.requests.send(LinReadReq { index_tx }))
            .await?
            .map_err(|_| Error::Stopped)?;

        // A dropped sender means the loop shut down with the request queued.
        let index = ctx.run(index_rx).await?.unwrap_or(0);
        if index == 0 {
            return Err(Error::ReadIndexUnavailable);
        }
        self.applied.wait_for_mark(ctx, index).await?;
        Ok(())
    }

    /// Starts the read-index loop fed by the engine's `read_states`.
    pub fn spawn_read_index_loop(
        self: &Arc<Self>,
        closer: CancellationToken,
        read_states: Receiver<ReadState>,
    ) -> Result<JoinHandle<()>> {
        let requests = self
            .pending_reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(Error::AlreadyStarted("read index loop"))?;
        Ok(tokio::spawn(self.clone().run_read_index_loop(
            closer,
            read_states,
            requests,
        )))
    }

    async fn run_read_index_loop(
        self: Arc<Self>,
        closer: CancellationToken,
        mut read_states: Receiver<ReadState>,
        mut requests: Receiver<LinReadReq>,
    ) {
        let mut batch: Vec<LinReadReq> = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = closer.cancelled() => return,
                rs = read_states.recv() => match rs {
                    Some(rs) => log::warn!(
                        "Received a read state unexpectedly: index {} ctx {:?}",
                        rs.index,
                        rs.request_ctx
                    ),
                    None => return,
                },
                req = requests.recv() => {
                    match req {
                        Some(req) => batch.push(req),
                        None => return,
                    }
                    while let Ok(req) = requests.try_recv() {
                        batch.push(req);
                    }

                    let index = loop {
                        match self.read_index_once(&closer, &mut read_states).await {
                            ReadAttempt::Index(index) => break index,
                            ReadAttempt::Retry if closer.is_cancelled() => break 0,
                            ReadAttempt::Retry => {
                                log::debug!("[{:#x}] Read index timed out, retrying", self.id);
                            }
                        }
                    };
                    for req in batch.drain(..) {
                        let _ = req.index_tx.send(index);
                    }
                }
            }
        }
    }

    async fn read_index_once(
        &self,
        closer: &CancellationToken,
        read_states: &mut Receiver<ReadState>,
    ) -> ReadAttempt {
        let raft = match self.raft() {
            Some(raft) => raft,
            None => return ReadAttempt::Index(0),
        };
        metrics::READ_INDEX_ROUNDS.inc();

        let ctx = Context::with_token(closer.child_token()).with_timeout(READ_INDEX_TIMEOUT);
        let token = rand::random::<u64>().to_le_bytes().to_vec();
        match ctx.run(raft.read_index(token.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("Error while trying to call ReadIndex: {}", e);
                return ReadAttempt::Index(0);
            }
            Err(ContextError::DeadlineExceeded) => return ReadAttempt::Retry,
            Err(ContextError::Cancelled) => return ReadAttempt::Index(0),
        }

        loop {
            tokio::select! {
                biased;
                rs = read_states.recv() => match rs {
                    Some(rs) if rs.request_ctx == token => return ReadAttempt::Index(rs.index),
                    // Left over from an abandoned attempt.
                    Some(rs) => log::debug!("Discarding stale read state at index {}", rs.index),
                    None => return ReadAttempt::Index(0),
                },
                err = ctx.done() => return match err {
                    ContextError::DeadlineExceeded => ReadAttempt::Retry,
                    ContextError::Cancelled => ReadAttempt::Index(0),
                },
            }
        }
    }
}
