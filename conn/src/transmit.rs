//! Outbound raft message batching.
//!
//! Messages queued with [`Node::send`] are drained by a single transmitter
//! task, framed per destination (`u32` little-endian length + payload) and
//! shipped as one RPC per destination and round.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metrics;
use crate::node::Node;
use crate::pb::{Payload, RaftBatch};
use crate::raft_client::{PeerConn, TransportError};

pub const MESSAGE_BATCH_SOFT_LIMIT: usize = 10_000_000;
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

const FRAME_HEADER_SIZE: usize = 4;

#[derive(Debug)]
pub(crate) struct SendMsg {
    pub(crate) to: u64,
    pub(crate) data: Vec<u8>,
}

pub fn write_frame(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
}

/// Splits a batch payload back into its frames.
pub fn decode_frames(mut payload: &[u8]) -> Result<Vec<&[u8]>> {
    let mut frames = Vec::new();
    while !payload.is_empty() {
        if payload.len() < FRAME_HEADER_SIZE {
            return Err(Error::CorruptBatch(format!(
                "{} trailing bytes",
                payload.len()
            )));
        }
        let mut len = [0u8; FRAME_HEADER_SIZE];
        len.copy_from_slice(&payload[..FRAME_HEADER_SIZE]);
        let len = u32::from_le_bytes(len) as usize;
        let rest = &payload[FRAME_HEADER_SIZE..];
        if rest.len() < len {
            return Err(Error::CorruptBatch(format!(
                "frame of {} bytes, {} available",
                len,
                rest.len()
            )));
        }
        frames.push(&rest[..len]);
        payload = &rest[len..];
    }
    Ok(frames)
}

/// Appends `first` and everything queued right now to the per-destination
/// buffers, stopping early once the soft limit is passed.
fn slurp(first: SendMsg, rx: &mut Receiver<SendMsg>, batches: &mut HashMap<u64, Vec<u8>>) -> usize {
    let mut total_size = 0;
    let mut sm = first;
    loop {
        total_size += FRAME_HEADER_SIZE + sm.data.len();
        write_frame(batches.entry(sm.to).or_default(), &sm.data);
        if total_size > MESSAGE_BATCH_SOFT_LIMIT {
            break;
        }
        match rx.try_recv() {
            Ok(next) => sm = next,
            Err(_) => break,
        }
    }
    total_size
}

impl Node {
    /// Queues `msg` for its destination, waiting while the queue is full.
    pub async fn send(&self, msg: Message) -> Result<()> {
        if msg.to == self.id {
            return Err(Error::SendToSelf);
        }
        let data = msg.write_to_bytes()?;
        // Never dropped here: raft resends appends, but a dropped proposal
        // forwarded to the leader is lost.
        self.messages
            .send(SendMsg { to: msg.to, data })
            .await
            .map_err(|_| Error::Stopped)
    }

    /// Starts the transmitter. It can only be started once per node.
    pub fn spawn_transmitter(self: &Arc<Self>, closer: CancellationToken) -> Result<JoinHandle<()>> {
        let rx = self
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(Error::AlreadyStarted("transmitter"))?;
        Ok(tokio::spawn(self.clone().batch_and_send_messages(rx, closer)))
    }

    async fn batch_and_send_messages(self: Arc<Self>, mut rx: Receiver<SendMsg>, closer: CancellationToken) {
        let mut batches: HashMap<u64, Vec<u8>> = HashMap::new();
        let mut failed_conn: HashSet<u64> = HashSet::new();
        loop {
            let first = tokio::select! {
                _ = closer.cancelled() => return,
                sm = rx.recv() => match sm {
                    Some(sm) => sm,
                    None => return,
                },
            };
            slurp(first, &mut rx, &mut batches);

            for (&to, buf) in batches.iter_mut() {
                if buf.is_empty() {
                    continue;
                }
                let conn = match self.peer(to) {
                    Some(addr) => self.transport.get(&addr).map_err(|e| (addr, e)),
                    None => Err((String::new(), TransportError::NoConnection(format!("{:#x}", to)))),
                };
                match conn {
                    Ok(conn) => {
                        failed_conn.remove(&to);
                        let data = std::mem::take(buf);
                        tokio::spawn(self.clone().do_send_message(to, conn, data));
                    }
                    Err((addr, e)) => {
                        // Only the first failure of a streak is logged.
                        if failed_conn.insert(to) {
                            log::warn!(
                                "No healthy connection to node Id: {:#x} addr: [{}], err: {}",
                                to,
                                addr,
                                e
                            );
                        }
                        buf.clear();
                    }
                }
            }
        }
    }

    async fn do_send_message(self: Arc<Self>, to: u64, conn: Arc<dyn PeerConn>, data: Vec<u8>) {
        let size = data.len();
        let batch = RaftBatch {
            context: Some(self.raft_context.clone()),
            payload: Some(Payload { data }),
        };
        let res = match tokio::time::timeout(SEND_TIMEOUT, conn.raft_message(batch)).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Rpc("deadline exceeded".to_string())),
        };
        match res {
            Ok(()) => {
                metrics::RAFT_BATCH_COUNTER_VEC.with_label_values(&["ok"]).inc();
                metrics::RAFT_BATCH_BYTES.inc_by(size as u64);
            }
            Err(e) if e.is_unreachable() => {
                metrics::RAFT_BATCH_COUNTER_VEC
                    .with_label_values(&["unreachable"])
                    .inc();
                log::warn!(
                    "Reporting node: {:#x} addr: {} as unreachable.",
                    to,
                    conn.addr()
                );
                if let Some(raft) = self.raft() {
                    raft.report_unreachable(to).await;
                }
                conn.set_unhealthy();
            }
            // Raft resends whatever it still needs.
            Err(e) => {
                metrics::RAFT_BATCH_COUNTER_VEC
                    .with_label_values(&["error"])
                    .inc();
                log::debug!(
                    "Error while sending Raft message to node with addr: {}, err: {}",
                    conn.addr(),
                    e
                );
            }
        }
    }

    /// Steps every message of a batch received from a peer.
    pub async fn on_raft_batch(&self, batch: &RaftBatch) -> Result<()> {
        let raft = self.raft().ok_or(Error::NoNode)?;
        let payload = batch
            .payload
            .as_ref()
            .map(|p| p.data.as_slice())
            .unwrap_or_default();
        let msgs = decode_frames(payload)?
            .into_iter()
            .map(|frame| Message::parse_from_bytes(frame).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        for msg in msgs {
            raft.step(msg).await?;
        }
        Ok(())
    }
}
