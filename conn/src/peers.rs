//! Peer directory: raft node id to network address.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};

pub struct PeerDirectory {
    own_id: u64,
    peers: RwLock<HashMap<u64, String>>,
}

impl PeerDirectory {
    pub fn new(own_id: u64) -> Self {
        PeerDirectory {
            own_id,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, pid: u64) -> Option<String> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pid)
            .cloned()
    }

    pub fn contains(&self, pid: u64) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&pid)
    }

    /// Records the address of `pid`. The local id is never stored.
    pub fn set(&self, pid: u64, addr: &str) -> Result<()> {
        if addr.is_empty() {
            return Err(Error::EmptyAddr(pid));
        }
        if pid == self.own_id {
            log::debug!("Not recording own id {:#x} as a peer", pid);
            return Ok(());
        }
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, addr.to_string());
        Ok(())
    }

    pub fn delete(&self, pid: u64) {
        if pid == self.own_id {
            return;
        }
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}
