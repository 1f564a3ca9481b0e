use std::sync::{Arc, RwLock};

use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Storage};

use crate::error::{Error, Result};

/// The durability surface the node relies on.
pub trait DurableStore: Send + Sync {
    /// Persists a raft update. Nothing in it may be lost once this returns Ok.
    fn save(
        &self,
        hs: Option<&HardState>,
        entries: &[Entry],
        snapshot: Option<&Snapshot>,
    ) -> Result<()>;

    /// The latest snapshot, or an empty one.
    fn snapshot(&self) -> Result<Snapshot>;

    fn hard_state(&self) -> Result<HardState>;

    /// Number of log entries held after the latest snapshot.
    fn num_entries(&self) -> Result<usize>;
}

/// In-memory store backing both the raft-rs engine and the node.
#[derive(Clone)]
pub struct MemStore {
    mem_storage: MemStorage,
    last_snapshot: Arc<RwLock<Snapshot>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            mem_storage: MemStorage::new(),
            last_snapshot: Arc::new(RwLock::new(Snapshot::default())),
        }
    }

    /// A store seeded with a snapshot at index 1 naming `voters` as the
    /// initial configuration.
    pub fn bootstrap(voters: &[u64]) -> Result<Self> {
        let store = Self::new();
        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = 1;
        snapshot.mut_metadata().term = 1;
        snapshot.mut_metadata().mut_conf_state().voters = voters.to_vec();
        store.save(None, &[], Some(&snapshot))?;
        Ok(store)
    }

    pub fn set_conf_state(&self, conf_state: ConfState) {
        self.mem_storage.wl().set_conf_state(conf_state)
    }

    pub fn set_commit(&self, commit: u64) {
        self.mem_storage.wl().mut_hard_state().set_commit(commit);
    }
}

impl DurableStore for MemStore {
    fn save(
        &self,
        hs: Option<&HardState>,
        entries: &[Entry],
        snapshot: Option<&Snapshot>,
    ) -> Result<()> {
        let snapshot = snapshot.filter(|s| s.get_metadata().index > 0);
        {
            let mut core = self.mem_storage.wl();
            if let Some(snapshot) = snapshot {
                core.apply_snapshot(snapshot.clone())?;
            }
            if !entries.is_empty() {
                core.append(entries)?;
            }
            if let Some(hs) = hs {
                core.set_hardstate(hs.clone());
            }
        }
        if let Some(snapshot) = snapshot {
            *self
                .last_snapshot
                .write()
                .map_err(|e| Error::Store(e.to_string()))? = snapshot.clone();
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Snapshot> {
        self.last_snapshot
            .read()
            .map(|s| s.clone())
            .map_err(|e| Error::Store(e.to_string()))
    }

    fn hard_state(&self) -> Result<HardState> {
        Ok(self.mem_storage.initial_state()?.hard_state)
    }

    fn num_entries(&self) -> Result<usize> {
        let first = self.mem_storage.first_index()?;
        let last = self.mem_storage.last_index()?;
        Ok((last + 1).saturating_sub(first) as usize)
    }
}

impl Storage for MemStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem_storage.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem_storage.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem_storage.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem_storage.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem_storage.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        self.mem_storage.snapshot(request_index, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e
    }

    #[test]
    fn test_fresh_store_is_empty() {
        let store = MemStore::new();
        assert_eq!(store.num_entries().unwrap(), 0);
        assert_eq!(DurableStore::snapshot(&store).unwrap(), Snapshot::default());
        assert_eq!(store.hard_state().unwrap(), HardState::default());
    }

    #[test]
    fn test_bootstrap_then_save() {
        let store = MemStore::bootstrap(&[1]).unwrap();
        let snap = DurableStore::snapshot(&store).unwrap();
        assert_eq!(snap.get_metadata().index, 1);
        assert_eq!(snap.get_metadata().get_conf_state().voters, vec![1]);

        let mut hs = HardState::default();
        hs.term = 2;
        hs.commit = 3;
        store
            .save(Some(&hs), &[entry(2, 2), entry(3, 2)], None)
            .unwrap();
        assert_eq!(store.num_entries().unwrap(), 2);
        assert_eq!(store.hard_state().unwrap().commit, 3);
        assert_eq!(store.last_index().unwrap(), 3);
    }
}
