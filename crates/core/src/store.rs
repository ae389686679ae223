use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use sluice_model::{Transfer, TransferState};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transfer {0} not found")]
    NotFound(Uuid),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Filter for [`TransferStore::find`]. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    pub user_id: Option<u64>,
    pub removed: Option<bool>,
    pub state: Option<TransferState>,
}

impl Criteria {
    fn matches(&self, t: &Transfer) -> bool {
        self.user_id.is_none_or(|u| t.user_id == u)
            && self.removed.is_none_or(|r| t.removed == r)
            && self.state.is_none_or(|s| t.state == s)
    }
}

/// Persistence collaborator for transfer records.
///
/// The engine calls `commit` after every state-changing operation and never
/// assumes write-behind caching.
pub trait TransferStore: Send + Sync {
    fn add(&self, transfer: Transfer) -> Result<(), StoreError>;
    fn get(&self, id: Uuid) -> Result<Option<Transfer>, StoreError>;
    /// Returns matches ordered by the time they were added.
    fn find(&self, criteria: &Criteria) -> Result<Vec<Transfer>, StoreError>;
    fn update(&self, transfer: &Transfer) -> Result<(), StoreError>;
    fn commit(&self) -> Result<(), StoreError>;
}

/// In-memory store preserving insertion order.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    commits: AtomicU64,
}

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, Transfer>,
    order: Vec<Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commits issued so far; used by tests to assert
    /// persist-on-demand behavior.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

impl TransferStore for MemoryStore {
    fn add(&self, transfer: Transfer) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.records.contains_key(&transfer.id) {
            inner.order.push(transfer.id);
        }
        inner.records.insert(transfer.id, transfer);
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<Transfer>, StoreError> {
        Ok(self.inner.read().unwrap().records.get(&id).cloned())
    }

    fn find(&self, criteria: &Criteria) -> Result<Vec<Transfer>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id))
            .filter(|t| criteria.matches(t))
            .cloned()
            .collect())
    }

    fn update(&self, transfer: &Transfer) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        match inner.records.get_mut(&transfer.id) {
            Some(slot) => {
                *slot = transfer.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(transfer.id)),
        }
    }

    fn commit(&self) -> Result<(), StoreError> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
