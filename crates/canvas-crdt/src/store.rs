//! The application-facing record store.
//!
//! The editing surface reads and mutates records here. Every mutation carries
//! a [`ChangeSource`], and listeners pick which sources they hear about; that
//! tag is what lets the sync bridge tell a user's edit from its own
//! reconciliation writes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use canvas_common::{Subscribers, Subscription};

use crate::error::StoreError;
use crate::record::{Record, RecordId};

/// Who caused a store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSource {
    /// A genuine user action on this replica.
    User,
    /// A reconciliation write from replication or the backend.
    Remote,
}

/// Which sources a listener wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFilter {
    All,
    Only(ChangeSource),
}

impl SourceFilter {
    pub fn matches(self, source: ChangeSource) -> bool {
        match self {
            SourceFilter::All => true,
            SourceFilter::Only(wanted) => wanted == source,
        }
    }
}

/// One committed store mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub source: ChangeSource,
    pub added: Vec<Record>,
    /// `(before, after)` pairs.
    pub updated: Vec<(Record, Record)>,
    pub removed: Vec<Record>,
}

impl ChangeBatch {
    pub fn new(source: ChangeSource) -> Self {
        Self {
            source,
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

pub type ChangeHandler = Box<dyn Fn(&ChangeBatch) + Send + Sync>;

/// Contract of the record store owned by the editing surface.
pub trait DocumentStore: Send + Sync {
    /// Hear about committed mutations whose source passes `filter`.
    fn listen(&self, filter: SourceFilter, handler: ChangeHandler) -> Subscription;

    /// Insert or replace records.
    fn put(&self, records: Vec<Record>, source: ChangeSource) -> Result<(), StoreError>;

    /// Remove records by id. Unknown ids are ignored.
    fn remove(&self, ids: &[RecordId], source: ChangeSource) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Option<Record>;

    fn all(&self) -> Vec<Record>;
}

/// In-memory [`DocumentStore`].
///
/// Cheap to clone; clones share records and listeners. Listeners run after
/// the store lock is released, so they may read or write the store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<RecordId, Record>>>,
    listeners: Subscribers<ChangeBatch>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RecordId, Record>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn publish(&self, batch: ChangeBatch) {
        if !batch.is_empty() {
            self.listeners.emit(&batch);
        }
    }
}

impl DocumentStore for MemoryStore {
    fn listen(&self, filter: SourceFilter, handler: ChangeHandler) -> Subscription {
        self.listeners.subscribe(move |batch: &ChangeBatch| {
            if filter.matches(batch.source) {
                handler(batch);
            }
        })
    }

    fn put(&self, records: Vec<Record>, source: ChangeSource) -> Result<(), StoreError> {
        let mut batch = ChangeBatch::new(source);
        {
            let mut map = self.lock();
            for record in records {
                match map.insert(record.id.clone(), record.clone()) {
                    None => batch.added.push(record),
                    Some(before) if before != record => batch.updated.push((before, record)),
                    Some(_) => {}
                }
            }
        }
        self.publish(batch);
        Ok(())
    }

    fn remove(&self, ids: &[RecordId], source: ChangeSource) -> Result<(), StoreError> {
        let mut batch = ChangeBatch::new(source);
        {
            let mut map = self.lock();
            batch.removed.extend(ids.iter().filter_map(|id| map.remove(id)));
        }
        self.publish(batch);
        Ok(())
    }

    fn get(&self, id: &str) -> Option<Record> {
        self.lock().get(id).cloned()
    }

    fn all(&self) -> Vec<Record> {
        self.lock().values().cloned().collect()
    }
}
