//! Two-way bridge between the record store and the replicated document.
//!
//! User mutations in the store become one actor-tagged transaction each.
//! Any document change that is not a plain local edit (peer imports, undo,
//! redo, backend-driven writes) triggers a reconciliation pass that rewrites
//! the store to match the materialized document. Reconciliation writes are
//! tagged [`ChangeSource::Remote`] (except after this actor's own undo or
//! redo, which are user actions) and the store listener only hears
//! [`ChangeSource::User`] outside a reconciliation pass, which is what keeps
//! the two from feeding each other forever.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use canvas_common::Subscription;

use crate::document::{ReplicatedDoc, TxnKind, TxnOrigin};
use crate::error::CrdtError;
use crate::record::{Record, RecordId};
use crate::store::{ChangeBatch, ChangeSource, DocumentStore, SourceFilter};

/// Store mutations performed by one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Document entries skipped because they failed validation.
    pub rejected: usize,
}

impl ReconcileStats {
    pub fn mutations(&self) -> usize {
        self.added + self.updated + self.removed
    }
}

struct BridgeInner<S> {
    doc: ReplicatedDoc,
    store: S,
    applying_remote: AtomicBool,
    /// Set when the store refused a reconciliation write.
    needs_retry: AtomicBool,
    /// User batches heard mid-reconciliation, applied once the pass ends.
    /// The pass's own writes come back through here too and replay as
    /// no-ops, since they already match the document.
    deferred: Mutex<Vec<ChangeBatch>>,
}

impl<S: DocumentStore> BridgeInner<S> {
    fn apply_local_change(&self, batch: &ChangeBatch) -> Result<(), CrdtError> {
        if batch.source != ChangeSource::User {
            return Err(CrdtError::NotLocal);
        }
        if self.applying_remote.load(Ordering::SeqCst) {
            tracing::debug!(changes = batch.len(), "deferring store change raised during reconciliation");
            self.deferred().push(batch.clone());
            return Ok(());
        }

        let actor = self.doc.actor();
        self.doc.transact(TxnOrigin::edit(actor), |txn| {
            for record in &batch.added {
                txn.put(record)?;
            }
            for (_, record) in &batch.updated {
                txn.put(record)?;
            }
            for record in &batch.removed {
                txn.remove(record.id.clone());
            }
            Ok(())
        })?;
        tracing::debug!(actor = %actor, changes = batch.len(), "applied local change");

        if self.needs_retry.load(Ordering::SeqCst) {
            self.apply_remote_change()?;
        }
        Ok(())
    }

    fn apply_remote_change(&self) -> Result<ReconcileStats, CrdtError> {
        self.sync_store(ChangeSource::Remote)
    }

    /// Rewrite the store from the document, tagging the writes with `source`.
    fn sync_store(&self, source: ChangeSource) -> Result<ReconcileStats, CrdtError> {
        if self.applying_remote.swap(true, Ordering::SeqCst) {
            return Ok(ReconcileStats::default());
        }
        let result = self.reconcile(source);
        self.applying_remote.store(false, Ordering::SeqCst);
        self.replay_deferred();

        match &result {
            Ok(stats) => {
                self.needs_retry.store(false, Ordering::SeqCst);
                if stats.mutations() > 0 {
                    tracing::debug!(
                        added = stats.added,
                        updated = stats.updated,
                        removed = stats.removed,
                        "reconciled store with document"
                    );
                }
            }
            Err(e) => {
                self.needs_retry.store(true, Ordering::SeqCst);
                tracing::error!(?e, "store rejected reconciliation, will retry on next change");
            }
        }
        result
    }

    fn replay_deferred(&self) {
        let batches = std::mem::take(&mut *self.deferred());
        for batch in &batches {
            if let Err(e) = self.apply_local_change(batch) {
                tracing::warn!(?e, "failed to apply deferred store change");
            }
        }
    }

    fn deferred(&self) -> MutexGuard<'_, Vec<ChangeBatch>> {
        self.deferred.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reconcile(&self, source: ChangeSource) -> Result<ReconcileStats, CrdtError> {
        let materialized = self.doc.materialize();
        let mut stats = ReconcileStats {
            rejected: materialized.rejected.len(),
            ..Default::default()
        };
        for (id, e) in &materialized.rejected {
            tracing::warn!(record_id = %id, ?e, "skipping invalid record from document");
        }
        let rejected: HashSet<&RecordId> = materialized.rejected.iter().map(|(id, _)| id).collect();

        let current: BTreeMap<RecordId, Record> = self
            .store
            .all()
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        let removals: Vec<RecordId> = current
            .keys()
            .filter(|id| !materialized.records.contains_key(*id) && !rejected.contains(id))
            .cloned()
            .collect();

        let mut upserts = Vec::new();
        for (id, mut record) in materialized.records {
            match current.get(&id) {
                None => {
                    stats.added += 1;
                    upserts.push(record);
                }
                Some(existing) if !existing.content_eq(&record) => {
                    record.local = existing.local.clone();
                    stats.updated += 1;
                    upserts.push(record);
                }
                Some(_) => {}
            }
        }

        if !removals.is_empty() {
            stats.removed = removals.len();
            self.store.remove(&removals, source)?;
        }
        if !upserts.is_empty() {
            self.store.put(upserts, source)?;
        }
        Ok(stats)
    }
}

/// Keeps a [`DocumentStore`] and a [`ReplicatedDoc`] converged.
///
/// Shareable behind an `Arc`; every method takes `&self`.
pub struct SyncBridge<S: DocumentStore + 'static> {
    inner: Arc<BridgeInner<S>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl<S: DocumentStore + 'static> SyncBridge<S> {
    /// Install the store and document listeners.
    pub fn attach(doc: ReplicatedDoc, store: S) -> Self {
        let inner = Arc::new(BridgeInner {
            doc,
            store,
            applying_remote: AtomicBool::new(false),
            needs_retry: AtomicBool::new(false),
            deferred: Mutex::new(Vec::new()),
        });

        let weak: Weak<BridgeInner<S>> = Arc::downgrade(&inner);
        let store_sub = inner.store.listen(
            SourceFilter::Only(ChangeSource::User),
            Box::new(move |batch| {
                let Some(inner) = weak.upgrade() else { return };
                if let Err(e) = inner.apply_local_change(batch) {
                    tracing::warn!(?e, "failed to apply local change to document");
                }
            }),
        );

        let weak: Weak<BridgeInner<S>> = Arc::downgrade(&inner);
        let doc_sub = inner.doc.subscribe_transactions(move |event| {
            if event.origin.is_edit() {
                return;
            }
            let Some(inner) = weak.upgrade() else { return };
            // Undo and redo are user actions, so their store writes stay
            // visible to user-source listeners. The bridge's own store
            // listener still skips them while reconciling.
            let source = match event.origin {
                TxnOrigin::Local {
                    kind: TxnKind::Undo | TxnKind::Redo,
                    ..
                } => ChangeSource::User,
                _ => ChangeSource::Remote,
            };
            // errors are logged inside and retried on the next change
            let _ = inner.sync_store(source);
        });

        tracing::debug!(actor = %inner.doc.actor(), "sync bridge attached");
        Self {
            inner,
            subscriptions: Mutex::new(vec![store_sub, doc_sub]),
        }
    }

    /// Write a user-originated store batch into the document.
    ///
    /// Normally driven by the store listener; exposed for hosts that feed
    /// batches by hand.
    pub fn apply_local_change(&self, batch: &ChangeBatch) -> Result<(), CrdtError> {
        self.inner.apply_local_change(batch)
    }

    /// Bring the store in line with the materialized document.
    pub fn apply_remote_change(&self) -> Result<ReconcileStats, CrdtError> {
        self.inner.apply_remote_change()
    }

    /// Import peer bytes; reconciliation follows from the import event.
    pub fn apply_remote_update(&self, data: &[u8]) -> Result<(), CrdtError> {
        self.inner.doc.import(data)
    }

    /// First reconciliation after the channel reports it is synced.
    pub fn initial_sync(&self) -> Result<ReconcileStats, CrdtError> {
        tracing::debug!("initial sync");
        self.inner.apply_remote_change()
    }

    /// Write changes that did not come from the user (backend pushes) into
    /// the document. The store follows through reconciliation, tagged remote,
    /// and the undo manager never sees them.
    pub fn apply_external_change(
        &self,
        records: &[Record],
        removed: &[RecordId],
    ) -> Result<(), CrdtError> {
        let actor = self.inner.doc.actor();
        self.inner.doc.transact(TxnOrigin::external(actor), |txn| {
            for record in records {
                txn.put(record)?;
            }
            for id in removed {
                if txn.contains(id) {
                    txn.remove(id.clone());
                }
            }
            Ok(())
        })
    }

    pub fn is_applying_remote(&self) -> bool {
        self.inner.applying_remote.load(Ordering::SeqCst)
    }

    pub fn doc(&self) -> &ReplicatedDoc {
        &self.inner.doc
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Remove both listeners. The store and document keep their state.
    pub fn detach(&self) {
        let released: Vec<Subscription> = std::mem::take(&mut *self.subscriptions());
        if !released.is_empty() {
            tracing::debug!("sync bridge detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        !self.subscriptions().is_empty()
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
