//! The replicated document: a Loro map of records, one nested map per record.
//!
//! Each record field is its own last-writer-wins register, so two actors
//! editing different fields of the same record never clobber each other and
//! every field knows which actor wrote it last. Local writes only touch
//! fields whose value actually changed.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use canvas_common::{ActorId, Subscribers, Subscription};
use loro::{Container, ExportMode, LoroDoc, LoroMap, ValueOrContainer, VersionVector};
use serde_json::Value;
use smol_str::SmolStr;

use crate::error::CrdtError;
use crate::record::{Fields, Record, RecordId};
use crate::value::{json_to_loro, loro_to_json};

/// Name of the root map holding every record.
pub const RECORDS_CONTAINER: &str = "records";

/// What kind of local transaction this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnKind {
    /// A user edit, captured by the undo manager.
    Edit,
    /// The inverse of an undo unit.
    Undo,
    /// Re-application of an undone unit.
    Redo,
    /// Changes pushed in from outside the canvas (backend notifications).
    External,
}

/// Causal origin of a change to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnOrigin {
    Local { actor: ActorId, kind: TxnKind },
    /// Updates imported from a peer.
    Remote,
}

impl TxnOrigin {
    pub fn edit(actor: ActorId) -> Self {
        TxnOrigin::Local {
            actor,
            kind: TxnKind::Edit,
        }
    }

    pub fn undo(actor: ActorId) -> Self {
        TxnOrigin::Local {
            actor,
            kind: TxnKind::Undo,
        }
    }

    pub fn redo(actor: ActorId) -> Self {
        TxnOrigin::Local {
            actor,
            kind: TxnKind::Redo,
        }
    }

    pub fn external(actor: ActorId) -> Self {
        TxnOrigin::Local {
            actor,
            kind: TxnKind::External,
        }
    }

    pub fn actor(&self) -> Option<ActorId> {
        match self {
            TxnOrigin::Local { actor, .. } => Some(*actor),
            TxnOrigin::Remote => None,
        }
    }

    pub fn is_edit(&self) -> bool {
        matches!(
            self,
            TxnOrigin::Local {
                kind: TxnKind::Edit,
                ..
            }
        )
    }
}

impl fmt::Display for TxnOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnOrigin::Local { actor, kind } => {
                let kind = match kind {
                    TxnKind::Edit => "edit",
                    TxnKind::Undo => "undo",
                    TxnKind::Redo => "redo",
                    TxnKind::External => "external",
                };
                write!(f, "{actor}:{kind}")
            }
            TxnOrigin::Remote => f.write_str("remote"),
        }
    }
}

/// One field write, with the values on either side of it.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: SmolStr,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Everything a transaction did to one record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange {
    pub id: RecordId,
    pub existed_before: bool,
    pub exists_after: bool,
    /// In application order.
    pub fields: Vec<FieldChange>,
}

impl RecordChange {
    pub fn created(&self) -> bool {
        !self.existed_before && self.exists_after
    }

    pub fn removed(&self) -> bool {
        self.existed_before && !self.exists_after
    }

    fn is_noop(&self) -> bool {
        self.fields.is_empty() && self.existed_before == self.exists_after
    }
}

/// Emitted after every commit and every import that changed the document.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub origin: TxnOrigin,
    /// Field-level changes. Empty for imports, which are described by
    /// re-materializing instead.
    pub changes: Vec<RecordChange>,
}

enum Staged {
    Put { id: RecordId, fields: Fields },
    Remove { id: RecordId },
    SetField {
        id: RecordId,
        field: SmolStr,
        value: Option<Value>,
    },
}

/// Staged ops folded into per-record states, ready to write.
#[derive(Default)]
struct Plan {
    /// id -> (state before the batch, state after it)
    records: BTreeMap<RecordId, (Option<Fields>, Option<Fields>)>,
    changes: Vec<RecordChange>,
}

impl Plan {
    fn state(&mut self, doc: &ReplicatedDoc, id: &RecordId) -> Option<Fields> {
        self.records
            .entry(id.clone())
            .or_insert_with(|| {
                let current = doc.record_fields(id);
                (current.clone(), current)
            })
            .1
            .clone()
    }

    fn set(&mut self, id: &RecordId, state: Option<Fields>) {
        if let Some(entry) = self.records.get_mut(id) {
            entry.1 = state;
        }
    }
}

/// A batch of writes, staged and then applied together on commit.
///
/// Reads through a transaction see the document as it was when the
/// transaction opened.
pub struct Transaction<'a> {
    doc: &'a ReplicatedDoc,
    staged: Vec<Staged>,
}

impl Transaction<'_> {
    /// Write the full current content of a record.
    pub fn put(&mut self, record: &Record) -> Result<(), CrdtError> {
        let fields = record.to_fields()?;
        self.staged.push(Staged::Put {
            id: record.id.clone(),
            fields,
        });
        Ok(())
    }

    /// Write a raw field map. Fields missing from `fields` are removed.
    pub fn put_fields(&mut self, id: impl Into<RecordId>, fields: Fields) {
        self.staged.push(Staged::Put {
            id: id.into(),
            fields,
        });
    }

    pub fn remove(&mut self, id: impl Into<RecordId>) {
        self.staged.push(Staged::Remove { id: id.into() });
    }

    /// Set (`Some`) or delete (`None`) one field of an existing record.
    pub fn set_field(&mut self, id: impl Into<RecordId>, field: impl Into<SmolStr>, value: Option<Value>) {
        self.staged.push(Staged::SetField {
            id: id.into(),
            field: field.into(),
            value,
        });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.doc.record_map(id).is_some()
    }

    pub fn field(&self, id: &str, field: &str) -> Option<Value> {
        self.doc.field(id, field)
    }

    pub fn record_fields(&self, id: &str) -> Option<Fields> {
        self.doc.record_fields(id)
    }

    pub fn last_editor(&self, id: &str, field: &str) -> Option<ActorId> {
        self.doc.last_editor(id, field)
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}

/// Result of materializing the document.
#[derive(Debug, Default)]
pub struct Materialized {
    pub records: BTreeMap<RecordId, Record>,
    /// Entries that failed schema validation.
    pub rejected: Vec<(RecordId, CrdtError)>,
}

/// Loro-backed replicated record document.
///
/// Cheap to clone; clones share the same underlying document and
/// subscriber set.
#[derive(Clone)]
pub struct ReplicatedDoc {
    doc: LoroDoc,
    records: LoroMap,
    transactions: Subscribers<TransactionEvent>,
}

impl fmt::Debug for ReplicatedDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedDoc")
            .field("actor", &self.actor())
            .field("records", &self.records.len())
            .finish()
    }
}

impl ReplicatedDoc {
    /// An empty document with a random actor.
    pub fn new() -> Self {
        let doc = LoroDoc::new();
        let records = doc.get_map(RECORDS_CONTAINER);
        Self {
            doc,
            records,
            transactions: Subscribers::new(),
        }
    }

    pub fn with_actor(actor: ActorId) -> Result<Self, CrdtError> {
        let this = Self::new();
        this.set_actor(actor)?;
        Ok(this)
    }

    /// Load a document from a snapshot or update blob.
    pub fn from_snapshot(snapshot: &[u8], actor: ActorId) -> Result<Self, CrdtError> {
        let this = Self::with_actor(actor)?;
        this.doc
            .import(snapshot)
            .map_err(|e| CrdtError::Import(e.to_string()))?;
        Ok(this)
    }

    pub fn actor(&self) -> ActorId {
        ActorId(self.doc.peer_id())
    }

    /// Switch the actor identity used for subsequent commits.
    pub fn set_actor(&self, actor: ActorId) -> Result<(), CrdtError> {
        self.doc.commit();
        self.doc.set_peer_id(actor.0)?;
        tracing::debug!(actor = %actor, "document actor set");
        Ok(())
    }

    /// Stage writes in `f` and apply them as one commit tagged with `origin`.
    ///
    /// The batch is all or nothing: nothing is written if `f` returns an
    /// error or if any record would be left failing validation. Subscribers
    /// see a single [`TransactionEvent`] after the commit.
    pub fn transact<R>(
        &self,
        origin: TxnOrigin,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, CrdtError>,
    ) -> Result<R, CrdtError> {
        if origin == TxnOrigin::Remote {
            return Err(CrdtError::NotLocal);
        }

        let mut txn = Transaction {
            doc: self,
            staged: Vec::new(),
        };
        let out = f(&mut txn)?;
        if txn.staged.is_empty() {
            return Ok(out);
        }

        let plan = self.plan(txn.staged)?;
        if plan.changes.is_empty() {
            return Ok(out);
        }
        if let Err(e) = self.write_plan(&plan) {
            tracing::error!(%origin, ?e, "transaction failed mid-write, restoring prior state");
            self.restore(&plan);
            self.doc.set_next_commit_origin(&origin.to_string());
            self.doc.commit();
            return Err(e);
        }

        self.doc.set_next_commit_origin(&origin.to_string());
        self.doc.commit();
        tracing::debug!(%origin, records = plan.changes.len(), "transaction committed");
        self.transactions.emit(&TransactionEvent {
            origin,
            changes: plan.changes,
        });
        Ok(out)
    }

    /// Fold the staged ops over the current state without writing anything.
    /// Every record the batch leaves behind must validate.
    fn plan(&self, staged: Vec<Staged>) -> Result<Plan, CrdtError> {
        if self.doc.is_detached() && !self.doc.is_detached_editing_enabled() {
            return Err(CrdtError::Loro("document is checked out at a past version".to_owned()));
        }

        let mut plan = Plan::default();
        for op in staged {
            match op {
                Staged::Put { id, fields } => {
                    let current = plan.state(self, &id);
                    let change = change_for(&mut plan.changes, &id, current.is_some());
                    change.exists_after = true;
                    let current = current.unwrap_or_default();
                    for (key, value) in &fields {
                        let before = current.get(key).cloned();
                        if before.as_ref() == Some(value) {
                            continue;
                        }
                        change.fields.push(FieldChange {
                            field: SmolStr::new(key),
                            before,
                            after: Some(value.clone()),
                        });
                    }
                    for (key, before) in current {
                        if !fields.contains_key(&key) {
                            change.fields.push(FieldChange {
                                field: SmolStr::new(&key),
                                before: Some(before),
                                after: None,
                            });
                        }
                    }
                    plan.set(&id, Some(fields));
                }
                Staged::Remove { id } => {
                    let Some(current) = plan.state(self, &id) else {
                        continue;
                    };
                    let change = change_for(&mut plan.changes, &id, true);
                    change.exists_after = false;
                    change
                        .fields
                        .extend(current.into_iter().map(|(key, before)| FieldChange {
                            field: SmolStr::new(&key),
                            before: Some(before),
                            after: None,
                        }));
                    plan.set(&id, None);
                }
                Staged::SetField { id, field, value } => {
                    let Some(mut current) = plan.state(self, &id) else {
                        tracing::debug!(record_id = %id, %field, "field write on missing record skipped");
                        continue;
                    };
                    let before = current.get(field.as_str()).cloned();
                    if before == value {
                        continue;
                    }
                    match &value {
                        Some(v) => {
                            current.insert(field.to_string(), v.clone());
                        }
                        None => {
                            current.remove(field.as_str());
                        }
                    }
                    change_for(&mut plan.changes, &id, true).fields.push(FieldChange {
                        field,
                        before,
                        after: value,
                    });
                    plan.set(&id, Some(current));
                }
            }
        }
        plan.changes.retain(|c| !c.is_noop());

        for change in &plan.changes {
            if let Some((_, Some(fields))) = plan.records.get(&change.id) {
                Record::from_fields(&change.id, fields)?;
            }
        }
        Ok(plan)
    }

    fn write_plan(&self, plan: &Plan) -> Result<(), CrdtError> {
        for change in &plan.changes {
            if let Some((before, after)) = plan.records.get(&change.id) {
                self.write_record(&change.id, before.as_ref(), after.as_ref())?;
            }
        }
        Ok(())
    }

    /// Put every touched record back the way it was before the plan ran.
    fn restore(&self, plan: &Plan) {
        for (id, (before, _)) in &plan.records {
            let actual = self.record_fields(id);
            if let Err(e) = self.write_record(id, actual.as_ref(), before.as_ref()) {
                tracing::error!(record_id = %id, ?e, "could not restore record");
            }
        }
    }

    /// Move the stored entry for `id` from `from` to `to`, touching only the
    /// fields that differ.
    fn write_record(&self, id: &str, from: Option<&Fields>, to: Option<&Fields>) -> Result<(), CrdtError> {
        let Some(to) = to else {
            if from.is_some() {
                self.records.delete(id)?;
            }
            return Ok(());
        };
        let (map, from) = match (from, self.record_map(id)) {
            (Some(from), Some(map)) => (map, Cow::Borrowed(from)),
            _ => (
                self.records.insert_container(id, LoroMap::new())?,
                Cow::Owned(Fields::new()),
            ),
        };
        for (key, value) in to {
            if from.get(key) != Some(value) {
                map.insert(key, json_to_loro(value))?;
            }
        }
        for key in from.keys() {
            if !to.contains_key(key) {
                map.delete(key)?;
            }
        }
        Ok(())
    }

    /// Write raw fields with no validation, the way a misbehaving peer could.
    #[cfg(test)]
    pub(crate) fn write_unchecked(&self, id: &str, fields: &Fields) -> Result<(), CrdtError> {
        let from = self.record_fields(id);
        self.write_record(id, from.as_ref(), Some(fields))?;
        self.doc.commit();
        Ok(())
    }

    /// Import updates or a snapshot from a peer.
    pub fn import(&self, data: &[u8]) -> Result<(), CrdtError> {
        let before = self.doc.oplog_vv();
        self.doc
            .import(data)
            .map_err(|e| CrdtError::Import(e.to_string()))?;
        if self.doc.oplog_vv() != before {
            tracing::debug!(bytes = data.len(), "imported remote updates");
            self.transactions.emit(&TransactionEvent {
                origin: TxnOrigin::Remote,
                changes: Vec::new(),
            });
        }
        Ok(())
    }

    /// Export full snapshot.
    pub fn export_snapshot(&self) -> Result<Vec<u8>, CrdtError> {
        Ok(self.doc.export(ExportMode::Snapshot)?)
    }

    /// Export every update the holder of `version` is missing.
    pub fn export_updates_since(&self, version: &VersionVector) -> Result<Vec<u8>, CrdtError> {
        Ok(self.doc.export(ExportMode::Updates {
            from: Cow::Owned(version.clone()),
        })?)
    }

    /// Get current version vector.
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    pub fn encode_version(&self) -> Vec<u8> {
        self.version().encode()
    }

    pub fn decode_version(bytes: &[u8]) -> Result<VersionVector, CrdtError> {
        VersionVector::decode(bytes).map_err(|e| CrdtError::Import(e.to_string()))
    }

    /// Current record set, validated against the record schema.
    pub fn materialize(&self) -> Materialized {
        let mut out = Materialized::default();
        let Value::Object(entries) = loro_to_json(&self.records.get_deep_value()) else {
            return out;
        };
        for (id, fields) in entries {
            let id = RecordId::new(&id);
            let result = match &fields {
                Value::Object(fields) => Record::from_fields(&id, fields),
                _ => Err(CrdtError::InvalidRecord {
                    id: id.to_string(),
                    message: "record entry is not a map".to_owned(),
                }),
            };
            match result {
                Ok(record) => {
                    out.records.insert(id, record);
                }
                Err(e) => out.rejected.push((id, e)),
            }
        }
        out
    }

    pub fn get(&self, id: &str) -> Option<Result<Record, CrdtError>> {
        self.record_fields(id)
            .map(|fields| Record::from_fields(id, &fields))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.record_map(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn field(&self, id: &str, field: &str) -> Option<Value> {
        self.record_map(id).and_then(|map| field_value(&map, field))
    }

    pub fn record_fields(&self, id: &str) -> Option<Fields> {
        self.record_map(id).map(|map| read_fields(&map))
    }

    /// The actor whose write currently holds `field` of record `id`.
    pub fn last_editor(&self, id: &str, field: &str) -> Option<ActorId> {
        self.record_map(id)
            .and_then(|map| map.get_last_editor(field))
            .map(ActorId)
    }

    /// Called after every local commit or effective import.
    pub fn subscribe_transactions(
        &self,
        handler: impl Fn(&TransactionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.transactions.subscribe(handler)
    }

    /// Called with the encoded update bytes of every local commit.
    pub fn subscribe_local_updates(
        &self,
        handler: impl Fn(Vec<u8>) + Send + Sync + 'static,
    ) -> Subscription {
        let sub = self.doc.subscribe_local_update(Box::new(move |update| {
            handler(update.to_vec());
            true
        }));
        Subscription::new(move || drop(sub))
    }

    pub fn transaction_subscribers(&self) -> usize {
        self.transactions.len()
    }

    fn record_map(&self, id: &str) -> Option<LoroMap> {
        match self.records.get(id) {
            Some(ValueOrContainer::Container(Container::Map(map))) => Some(map),
            _ => None,
        }
    }
}

impl Default for ReplicatedDoc {
    fn default() -> Self {
        Self::new()
    }
}

fn change_for<'a>(changes: &'a mut Vec<RecordChange>, id: &RecordId, existed: bool) -> &'a mut RecordChange {
    let pos = match changes.iter().position(|c| &c.id == id) {
        Some(pos) => pos,
        None => {
            changes.push(RecordChange {
                id: id.clone(),
                existed_before: existed,
                exists_after: existed,
                fields: Vec::new(),
            });
            changes.len() - 1
        }
    };
    &mut changes[pos]
}

fn field_value(map: &LoroMap, field: &str) -> Option<Value> {
    match map.get(field) {
        Some(ValueOrContainer::Value(value)) => Some(loro_to_json(&value)),
        _ => None,
    }
}

fn read_fields(map: &LoroMap) -> Fields {
    match loro_to_json(&map.get_deep_value()) {
        Value::Object(fields) => fields,
        _ => Fields::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Shape, TodoProps};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn doc(actor: u64) -> ReplicatedDoc {
        ReplicatedDoc::with_actor(ActorId(actor)).unwrap()
    }

    fn sync(from: &ReplicatedDoc, to: &ReplicatedDoc) {
        let updates = from.export_updates_since(&to.version()).unwrap();
        to.import(&updates).unwrap();
    }

    fn put(doc: &ReplicatedDoc, record: &Record) {
        doc.transact(TxnOrigin::edit(doc.actor()), |txn| txn.put(record))
            .unwrap();
    }

    #[test]
    fn test_put_then_materialize() {
        let d = doc(1);
        put(&d, &Record::note("n1", "hello").at(1.0, 2.0));

        let m = d.materialize();
        assert!(m.rejected.is_empty());
        let record = &m.records["n1"];
        assert_eq!(record.x, 1.0);
        assert!(matches!(&record.shape, Shape::Note(n) if n.text == "hello"));
    }

    #[test]
    fn test_unchanged_fields_are_not_rewritten() {
        let d = doc(1);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = d.subscribe_transactions(move |e| sink.lock().unwrap().push(e.clone()));

        let mut record = Record::todo("t", TodoProps::titled("a"));
        put(&d, &record);
        record.as_todo_mut().unwrap().title = "b".into();
        put(&d, &record);
        put(&d, &record);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2, "identical put must not commit");
        let second = &events[1].changes[0];
        assert!(!second.created());
        assert_eq!(second.fields.len(), 1);
        assert_eq!(second.fields[0].field, "title");
        assert_eq!(second.fields[0].before, Some(json!("a")));
        assert_eq!(second.fields[0].after, Some(json!("b")));
    }

    #[test]
    fn test_put_removes_fields_of_previous_type() {
        let d = doc(1);
        put(&d, &Record::note("s", "text"));
        put(&d, &Record::todo("s", TodoProps::default()));

        let fields = d.record_fields("s").unwrap();
        assert!(!fields.contains_key("text"));
        assert_eq!(fields["type"], json!("todo"));
    }

    #[test]
    fn test_failed_closure_writes_nothing() {
        let d = doc(1);
        let result: Result<(), CrdtError> = d.transact(TxnOrigin::edit(d.actor()), |txn| {
            txn.put(&Record::note("a", "x"))?;
            Err(CrdtError::Loro("boom".into()))
        });

        assert!(result.is_err());
        assert!(d.is_empty());
    }

    #[test]
    fn test_batch_with_invalid_record_writes_nothing() {
        let d = doc(1);
        put(&d, &Record::note("a", "before"));

        let events = Arc::new(Mutex::new(0usize));
        let counter = events.clone();
        let _txns = d.subscribe_transactions(move |_| *counter.lock().unwrap() += 1);
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let _updates = d.subscribe_local_updates(move |bytes| sink.lock().unwrap().push(bytes));
        let version = d.version();

        let result = d.transact(TxnOrigin::edit(d.actor()), |txn| {
            txn.put(&Record::note("a", "after"))?;
            txn.put(&Record::note("c", "new"))?;
            txn.put_fields("b", Fields::from_iter([("type".to_owned(), json!(5))]));
            Ok(())
        });

        assert!(matches!(result, Err(CrdtError::InvalidRecord { ref id, .. }) if id == "b"));
        assert_eq!(d.field("a", "text"), Some(json!("before")));
        assert!(!d.contains("b"));
        assert!(!d.contains("c"));
        assert_eq!(d.version(), version);
        assert_eq!(*events.lock().unwrap(), 0);
        assert!(updates.lock().unwrap().is_empty());
    }

    #[test]
    fn test_field_write_that_breaks_a_record_is_rejected() {
        let d = doc(1);
        put(&d, &Record::note("a", "x").at(3.0, 4.0));

        let result = d.transact(TxnOrigin::edit(d.actor()), |txn| {
            txn.set_field("a", "x", Some(json!("left")));
            Ok(())
        });

        assert!(matches!(result, Err(CrdtError::InvalidRecord { .. })));
        assert_eq!(d.get("a").unwrap().unwrap().x, 3.0);
    }

    #[test]
    fn test_remove_then_put_in_one_batch_keeps_the_record() {
        let d = doc(1);
        put(&d, &Record::note("a", "x"));
        d.transact(TxnOrigin::edit(d.actor()), |txn| {
            txn.remove("a");
            txn.put(&Record::note("a", "y"))
        })
        .unwrap();

        assert_eq!(d.field("a", "text"), Some(json!("y")));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_remote_origin_cannot_transact() {
        let d = doc(1);
        let result = d.transact(TxnOrigin::Remote, |txn| txn.put(&Record::note("a", "x")));
        assert!(matches!(result, Err(CrdtError::NotLocal)));
    }

    #[test]
    fn test_remove_reports_prior_fields() {
        let d = doc(1);
        put(&d, &Record::note("a", "x"));

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let _sub = d.subscribe_transactions(move |e| {
            *sink.lock().unwrap() = Some(e.changes.clone());
        });
        d.transact(TxnOrigin::edit(d.actor()), |txn| {
            txn.remove("a");
            Ok(())
        })
        .unwrap();

        let changes = seen.lock().unwrap().clone().unwrap();
        assert!(changes[0].removed());
        assert!(changes[0]
            .fields
            .iter()
            .any(|f| f.field == "text" && f.before == Some(json!("x")) && f.after.is_none()));
        assert!(!d.contains("a"));
    }

    #[test]
    fn test_last_editor_is_per_field() {
        let x = doc(1);
        let y = doc(2);
        let mut record = Record::todo("r", TodoProps::titled("first"));
        put(&x, &record);
        sync(&x, &y);

        record.as_todo_mut().unwrap().title = "second".into();
        put(&y, &record);
        sync(&y, &x);

        assert_eq!(x.last_editor("r", "title"), Some(ActorId(2)));
        assert_eq!(x.last_editor("r", "w"), Some(ActorId(1)));
    }

    #[test]
    fn test_import_emits_remote_event_once() {
        let a = doc(1);
        let b = doc(2);
        put(&a, &Record::note("a", "x"));

        let origins = Arc::new(Mutex::new(Vec::new()));
        let sink = origins.clone();
        let _sub = b.subscribe_transactions(move |e| sink.lock().unwrap().push(e.origin));

        let updates = a.export_updates_since(&b.version()).unwrap();
        b.import(&updates).unwrap();
        b.import(&updates).unwrap();

        assert_eq!(*origins.lock().unwrap(), vec![TxnOrigin::Remote]);
    }

    #[test]
    fn test_garbage_import_fails() {
        let d = doc(1);
        assert!(matches!(d.import(&[1, 2, 3, 4]), Err(CrdtError::Import(_))));
    }

    #[test]
    fn test_later_writer_wins_after_observing() {
        let x = doc(1);
        let y = doc(2);
        put(&x, &Record::todo("b", TodoProps::titled("X")));
        sync(&x, &y);
        put(&y, &Record::todo("b", TodoProps::titled("Y")));
        sync(&y, &x);
        sync(&x, &y);

        for d in [&x, &y] {
            let record = &d.materialize().records["b"];
            assert_eq!(record.as_todo().unwrap().title, "Y");
        }
    }

    #[test]
    fn test_snapshot_restores_records() {
        let a = doc(1);
        put(&a, &Record::note("a", "cached"));
        let snapshot = a.export_snapshot().unwrap();

        let b = ReplicatedDoc::from_snapshot(&snapshot, ActorId(5)).unwrap();
        assert_eq!(b.actor(), ActorId(5));
        assert_eq!(b.materialize().records, a.materialize().records);
    }

    #[test]
    fn test_version_encoding() {
        let a = doc(1);
        put(&a, &Record::note("a", "x"));
        let decoded = ReplicatedDoc::decode_version(&a.encode_version()).unwrap();
        assert_eq!(decoded, a.version());
    }

    #[test]
    fn test_local_updates_are_published_per_commit() {
        let a = doc(1);
        let b = doc(2);
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let sub = a.subscribe_local_updates(move |bytes| sink.lock().unwrap().push(bytes));

        put(&a, &Record::note("a", "x"));
        put(&a, &Record::note("b", "y"));
        drop(sub);
        put(&a, &Record::note("c", "z"));

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        for update in updates.iter() {
            b.import(update).unwrap();
        }
        let ids: Vec<_> = b.materialize().records.into_keys().collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_invalid_remote_entries_are_rejected_not_dropped() {
        let a = doc(1);
        a.write_unchecked("bad", &Fields::from_iter([("type".to_owned(), json!("hologram"))]))
            .unwrap();
        put(&a, &Record::note("good", "ok"));

        let m = a.materialize();
        assert_eq!(m.records.len(), 1);
        assert_eq!(m.rejected.len(), 1);
        assert_eq!(m.rejected[0].0, "bad");
    }

    #[test]
    fn test_set_actor_changes_attribution() {
        let d = doc(1);
        put(&d, &Record::note("a", "x"));
        d.set_actor(ActorId(9)).unwrap();
        put(&d, &Record::note("a", "y"));

        assert_eq!(d.actor(), ActorId(9));
        assert_eq!(d.last_editor("a", "text"), Some(ActorId(9)));
        assert_eq!(d.last_editor("a", "color"), Some(ActorId(1)));
    }
}
