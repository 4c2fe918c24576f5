//! Undo/redo scoped to one actor.
//!
//! Only transactions tagged with this manager's actor are captured; imports
//! and other actors' edits never enter the stacks. Undo is field-granular:
//! a field is reverted only while it still holds the value this actor
//! wrote, so an interleaved edit by someone else always survives.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use canvas_common::{ActorId, Clock, Subscription};
use serde_json::Value;
use smol_str::SmolStr;
use web_time::Instant;

use crate::document::{RecordChange, ReplicatedDoc, Transaction, TxnKind, TxnOrigin};
use crate::error::CrdtError;
use crate::record::{Fields, RecordId};

/// A captured group of transactions.
#[derive(Debug, Clone)]
struct UndoUnit {
    changes: Vec<RecordChange>,
}

/// Net effect of a unit on one record.
struct NetChange {
    existed_before: bool,
    exists_after: bool,
    /// field -> (before, after)
    fields: BTreeMap<SmolStr, (Option<Value>, Option<Value>)>,
}

impl UndoUnit {
    fn net(&self) -> Vec<(RecordId, NetChange)> {
        let mut out: Vec<(RecordId, NetChange)> = Vec::new();
        for change in &self.changes {
            let pos = match out.iter().position(|(id, _)| id == &change.id) {
                Some(pos) => pos,
                None => {
                    out.push((
                        change.id.clone(),
                        NetChange {
                            existed_before: change.existed_before,
                            exists_after: change.exists_after,
                            fields: BTreeMap::new(),
                        },
                    ));
                    out.len() - 1
                }
            };
            let net = &mut out[pos].1;
            net.exists_after = change.exists_after;
            for field in &change.fields {
                net.fields
                    .entry(field.field.clone())
                    .and_modify(|(_, after)| *after = field.after.clone())
                    .or_insert_with(|| (field.before.clone(), field.after.clone()));
            }
        }
        out
    }

    /// Whether this unit brought record `id` into existence.
    fn creates(&self, id: &RecordId) -> bool {
        let mut touching = self.changes.iter().filter(|c| &c.id == id);
        let Some(first) = touching.next() else {
            return false;
        };
        let last = touching.last().unwrap_or(first);
        !first.existed_before && last.exists_after
    }
}

struct UndoState {
    actor: ActorId,
    undo_stack: Vec<UndoUnit>,
    redo_stack: Vec<UndoUnit>,
    capture_timeout: Duration,
    max_steps: usize,
    last_capture: Option<Instant>,
    /// Cleared by `stop_capturing` and by undo/redo so the next edit starts
    /// a fresh unit.
    capture_open: bool,
}

impl UndoState {
    fn capture(&mut self, changes: Vec<RecordChange>, now: Instant) {
        self.redo_stack.clear();

        let within_window = self
            .last_capture
            .is_some_and(|last| now.saturating_duration_since(last) < self.capture_timeout);
        match self.undo_stack.last_mut() {
            Some(top) if self.capture_open && within_window => top.changes.extend(changes),
            _ => self.undo_stack.push(UndoUnit { changes }),
        }
        self.last_capture = Some(now);
        self.capture_open = true;

        // Trim if over max
        while self.undo_stack.len() > self.max_steps {
            self.undo_stack.remove(0);
        }
    }

    /// Attach this actor's non-user writes (backend links) to the unit that
    /// created the record, so undoing the creation still sees every field as
    /// ours. Writes to records no unit created are not tracked.
    fn fold_external(&mut self, changes: &[RecordChange]) {
        for change in changes {
            match self.undo_stack.iter_mut().rev().find(|unit| unit.creates(&change.id)) {
                Some(unit) => unit.changes.push(change.clone()),
                None => tracing::trace!(record_id = %change.id, "external write outside undo history"),
            }
        }
    }
}

/// Undo manager for one actor's contributions to a [`ReplicatedDoc`].
pub struct ActorUndoManager {
    doc: ReplicatedDoc,
    state: Arc<Mutex<UndoState>>,
    _subscription: Subscription,
}

impl ActorUndoManager {
    /// Track the document's current actor.
    pub fn new(
        doc: ReplicatedDoc,
        clock: Arc<dyn Clock>,
        capture_timeout: Duration,
        max_steps: usize,
    ) -> Self {
        let state = Arc::new(Mutex::new(UndoState {
            actor: doc.actor(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            capture_timeout,
            max_steps: max_steps.max(1),
            last_capture: None,
            capture_open: false,
        }));

        let observed = Arc::downgrade(&state);
        let subscription = doc.subscribe_transactions(move |event| {
            let TxnOrigin::Local { actor, kind } = event.origin else {
                return;
            };
            let Some(state) = observed.upgrade() else { return };
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            if actor != state.actor {
                return;
            }
            let changes = event.changes.clone();
            match kind {
                TxnKind::Edit => state.capture(changes, clock.now()),
                TxnKind::Undo => state.redo_stack.push(UndoUnit { changes }),
                TxnKind::Redo => state.undo_stack.push(UndoUnit { changes }),
                TxnKind::External => state.fold_external(&changes),
            }
        });

        Self {
            doc,
            state,
            _subscription: subscription,
        }
    }

    fn lock(&self) -> MutexGuard<'_, UndoState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn can_undo(&self) -> bool {
        !self.lock().undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.lock().redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.lock().undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.lock().redo_stack.len()
    }

    /// Revert the most recent unit. Units whose every field has since been
    /// overwritten by other actors, or whose inverse changes nothing, are
    /// discarded and the next one is tried.
    ///
    /// Returns `true` if anything changed.
    pub fn undo(&self) -> Result<bool, CrdtError> {
        self.step(true)
    }

    /// Re-apply the most recently undone unit.
    pub fn redo(&self) -> Result<bool, CrdtError> {
        self.step(false)
    }

    fn step(&self, undo: bool) -> Result<bool, CrdtError> {
        loop {
            let (unit, actor) = {
                let mut state = self.lock();
                state.capture_open = false;
                let stack = if undo {
                    &mut state.undo_stack
                } else {
                    &mut state.redo_stack
                };
                match stack.pop() {
                    Some(unit) => (unit, state.actor),
                    None => return Ok(false),
                }
            };

            let origin = if undo {
                TxnOrigin::undo(actor)
            } else {
                TxnOrigin::redo(actor)
            };
            let version = self.doc.version();
            let result = self
                .doc
                .transact(origin, |txn| Ok(invert(txn, &unit, actor)));

            match result {
                Ok(_) if self.doc.version() != version => {
                    tracing::debug!(%origin, "applied undo unit");
                    return Ok(true);
                }
                Ok(_) => {
                    tracing::debug!(%origin, "undo unit fully superseded by other actors");
                }
                Err(CrdtError::InvalidRecord { id, message }) => {
                    tracing::warn!(%origin, record_id = %id, %message, "undo unit no longer yields a valid record, dropping it");
                }
                Err(e) => {
                    let mut state = self.lock();
                    if undo {
                        state.undo_stack.push(unit);
                    } else {
                        state.redo_stack.push(unit);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Close the current capture window so the next edit starts a new unit.
    pub fn stop_capturing(&self) {
        self.lock().capture_open = false;
    }

    /// Drop all history.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.undo_stack.clear();
        state.redo_stack.clear();
        state.last_capture = None;
        state.capture_open = false;
    }

    /// Start tracking a new actor identity. History is dropped.
    pub fn set_actor(&self, actor: ActorId) {
        self.clear();
        self.lock().actor = actor;
    }

    pub fn actor(&self) -> ActorId {
        self.lock().actor
    }
}

/// Stage the inverse of `unit`. Returns whether anything was staged.
fn invert(txn: &mut Transaction<'_>, unit: &UndoUnit, actor: ActorId) -> bool {
    let ours = |txn: &Transaction<'_>, id: &str, field: &str, after: &Option<Value>| {
        txn.last_editor(id, field) == Some(actor) && &txn.field(id, field) == after
    };

    for (id, net) in unit.net() {
        match (net.existed_before, net.exists_after) {
            (false, true) => {
                if !txn.contains(&id) {
                    continue;
                }
                let Some(current) = txn.record_fields(&id) else {
                    continue;
                };
                let adopted = current.iter().any(|(field, value)| {
                    txn.last_editor(&id, field) != Some(actor)
                        || net.fields.get(field.as_str()).map(|(_, after)| after.as_ref())
                            != Some(Some(value))
                });
                if adopted {
                    tracing::debug!(record_id = %id, "created record edited by others, keeping it");
                } else {
                    txn.remove(id.clone());
                }
            }
            (true, false) => {
                if txn.contains(&id) {
                    continue;
                }
                let fields: Fields = net
                    .fields
                    .iter()
                    .filter_map(|(field, (before, _))| {
                        before.clone().map(|value| (field.to_string(), value))
                    })
                    .collect();
                if !fields.is_empty() {
                    txn.put_fields(id.clone(), fields);
                }
            }
            (true, true) => {
                if !txn.contains(&id) {
                    continue;
                }
                for (field, (before, after)) in &net.fields {
                    if before == after {
                        continue;
                    }
                    if ours(&*txn, id.as_str(), field.as_str(), after) {
                        txn.set_field(id.clone(), field.clone(), before.clone());
                    } else {
                        tracing::debug!(record_id = %id, %field, "field overwritten by another actor, not reverting");
                    }
                }
            }
            (false, false) => {}
        }
    }
    !txn.is_empty()
}
