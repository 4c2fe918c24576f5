//! Keeps backend tasks in step with the task cards on the canvas.
//!
//! [`TaskReconciler`] is a synchronous planner: it turns store change batches,
//! call completions and backend pushes into [`BackendCall`]s and
//! [`StorePatch`]es without touching the network. [`ReconcilerDriver`] runs it
//! against a real [`TaskBackend`] and a [`SyncBridge`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use canvas_common::{Clock, SyncConfig};
use canvas_crdt::{
    ChangeBatch, ChangeSource, DocumentStore, Record, RecordId, SourceFilter, SyncBridge,
    TodoProps,
};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use n0_future::StreamExt;
use n0_future::boxed::BoxStream;
use tokio::sync::mpsc;
use web_time::Instant;

use crate::backend::{
    ListId, NewTask, NotificationData, NotificationKind, TaskBackend, TaskEntity, TaskId,
    TaskNotification, TaskUpdate,
};
use crate::error::TaskApiError;

/// A call the planner wants made.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Create {
        record_id: RecordId,
        list_id: ListId,
        task: NewTask,
    },
    Update {
        record_id: RecordId,
        backend_id: TaskId,
        update: TaskUpdate,
    },
    Delete {
        backend_id: TaskId,
    },
    /// Flip completion server-side; used for a bare checkbox click.
    Toggle {
        record_id: RecordId,
        backend_id: TaskId,
    },
}

/// Record writes derived from backend data. Applied as non-user changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorePatch {
    pub upserts: Vec<Record>,
    pub removals: Vec<RecordId>,
}

impl StorePatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

/// What to do after a create call came back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOutcome {
    /// The card with its backend link filled in, to be written back.
    pub link: Option<Record>,
    pub calls: Vec<BackendCall>,
}

/// What to do with a full list fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingOutcome {
    pub patch: StorePatch,
    /// Retries of earlier failed calls the listing showed were lost.
    pub calls: Vec<BackendCall>,
}

#[derive(Debug, Clone)]
struct PendingUpdate {
    record_id: RecordId,
    update: TaskUpdate,
    due: Instant,
}

/// Plans backend calls for task cards.
#[derive(Debug)]
pub struct TaskReconciler {
    /// List new cards are created in. `None` disables creation.
    default_list: Option<ListId>,
    debounce: Duration,
    /// Cards with a create call in flight, keyed by local id.
    pending_creates: HashSet<RecordId>,
    /// Cards edited while their create was in flight.
    queued_updates: HashSet<RecordId>,
    /// Cards removed while their create was in flight.
    removed_while_pending: HashSet<RecordId>,
    /// Cards whose create failed; the next edit retries it.
    failed_creates: HashSet<RecordId>,
    /// Debounced updates, latest state only, per backend task.
    debounced: BTreeMap<TaskId, PendingUpdate>,
    failed_updates: HashSet<TaskId>,
    failed_deletes: HashSet<TaskId>,
    /// Tasks deleted on behalf of a removed card. A card that comes back
    /// still pointing at one (undo, redo) gets a new task.
    deleted_tasks: HashSet<TaskId>,
}

impl TaskReconciler {
    pub fn new(default_list: Option<ListId>, debounce: Duration) -> Self {
        Self {
            default_list,
            debounce,
            pending_creates: HashSet::new(),
            queued_updates: HashSet::new(),
            removed_while_pending: HashSet::new(),
            failed_creates: HashSet::new(),
            debounced: BTreeMap::new(),
            failed_updates: HashSet::new(),
            failed_deletes: HashSet::new(),
            deleted_tasks: HashSet::new(),
        }
    }

    pub fn from_config(default_list: Option<ListId>, config: &SyncConfig) -> Self {
        Self::new(default_list, config.backend_debounce())
    }

    pub fn is_creating(&self, record_id: &str) -> bool {
        self.pending_creates.contains(record_id)
    }

    pub fn pending_updates(&self) -> usize {
        self.debounced.len()
    }

    /// Earliest debounce deadline, if any update is waiting.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.debounced.values().map(|p| p.due).min()
    }

    /// Plan calls for a batch of user-originated store changes.
    pub fn on_local_changes(&mut self, batch: &ChangeBatch, now: Instant) -> Vec<BackendCall> {
        if batch.source != ChangeSource::User {
            return Vec::new();
        }
        let mut calls = Vec::new();

        for record in &batch.added {
            let Some(todo) = record.as_todo() else { continue };
            match todo.backend_id {
                None => calls.extend(self.create(record, todo)),
                Some(backend_id) if self.deleted_tasks.contains(&backend_id) => {
                    tracing::debug!(record_id = %record.id, backend_id, "card restored after its task was deleted");
                    calls.extend(self.create(record, todo));
                }
                Some(_) => {}
            }
        }

        for (before, after) in &batch.updated {
            let Some(todo) = after.as_todo() else { continue };
            if self.pending_creates.contains(&after.id) {
                self.queued_updates.insert(after.id.clone());
                continue;
            }
            match todo.backend_id {
                Some(backend_id) => {
                    let next = TaskUpdate::from_todo(todo);
                    let prev = before.as_todo().map(TaskUpdate::from_todo);
                    match prev {
                        Some(prev) if prev == next => {}
                        Some(prev) if only_completion_changed(&prev, &next) && !self.debounced.contains_key(&backend_id) => {
                            calls.push(BackendCall::Toggle {
                                record_id: after.id.clone(),
                                backend_id,
                            });
                        }
                        _ => self.schedule_update(&after.id, backend_id, todo, now + self.debounce),
                    }
                }
                None if self.failed_creates.contains(&after.id) => {
                    tracing::debug!(record_id = %after.id, "retrying task creation after edit");
                    calls.extend(self.create(after, todo));
                }
                None => {}
            }
        }

        for record in &batch.removed {
            let Some(todo) = record.as_todo() else { continue };
            self.queued_updates.remove(&record.id);
            self.failed_creates.remove(&record.id);
            if self.pending_creates.contains(&record.id) {
                self.removed_while_pending.insert(record.id.clone());
                continue;
            }
            if let Some(backend_id) = todo.backend_id {
                self.debounced.remove(&backend_id);
                if self.deleted_tasks.insert(backend_id) {
                    calls.push(BackendCall::Delete { backend_id });
                }
            }
        }

        calls
    }

    fn create(&mut self, record: &Record, todo: &TodoProps) -> Option<BackendCall> {
        let list_id = todo.list_id.or(self.default_list)?;
        // a card restored while its create is in flight is no longer an orphan
        self.removed_while_pending.remove(&record.id);
        if !self.pending_creates.insert(record.id.clone()) {
            tracing::debug!(record_id = %record.id, "create already in flight");
            return None;
        }
        self.failed_creates.remove(&record.id);
        Some(BackendCall::Create {
            record_id: record.id.clone(),
            list_id,
            task: NewTask::from_todo(todo),
        })
    }

    fn schedule_update(&mut self, record_id: &RecordId, backend_id: TaskId, todo: &TodoProps, due: Instant) {
        self.debounced.insert(
            backend_id,
            PendingUpdate {
                record_id: record_id.clone(),
                update: TaskUpdate::from_todo(todo),
                due,
            },
        );
    }

    /// Updates whose quiet window has passed, in backend id order.
    pub fn due_updates(&mut self, now: Instant) -> Vec<BackendCall> {
        let due: Vec<TaskId> = self
            .debounced
            .iter()
            .filter(|(_, pending)| pending.due <= now)
            .map(|(id, _)| *id)
            .collect();
        due.into_iter()
            .filter_map(|backend_id| {
                self.debounced
                    .remove(&backend_id)
                    .map(|pending| BackendCall::Update {
                        record_id: pending.record_id,
                        backend_id,
                        update: pending.update,
                    })
            })
            .collect()
    }

    /// Every waiting update, regardless of its deadline.
    pub fn drain_updates(&mut self) -> Vec<BackendCall> {
        std::mem::take(&mut self.debounced)
            .into_iter()
            .map(|(backend_id, pending)| BackendCall::Update {
                record_id: pending.record_id,
                backend_id,
                update: pending.update,
            })
            .collect()
    }

    /// A create call finished. `current` is the card as the store holds it
    /// now, `None` if it has since been removed.
    pub fn on_create_result(
        &mut self,
        record_id: &RecordId,
        result: Result<TaskEntity, TaskApiError>,
        current: Option<&Record>,
        now: Instant,
    ) -> CreateOutcome {
        self.pending_creates.remove(record_id);
        let queued = self.queued_updates.remove(record_id);
        let removed = self.removed_while_pending.remove(record_id);

        let task = match result {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(record_id = %record_id, status = ?e.status, error = %e, "task creation failed, card stays local");
                if !removed && current.is_some() {
                    self.failed_creates.insert(record_id.clone());
                }
                return CreateOutcome::default();
            }
        };

        let current = current.filter(|r| !removed && r.as_todo().is_some());
        let Some(record) = current else {
            tracing::debug!(record_id = %record_id, backend_id = task.id, "card removed before create finished, deleting task");
            return CreateOutcome {
                link: None,
                calls: vec![BackendCall::Delete { backend_id: task.id }],
            };
        };

        let mut linked = record.clone();
        let Some(todo) = linked.as_todo_mut() else {
            return CreateOutcome::default();
        };
        todo.backend_id = Some(task.id);
        todo.list_id = Some(task.list_id);
        if task.assignee_username.is_some() {
            todo.assignee_name = task.assignee_username.clone();
        }
        tracing::debug!(record_id = %record_id, backend_id = task.id, "task created");

        let mut outcome = CreateOutcome::default();
        if queued && TaskUpdate::from_todo(todo) != task_update_of(&task) {
            let todo = todo.clone();
            self.schedule_update(record_id, task.id, &todo, now);
            outcome.calls = self.due_updates(now);
        }
        outcome.link = Some(linked);
        outcome
    }

    pub fn on_update_result(&mut self, backend_id: TaskId, result: &Result<TaskEntity, TaskApiError>) {
        match result {
            Ok(_) => {
                self.failed_updates.remove(&backend_id);
            }
            Err(e) => {
                tracing::warn!(backend_id, status = ?e.status, error = %e, "task update failed");
                self.failed_updates.insert(backend_id);
            }
        }
    }

    /// A toggle call finished. When the backend's completion no longer
    /// matches the card, the card's state is sent as a regular update.
    pub fn on_toggle_result(
        &mut self,
        backend_id: TaskId,
        result: &Result<TaskEntity, TaskApiError>,
        current: Option<&Record>,
        now: Instant,
    ) -> Vec<BackendCall> {
        self.on_update_result(backend_id, result);
        let Ok(task) = result else {
            return Vec::new();
        };
        let Some(record) = current else {
            return Vec::new();
        };
        match record.as_todo() {
            Some(todo) if todo.backend_id == Some(backend_id) && todo.completed != task.completed => {
                tracing::debug!(backend_id, "toggle left the task out of step, sending card state");
                let todo = todo.clone();
                self.schedule_update(&record.id, backend_id, &todo, now);
                self.due_updates(now)
            }
            _ => Vec::new(),
        }
    }

    pub fn on_delete_result(&mut self, backend_id: TaskId, result: &Result<(), TaskApiError>) {
        match result {
            Err(e) if !e.is_not_found() => {
                tracing::warn!(backend_id, status = ?e.status, error = %e, "task delete failed");
                self.failed_deletes.insert(backend_id);
            }
            _ => {
                self.failed_deletes.remove(&backend_id);
            }
        }
    }

    /// Apply a backend push to the cards linked to its task.
    ///
    /// Creations are not turned into cards.
    pub fn on_remote_notification(
        &mut self,
        notification: &TaskNotification,
        records: &[Record],
    ) -> StorePatch {
        let backend_id = notification.data.id;
        let mut patch = StorePatch::default();
        let linked = records
            .iter()
            .filter(|r| r.as_todo().and_then(|t| t.backend_id) == Some(backend_id));

        match notification.kind {
            NotificationKind::TodoCreated => {
                tracing::debug!(backend_id, "ignoring backend task creation");
            }
            NotificationKind::TodoUpdated => {
                for record in linked {
                    let mut updated = record.clone();
                    if let Some(todo) = updated.as_todo_mut() {
                        if apply_task_data(todo, &notification.data) {
                            patch.upserts.push(updated);
                        }
                    }
                }
            }
            NotificationKind::TodoDeleted => {
                self.debounced.remove(&backend_id);
                patch.removals.extend(linked.map(|r| r.id.clone()));
            }
        }
        if !patch.is_empty() {
            tracing::debug!(backend_id, kind = ?notification.kind, records = patch.upserts.len() + patch.removals.len(), "applying backend push");
        }
        patch
    }

    /// Bring cards linked to tasks of `list_id` in line with a full list
    /// fetch, and retry calls the listing shows were lost.
    pub fn apply_listing(
        &mut self,
        list_id: ListId,
        tasks: &[TaskEntity],
        records: &[Record],
    ) -> ListingOutcome {
        let by_id: HashMap<TaskId, &TaskEntity> = tasks.iter().map(|t| (t.id, t)).collect();
        let mut outcome = ListingOutcome::default();

        for record in records {
            let Some(todo) = record.as_todo() else { continue };
            let Some(backend_id) = todo.backend_id else { continue };
            if todo.list_id.is_some_and(|l| l != list_id)
                || self.debounced.contains_key(&backend_id)
                || self.pending_creates.contains(&record.id)
            {
                continue;
            }
            match by_id.get(&backend_id) {
                None => {
                    self.failed_updates.remove(&backend_id);
                    outcome.patch.removals.push(record.id.clone());
                }
                Some(task) => {
                    let local = TaskUpdate::from_todo(todo);
                    if local == task_update_of(task) {
                        self.failed_updates.remove(&backend_id);
                    } else if self.failed_updates.remove(&backend_id) {
                        outcome.calls.push(BackendCall::Update {
                            record_id: record.id.clone(),
                            backend_id,
                            update: local,
                        });
                    } else {
                        let mut updated = record.clone();
                        if let Some(todo) = updated.as_todo_mut() {
                            if apply_task_data(todo, &NotificationData::from(*task)) {
                                outcome.patch.upserts.push(updated);
                            }
                        }
                    }
                }
            }
        }

        let retry: Vec<TaskId> = self
            .failed_deletes
            .iter()
            .filter(|id| by_id.contains_key(*id))
            .copied()
            .collect();
        for backend_id in &retry {
            outcome.calls.push(BackendCall::Delete {
                backend_id: *backend_id,
            });
        }
        self.failed_deletes.retain(|id| retry.contains(id));

        tracing::debug!(
            list_id,
            upserts = outcome.patch.upserts.len(),
            removals = outcome.patch.removals.len(),
            retries = outcome.calls.len(),
            "applied task listing"
        );
        outcome
    }
}

/// Whether `next` differs from `prev` in completion and nothing else.
fn only_completion_changed(prev: &TaskUpdate, next: &TaskUpdate) -> bool {
    prev.completed != next.completed
        && TaskUpdate {
            completed: prev.completed,
            ..next.clone()
        } == *prev
}

fn task_update_of(task: &TaskEntity) -> TaskUpdate {
    TaskUpdate {
        title: Some(task.title.clone()),
        description: None,
        completed: Some(task.completed),
        assigned_to: task.assigned_to,
        due_date: task.due_date.clone(),
    }
}

/// Copy backend fields onto a card. Returns whether anything changed.
fn apply_task_data(todo: &mut TodoProps, data: &NotificationData) -> bool {
    let before = todo.clone();
    todo.title = data.title.clone();
    todo.completed = data.completed;
    todo.due_date = data.due_date.clone();
    todo.assignee_id = data.assigned_to;
    todo.assignee_name = data.assignee_username.clone();
    *todo != before
}

/// Input to a running [`ReconcilerDriver`] besides store changes.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendSignal {
    Notification(TaskNotification),
    /// Fetch the default list and reconcile against it.
    Refresh,
}

enum Completion {
    Created {
        record_id: RecordId,
        result: Result<TaskEntity, TaskApiError>,
    },
    Updated {
        backend_id: TaskId,
        result: Result<TaskEntity, TaskApiError>,
    },
    Deleted {
        backend_id: TaskId,
        result: Result<(), TaskApiError>,
    },
    Toggled {
        record_id: RecordId,
        backend_id: TaskId,
        result: Result<TaskEntity, TaskApiError>,
    },
    Listed {
        list_id: ListId,
        result: Result<Vec<TaskEntity>, TaskApiError>,
    },
}

/// Runs a [`TaskReconciler`] against a backend and a bridge.
///
/// Backend errors are logged and absorbed here; nothing propagates into the
/// bridge or the editing surface.
pub struct ReconcilerDriver<B, S: DocumentStore + 'static> {
    reconciler: TaskReconciler,
    backend: B,
    bridge: Arc<SyncBridge<S>>,
    token: String,
    time: Arc<dyn Clock>,
}

impl<B: TaskBackend, S: DocumentStore + 'static> ReconcilerDriver<B, S> {
    pub fn new(
        reconciler: TaskReconciler,
        backend: B,
        bridge: Arc<SyncBridge<S>>,
        token: impl Into<String>,
        time: Arc<dyn Clock>,
    ) -> Self {
        Self {
            reconciler,
            backend,
            bridge,
            token: token.into(),
            time,
        }
    }

    /// Process store changes and `signals` until `signals` ends, then send
    /// any waiting updates and wait for every call in flight.
    pub async fn run(self, mut signals: BoxStream<BackendSignal>) -> TaskReconciler {
        let Self {
            mut reconciler,
            backend,
            bridge,
            token,
            time,
        } = self;

        let (tx, mut batches) = mpsc::unbounded_channel::<ChangeBatch>();
        let _listener = bridge.store().listen(
            SourceFilter::Only(ChangeSource::User),
            Box::new(move |batch| {
                // receiver gone means the driver stopped
                let _ = tx.send(batch.clone());
            }),
        );

        let backend = &backend;
        let token = token.as_str();
        let mut in_flight: FuturesUnordered<BoxFuture<'_, Completion>> = FuturesUnordered::new();

        tracing::debug!("task reconciler running");
        let mut signals_open = true;
        while signals_open {
            let wait = reconciler
                .next_deadline()
                .map(|due| due.saturating_duration_since(time.now()));

            tokio::select! {
                Some(batch) = batches.recv() => {
                    let calls = reconciler.on_local_changes(&batch, time.now());
                    dispatch(&mut in_flight, backend, token, calls);
                }
                signal = signals.next() => match signal {
                    Some(BackendSignal::Notification(notification)) => {
                        let patch = reconciler.on_remote_notification(&notification, &bridge.store().all());
                        apply_patch(&bridge, &patch);
                    }
                    Some(BackendSignal::Refresh) => {
                        match reconciler.default_list {
                            Some(list_id) => in_flight.push(
                                async move {
                                    let result = backend.list_tasks(list_id, token).await;
                                    Completion::Listed { list_id, result }
                                }
                                .boxed(),
                            ),
                            None => tracing::debug!("refresh requested without a task list"),
                        }
                    }
                    None => signals_open = false,
                },
                _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {
                    let calls = reconciler.due_updates(time.now());
                    dispatch(&mut in_flight, backend, token, calls);
                }
                Some(done) = in_flight.next(), if !in_flight.is_empty() => {
                    let calls = complete(&mut reconciler, &bridge, done, time.now());
                    dispatch(&mut in_flight, backend, token, calls);
                }
            }
        }

        // pick up edits that raced the shutdown
        while let Ok(batch) = batches.try_recv() {
            let calls = reconciler.on_local_changes(&batch, time.now());
            dispatch(&mut in_flight, backend, token, calls);
        }
        let calls = reconciler.drain_updates();
        dispatch(&mut in_flight, backend, token, calls);
        while let Some(done) = in_flight.next().await {
            let calls = complete(&mut reconciler, &bridge, done, time.now());
            dispatch(&mut in_flight, backend, token, calls);
        }
        tracing::debug!("task reconciler stopped");
        reconciler
    }
}

fn dispatch<'a, B: TaskBackend>(
    in_flight: &mut FuturesUnordered<BoxFuture<'a, Completion>>,
    backend: &'a B,
    token: &'a str,
    calls: Vec<BackendCall>,
) {
    for call in calls {
        in_flight.push(call_backend(backend, token, call));
    }
}

fn call_backend<'a, B: TaskBackend>(backend: &'a B, token: &'a str, call: BackendCall) -> BoxFuture<'a, Completion> {
    async move {
        match call {
            BackendCall::Create {
                record_id,
                list_id,
                task,
            } => {
                tracing::debug!(record_id = %record_id, list_id, "creating task");
                let result = backend.create_task(list_id, &task, token).await;
                Completion::Created { record_id, result }
            }
            BackendCall::Update {
                backend_id, update, ..
            } => {
                let result = backend.update_task(backend_id, &update, token).await;
                Completion::Updated { backend_id, result }
            }
            BackendCall::Delete { backend_id } => {
                let result = backend.delete_task(backend_id, token).await;
                Completion::Deleted { backend_id, result }
            }
            BackendCall::Toggle {
                record_id,
                backend_id,
            } => {
                let result = backend.toggle_task(backend_id, token).await;
                Completion::Toggled {
                    record_id,
                    backend_id,
                    result,
                }
            }
        }
    }
    .boxed()
}

fn complete<S: DocumentStore + 'static>(
    reconciler: &mut TaskReconciler,
    bridge: &SyncBridge<S>,
    done: Completion,
    now: Instant,
) -> Vec<BackendCall> {
    match done {
        Completion::Created { record_id, result } => {
            let current = bridge.store().get(&record_id);
            let outcome = reconciler.on_create_result(&record_id, result, current.as_ref(), now);
            if let Some(link) = outcome.link {
                apply_patch(
                    bridge,
                    &StorePatch {
                        upserts: vec![link],
                        removals: Vec::new(),
                    },
                );
            }
            outcome.calls
        }
        Completion::Updated { backend_id, result } => {
            reconciler.on_update_result(backend_id, &result);
            Vec::new()
        }
        Completion::Deleted { backend_id, result } => {
            reconciler.on_delete_result(backend_id, &result);
            Vec::new()
        }
        Completion::Toggled {
            record_id,
            backend_id,
            result,
        } => {
            let current = bridge.store().get(&record_id);
            reconciler.on_toggle_result(backend_id, &result, current.as_ref(), now)
        }
        Completion::Listed { list_id, result } => match result {
            Ok(tasks) => {
                let outcome = reconciler.apply_listing(list_id, &tasks, &bridge.store().all());
                apply_patch(bridge, &outcome.patch);
                outcome.calls
            }
            Err(e) => {
                tracing::warn!(list_id, status = ?e.status, error = %e, "task listing failed");
                Vec::new()
            }
        },
    }
}

fn apply_patch<S: DocumentStore + 'static>(bridge: &SyncBridge<S>, patch: &StorePatch) {
    if patch.is_empty() {
        return;
    }
    if let Err(e) = bridge.apply_external_change(&patch.upserts, &patch.removals) {
        tracing::warn!(?e, "failed to apply backend changes to the document");
    }
}
