//! Backend task reconciliation driven against a fake REST backend.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canvas_common::{ManualClock, SystemClock};
use canvas_crdt::{
    ActorUndoManager, ChangeSource, DocumentStore, MemoryStore, Record, ReplicatedDoc, SyncBridge,
    TodoProps,
};
use canvas_sync::backend::{NotificationData, NotificationKind};
use canvas_sync::{
    BackendSignal, ListId, NewTask, ReconcilerDriver, TaskApiError, TaskBackend, TaskEntity, TaskId,
    TaskNotification, TaskReconciler, TaskUpdate,
};
use n0_future::boxed::BoxStream;
use tokio::sync::mpsc;

const LIST: ListId = 1;

#[derive(Default)]
struct Ledger {
    tasks: BTreeMap<TaskId, TaskEntity>,
    next_id: TaskId,
    creates: Vec<NewTask>,
    updates: Vec<(TaskId, TaskUpdate)>,
    deletes: Vec<TaskId>,
    toggles: Vec<TaskId>,
    fail_creates: usize,
}

#[derive(Clone, Default)]
struct FakeBackend {
    ledger: Arc<Mutex<Ledger>>,
    latency: Duration,
}

impl FakeBackend {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    fn seed(&self, id: TaskId, title: &str) {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.tasks.insert(id, entity(id, title));
        ledger.next_id = ledger.next_id.max(id);
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap()
    }
}

fn entity(id: TaskId, title: &str) -> TaskEntity {
    TaskEntity {
        id,
        title: title.to_owned(),
        description: None,
        completed: false,
        assigned_to: None,
        assignee_username: None,
        due_date: None,
        list_id: LIST,
        created_at: "2025-01-01T00:00:00".to_owned(),
    }
}

impl TaskBackend for FakeBackend {
    async fn create_task(&self, list_id: ListId, task: &NewTask, _token: &str) -> Result<TaskEntity, TaskApiError> {
        tokio::time::sleep(self.latency).await;
        let mut ledger = self.ledger();
        ledger.creates.push(task.clone());
        if ledger.fail_creates > 0 {
            ledger.fail_creates -= 1;
            return Err(TaskApiError::new(500, "Internal Server Error"));
        }
        ledger.next_id += 1;
        let mut created = entity(ledger.next_id, &task.title);
        created.list_id = list_id;
        created.assigned_to = task.assigned_to;
        ledger.tasks.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_task(&self, id: TaskId, update: &TaskUpdate, _token: &str) -> Result<TaskEntity, TaskApiError> {
        tokio::time::sleep(self.latency).await;
        let mut ledger = self.ledger();
        ledger.updates.push((id, update.clone()));
        let task = ledger
            .tasks
            .get_mut(&id)
            .ok_or_else(|| TaskApiError::new(404, "Task not found"))?;
        if let Some(title) = &update.title {
            task.title = title.clone();
        }
        if let Some(completed) = update.completed {
            task.completed = completed;
        }
        Ok(task.clone())
    }

    async fn delete_task(&self, id: TaskId, _token: &str) -> Result<(), TaskApiError> {
        tokio::time::sleep(self.latency).await;
        let mut ledger = self.ledger();
        ledger.deletes.push(id);
        ledger
            .tasks
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| TaskApiError::new(404, "Task not found"))
    }

    async fn list_tasks(&self, list_id: ListId, _token: &str) -> Result<Vec<TaskEntity>, TaskApiError> {
        let ledger = self.ledger();
        Ok(ledger
            .tasks
            .values()
            .filter(|t| t.list_id == list_id)
            .cloned()
            .collect())
    }

    async fn toggle_task(&self, id: TaskId, _token: &str) -> Result<TaskEntity, TaskApiError> {
        tokio::time::sleep(self.latency).await;
        let mut ledger = self.ledger();
        ledger.toggles.push(id);
        let task = ledger
            .tasks
            .get_mut(&id)
            .ok_or_else(|| TaskApiError::new(404, "Task not found"))?;
        task.completed = !task.completed;
        Ok(task.clone())
    }
}

struct Harness {
    bridge: Arc<SyncBridge<MemoryStore>>,
    backend: FakeBackend,
    signals: mpsc::UnboundedSender<BackendSignal>,
    driver: ReconcilerDriver<FakeBackend, MemoryStore>,
    stream: BoxStream<BackendSignal>,
}

fn harness(backend: FakeBackend) -> Harness {
    let bridge = Arc::new(SyncBridge::attach(ReplicatedDoc::new(), MemoryStore::new()));
    let (signals, rx) = mpsc::unbounded_channel();
    let stream: BoxStream<BackendSignal> = Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|signal| (signal, rx))
    }));
    let driver = ReconcilerDriver::new(
        TaskReconciler::new(Some(LIST), Duration::from_millis(20)),
        backend.clone(),
        bridge.clone(),
        "token",
        Arc::new(SystemClock),
    );
    Harness {
        bridge,
        backend,
        signals,
        driver,
        stream,
    }
}

fn user_put(bridge: &SyncBridge<MemoryStore>, record: Record) {
    bridge.store().put(vec![record], ChangeSource::User).unwrap();
}

fn retitle(bridge: &SyncBridge<MemoryStore>, id: &str, title: &str) {
    let mut record = bridge.store().get(id).unwrap();
    record.as_todo_mut().unwrap().title = title.to_owned();
    user_put(bridge, record);
}

fn card(bridge: &SyncBridge<MemoryStore>, id: &str) -> Option<TodoProps> {
    bridge.store().get(id).and_then(|r| r.as_todo().cloned())
}

fn undo_manager(bridge: &SyncBridge<MemoryStore>) -> ActorUndoManager {
    ActorUndoManager::new(
        bridge.doc().clone(),
        Arc::new(ManualClock::new()),
        Duration::from_millis(500),
        100,
    )
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn rapid_edits_create_exactly_one_task() {
    let Harness {
        bridge,
        backend,
        signals,
        driver,
        stream,
    } = harness(FakeBackend::with_latency(Duration::from_millis(40)));

    let (reconciler, ()) = tokio::join!(driver.run(stream), async {
        // let the driver install its store listener first
        tokio::task::yield_now().await;
        user_put(&bridge, Record::todo("card", TodoProps::titled("New Task")));
        for i in 0..5 {
            retitle(&bridge, "card", &format!("Draft {i}"));
            tokio::task::yield_now().await;
        }
        settle().await;
        drop(signals);
    });

    let ledger = backend.ledger();
    assert_eq!(ledger.creates.len(), 1);
    assert_eq!(ledger.creates[0].title, "New Task");

    let todo = card(&bridge, "card").unwrap();
    let backend_id = todo.backend_id.unwrap();
    assert_eq!(todo.list_id, Some(LIST));
    assert!(!reconciler.is_creating("card"));

    // the edits made while creating land as one follow-up update
    assert_eq!(ledger.updates.len(), 1);
    assert_eq!(ledger.tasks[&backend_id].title, "Draft 4");
}

#[tokio::test]
async fn edits_to_linked_cards_are_debounced() {
    let Harness {
        bridge,
        backend,
        signals,
        driver,
        stream,
    } = harness(FakeBackend::default());
    backend.seed(7, "Buy milk");
    let linked = Record::todo(
        "milk",
        TodoProps {
            backend_id: Some(7),
            list_id: Some(LIST),
            ..TodoProps::titled("Buy milk")
        },
    );
    bridge.apply_external_change(&[linked], &[]).unwrap();

    tokio::join!(driver.run(stream), async {
        tokio::task::yield_now().await;
        for title in ["Buy oat milk", "Buy oat milk x2", "Buy oat milk x3"] {
            retitle(&bridge, "milk", title);
        }
        // a move is not a task change
        let moved = bridge.store().get("milk").unwrap().at(300.0, 40.0);
        user_put(&bridge, moved);
        settle().await;
        drop(signals);
    });

    let ledger = backend.ledger();
    assert!(ledger.creates.is_empty());
    assert_eq!(ledger.updates.len(), 1);
    assert_eq!(ledger.updates[0].0, 7);
    assert_eq!(ledger.tasks[&7].title, "Buy oat milk x3");
}

#[tokio::test]
async fn failed_create_is_retried_on_next_edit() {
    let backend = FakeBackend::default();
    backend.ledger().fail_creates = 1;
    let Harness {
        bridge,
        signals,
        driver,
        stream,
        ..
    } = harness(backend.clone());

    tokio::join!(driver.run(stream), async {
        tokio::task::yield_now().await;
        user_put(&bridge, Record::todo("card", TodoProps::titled("Call mum")));
        settle().await;
        assert!(card(&bridge, "card").unwrap().backend_id.is_none());

        retitle(&bridge, "card", "Call mum today");
        settle().await;
        drop(signals);
    });

    let ledger = backend.ledger();
    assert_eq!(ledger.creates.len(), 2);
    assert_eq!(ledger.creates[1].title, "Call mum today");
    assert!(card(&bridge, "card").unwrap().backend_id.is_some());
}

#[tokio::test]
async fn removing_a_card_deletes_its_task() {
    let Harness {
        bridge,
        backend,
        signals,
        driver,
        stream,
    } = harness(FakeBackend::default());

    tokio::join!(driver.run(stream), async {
        tokio::task::yield_now().await;
        user_put(&bridge, Record::todo("card", TodoProps::titled("Temporary")));
        settle().await;
        let id: canvas_crdt::RecordId = "card".into();
        bridge.store().remove(&[id], ChangeSource::User).unwrap();
        settle().await;
        drop(signals);
    });

    let ledger = backend.ledger();
    assert_eq!(ledger.creates.len(), 1);
    assert_eq!(ledger.deletes.len(), 1);
    assert!(ledger.tasks.is_empty());
}

#[tokio::test]
async fn backend_pushes_and_listing_update_cards() {
    let Harness {
        bridge,
        backend,
        signals,
        driver,
        stream,
    } = harness(FakeBackend::default());
    backend.seed(7, "Water plants");
    let linked = |id: &str, backend_id: TaskId, title: &str| {
        Record::todo(
            id,
            TodoProps {
                backend_id: Some(backend_id),
                list_id: Some(LIST),
                ..TodoProps::titled(title)
            },
        )
    };
    bridge
        .apply_external_change(
            &[
                linked("plants", 7, "Water plants"),
                linked("gone", 8, "Deleted elsewhere"),
            ],
            &[],
        )
        .unwrap();

    tokio::join!(driver.run(stream), async {
        tokio::task::yield_now().await;
        let push = TaskNotification {
            kind: NotificationKind::TodoUpdated,
            data: NotificationData {
                completed: true,
                ..NotificationData::from(&entity(7, "Water all plants"))
            },
        };
        signals.send(BackendSignal::Notification(push)).unwrap();
        settle().await;
        let plants = card(&bridge, "plants").unwrap();
        assert_eq!(plants.title, "Water all plants");
        assert!(plants.completed);

        // a listing that no longer has task 8 removes its card, and the
        // backend's copy of 7 wins over the pushed one
        signals.send(BackendSignal::Refresh).unwrap();
        settle().await;
        assert!(card(&bridge, "gone").is_none());
        assert_eq!(card(&bridge, "plants").unwrap().title, "Water plants");

        let deleted = TaskNotification::from_json(r#"{"type":"todo_deleted","data":{"id":7}}"#).unwrap();
        signals.send(BackendSignal::Notification(deleted)).unwrap();
        settle().await;
        drop(signals);
    });

    assert!(card(&bridge, "plants").is_none());
    // backend-originated changes never call back into the backend
    let ledger = backend.ledger();
    assert!(ledger.creates.is_empty());
    assert!(ledger.updates.is_empty());
    assert!(ledger.deletes.is_empty());
}

#[tokio::test]
async fn undo_of_an_edit_reaches_the_backend() {
    let Harness {
        bridge,
        backend,
        signals,
        driver,
        stream,
    } = harness(FakeBackend::default());
    backend.seed(3, "Original");
    bridge
        .apply_external_change(
            &[Record::todo(
                "card",
                TodoProps {
                    backend_id: Some(3),
                    list_id: Some(LIST),
                    ..TodoProps::titled("Original")
                },
            )],
            &[],
        )
        .unwrap();
    let undo = undo_manager(&bridge);

    tokio::join!(driver.run(stream), async {
        tokio::task::yield_now().await;
        retitle(&bridge, "card", "Edited");
        settle().await;
        assert!(undo.undo().unwrap());
        settle().await;
        drop(signals);
    });

    assert_eq!(card(&bridge, "card").unwrap().title, "Original");
    let ledger = backend.ledger();
    assert_eq!(ledger.updates.len(), 2);
    assert_eq!(ledger.tasks[&3].title, "Original");
}

#[tokio::test]
async fn undoing_a_linked_card_deletes_its_task() {
    let Harness {
        bridge,
        backend,
        signals,
        driver,
        stream,
    } = harness(FakeBackend::default());
    let undo = undo_manager(&bridge);

    tokio::join!(driver.run(stream), async {
        tokio::task::yield_now().await;
        user_put(&bridge, Record::todo("card", TodoProps::titled("New Task")));
        settle().await;
        let first = card(&bridge, "card").unwrap().backend_id;
        assert_eq!(first, Some(1));

        assert!(undo.undo().unwrap());
        assert!(card(&bridge, "card").is_none());
        settle().await;
        assert_eq!(backend.ledger().deletes, vec![1]);

        // redo brings the card back under a fresh task
        assert!(undo.redo().unwrap());
        settle().await;
        assert_eq!(card(&bridge, "card").unwrap().backend_id, Some(2));
        drop(signals);
    });

    let ledger = backend.ledger();
    assert_eq!(ledger.creates.len(), 2);
    assert_eq!(ledger.tasks.keys().copied().collect::<Vec<_>>(), vec![2]);
    assert!(ledger.updates.is_empty());
}

#[tokio::test]
async fn checking_a_card_toggles_its_task() {
    let Harness {
        bridge,
        backend,
        signals,
        driver,
        stream,
    } = harness(FakeBackend::default());
    backend.seed(4, "Stretch");
    bridge
        .apply_external_change(
            &[Record::todo(
                "card",
                TodoProps {
                    backend_id: Some(4),
                    list_id: Some(LIST),
                    ..TodoProps::titled("Stretch")
                },
            )],
            &[],
        )
        .unwrap();

    tokio::join!(driver.run(stream), async {
        tokio::task::yield_now().await;
        let mut checked = bridge.store().get("card").unwrap();
        checked.as_todo_mut().unwrap().completed = true;
        user_put(&bridge, checked);
        settle().await;
        drop(signals);
    });

    let ledger = backend.ledger();
    assert_eq!(ledger.toggles, vec![4]);
    assert!(ledger.updates.is_empty());
    assert!(ledger.tasks[&4].completed);
}
