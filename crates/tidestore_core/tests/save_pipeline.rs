mod common;

use common::{raw_attributes, secrets, StatusRecorder, StoreDirs, User, ACCOUNTS_V1};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tidestore_core::{
    ContextRole, ExecutionContext, ModelSchema, Persistable, Record, RecordError, RecordId,
    SaveMode, SaveStatus, SortDescriptor, StoreError, StoreHandle,
};
use uuid::Uuid;

const ACCOUNTS_WITH_BADGES: &str = r#"{
    "name": "Accounts",
    "version": 1,
    "entities": [
        {
            "name": "User",
            "attributes": [
                { "name": "name", "kind": "text", "optional": false },
                { "name": "secret", "kind": "text", "encrypted": true },
                { "name": "birth_date", "kind": "timestamp", "encrypted": true },
                { "name": "age", "kind": "integer" }
            ]
        },
        {
            "name": "Badge",
            "attributes": [
                { "name": "label", "kind": "text", "optional": false }
            ]
        }
    ]
}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Badge {
    id: RecordId,
    label: String,
}

impl Persistable for Badge {
    const ENTITY: &'static str = "Badge";

    fn id(&self) -> RecordId {
        self.id
    }

    fn to_record(&self) -> Record {
        Record::with_id(self.id, Self::ENTITY).with("label", self.label.as_str())
    }

    fn from_record(record: &Record) -> Result<Self, RecordError> {
        Ok(Self {
            id: record.id,
            label: record.require_text("label")?,
        })
    }
}

fn memory_store() -> StoreHandle {
    let schema = ModelSchema::from_json(ACCOUNTS_V1).unwrap();
    StoreHandle::open_in_memory(schema, &secrets()).unwrap()
}

fn save_blocking(
    store: &StoreHandle,
    mutate: impl FnOnce(&tidestore_core::Context) -> tidestore_core::StoreResult<()> + Send + 'static,
) -> SaveStatus {
    let recorder = StatusRecorder::default();
    store.save(SaveMode::Blocking, mutate, recorder.callback());
    let statuses = recorder.statuses();
    assert_eq!(statuses.len(), 1, "blocking save on the foreground completes inline");
    statuses[0]
}

fn durable_count(path: &std::path::Path) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row("SELECT COUNT(*) FROM records;", [], |row| row.get(0))
        .unwrap()
}

/// Writes `name` as an integer so schema validation rejects it.
struct MistypedUser {
    id: RecordId,
}

impl Persistable for MistypedUser {
    const ENTITY: &'static str = "User";

    fn id(&self) -> RecordId {
        self.id
    }

    fn to_record(&self) -> Record {
        Record::with_id(self.id, Self::ENTITY).with("name", 42_i64)
    }

    fn from_record(record: &Record) -> Result<Self, RecordError> {
        Ok(Self { id: record.id })
    }
}

#[test]
fn no_op_save_reports_no_changes_and_leaves_file_untouched() {
    let dirs = StoreDirs::new(ACCOUNTS_V1);
    let store = dirs.open();
    let path = dirs.store_path();

    let before_modified = std::fs::metadata(&path).unwrap().modified().unwrap();
    let before_bytes = std::fs::read(&path).unwrap();
    thread::sleep(Duration::from_millis(20));

    let status = save_blocking(&store, |_| Ok(()));

    assert_eq!(status, SaveStatus::NoChanges);
    assert_eq!(
        std::fs::metadata(&path).unwrap().modified().unwrap(),
        before_modified
    );
    assert_eq!(std::fs::read(&path).unwrap(), before_bytes);
}

#[test]
fn insert_then_delete_in_one_save_is_no_change() {
    let store = memory_store();

    let status = save_blocking(&store, |context| {
        let user = User::new("Temp");
        context.insert(&user)?;
        context.delete::<User>(user.id)
    });

    assert_eq!(status, SaveStatus::NoChanges);
    assert_eq!(store.reader_context().count::<User, _>(|_| true).unwrap(), 0);
}

#[test]
fn blocking_save_cascades_to_disk_and_survives_reopen() {
    let dirs = StoreDirs::new(ACCOUNTS_V1);
    let user = User::new("Bob");
    let id = user.id;

    {
        let store = dirs.open();
        let status = save_blocking(&store, move |context| context.insert(&user));
        assert_eq!(status, SaveStatus::Saved);

        let loaded = store.reader_context().get::<User>(id).unwrap().unwrap();
        assert_eq!(loaded.name, "Bob");
        assert!(!store.reader_context().has_changes());
        assert!(!store.writer_context().has_changes());
    }

    assert_eq!(durable_count(&dirs.store_path()), 1);
    let reopened = dirs.open();
    let loaded = reopened.reader_context().get::<User>(id).unwrap().unwrap();
    assert_eq!(loaded.name, "Bob");
}

#[test]
fn background_save_of_alice_with_secret_persists_plaintext_view() {
    let dirs = StoreDirs::new(ACCOUNTS_V1);
    let recorder = StatusRecorder::default();

    {
        let store = dirs.open();
        store.save(
            SaveMode::Background,
            |context| context.insert(&User::new("Alice").with_secret("secret")),
            recorder.callback(),
        );
        assert_eq!(recorder.wait_for(&store, 1), vec![SaveStatus::Saved]);
    }

    let reopened = dirs.open();
    let users = reopened
        .reader_context()
        .fetch::<User, _>(|user| user.name == "Alice", &[])
        .unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].secret.as_deref(), Some("secret"));
    assert_eq!(reopened.crypto_failure_count(), 0);

    let raw = raw_attributes(&dirs.store_path());
    let attributes: serde_json::Value = serde_json::from_str(&raw[0]).unwrap();
    assert!(attributes["secret"]["cipher"].is_string());
    assert_eq!(attributes["name"]["plain"]["value"], "Alice");
}

#[test]
fn completion_runs_on_foreground_for_background_saves() {
    let store = memory_store();
    let foreground = thread::current().id();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    store.save(
        SaveMode::Background,
        |context| context.insert(&User::new("Carol")),
        move |status| sink.lock().unwrap().push((status, thread::current().id())),
    );

    while seen.lock().unwrap().is_empty() {
        store
            .process_foreground_timeout(Duration::from_millis(50))
            .unwrap();
    }
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[(SaveStatus::Saved, foreground)]
    );
}

#[test]
fn blocking_save_from_other_thread_waits_for_foreground_commit() {
    let store = memory_store();
    let recorder = StatusRecorder::default();
    let user = User::new("Dana");
    let id = user.id;

    let worker_store = store.clone();
    let callback = recorder.callback();
    let worker = thread::spawn(move || {
        worker_store.save(SaveMode::Blocking, move |context| context.insert(&user), callback);
        worker_store.reader_context().get::<User>(id).unwrap()
    });

    assert_eq!(recorder.wait_for(&store, 1), vec![SaveStatus::Saved]);
    let seen_by_worker = worker.join().unwrap();
    assert_eq!(seen_by_worker.map(|user| user.name), Some("Dana".to_string()));
}

#[test]
fn reader_commit_failure_rolls_back_and_keeps_change_visible() {
    let dirs = StoreDirs::new(ACCOUNTS_V1);
    let store = dirs.open();
    let path = dirs.store_path();

    let blocker = Connection::open(&path).unwrap();
    blocker
        .execute_batch(
            "CREATE TRIGGER block_inserts BEFORE INSERT ON records
             BEGIN SELECT RAISE(ABORT, 'forced'); END;",
        )
        .unwrap();
    drop(blocker);

    let user = User::new("Eve");
    let id = user.id;
    let status = save_blocking(&store, move |context| context.insert(&user));

    assert_eq!(status, SaveStatus::RolledBack);
    assert_eq!(durable_count(&path), 0);
    assert!(store.reader_context().has_changes());
    assert!(store.reader_context().get::<User>(id).unwrap().is_some());
    assert!(store.writer_context().get::<User>(id).unwrap().is_some());

    let unblocker = Connection::open(&path).unwrap();
    unblocker
        .execute_batch("DROP TRIGGER block_inserts;")
        .unwrap();
    drop(unblocker);

    let status = save_blocking(&store, |_| Ok(()));
    assert_eq!(status, SaveStatus::Saved);
    assert_eq!(durable_count(&path), 1);
    assert!(!store.reader_context().has_changes());
}

#[test]
fn writer_failures_discard_writer_changes_and_leave_reader_untouched() {
    let store = memory_store();
    let bob = User::new("Bob");
    let bob_id = bob.id;
    assert_eq!(
        save_blocking(&store, move |context| context.insert(&bob)),
        SaveStatus::Saved
    );

    let status = save_blocking(&store, |context| {
        context.insert(&User::new("Frank"))?;
        context.insert(&MistypedUser { id: Uuid::new_v4() })
    });
    assert_eq!(status, SaveStatus::RolledBack);
    assert!(!store.writer_context().has_changes());
    assert!(!store.reader_context().has_changes());

    let status = save_blocking(&store, |context| context.update(&User::new("Nobody")));
    assert_eq!(status, SaveStatus::RolledBack);
    assert!(!store.writer_context().has_changes());

    let ids = store
        .reader_context()
        .fetch::<User, _>(|_| true, &[])
        .unwrap()
        .into_iter()
        .map(|user| user.id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![bob_id]);
}

#[test]
fn context_operations_report_duplicates_and_missing_records() {
    let store = memory_store();
    let user = User::new("Gina");
    let copy = user.clone();
    assert_eq!(
        save_blocking(&store, move |context| context.insert(&copy)),
        SaveStatus::Saved
    );

    let writer = store.writer_context();
    assert!(matches!(
        writer.insert(&user),
        Err(StoreError::Duplicate(id)) if id == user.id
    ));
    let missing = Uuid::new_v4();
    assert!(matches!(
        writer.delete::<User>(missing),
        Err(StoreError::NotFound(id)) if id == missing
    ));
    assert!(!writer.has_changes());
}

#[test]
fn fetch_orders_by_sort_descriptors() {
    let store = memory_store();
    assert_eq!(
        save_blocking(&store, |context| {
            for (name, age) in [("Ann", 40_i64), ("Ben", 25), ("Cid", 33)] {
                let mut user = User::new(name);
                user.age = Some(age);
                context.insert(&user)?;
            }
            Ok(())
        }),
        SaveStatus::Saved
    );

    let by_age = store
        .reader_context()
        .fetch::<User, _>(|user| user.age.unwrap_or(0) > 30, &[SortDescriptor::descending("age")])
        .unwrap()
        .into_iter()
        .map(|user| user.name)
        .collect::<Vec<_>>();
    assert_eq!(by_age, vec!["Ann".to_string(), "Cid".to_string()]);
}

#[test]
fn updates_and_deletes_cascade_through_both_contexts() {
    let store = memory_store();
    let mut user = User::new("Hank");
    let id = user.id;
    let copy = user.clone();
    assert_eq!(
        save_blocking(&store, move |context| context.insert(&copy)),
        SaveStatus::Saved
    );

    user.age = Some(52);
    assert_eq!(
        save_blocking(&store, move |context| context.update(&user)),
        SaveStatus::Saved
    );
    let loaded = store.reader_context().get::<User>(id).unwrap().unwrap();
    assert_eq!(loaded.age, Some(52));

    assert_eq!(
        save_blocking(&store, move |context| context.delete::<User>(id)),
        SaveStatus::Saved
    );
    assert!(store.reader_context().get::<User>(id).unwrap().is_none());
}

#[test]
fn router_selects_context_by_execution_context() {
    let store = memory_store();
    assert!(store.is_foreground());
    assert_eq!(store.current_context().role(), ContextRole::Reader);
    assert_eq!(
        store.context_for(ExecutionContext::Background).role(),
        ContextRole::Writer
    );
    assert_eq!(
        store.context_for(ExecutionContext::Foreground).role(),
        ContextRole::Reader
    );

    let other = store.clone();
    let (is_foreground, role) =
        thread::spawn(move || (other.is_foreground(), other.current_context().role()))
            .join()
            .unwrap();
    assert!(!is_foreground);
    assert_eq!(role, ContextRole::Writer);
}

#[test]
fn draining_the_foreground_off_thread_is_rejected() {
    let store = memory_store();
    let other = store.clone();
    let result = thread::spawn(move || other.process_foreground())
        .join()
        .unwrap();
    assert!(matches!(
        result,
        Err(StoreError::WrongExecutionContext("process_foreground"))
    ));
    assert_eq!(store.process_foreground().unwrap(), 0);
}

#[test]
fn subscribers_see_writer_then_reader_commits() {
    let store = memory_store();
    let roles = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&roles);
    let subscription = store.subscribe(move |notification| {
        sink.lock()
            .unwrap()
            .push((notification.context, notification.changes.inserted.len()));
    });

    assert_eq!(
        save_blocking(&store, |context| context.insert(&User::new("Ivy"))),
        SaveStatus::Saved
    );
    assert_eq!(
        roles.lock().unwrap().as_slice(),
        &[(ContextRole::Writer, 1), (ContextRole::Reader, 1)]
    );

    drop(subscription);
    assert_eq!(
        save_blocking(&store, |context| context.insert(&User::new("Jon"))),
        SaveStatus::Saved
    );
    assert_eq!(roles.lock().unwrap().len(), 2);
}

#[test]
fn records_staged_on_the_reader_are_validated() {
    let store = memory_store();
    let reader = store.reader_context();

    let err = reader
        .insert(&MistypedUser { id: Uuid::new_v4() })
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert!(!reader.has_changes());

    let bob = User::new("Bob");
    reader.insert(&bob).unwrap();
    let err = reader.update(&MistypedUser { id: bob.id }).unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));

    assert_eq!(save_blocking(&store, |_| Ok(())), SaveStatus::Saved);
    assert_eq!(
        store.reader_context().fetch::<User, _>(|_| true, &[]).unwrap(),
        vec![bob]
    );
}

#[test]
fn deleted_id_can_be_reused_by_another_entity() {
    let schema = ModelSchema::from_json(ACCOUNTS_WITH_BADGES).unwrap();
    let store = StoreHandle::open_in_memory(schema, &secrets()).unwrap();
    let user = User::new("Kim");
    let id = user.id;
    assert_eq!(
        save_blocking(&store, move |context| context.insert(&user)),
        SaveStatus::Saved
    );

    let badge = Badge {
        id,
        label: "gold".to_string(),
    };
    let staged = badge.clone();
    let status = save_blocking(&store, move |context| {
        context.delete::<User>(id)?;
        context.insert(&staged)
    });
    assert_eq!(status, SaveStatus::Saved);
    assert!(!store.reader_context().has_changes());

    let reader = store.reader_context();
    assert_eq!(reader.get::<User>(id).unwrap(), None);
    assert_eq!(reader.get::<Badge>(id).unwrap(), Some(badge));

    assert_eq!(
        save_blocking(&store, |context| context.insert(&User::new("Lee"))),
        SaveStatus::Saved
    );
    assert_eq!(reader.count::<User, _>(|_| true).unwrap(), 1);
}

#[test]
fn concurrent_saves_commit_whole_batches_in_issue_order() {
    const THREADS: usize = 4;
    const SAVES_PER_THREAD: usize = 3;
    const BATCH: usize = 5;

    let store = memory_store();
    let batches = Arc::new(Mutex::new(Vec::<Vec<String>>::new()));
    let sink = Arc::clone(&batches);
    let _subscription = store.subscribe(move |notification| {
        if notification.context != ContextRole::Writer {
            return;
        }
        let names = notification
            .changes
            .inserted
            .values()
            .map(|record| record.text("name").unwrap_or_default().to_string())
            .collect();
        sink.lock().unwrap().push(names);
    });

    let recorder = StatusRecorder::default();
    let workers = (0..THREADS)
        .map(|thread_index| {
            let store = store.clone();
            let recorder = recorder.clone();
            thread::spawn(move || {
                let mode = if thread_index % 2 == 0 {
                    SaveMode::Background
                } else {
                    SaveMode::Blocking
                };
                for save_index in 0..SAVES_PER_THREAD {
                    store.save(
                        mode,
                        move |context| {
                            for item in 0..BATCH {
                                let name = format!("{thread_index}/{save_index}/{item}");
                                context.insert(&User::new(&name))?;
                                thread::yield_now();
                            }
                            Ok(())
                        },
                        recorder.callback(),
                    );
                }
            })
        })
        .collect::<Vec<_>>();

    let statuses = recorder.wait_for(&store, THREADS * SAVES_PER_THREAD);
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(statuses.iter().all(|status| *status == SaveStatus::Saved));

    let batches = batches.lock().unwrap().clone();
    assert_eq!(batches.len(), THREADS * SAVES_PER_THREAD);

    let mut committed_per_thread = vec![Vec::new(); THREADS];
    for names in &batches {
        assert_eq!(names.len(), BATCH);
        let origins = names
            .iter()
            .map(|name| {
                let mut parts = name.split('/').map(|part| part.parse::<usize>().unwrap());
                (parts.next().unwrap(), parts.next().unwrap())
            })
            .collect::<Vec<_>>();
        assert!(
            origins.iter().all(|origin| *origin == origins[0]),
            "writer commit mixed saves: {names:?}"
        );
        let (thread_index, save_index) = origins[0];
        committed_per_thread[thread_index].push(save_index);
    }
    for saves in committed_per_thread {
        assert_eq!(saves, (0..SAVES_PER_THREAD).collect::<Vec<_>>());
    }

    assert!(!store.writer_context().has_changes());
    assert!(!store.reader_context().has_changes());
    assert_eq!(
        store.reader_context().count::<User, _>(|_| true).unwrap(),
        THREADS * SAVES_PER_THREAD * BATCH
    );
}

#[test]
fn writer_changes_staged_outside_a_save_commit_with_the_next_save() {
    let store = memory_store();
    store.writer_context().insert(&User::new("Stray")).unwrap();
    assert!(store.writer_context().has_changes());

    assert_eq!(
        save_blocking(&store, |context| context.insert(&User::new("Main"))),
        SaveStatus::Saved
    );
    assert!(!store.writer_context().has_changes());
    assert_eq!(
        store.reader_context().count::<User, _>(|_| true).unwrap(),
        2
    );
}
