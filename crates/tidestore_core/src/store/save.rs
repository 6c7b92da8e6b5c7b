//! Cascading save pipeline.
//!
//! # Responsibility
//! - Run a caller's mutation on the writer under the store write lock.
//! - Commit writer changes into the reader, then reader changes to disk.
//! - Report exactly one `SaveStatus` per save on the foreground.
//!
//! # Invariants
//! - The write lock is held from mutation through the writer commit and is
//!   released before the writer notification goes out.
//! - A failed writer commit discards the writer's changes and leaves the
//!   reader untouched.
//! - A failed reader commit keeps the reader's pending changes; they stay
//!   visible through the reader and are retried by the next save.

use super::context::{merge_into, Context};
use super::executor::{BackgroundJob, ForegroundJob};
use super::handle::StoreInner;
use super::notify::ChangeNotification;
use super::{ContextRole, SaveMode, SaveStatus, StoreError, StoreResult};
use crate::model::change::ChangeSet;
use log::{debug, error, info, warn};
use std::sync::mpsc;
use std::sync::{Arc, PoisonError};
use std::time::Instant;

pub(crate) type Mutation = Box<dyn FnOnce(&Context) -> StoreResult<()> + Send + 'static>;
pub(crate) type Completion = Box<dyn FnOnce(SaveStatus) + Send + 'static>;

enum WriterOutcome {
    Finished(SaveStatus),
    CommitReader,
}

pub(crate) fn run(store: &Arc<StoreInner>, mode: SaveMode, mutate: Mutation, on_complete: Completion) {
    match mode {
        SaveMode::Background => run_background(store, mutate, on_complete),
        SaveMode::Blocking => run_blocking(store, mutate, on_complete),
    }
}

fn run_background(store: &Arc<StoreInner>, mutate: Mutation, on_complete: Completion) {
    let started_at = Instant::now();
    let task_store = Arc::clone(store);
    let job: BackgroundJob = Box::new(move || {
        let outcome = writer_phase(&task_store, mutate);
        task_store
            .foreground
            .post(finish(outcome, SaveMode::Background, started_at, on_complete));
    });

    if let Err(job) = store.worker.submit(job) {
        warn!(
            "event=save module=store status=error mode=background error_code=worker_unavailable fallback=inline"
        );
        job();
    }
}

fn run_blocking(store: &Arc<StoreInner>, mutate: Mutation, on_complete: Completion) {
    let started_at = Instant::now();
    let outcome = writer_phase(store, mutate);
    let job = finish(outcome, SaveMode::Blocking, started_at, on_complete);

    if store.foreground.is_current() {
        job(store.as_ref());
        return;
    }

    let (done_sender, done_receiver) = mpsc::channel::<()>();
    store.foreground.post(Box::new(move |store: &StoreInner| {
        job(store);
        let _ = done_sender.send(());
    }));
    // Returns early only if the store drops the job unrun.
    let _ = done_receiver.recv();
}

/// Mutation, change detection and writer commit.
///
/// The writer notification is published after the write lock is released, so
/// listeners may issue saves of their own.
fn writer_phase(store: &Arc<StoreInner>, mutate: Mutation) -> WriterOutcome {
    let committed = {
        let _guard = store
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match locked_writer_phase(store, mutate) {
            Ok(changes) => changes,
            Err(status) => return WriterOutcome::Finished(status),
        }
    };

    if let Some(changes) = committed {
        store.notifications.publish(&ChangeNotification {
            context: ContextRole::Writer,
            changes,
        });
    }
    WriterOutcome::CommitReader
}

/// Runs under the write lock. Returns the committed writer changes, if any,
/// or the final status when the save ends here.
fn locked_writer_phase(
    store: &Arc<StoreInner>,
    mutate: Mutation,
) -> Result<Option<ChangeSet>, SaveStatus> {
    let writer = Context::new(Arc::clone(store), ContextRole::Writer);
    if let Err(err) = mutate(&writer) {
        let discarded = store.writer.discard();
        warn!(
            "event=save_mutate module=store status=error error_code={} discarded_changes={} error={}",
            err.code(),
            discarded,
            err
        );
        return Err(SaveStatus::RolledBack);
    }

    let writer_has_changes = store.writer.has_changes();
    if !writer_has_changes && !store.reader.has_changes() {
        debug!("event=save module=store status=skip reason=no_changes");
        return Err(SaveStatus::NoChanges);
    }
    if !writer_has_changes {
        return Ok(None);
    }

    commit_writer(store).map(Some).map_err(|err| {
        error!(
            "event=commit module=store status=error context=writer error_code={} error={}",
            err.code(),
            err
        );
        SaveStatus::RolledBack
    })
}

/// Validates writer changes and merges them into the reader.
///
/// The writer is emptied whether or not validation passes.
fn commit_writer(store: &StoreInner) -> StoreResult<ChangeSet> {
    let changes = store.writer.take();
    for record in changes.values().filter_map(|change| change.visible()) {
        store.schema.validate_record(record)?;
    }

    {
        let mut reader = store.reader.lock();
        for change in changes.values() {
            merge_into(&mut reader, change.clone());
        }
    }

    info!(
        "event=commit module=store status=ok context=writer changes={}",
        changes.len()
    );
    Ok(ChangeSet::from_pending(changes.values()))
}

/// Persists the reader's pending changes. Runs on the foreground only.
fn commit_reader(store: &StoreInner) -> SaveStatus {
    let started_at = Instant::now();
    let mut pending = store.reader.lock();
    if pending.is_empty() {
        return SaveStatus::Saved;
    }

    let result = store.repo().apply_changes(&pending);
    match result {
        Ok(()) => {
            let committed = std::mem::take(&mut *pending);
            drop(pending);
            info!(
                "event=commit module=store status=ok context=reader store={} changes={} duration_ms={}",
                store.label(),
                committed.len(),
                started_at.elapsed().as_millis()
            );
            store.notifications.publish(&ChangeNotification {
                context: ContextRole::Reader,
                changes: ChangeSet::from_pending(committed.values()),
            });
            SaveStatus::Saved
        }
        Err(err) => {
            let retained = pending.len();
            drop(pending);
            let err = StoreError::from(err);
            error!(
                "event=commit module=store status=error context=reader store={} retained_changes={} error_code={} error={}",
                store.label(),
                retained,
                err.code(),
                err
            );
            SaveStatus::RolledBack
        }
    }
}

fn finish(
    outcome: WriterOutcome,
    mode: SaveMode,
    started_at: Instant,
    on_complete: Completion,
) -> ForegroundJob {
    Box::new(move |store: &StoreInner| {
        let status = match outcome {
            WriterOutcome::Finished(status) => status,
            WriterOutcome::CommitReader => commit_reader(store),
        };
        info!(
            "event=save module=store status={} mode={} duration_ms={}",
            status.as_str(),
            mode_name(mode),
            started_at.elapsed().as_millis()
        );
        on_complete(status);
    })
}

fn mode_name(mode: SaveMode) -> &'static str {
    match mode {
        SaveMode::Background => "background",
        SaveMode::Blocking => "blocking",
    }
}
