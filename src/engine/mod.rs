mod conflict;
mod error;
mod mutations;
mod policy;
mod queries;

pub use error::EngineError;
pub use mutations::CreateLesson;
pub use queries::ListLessons;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::directory::{CallerRef, UserDirectory};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedDaySchedule = Arc<RwLock<DaySchedule>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The scheduling core: lessons partitioned by calendar date. Each date
/// partition is its own lock, so mutations on different days run in
/// parallel while a day's scan-then-write is serialized.
pub struct Engine {
    pub(super) state: DashMap<NaiveDate, SharedDaySchedule>,
    /// Reverse lookup: lesson id → the date partition holding it.
    pub(super) lesson_to_date: DashMap<Ulid, NaiveDate>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub directory: Arc<dyn UserDirectory>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        directory: Arc<dyn UserDirectory>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            lesson_to_date: DashMap::new(),
            wal_tx,
            notify,
            directory,
        };

        // Replay — we're the sole owner of the partition Arcs here, so
        // try_write always succeeds instantly. Never blocking_write: this
        // may run inside an async context.
        for event in &events {
            engine.replay_apply(event);
        }

        Ok(engine)
    }

    fn replay_apply(&self, event: &Event) {
        match event {
            Event::LessonCreated { lesson } => {
                let day = self.day_entry(lesson.date);
                let mut guard = day.try_write().expect("replay: uncontended write");
                self.lesson_to_date.insert(lesson.id, lesson.date);
                guard.insert_lesson(lesson.clone());
            }
            Event::LessonUpdated {
                id,
                patch,
                updated_at,
            } => {
                let Some(old_date) = self.lesson_to_date.get(id).map(|e| *e.value()) else {
                    return; // lesson vanished earlier in the log
                };
                let old_day = self.day_entry(old_date);
                let mut old_guard = old_day.try_write().expect("replay: uncontended write");
                let Some(mut lesson) = old_guard.remove_lesson(*id) else {
                    return;
                };
                lesson.apply_patch(patch, *updated_at);
                if lesson.date == old_date {
                    old_guard.insert_lesson(lesson);
                } else {
                    drop(old_guard);
                    self.drop_day_if_empty(old_date);
                    let new_day = self.day_entry(lesson.date);
                    let mut new_guard = new_day.try_write().expect("replay: uncontended write");
                    self.lesson_to_date.insert(*id, lesson.date);
                    new_guard.insert_lesson(lesson);
                }
            }
            Event::LessonDeleted { id } => {
                if let Some((_, date)) = self.lesson_to_date.remove(id) {
                    let day = self.day_entry(date);
                    let mut guard = day.try_write().expect("replay: uncontended write");
                    guard.remove_lesson(*id);
                    drop(guard);
                    self.drop_day_if_empty(date);
                }
            }
        }
    }

    /// Get or lazily create the partition for a date.
    pub(super) fn day_entry(&self, date: NaiveDate) -> SharedDaySchedule {
        self.state
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DaySchedule::new(date))))
            .value()
            .clone()
    }

    pub(super) fn day(&self, date: NaiveDate) -> Option<SharedDaySchedule> {
        self.state.get(&date).map(|e| e.value().clone())
    }

    /// Remove an empty partition. Only call without holding its lock.
    pub(super) fn drop_day_if_empty(&self, date: NaiveDate) {
        self.state.remove_if(&date, |_, day| {
            day.try_read().is_ok_and(|g| g.lessons.is_empty())
        });
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Snapshot a lesson by id.
    pub async fn get_lesson(&self, id: &Ulid) -> Option<Lesson> {
        let date = self.lesson_to_date.get(id).map(|e| *e.value())?;
        let day = self.day(date)?;
        let guard = day.read().await;
        guard.get(id).cloned()
    }

    pub fn lesson_count(&self) -> usize {
        self.lesson_to_date.len()
    }

    /// Resolve the caller through the directory collaborator. The fallback
    /// chain (user id, then credential) lives entirely on the other side of
    /// the trait.
    pub(super) async fn resolve_caller(&self, caller: &CallerRef) -> Result<User, EngineError> {
        self.directory
            .resolve(caller)
            .await
            .ok_or(EngineError::NotLoggedIn)
    }
}
