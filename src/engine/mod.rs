mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{available_cabinets, available_slots, booked_slots, day_overview};
pub use conflict::{Candidate, ConflictKind, ConflictReport, check_conflict};
pub use error::EngineError;
pub use mutations::{AppointmentPatch, BookingRequest};
pub use queries::ListFilter;
pub use slots::{Schedule, SlotGrid, generate_slots};
pub use store::{InMemoryStore, SharedDay};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::Clock;
use crate::directory::Directory;
use crate::journal::Journal;
use crate::limits::MAX_RELOCK_ATTEMPTS;
use crate::model::*;
use crate::notify::NotifyHub;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the journal. Appends that arrive while a batch is being collected
/// share one fsync; other commands are handled after the pending batch flushes.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            JournalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut journal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(JournalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut journal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut journal, cmd);
        }
    }
}

fn flush_and_respond(journal: &mut Journal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = journal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so the half-written batch does not
    // leak into the next one.
    let flushed = journal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let result = Journal::write_snapshot(journal.path(), &events)
                .and_then(|()| journal.install_snapshot());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { .. } => {}
    }
}

async fn append_event(journal_tx: &mpsc::Sender<JournalCommand>, event: Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    journal_tx
        .send(JournalCommand::Append { event, response: tx })
        .await
        .map_err(|_| EngineError::Store("journal writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::Store("journal writer dropped response".into()))?
        .map_err(|e| EngineError::Store(e.to_string()))
}

/// What an engine needs from outside the scheduling core.
#[derive(Clone)]
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub directory: Arc<dyn Directory>,
    pub notify: Arc<NotifyHub>,
}

/// Scheduling engine for one clinic.
pub struct Engine {
    pub(super) store: Arc<InMemoryStore>,
    pub(super) schedule: Schedule,
    pub(super) journal_tx: mpsc::Sender<JournalCommand>,
    /// Mutations hold it shared from first lock to last write; compaction
    /// takes it exclusively so no append can slip in behind the snapshot.
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) directory: Arc<dyn Directory>,
}

impl Engine {
    /// Replay the journal at `journal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(journal_path: PathBuf, schedule: Schedule, collaborators: Collaborators) -> io::Result<Self> {
        let replay = Journal::replay(&journal_path)?;
        let journal = Journal::open(&journal_path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let engine = Self {
            store: Arc::new(InMemoryStore::new()),
            schedule,
            journal_tx,
            commit_gate: Arc::new(RwLock::new(())),
            notify: collaborators.notify,
            clock: collaborators.clock,
            directory: collaborators.directory,
        };

        // Sole owner of every day lock here, so try_write never contends.
        for event in &replay.events {
            let (first, second) = event.days();
            for date in std::iter::once(first).chain(second) {
                let day = engine.store.day(date);
                let mut guard = day
                    .try_write()
                    .map_err(|_| io::Error::other("replay: day unexpectedly locked"))?;
                engine.store.apply_event(&mut guard, event);
            }
        }
        if !replay.events.is_empty() {
            tracing::info!(
                "replayed {} journal events: {} appointments over {} days",
                replay.events.len(),
                engine.store.appointment_count(),
                engine.store.day_count()
            );
        }

        Ok(engine)
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    async fn journal_request<T>(
        &self,
        cmd: JournalCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, EngineError> {
        self.journal_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::Store("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Store("journal writer dropped response".into()))
    }

    /// Shared hold on the commit gate, taken before any day lock.
    pub(super) async fn enter_commit(&self) -> OwnedRwLockReadGuard<()> {
        self.commit_gate.clone().read_owned().await
    }

    /// Journal `event`, then apply it to every day in `days`.
    ///
    /// The write runs on its own task that owns the gate and day guards, so
    /// it completes even if the caller is dropped while waiting on the fsync.
    /// Memory is untouched if the journal write fails.
    pub(super) async fn persist_and_apply(
        &self,
        event: Event,
        gate: OwnedRwLockReadGuard<()>,
        mut days: Vec<OwnedRwLockWriteGuard<DayState>>,
    ) -> Result<(), EngineError> {
        let store = self.store.clone();
        let journal_tx = self.journal_tx.clone();
        let commit = tokio::spawn(async move {
            let _gate = gate;
            append_event(&journal_tx, event.clone()).await?;
            for day in days.iter_mut() {
                store.apply_event(day, &event);
            }
            Ok::<(), EngineError>(())
        });
        commit
            .await
            .map_err(|e| EngineError::Store(format!("commit task failed: {e}")))?
    }

    /// Write-lock `a` and `b` (which may be equal) in date order. The first
    /// guard returned is always `a`'s.
    pub(super) async fn lock_days(
        &self,
        a: NaiveDate,
        b: NaiveDate,
    ) -> (OwnedRwLockWriteGuard<DayState>, Option<OwnedRwLockWriteGuard<DayState>>) {
        if a == b {
            return (self.store.day(a).write_owned().await, None);
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let lo_guard = self.store.day(lo).write_owned().await;
        let hi_guard = self.store.day(hi).write_owned().await;
        if a < b {
            (lo_guard, Some(hi_guard))
        } else {
            (hi_guard, Some(lo_guard))
        }
    }

    /// Write-lock the day currently holding `id`, and `target` too if it is a
    /// different day. Retries when the appointment moved while we waited.
    pub(super) async fn lock_appointment(
        &self,
        id: Ulid,
        target: Option<NaiveDate>,
    ) -> Result<(OwnedRwLockWriteGuard<DayState>, Option<OwnedRwLockWriteGuard<DayState>>), EngineError> {
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let current = self
                .store
                .day_of(&id)
                .ok_or(EngineError::NotFound("appointment", id))?;
            let guards = self.lock_days(current, target.unwrap_or(current)).await;
            if guards.0.get(id).is_some() {
                return Ok(guards);
            }
        }
        Err(EngineError::NotFound("appointment", id))
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        self.journal_request(JournalCommand::AppendsSinceCompact { response: tx }, rx)
            .await
            .unwrap_or(0)
    }

    /// Rewrite the journal as one booking per stored appointment.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();
        for date in self.store.dates() {
            let Some(day) = self.store.get_day(&date) else {
                continue;
            };
            let guard = day.read().await;
            events.extend(guard.appointments.iter().map(|a| Event::AppointmentBooked {
                appointment: a.clone(),
            }));
        }
        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.journal_request(JournalCommand::Compact { events, response: tx }, rx)
            .await?
            .map_err(|e| EngineError::Store(e.to_string()))?;
        tracing::info!("journal compacted to {count} appointments");
        Ok(())
    }
}
