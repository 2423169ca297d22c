use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, info};
use ulid::Ulid;

use crate::engine::Engine;
use crate::notify::AppointmentEvent;

/// Tracks which upcoming appointments already had their reminder published.
#[derive(Debug)]
pub struct ReminderSweeper {
    lead: chrono::Duration,
    /// Reminded appointment → its start, so entries can be dropped once it passes.
    reminded: HashMap<Ulid, NaiveDateTime>,
}

impl ReminderSweeper {
    pub fn new(lead: chrono::Duration) -> Self {
        Self {
            lead,
            reminded: HashMap::new(),
        }
    }

    /// Publish `ReminderDue` for every scheduled appointment starting within
    /// the lead window that has not been reminded yet. Returns how many went out.
    pub async fn sweep(&mut self, engine: &Engine) -> usize {
        let now = engine.clock().now();
        self.reminded.retain(|_, starts_at| *starts_at >= now);

        let due = engine.active_in_window(now, now + self.lead).await;
        let mut sent = 0;
        for appointment in due {
            // A rescheduled appointment gets a fresh reminder for its new time.
            if self.reminded.get(&appointment.id) == Some(&appointment.starts_at()) {
                continue;
            }
            self.reminded.insert(appointment.id, appointment.starts_at());
            debug!("reminder due for {} at {}", appointment.id, appointment.starts_at());
            engine.notify.publish(AppointmentEvent::ReminderDue { appointment });
            sent += 1;
        }
        if sent > 0 {
            metrics::counter!(crate::observability::REMINDERS_SENT_TOTAL).increment(sent as u64);
            info!("published {sent} appointment reminders");
        }
        sent
    }
}

/// Background task that publishes appointment reminders every `interval`.
pub async fn run_reminders(engine: Arc<Engine>, interval: Duration, lead: chrono::Duration) {
    let mut sweeper = ReminderSweeper::new(lead);
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        sweeper.sweep(&engine).await;
    }
}

/// Background task that compacts the journal once it has grown past
/// `threshold` appends.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let appends = engine.journal_appends_since_compact().await;
        if appends < threshold {
            debug!("compactor skip: {appends} appends since last compaction");
            continue;
        }
        match engine.compact_journal().await {
            Ok(()) => info!("compacted journal after {appends} appends"),
            Err(e) => tracing::error!("journal compaction failed: {e}"),
        }
    }
}
