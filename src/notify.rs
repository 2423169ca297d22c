use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{Appointment, FieldChange};

const CHANNEL_CAPACITY: usize = 256;

/// Outbound scheduling events consumed by the notification side (email/SMS).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum AppointmentEvent {
    Created {
        appointment: Appointment,
    },
    Updated {
        appointment: Appointment,
        changes: Vec<FieldChange>,
    },
    Cancelled {
        appointment: Appointment,
    },
    ReminderDue {
        appointment: Appointment,
    },
}

impl AppointmentEvent {
    pub fn label(&self) -> &'static str {
        match self {
            AppointmentEvent::Created { .. } => "created",
            AppointmentEvent::Updated { .. } => "updated",
            AppointmentEvent::Cancelled { .. } => "cancelled",
            AppointmentEvent::ReminderDue { .. } => "reminder_due",
        }
    }

    pub fn appointment(&self) -> &Appointment {
        match self {
            AppointmentEvent::Created { appointment }
            | AppointmentEvent::Updated { appointment, .. }
            | AppointmentEvent::Cancelled { appointment }
            | AppointmentEvent::ReminderDue { appointment } => appointment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notification delivery failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// A delivery channel (mailer, SMS gateway, ...). Failures are logged by the hub
/// and never reach the booking that triggered them.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, event: &AppointmentEvent) -> Result<(), NotifyError>;
}

/// Sink that only writes the event to the log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &AppointmentEvent) -> Result<(), NotifyError> {
        let a = event.appointment();
        tracing::info!(
            "notify {}: appointment {} for patient {} with {} on {} {} ({})",
            event.label(),
            a.id,
            a.patient_name,
            a.provider_name,
            a.date,
            a.time_slot,
            a.cabinet
        );
        Ok(())
    }
}

/// Fan-out point for appointment events: an in-process broadcast channel plus
/// the registered delivery sinks, each driven on its own task.
pub struct NotifyHub {
    sender: broadcast::Sender<AppointmentEvent>,
    sinks: DashMap<String, Arc<dyn NotificationSink>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            sinks: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppointmentEvent> {
        self.sender.subscribe()
    }

    /// Register a sink; a sink with the same name is replaced.
    pub fn register(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks.insert(sink.name().to_string(), sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Fire-and-forget. Never blocks, never fails.
    pub fn publish(&self, event: AppointmentEvent) {
        let _ = self.sender.send(event.clone());

        let sinks: Vec<Arc<dyn NotificationSink>> =
            self.sinks.iter().map(|e| e.value().clone()).collect();
        if sinks.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no runtime to deliver {} notification", event.label());
            return;
        };
        let event = Arc::new(event);
        for sink in sinks {
            let event = event.clone();
            handle.spawn(async move {
                if let Err(e) = sink.deliver(&event).await {
                    tracing::warn!(
                        "sink {} failed for {} of appointment {}: {e}",
                        sink.name(),
                        event.label(),
                        event.appointment().id
                    );
                    metrics::counter!(
                        crate::observability::NOTIFICATION_FAILURES_TOTAL,
                        "sink" => sink.name().to_string()
                    )
                    .increment(1);
                }
            });
        }
    }
}
