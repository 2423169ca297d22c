use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::clock::Clock;
use crate::directory::Directory;
use crate::engine::{Collaborators, Engine, Schedule};
use crate::limits::*;
use crate::notify::{NotificationSink, NotifyHub};
use crate::sweeper;

/// How every clinic engine is set up.
#[derive(Clone)]
pub struct ClinicSettings {
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub schedule: Schedule,
    pub reminder_interval: Duration,
    pub reminder_lead: chrono::Duration,
    pub clock: Arc<dyn Clock>,
    pub directory: Arc<dyn Directory>,
    /// Registered on each clinic's hub when the clinic is first loaded.
    pub sinks: Vec<Arc<dyn NotificationSink>>,
}

/// Manages per-clinic engines. Each clinic gets its own Engine, journal,
/// reminder sweeper and compactor. The clinic is named by the `X-Clinic` header.
pub struct ClinicManager {
    engines: DashMap<String, Arc<Engine>>,
    settings: ClinicSettings,
}

/// The journal-safe form of a clinic name. This, not the raw header, is the
/// clinic's identity.
fn clinic_key(clinic: &str) -> std::io::Result<String> {
    let safe: String = clinic
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty clinic name",
        ));
    }
    if safe.len() > MAX_CLINIC_NAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "clinic name too long",
        ));
    }
    Ok(safe)
}

impl ClinicManager {
    pub fn new(settings: ClinicSettings) -> Self {
        Self {
            engines: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &ClinicSettings {
        &self.settings
    }

    pub fn clinic_count(&self) -> usize {
        self.engines.len()
    }

    /// Get or lazily load the engine for `clinic`. Names that sanitize to the
    /// same journal file share one engine.
    pub fn get_or_create(&self, clinic: &str) -> std::io::Result<Arc<Engine>> {
        let key = clinic_key(clinic)?;
        if let Some(engine) = self.engines.get(&key) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_CLINICS {
            return Err(std::io::Error::other("too many clinics"));
        }

        // Two requests may race to load the same clinic; the entry lock makes
        // sure only one engine (and one journal writer) exists per clinic.
        let entry = self.engines.entry(key.clone());
        let engine = match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let engine = Arc::new(self.load(&key)?);
                v.insert(engine.clone());
                engine
            }
        };

        let reminder_engine = engine.clone();
        let (interval, lead) = (self.settings.reminder_interval, self.settings.reminder_lead);
        tokio::spawn(async move {
            sweeper::run_reminders(reminder_engine, interval, lead).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.settings.compact_threshold;
        tokio::spawn(async move {
            sweeper::run_compactor(compactor_engine, threshold).await;
        });

        metrics::gauge!(crate::observability::CLINICS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("loaded clinic {key}");
        Ok(engine)
    }

    fn load(&self, safe_name: &str) -> std::io::Result<Engine> {
        let journal_path = self.settings.data_dir.join(format!("{safe_name}.journal"));
        let notify = Arc::new(NotifyHub::new());
        for sink in &self.settings.sinks {
            notify.register(sink.clone());
        }
        let collaborators = Collaborators {
            clock: self.settings.clock.clone(),
            directory: self.settings.directory.clone(),
            notify,
        };
        Engine::new(journal_path, self.settings.schedule, collaborators)
    }
}
