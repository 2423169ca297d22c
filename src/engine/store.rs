use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedDay = Arc<RwLock<DayState>>;

/// Day-partitioned appointment state plus an id → day index.
///
/// Each day sits behind its own lock; that lock is what serializes
/// check-then-write for every slot on the day.
pub struct InMemoryStore {
    days: DashMap<NaiveDate, SharedDay>,
    appointment_day: DashMap<Ulid, NaiveDate>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            days: DashMap::new(),
            appointment_day: DashMap::new(),
        }
    }

    // ── Days ────────────────────────────────────────────────────

    pub fn day_count(&self) -> usize {
        self.days.len()
    }

    pub fn get_day(&self, date: &NaiveDate) -> Option<SharedDay> {
        self.days.get(date).map(|e| e.value().clone())
    }

    /// The day's shared state, created empty on first touch.
    pub fn day(&self, date: NaiveDate) -> SharedDay {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))))
            .value()
            .clone()
    }

    /// Known days in calendar order.
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self.days.iter().map(|e| *e.key()).collect();
        dates.sort();
        dates
    }

    // ── Appointment index ───────────────────────────────────────

    pub fn day_of(&self, id: &Ulid) -> Option<NaiveDate> {
        self.appointment_day.get(id).map(|e| *e.value())
    }

    pub fn appointment_count(&self) -> usize {
        self.appointment_day.len()
    }

    // ── Event application ──────────────────────────────────────

    /// Apply the part of `event` that concerns `day`. Cross-day revisions are
    /// applied by calling this once for each of the two days.
    pub fn apply_event(&self, day: &mut DayState, event: &Event) {
        match event {
            Event::AppointmentBooked { appointment } => {
                if appointment.date == day.date {
                    self.appointment_day.insert(appointment.id, day.date);
                    day.insert(appointment.clone());
                }
            }
            Event::AppointmentRevised {
                previous_date,
                appointment,
            } => {
                if *previous_date == day.date {
                    day.remove(appointment.id);
                }
                if appointment.date == day.date {
                    self.appointment_day.insert(appointment.id, day.date);
                    day.insert(appointment.clone());
                }
            }
            Event::AppointmentDeleted { id, date } => {
                if *date == day.date {
                    day.remove(*id);
                    self.appointment_day.remove(id);
                }
            }
        }
    }
}
