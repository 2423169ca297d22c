use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::auth::{Actor, ensure_owner_or_staff};
use crate::model::*;

use super::availability;
use super::conflict::{Candidate, ConflictReport, check_conflict};
use super::{Engine, EngineError};

/// Narrowing for appointment listings. Unset fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub date: Option<NaiveDate>,
    pub provider_id: Option<Ulid>,
    pub patient_id: Option<Ulid>,
    pub status: Option<AppointmentStatus>,
}

impl ListFilter {
    fn matches(&self, a: &Appointment) -> bool {
        self.date.is_none_or(|d| a.date == d)
            && self.provider_id.is_none_or(|p| a.provider_id == p)
            && self.patient_id.is_none_or(|p| a.patient_id == p)
            && self.status.is_none_or(|s| a.status == s)
    }
}

impl Engine {
    /// Run `f` over a read-locked snapshot of `date`. Days never written to
    /// read as empty.
    async fn read_day<T>(&self, date: NaiveDate, f: impl FnOnce(&DayState) -> T) -> T {
        match self.store.get_day(&date) {
            Some(day) => {
                let guard = day.read().await;
                f(&guard)
            }
            None => f(&DayState::new(date)),
        }
    }

    pub async fn get_appointment(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        let date = self
            .store
            .day_of(&id)
            .ok_or(EngineError::NotFound("appointment", id))?;
        let appointment = self
            .read_day(date, |day| day.get(id).cloned())
            .await
            .ok_or(EngineError::NotFound("appointment", id))?;
        ensure_owner_or_staff(actor, appointment.patient_id)?;
        Ok(appointment)
    }

    /// Appointments matching `filter`, ordered by date, slot, then cabinet.
    /// Patients only ever see their own.
    pub async fn list_appointments(
        &self,
        actor: &Actor,
        mut filter: ListFilter,
    ) -> Result<Vec<Appointment>, EngineError> {
        if !actor.is_staff() {
            if filter.patient_id.is_some_and(|p| p != actor.id) {
                return Err(EngineError::Forbidden(
                    "patients can only list their own appointments".into(),
                ));
            }
            filter.patient_id = Some(actor.id);
        }
        let dates = match filter.date {
            Some(d) => vec![d],
            None => self.store.dates(),
        };
        let mut out = Vec::new();
        for date in dates {
            let matched = self
                .read_day(date, |day| {
                    day.appointments
                        .iter()
                        .filter(|a| filter.matches(a))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .await;
            out.extend(matched);
        }
        Ok(out)
    }

    /// `list_appointments` pinned to the clinic's current date.
    pub async fn todays_appointments(
        &self,
        actor: &Actor,
        filter: ListFilter,
    ) -> Result<Vec<Appointment>, EngineError> {
        let today = self.clock.today();
        self.list_appointments(
            actor,
            ListFilter {
                date: Some(today),
                ..filter
            },
        )
        .await
    }

    pub async fn available_slots(&self, date: NaiveDate, provider_id: Option<Ulid>) -> Vec<SlotTime> {
        self.read_day(date, |day| {
            availability::available_slots(day, &self.schedule, provider_id)
        })
        .await
    }

    pub async fn available_cabinets(&self, date: NaiveDate, slot: SlotTime) -> Result<Vec<Cabinet>, EngineError> {
        self.schedule.check_slot(slot)?;
        Ok(self
            .read_day(date, |day| {
                availability::available_cabinets(day, &self.schedule, slot)
            })
            .await)
    }

    pub async fn booked_slots(&self, date: NaiveDate) -> Vec<BookedSlot> {
        self.read_day(date, availability::booked_slots).await
    }

    /// Free slots, booked slots and (when `slot` is given) free cabinets, all
    /// read under one lock acquisition.
    pub async fn day_overview(
        &self,
        date: NaiveDate,
        provider_id: Option<Ulid>,
        slot: Option<SlotTime>,
    ) -> Result<DayOverview, EngineError> {
        if let Some(s) = slot {
            self.schedule.check_slot(s)?;
        }
        Ok(self
            .read_day(date, |day| {
                availability::day_overview(day, &self.schedule, provider_id, slot)
            })
            .await)
    }

    /// Dry-run conflict check. Nothing is locked beyond the read.
    pub async fn preview_conflict(&self, candidate: Candidate, exclude: Option<Ulid>) -> ConflictReport {
        self.read_day(candidate.date, |day| check_conflict(day, &candidate, exclude))
            .await
    }

    /// Scheduled appointments starting in `[from, to)`, in start order.
    pub async fn active_in_window(&self, from: NaiveDateTime, to: NaiveDateTime) -> Vec<Appointment> {
        let mut out = Vec::new();
        for date in self.store.dates() {
            if date < from.date() || date > to.date() {
                continue;
            }
            let due = self
                .read_day(date, |day| {
                    day.appointments
                        .iter()
                        .filter(|a| a.status == AppointmentStatus::Scheduled)
                        .filter(|a| (from..to).contains(&a.starts_at()))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .await;
            out.extend(due);
        }
        out
    }
}
