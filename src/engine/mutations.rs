use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use tracing::info;
use ulid::Ulid;

use crate::auth::{Actor, ensure_owner_or_staff, ensure_patient, ensure_staff};
use crate::limits::*;
use crate::model::*;
use crate::notify::AppointmentEvent;

use super::availability::available_cabinets;
use super::conflict::{Candidate, ensure_no_conflict, ensure_not_past, no_free_cabinet, validate_notes};
use super::{Engine, EngineError};

/// Body of a booking request. Everything is optional on the wire so that
/// missing fields come back as one validation error listing all of them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub patient_id: Option<Ulid>,
    #[serde(alias = "dentistId")]
    pub provider_id: Option<Ulid>,
    pub date: Option<String>,
    pub time_slot: Option<String>,
    pub cabinet: Option<u8>,
    #[serde(rename = "type")]
    pub kind: Option<AppointmentType>,
    pub notes: Option<String>,
}

/// Partial update. Absent fields keep their stored value; an empty `notes`
/// clears the notes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentPatch {
    pub patient_id: Option<Ulid>,
    #[serde(alias = "dentistId")]
    pub provider_id: Option<Ulid>,
    pub date: Option<String>,
    pub time_slot: Option<String>,
    pub cabinet: Option<u8>,
    #[serde(rename = "type")]
    pub kind: Option<AppointmentType>,
    pub notes: Option<String>,
    pub status: Option<AppointmentStatus>,
}

/// A validated booking request.
struct Draft {
    patient_id: Ulid,
    provider_id: Ulid,
    date: NaiveDate,
    time_slot: SlotTime,
    cabinet: Option<Cabinet>,
    kind: AppointmentType,
    notes: Option<String>,
}

fn display_name(raw: String) -> String {
    if raw.chars().count() > MAX_NAME_LEN {
        raw.chars().take(MAX_NAME_LEN).collect()
    } else {
        raw
    }
}

/// Shared by the cancel endpoint and status patches.
fn ensure_cancellable(current: &Appointment, now: NaiveDateTime) -> Result<(), EngineError> {
    if current.starts_at() < now {
        return Err(EngineError::InvalidState(format!(
            "appointment {} has already started",
            current.id
        )));
    }
    Ok(())
}

fn change(field: &'static str, from: impl ToString, to: impl ToString) -> FieldChange {
    FieldChange {
        field,
        from: from.to_string(),
        to: to.to_string(),
    }
}

impl Engine {
    /// Staff booking on behalf of a patient. Every field but `type` and
    /// `notes` is required.
    pub async fn create_appointment(
        &self,
        actor: &Actor,
        request: BookingRequest,
    ) -> Result<Appointment, EngineError> {
        ensure_staff(actor)?;
        let draft = self.draft(request, true)?;
        let appointment = self.book(draft).await?;
        metrics::counter!(crate::observability::APPOINTMENTS_BOOKED_TOTAL, "source" => "staff")
            .increment(1);
        Ok(appointment)
    }

    /// Patient self-service booking. The patient is always the caller; a
    /// missing cabinet is filled with the first free one.
    pub async fn book_for_patient(
        &self,
        actor: &Actor,
        mut request: BookingRequest,
    ) -> Result<Appointment, EngineError> {
        ensure_patient(actor)?;
        if let Some(pid) = request.patient_id
            && pid != actor.id
        {
            return Err(EngineError::Forbidden(
                "patients can only book for themselves".into(),
            ));
        }
        request.patient_id = Some(actor.id);
        let draft = self.draft(request, false)?;
        let appointment = self.book(draft).await?;
        metrics::counter!(crate::observability::APPOINTMENTS_BOOKED_TOTAL, "source" => "patient")
            .increment(1);
        Ok(appointment)
    }

    fn draft(&self, request: BookingRequest, cabinet_required: bool) -> Result<Draft, EngineError> {
        let mut missing = Vec::new();
        if request.patient_id.is_none() {
            missing.push("patientId");
        }
        if request.provider_id.is_none() {
            missing.push("dentistId");
        }
        if request.date.as_deref().is_none_or(|d| d.trim().is_empty()) {
            missing.push("date");
        }
        if request.time_slot.as_deref().is_none_or(|t| t.trim().is_empty()) {
            missing.push("timeSlot");
        }
        if cabinet_required && request.cabinet.is_none() {
            missing.push("cabinet");
        }
        let (Some(patient_id), Some(provider_id), Some(date), Some(time_slot)) = (
            request.patient_id,
            request.provider_id,
            request.date,
            request.time_slot,
        ) else {
            return Err(EngineError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        };
        if !missing.is_empty() {
            return Err(EngineError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        let date = parse_date(&date).map_err(EngineError::Validation)?;
        let time_slot: SlotTime = time_slot.parse().map_err(EngineError::Validation)?;
        self.schedule.check_slot(time_slot)?;
        let cabinet = request.cabinet.map(Cabinet);
        if let Some(c) = cabinet {
            self.schedule.check_cabinet(c)?;
        }

        Ok(Draft {
            patient_id,
            provider_id,
            date,
            time_slot,
            cabinet,
            kind: request.kind.unwrap_or_default(),
            notes: validate_notes(request.notes)?,
        })
    }

    async fn patient_name(&self, id: Ulid) -> Result<String, EngineError> {
        let profile = self
            .directory
            .patient(id)
            .await
            .ok_or(EngineError::NotFound("patient", id))?;
        Ok(display_name(profile.name))
    }

    async fn provider_name(&self, id: Ulid) -> Result<String, EngineError> {
        let profile = self
            .directory
            .provider(id)
            .await
            .ok_or(EngineError::NotFound("provider", id))?;
        Ok(display_name(profile.name))
    }

    async fn book(&self, draft: Draft) -> Result<Appointment, EngineError> {
        ensure_not_past(self.clock.now(), draft.date, draft.time_slot)?;
        let patient_name = self.patient_name(draft.patient_id).await?;
        let provider_name = self.provider_name(draft.provider_id).await?;

        let gate = self.enter_commit().await;
        let day = self.store.day(draft.date).write_owned().await;
        if day.active().count() >= MAX_APPOINTMENTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many appointments on this day"));
        }

        let candidate = Candidate {
            date: draft.date,
            time_slot: draft.time_slot,
            patient_id: Some(draft.patient_id),
            provider_id: Some(draft.provider_id),
            cabinet: draft.cabinet,
        };
        ensure_no_conflict(&day, &candidate, None)?;
        let cabinet = match draft.cabinet {
            Some(c) => c,
            None => {
                let free = available_cabinets(&day, &self.schedule, draft.time_slot);
                free.first()
                    .copied()
                    .ok_or_else(|| no_free_cabinet(draft.date, draft.time_slot))?
            }
        };

        let now = self.clock.now();
        let appointment = Appointment {
            id: Ulid::new(),
            patient_id: draft.patient_id,
            patient_name,
            provider_id: draft.provider_id,
            provider_name,
            date: draft.date,
            time_slot: draft.time_slot,
            cabinet,
            kind: draft.kind,
            status: AppointmentStatus::Scheduled,
            notes: draft.notes,
            created_at: now,
            updated_at: now,
        };
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(event, gate, vec![day]).await?;

        info!(
            "booked {} for patient {} with {} on {} {} in {}",
            appointment.id,
            appointment.patient_id,
            appointment.provider_name,
            appointment.date,
            appointment.time_slot,
            appointment.cabinet
        );
        self.notify.publish(AppointmentEvent::Created {
            appointment: appointment.clone(),
        });
        Ok(appointment)
    }

    /// Staff edit. Any change to where, when or who is re-checked against the
    /// target day, ignoring the appointment's own current booking.
    pub async fn update_appointment(
        &self,
        actor: &Actor,
        id: Ulid,
        patch: AppointmentPatch,
    ) -> Result<Appointment, EngineError> {
        ensure_staff(actor)?;
        let date = patch
            .date
            .as_deref()
            .map(parse_date)
            .transpose()
            .map_err(EngineError::Validation)?;
        let time_slot = patch
            .time_slot
            .as_deref()
            .map(str::parse::<SlotTime>)
            .transpose()
            .map_err(EngineError::Validation)?;
        if let Some(slot) = time_slot {
            self.schedule.check_slot(slot)?;
        }
        let cabinet = patch.cabinet.map(Cabinet);
        if let Some(c) = cabinet {
            self.schedule.check_cabinet(c)?;
        }
        // Outer None: leave notes alone. Inner None: clear them.
        let notes = patch.notes.map(|n| validate_notes(Some(n))).transpose()?;
        let patient = match patch.patient_id {
            Some(pid) => Some((pid, self.patient_name(pid).await?)),
            None => None,
        };
        let provider = match patch.provider_id {
            Some(pid) => Some((pid, self.provider_name(pid).await?)),
            None => None,
        };

        let gate = self.enter_commit().await;
        let (source, target) = self.lock_appointment(id, date).await?;
        let current = source
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound("appointment", id))?;
        if current.status != AppointmentStatus::Scheduled {
            return Err(EngineError::InvalidState(format!(
                "appointment {id} is {} and can no longer be changed",
                current.status
            )));
        }

        let mut next = current.clone();
        let mut changes = Vec::new();
        if let Some(d) = date
            && d != next.date
        {
            changes.push(change("date", next.date, d));
            next.date = d;
        }
        if let Some(slot) = time_slot
            && slot != next.time_slot
        {
            changes.push(change("timeSlot", next.time_slot, slot));
            next.time_slot = slot;
        }
        if let Some(c) = cabinet
            && c != next.cabinet
        {
            changes.push(change("cabinet", next.cabinet, c));
            next.cabinet = c;
        }
        if let Some((pid, name)) = patient
            && pid != next.patient_id
        {
            changes.push(change("patient", &next.patient_name, &name));
            next.patient_id = pid;
            next.patient_name = name;
        }
        if let Some((pid, name)) = provider
            && pid != next.provider_id
        {
            changes.push(change("dentist", &next.provider_name, &name));
            next.provider_id = pid;
            next.provider_name = name;
        }
        if let Some(kind) = patch.kind
            && kind != next.kind
        {
            changes.push(change("type", next.kind, kind));
            next.kind = kind;
        }
        if let Some(notes) = notes
            && notes != next.notes
        {
            changes.push(change(
                "notes",
                next.notes.as_deref().unwrap_or_default(),
                notes.as_deref().unwrap_or_default(),
            ));
            next.notes = notes;
        }
        if let Some(status) = patch.status
            && status != next.status
        {
            if status == AppointmentStatus::Cancelled {
                ensure_cancellable(&current, self.clock.now())?;
            }
            if !next.status.can_transition_to(status) {
                return Err(EngineError::InvalidState(format!(
                    "cannot move appointment from {} to {status}",
                    next.status
                )));
            }
            changes.push(change("status", next.status, status));
            next.status = status;
        }

        if changes.is_empty() {
            return Ok(current);
        }

        let moved = next.date != current.date || next.time_slot != current.time_slot;
        let reassigned = moved
            || next.cabinet != current.cabinet
            || next.patient_id != current.patient_id
            || next.provider_id != current.provider_id;
        let now = self.clock.now();
        if moved {
            ensure_not_past(now, next.date, next.time_slot)?;
        }
        if reassigned && next.is_active() {
            let day: &DayState = target.as_deref().unwrap_or(&*source);
            ensure_no_conflict(day, &Candidate::for_appointment(&next), Some(id))?;
        }

        next.updated_at = now;
        let event = Event::AppointmentRevised {
            previous_date: current.date,
            appointment: next.clone(),
        };
        let mut days = vec![source];
        days.extend(target);
        self.persist_and_apply(event, gate, days).await?;

        info!(
            "updated {id}: {}",
            changes.iter().map(|c| c.field).collect::<Vec<_>>().join(", ")
        );
        let published = if next.status == AppointmentStatus::Cancelled {
            AppointmentEvent::Cancelled {
                appointment: next.clone(),
            }
        } else {
            AppointmentEvent::Updated {
                appointment: next.clone(),
                changes,
            }
        };
        self.notify.publish(published);
        Ok(next)
    }

    /// Cancel a scheduled appointment that has not started yet. Patients may
    /// cancel their own; staff may cancel any.
    pub async fn cancel_appointment(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        let cancelled = self
            .set_status(id, AppointmentStatus::Cancelled, |current, now| {
                ensure_owner_or_staff(actor, current.patient_id)?;
                ensure_cancellable(current, now)
            })
            .await?;
        info!("cancelled {id} by {} {}", actor.role, actor.id);
        self.notify.publish(AppointmentEvent::Cancelled {
            appointment: cancelled.clone(),
        });
        Ok(cancelled)
    }

    /// Staff mark a scheduled appointment as done.
    pub async fn complete_appointment(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        ensure_staff(actor)?;
        let completed = self
            .set_status(id, AppointmentStatus::Completed, |_, _| Ok(()))
            .await?;
        info!("completed {id}");
        self.notify.publish(AppointmentEvent::Updated {
            appointment: completed.clone(),
            changes: vec![change(
                "status",
                AppointmentStatus::Scheduled,
                AppointmentStatus::Completed,
            )],
        });
        Ok(completed)
    }

    async fn set_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
        check: impl FnOnce(&Appointment, NaiveDateTime) -> Result<(), EngineError>,
    ) -> Result<Appointment, EngineError> {
        let gate = self.enter_commit().await;
        let (day, _) = self.lock_appointment(id, None).await?;
        let current = day
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound("appointment", id))?;
        let now = self.clock.now();
        check(&current, now)?;
        if !current.status.can_transition_to(status) {
            return Err(EngineError::InvalidState(format!(
                "appointment {id} is already {}",
                current.status
            )));
        }

        let mut next = current;
        next.status = status;
        next.updated_at = now;
        let event = Event::AppointmentRevised {
            previous_date: next.date,
            appointment: next.clone(),
        };
        self.persist_and_apply(event, gate, vec![day]).await?;
        Ok(next)
    }

    /// Hard delete. Staff only; the appointment is gone from every view.
    pub async fn delete_appointment(&self, actor: &Actor, id: Ulid) -> Result<Appointment, EngineError> {
        ensure_staff(actor)?;
        let gate = self.enter_commit().await;
        let (day, _) = self.lock_appointment(id, None).await?;
        let removed = day
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound("appointment", id))?;
        let event = Event::AppointmentDeleted {
            id,
            date: removed.date,
        };
        self.persist_and_apply(event, gate, vec![day]).await?;
        info!("deleted {id} ({} {})", removed.date, removed.time_slot);
        Ok(removed)
    }
}
