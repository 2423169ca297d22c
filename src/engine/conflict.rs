use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    Patient,
    Cabinet,
    Provider,
}

impl ConflictKind {
    pub fn label(self) -> &'static str {
        match self {
            ConflictKind::Patient => "patient",
            ConflictKind::Cabinet => "cabinet",
            ConflictKind::Provider => "provider",
        }
    }
}

/// Outcome of a conflict check. `kind == None` means the slot is clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub has_conflict: bool,
    #[serde(rename = "type")]
    pub kind: Option<ConflictKind>,
    pub message: String,
    pub conflicting_id: Option<Ulid>,
}

impl ConflictReport {
    pub fn clear() -> Self {
        Self {
            has_conflict: false,
            kind: None,
            message: "time slot is available".into(),
            conflicting_id: None,
        }
    }

    fn hit(kind: ConflictKind, existing: &Appointment, message: String) -> Self {
        Self {
            has_conflict: true,
            kind: Some(kind),
            message,
            conflicting_id: Some(existing.id),
        }
    }
}

/// What a booking would occupy. Unset parties are not checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub date: NaiveDate,
    pub time_slot: SlotTime,
    pub patient_id: Option<Ulid>,
    pub provider_id: Option<Ulid>,
    pub cabinet: Option<Cabinet>,
}

impl Candidate {
    pub fn for_appointment(a: &Appointment) -> Self {
        Self {
            date: a.date,
            time_slot: a.time_slot,
            patient_id: Some(a.patient_id),
            provider_id: Some(a.provider_id),
            cabinet: Some(a.cabinet),
        }
    }
}

/// Check a candidate against the active appointments of its day.
///
/// Rules are tried patient → cabinet → provider and the first violation wins,
/// so the same input always reports the same conflict. `exclude` skips the
/// appointment being edited in every rule.
pub fn check_conflict(day: &DayState, candidate: &Candidate, exclude: Option<Ulid>) -> ConflictReport {
    debug_assert_eq!(day.date, candidate.date, "candidate checked against wrong day");
    let date = candidate.date;
    let slot = candidate.time_slot;
    let others = || day.active_at(slot).filter(move |a| Some(a.id) != exclude);

    if let Some(patient_id) = candidate.patient_id
        && let Some(existing) = others().find(|a| a.patient_id == patient_id)
    {
        return ConflictReport::hit(
            ConflictKind::Patient,
            existing,
            format!(
                "patient {} already has an appointment on {date} at {slot}",
                existing.patient_name
            ),
        );
    }

    if let Some(cabinet) = candidate.cabinet
        && let Some(existing) = others().find(|a| a.cabinet == cabinet)
    {
        return ConflictReport::hit(
            ConflictKind::Cabinet,
            existing,
            format!("{cabinet} is already booked on {date} at {slot}"),
        );
    }

    if let Some(provider_id) = candidate.provider_id
        && let Some(existing) = others().find(|a| a.provider_id == provider_id)
    {
        return ConflictReport::hit(
            ConflictKind::Provider,
            existing,
            format!(
                "{} is already seeing a patient on {date} at {slot}",
                existing.provider_name
            ),
        );
    }

    ConflictReport::clear()
}

/// `check_conflict`, turned into an error for the mutation paths.
pub(crate) fn ensure_no_conflict(
    day: &DayState,
    candidate: &Candidate,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let report = check_conflict(day, candidate, exclude);
    match report.kind {
        None => Ok(()),
        Some(kind) => {
            tracing::warn!(
                "{} conflict on {} {}: {}",
                kind.label(),
                candidate.date,
                candidate.time_slot,
                report.message
            );
            metrics::counter!(crate::observability::CONFLICTS_TOTAL, "kind" => kind.label())
                .increment(1);
            Err(EngineError::Conflict(report))
        }
    }
}

/// Self-booking found every cabinet taken at the requested slot.
pub(crate) fn no_free_cabinet(date: NaiveDate, slot: SlotTime) -> EngineError {
    let kind = ConflictKind::Cabinet;
    metrics::counter!(crate::observability::CONFLICTS_TOTAL, "kind" => kind.label()).increment(1);
    EngineError::Conflict(ConflictReport {
        has_conflict: true,
        kind: Some(kind),
        message: format!("no cabinet is free on {date} at {slot}"),
        conflicting_id: None,
    })
}

/// Appointments may not start before `now`.
pub(crate) fn ensure_not_past(now: NaiveDateTime, date: NaiveDate, slot: SlotTime) -> Result<(), EngineError> {
    if slot.on(date) < now {
        return Err(EngineError::Validation(format!(
            "cannot book {date} {slot}: that time has already passed"
        )));
    }
    Ok(())
}

pub(crate) fn validate_notes(notes: Option<String>) -> Result<Option<String>, EngineError> {
    use crate::limits::MAX_NOTES_LEN;
    match notes {
        Some(n) if n.len() > MAX_NOTES_LEN => Err(EngineError::LimitExceeded("notes too long")),
        Some(n) if n.trim().is_empty() => Ok(None),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 20).unwrap()
    }

    fn slot(s: &str) -> SlotTime {
        s.parse().unwrap()
    }

    fn booked(patient: Ulid, provider: Ulid, cabinet: u8, at: &str, status: AppointmentStatus) -> Appointment {
        let now = date().and_hms_opt(7, 0, 0).unwrap();
        Appointment {
            id: Ulid::new(),
            patient_id: patient,
            patient_name: "Pt1".into(),
            provider_id: provider,
            provider_name: "Dr. P1".into(),
            date: date(),
            time_slot: slot(at),
            cabinet: Cabinet(cabinet),
            kind: AppointmentType::Checkup,
            status,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn candidate(patient: Ulid, provider: Ulid, cabinet: u8, at: &str) -> Candidate {
        Candidate {
            date: date(),
            time_slot: slot(at),
            patient_id: Some(patient),
            provider_id: Some(provider),
            cabinet: Some(Cabinet(cabinet)),
        }
    }

    #[test]
    fn empty_day_is_clear() {
        let day = DayState::new(date());
        let report = check_conflict(&day, &candidate(Ulid::new(), Ulid::new(), 1, "14:30"), None);
        assert!(!report.has_conflict);
        assert_eq!(report.kind, None);
    }

    #[test]
    fn priority_is_patient_then_cabinet_then_provider() {
        let (pt1, pt2, p1, p2) = (Ulid::new(), Ulid::new(), Ulid::new(), Ulid::new());
        let mut day = DayState::new(date());
        day.insert(booked(pt1, p1, 1, "14:30", AppointmentStatus::Scheduled));

        // Everything collides: patient reported first.
        let all = check_conflict(&day, &candidate(pt1, p1, 1, "14:30"), None);
        assert_eq!(all.kind, Some(ConflictKind::Patient));

        // Cabinet + provider collide: cabinet wins.
        let cab = check_conflict(&day, &candidate(pt2, p1, 1, "14:30"), None);
        assert_eq!(cab.kind, Some(ConflictKind::Cabinet));

        let prov = check_conflict(&day, &candidate(pt2, p1, 2, "14:30"), None);
        assert_eq!(prov.kind, Some(ConflictKind::Provider));

        let clear = check_conflict(&day, &candidate(pt2, p2, 2, "14:30"), None);
        assert!(!clear.has_conflict);
    }

    #[test]
    fn cancelled_appointments_do_not_block() {
        let (pt, p) = (Ulid::new(), Ulid::new());
        let mut day = DayState::new(date());
        day.insert(booked(pt, p, 1, "10:00", AppointmentStatus::Cancelled));
        assert!(!check_conflict(&day, &candidate(pt, p, 1, "10:00"), None).has_conflict);
    }

    #[test]
    fn completed_appointments_still_block() {
        let (pt, p) = (Ulid::new(), Ulid::new());
        let mut day = DayState::new(date());
        day.insert(booked(pt, p, 1, "10:00", AppointmentStatus::Completed));
        let report = check_conflict(&day, &candidate(Ulid::new(), Ulid::new(), 1, "10:00"), None);
        assert_eq!(report.kind, Some(ConflictKind::Cabinet));
    }

    #[test]
    fn other_slots_do_not_block() {
        let (pt, p) = (Ulid::new(), Ulid::new());
        let mut day = DayState::new(date());
        day.insert(booked(pt, p, 1, "10:00", AppointmentStatus::Scheduled));
        assert!(!check_conflict(&day, &candidate(pt, p, 1, "10:30"), None).has_conflict);
    }

    #[test]
    fn exclusion_applies_to_every_rule() {
        let (pt, p) = (Ulid::new(), Ulid::new());
        let mut day = DayState::new(date());
        let own = booked(pt, p, 3, "11:00", AppointmentStatus::Scheduled);
        let own_id = own.id;
        day.insert(own.clone());

        let report = check_conflict(&day, &Candidate::for_appointment(&own), Some(own_id));
        assert!(!report.has_conflict);

        // Excluding some other id does not hide the appointment.
        let report = check_conflict(&day, &Candidate::for_appointment(&own), Some(Ulid::new()));
        assert_eq!(report.kind, Some(ConflictKind::Patient));
        assert_eq!(report.conflicting_id, Some(own_id));
    }

    #[test]
    fn unset_parties_are_not_checked() {
        let (pt, p) = (Ulid::new(), Ulid::new());
        let mut day = DayState::new(date());
        day.insert(booked(pt, p, 1, "12:00", AppointmentStatus::Scheduled));
        let only_cabinet = Candidate {
            date: date(),
            time_slot: slot("12:00"),
            patient_id: None,
            provider_id: None,
            cabinet: Some(Cabinet(2)),
        };
        assert!(!check_conflict(&day, &only_cabinet, None).has_conflict);
    }

    #[test]
    fn ensure_no_conflict_carries_report() {
        let (pt, p) = (Ulid::new(), Ulid::new());
        let mut day = DayState::new(date());
        day.insert(booked(pt, p, 1, "12:00", AppointmentStatus::Scheduled));
        let err = ensure_no_conflict(&day, &candidate(Ulid::new(), Ulid::new(), 1, "12:00"), None).unwrap_err();
        match err {
            EngineError::Conflict(report) => assert_eq!(report.kind, Some(ConflictKind::Cabinet)),
            other => panic!("expected conflict, got {other}"),
        }
    }

    #[test]
    fn past_slots_rejected() {
        let now = date().and_hms_opt(14, 31, 0).unwrap();
        assert!(matches!(
            ensure_not_past(now, date(), slot("14:30")),
            Err(EngineError::Validation(_))
        ));
        assert!(ensure_not_past(now, date(), slot("15:00")).is_ok());
        // Starting exactly now is still allowed.
        let now = date().and_hms_opt(15, 0, 0).unwrap();
        assert!(ensure_not_past(now, date(), slot("15:00")).is_ok());
    }

    #[test]
    fn notes_are_trimmed_to_none_and_limited() {
        assert_eq!(validate_notes(Some("   ".into())).unwrap(), None);
        assert_eq!(validate_notes(Some("x".into())).unwrap(), Some("x".into()));
        let long = "a".repeat(crate::limits::MAX_NOTES_LEN + 1);
        assert!(matches!(validate_notes(Some(long)), Err(EngineError::LimitExceeded(_))));
    }
}
