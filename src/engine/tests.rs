use super::*;
use crate::auth::{Actor, Role};
use crate::clock::FixedClock;
use crate::directory::{InMemoryDirectory, PatientProfile, ProviderProfile};
use crate::notify::AppointmentEvent;

const DAY: &str = "2024-03-20";

fn test_journal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("chairside_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn date(s: &str) -> NaiveDate {
    parse_date(s).unwrap()
}

fn slot(s: &str) -> SlotTime {
    s.parse().unwrap()
}

struct Clinic {
    engine: Engine,
    clock: Arc<FixedClock>,
    directory: Arc<InMemoryDirectory>,
    notify: Arc<NotifyHub>,
    staff: Actor,
    pt1: Ulid,
    pt2: Ulid,
    p1: Ulid,
    p2: Ulid,
}

impl Clinic {
    fn open(path: PathBuf) -> Self {
        let clock = Arc::new(FixedClock::new(date(DAY).and_hms_opt(8, 0, 0).unwrap()));
        let directory = Arc::new(InMemoryDirectory::new());
        Self::with(path, clock, directory)
    }

    fn with(path: PathBuf, clock: Arc<FixedClock>, directory: Arc<InMemoryDirectory>) -> Self {
        let notify = Arc::new(NotifyHub::new());
        let collaborators = Collaborators {
            clock: clock.clone(),
            directory: directory.clone(),
            notify: notify.clone(),
        };
        let engine = Engine::new(path, Schedule::default(), collaborators).unwrap();
        let clinic = Self {
            engine,
            clock,
            directory,
            notify,
            staff: Actor::new(Ulid::new(), Role::Receptionist),
            pt1: Ulid::new(),
            pt2: Ulid::new(),
            p1: Ulid::new(),
            p2: Ulid::new(),
        };
        clinic.add_patient(clinic.pt1, "Pt1");
        clinic.add_patient(clinic.pt2, "Pt2");
        clinic.add_provider(clinic.p1, "Dr. P1");
        clinic.add_provider(clinic.p2, "Dr. P2");
        clinic
    }

    fn add_patient(&self, id: Ulid, name: &str) {
        self.directory.insert_patient(
            id,
            PatientProfile {
                name: name.into(),
                email: None,
                phone: None,
            },
        );
    }

    fn add_provider(&self, id: Ulid, name: &str) {
        self.directory.insert_provider(
            id,
            ProviderProfile {
                name: name.into(),
                email: None,
            },
        );
    }

    fn patient(&self, id: Ulid) -> Actor {
        Actor::new(id, Role::Patient)
    }
}

fn request(patient: Ulid, provider: Ulid, on: &str, at: &str, cabinet: u8) -> BookingRequest {
    BookingRequest {
        patient_id: Some(patient),
        provider_id: Some(provider),
        date: Some(on.into()),
        time_slot: Some(at.into()),
        cabinet: Some(cabinet),
        kind: None,
        notes: None,
    }
}

fn conflict_kind(err: EngineError) -> ConflictKind {
    match err {
        EngineError::Conflict(report) => {
            assert!(report.has_conflict);
            report.kind.unwrap()
        }
        other => panic!("expected conflict, got {other}"),
    }
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn booking_reports_each_conflict_kind() {
    let c = Clinic::open(test_journal_path("conflict_kinds.journal"));
    let first = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "14:30", 1))
        .await
        .unwrap();
    assert_eq!(first.status, AppointmentStatus::Scheduled);
    assert_eq!(first.patient_name, "Pt1");
    assert_eq!(first.kind, AppointmentType::Checkup);

    let err = c
        .engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, DAY, "14:30", 1))
        .await
        .unwrap_err();
    assert_eq!(conflict_kind(err), ConflictKind::Cabinet);

    let err = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p2, DAY, "14:30", 2))
        .await
        .unwrap_err();
    assert_eq!(conflict_kind(err), ConflictKind::Patient);

    let err = c
        .engine
        .create_appointment(&c.staff, request(c.pt2, c.p1, DAY, "14:30", 2))
        .await
        .unwrap_err();
    assert_eq!(conflict_kind(err), ConflictKind::Provider);

    c.engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, DAY, "14:30", 2))
        .await
        .unwrap();
    assert_eq!(c.engine.booked_slots(date(DAY)).await.len(), 2);
}

#[tokio::test]
async fn conflict_names_the_existing_appointment() {
    let c = Clinic::open(test_journal_path("conflicting_id.journal"));
    let first = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "10:00", 3))
        .await
        .unwrap();
    match c
        .engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, DAY, "10:00", 3))
        .await
    {
        Err(EngineError::Conflict(report)) => assert_eq!(report.conflicting_id, Some(first.id)),
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_fields_are_listed_together() {
    let c = Clinic::open(test_journal_path("missing_fields.journal"));
    let err = c
        .engine
        .create_appointment(
            &c.staff,
            BookingRequest {
                patient_id: Some(c.pt1),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        EngineError::Validation(msg) => {
            assert!(msg.contains("dentistId"), "{msg}");
            assert!(msg.contains("date"), "{msg}");
            assert!(msg.contains("timeSlot"), "{msg}");
            assert!(msg.contains("cabinet"), "{msg}");
            assert!(!msg.contains("patientId"), "{msg}");
        }
        other => panic!("expected validation error, got {other}"),
    }
}

#[tokio::test]
async fn off_grid_and_malformed_input_rejected() {
    let c = Clinic::open(test_journal_path("off_grid.journal"));
    for (on, at, cab) in [
        (DAY, "14:15", 1),
        (DAY, "21:00", 1),
        (DAY, "7:30", 1),
        (DAY, "half past", 1),
        ("20-03-2024", "14:30", 1),
        (DAY, "14:30", 0),
        (DAY, "14:30", 5),
    ] {
        let err = c
            .engine
            .create_appointment(&c.staff, request(c.pt1, c.p1, on, at, cab))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{on} {at} {cab}: {err}");
    }
    assert_eq!(c.engine.store.appointment_count(), 0);
}

#[tokio::test]
async fn past_slots_rejected() {
    let c = Clinic::open(test_journal_path("past_slots.journal"));
    c.clock.set(date(DAY).and_hms_opt(14, 31, 0).unwrap());
    let err = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "14:30", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    c.engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "15:00", 1))
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_people_are_not_found() {
    let c = Clinic::open(test_journal_path("unknown_people.journal"));
    let stranger = Ulid::new();
    let err = c
        .engine
        .create_appointment(&c.staff, request(stranger, c.p1, DAY, "10:00", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound("patient", id) if id == stranger));
    let err = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, stranger, DAY, "10:00", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound("provider", _)));
}

#[tokio::test]
async fn patients_cannot_use_staff_booking() {
    let c = Clinic::open(test_journal_path("patient_staff_booking.journal"));
    let err = c
        .engine
        .create_appointment(&c.patient(c.pt1), request(c.pt1, c.p1, DAY, "10:00", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
}

#[tokio::test]
async fn concurrent_bookings_for_one_cabinet_admit_exactly_one() {
    let c = Clinic::open(test_journal_path("concurrent.journal"));
    let patients: Vec<Ulid> = (0..16).map(|_| Ulid::new()).collect();
    let providers: Vec<Ulid> = (0..16).map(|_| Ulid::new()).collect();
    for (i, (pt, p)) in patients.iter().zip(&providers).enumerate() {
        c.add_patient(*pt, &format!("Patient {i}"));
        c.add_provider(*p, &format!("Dr. {i}"));
    }
    let staff = c.staff;
    let engine = Arc::new(c.engine);

    let mut handles = Vec::new();
    for (pt, p) in patients.into_iter().zip(providers) {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_appointment(&staff, request(pt, p, DAY, "11:00", 2))
                .await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(conflict_kind(e), ConflictKind::Cabinet),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.booked_slots(date(DAY)).await.len(), 1);
}

// ── Self-service booking ─────────────────────────────────

#[tokio::test]
async fn self_booking_assigns_first_free_cabinet() {
    let c = Clinic::open(test_journal_path("self_book.journal"));
    c.engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, DAY, "09:00", 1))
        .await
        .unwrap();

    let mut req = request(c.pt1, c.p1, DAY, "09:00", 1);
    req.cabinet = None;
    req.patient_id = None;
    let booked = c.engine.book_for_patient(&c.patient(c.pt1), req).await.unwrap();
    assert_eq!(booked.patient_id, c.pt1);
    assert_eq!(booked.cabinet, Cabinet(2));
}

#[tokio::test]
async fn self_booking_full_slot_is_cabinet_conflict() {
    let c = Clinic::open(test_journal_path("self_book_full.journal"));
    for cab in 1..=4u8 {
        let (pt, p) = (Ulid::new(), Ulid::new());
        c.add_patient(pt, "Someone");
        c.add_provider(p, "Dr. Someone");
        c.engine
            .create_appointment(&c.staff, request(pt, p, DAY, "16:00", cab))
            .await
            .unwrap();
    }
    let mut req = request(c.pt1, c.p1, DAY, "16:00", 1);
    req.cabinet = None;
    let err = c.engine.book_for_patient(&c.patient(c.pt1), req).await.unwrap_err();
    assert_eq!(conflict_kind(err), ConflictKind::Cabinet);
    assert!(!c.engine.available_slots(date(DAY), None).await.contains(&slot("16:00")));
}

#[tokio::test]
async fn self_booking_for_someone_else_forbidden() {
    let c = Clinic::open(test_journal_path("self_book_other.journal"));
    let err = c
        .engine
        .book_for_patient(&c.patient(c.pt1), request(c.pt2, c.p1, DAY, "10:00", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    let err = c
        .engine
        .book_for_patient(&c.staff, request(c.pt2, c.p1, DAY, "10:00", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
}

// ── Updates ──────────────────────────────────────────────

#[tokio::test]
async fn notes_only_update_does_not_conflict_with_itself() {
    let c = Clinic::open(test_journal_path("notes_update.journal"));
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "14:30", 1))
        .await
        .unwrap();
    c.clock.advance(chrono::Duration::minutes(5));

    let patch = AppointmentPatch {
        notes: Some("bring x-rays".into()),
        ..Default::default()
    };
    let updated = c.engine.update_appointment(&c.staff, a.id, patch).await.unwrap();
    assert_eq!(updated.notes.as_deref(), Some("bring x-rays"));
    assert_eq!(updated.created_at, a.created_at);
    assert!(updated.updated_at > a.updated_at);

    // Re-sending the full current booking is also fine.
    let patch = AppointmentPatch {
        date: Some(DAY.into()),
        time_slot: Some("14:30".into()),
        cabinet: Some(1),
        patient_id: Some(c.pt1),
        provider_id: Some(c.p1),
        notes: Some(String::new()),
        ..Default::default()
    };
    let cleared = c.engine.update_appointment(&c.staff, a.id, patch).await.unwrap();
    assert_eq!(cleared.notes, None);
}

#[tokio::test]
async fn update_into_taken_cabinet_conflicts() {
    let c = Clinic::open(test_journal_path("update_conflict.journal"));
    c.engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "10:00", 1))
        .await
        .unwrap();
    let b = c
        .engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, DAY, "10:00", 2))
        .await
        .unwrap();

    let patch = AppointmentPatch {
        cabinet: Some(1),
        ..Default::default()
    };
    let err = c.engine.update_appointment(&c.staff, b.id, patch).await.unwrap_err();
    assert_eq!(conflict_kind(err), ConflictKind::Cabinet);

    let patch = AppointmentPatch {
        provider_id: Some(c.p1),
        ..Default::default()
    };
    let err = c.engine.update_appointment(&c.staff, b.id, patch).await.unwrap_err();
    assert_eq!(conflict_kind(err), ConflictKind::Provider);

    let unchanged = c.engine.get_appointment(&c.staff, b.id).await.unwrap();
    assert_eq!(unchanged, b);
}

#[tokio::test]
async fn reassigning_patient_into_their_own_slot_conflicts() {
    let c = Clinic::open(test_journal_path("update_patient.journal"));
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "10:00", 1))
        .await
        .unwrap();
    let b = c
        .engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, DAY, "10:00", 2))
        .await
        .unwrap();

    let patch = AppointmentPatch {
        patient_id: Some(c.pt1),
        ..Default::default()
    };
    let err = c.engine.update_appointment(&c.staff, b.id, patch).await.unwrap_err();
    let EngineError::Conflict(report) = err else {
        panic!("expected conflict");
    };
    assert_eq!(report.kind, Some(ConflictKind::Patient));
    assert_eq!(report.conflicting_id, Some(a.id));

    let unchanged = c.engine.get_appointment(&c.staff, b.id).await.unwrap();
    assert_eq!(unchanged, b);
}

#[tokio::test]
async fn move_across_days() {
    let c = Clinic::open(test_journal_path("cross_day.journal"));
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "10:00", 1))
        .await
        .unwrap();
    c.engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, "2024-03-21", "10:00", 1))
        .await
        .unwrap();

    let patch = AppointmentPatch {
        date: Some("2024-03-21".into()),
        ..Default::default()
    };
    let err = c
        .engine
        .update_appointment(&c.staff, a.id, patch.clone())
        .await
        .unwrap_err();
    assert_eq!(conflict_kind(err), ConflictKind::Cabinet);

    let patch = AppointmentPatch {
        cabinet: Some(2),
        ..patch
    };
    let moved = c.engine.update_appointment(&c.staff, a.id, patch).await.unwrap();
    assert_eq!(moved.date, date("2024-03-21"));
    assert!(c.engine.booked_slots(date(DAY)).await.is_empty());
    assert_eq!(c.engine.booked_slots(date("2024-03-21")).await.len(), 2);
    assert_eq!(c.engine.store.day_of(&a.id), Some(date("2024-03-21")));
}

#[tokio::test]
async fn update_into_the_past_rejected() {
    let c = Clinic::open(test_journal_path("update_past.journal"));
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "15:00", 1))
        .await
        .unwrap();
    c.clock.set(date(DAY).and_hms_opt(12, 0, 0).unwrap());
    let patch = AppointmentPatch {
        time_slot: Some("09:00".into()),
        ..Default::default()
    };
    let err = c.engine.update_appointment(&c.staff, a.id, patch).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn terminal_appointments_cannot_be_updated() {
    let c = Clinic::open(test_journal_path("terminal_update.journal"));
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "15:00", 1))
        .await
        .unwrap();
    c.engine.complete_appointment(&c.staff, a.id).await.unwrap();
    let patch = AppointmentPatch {
        notes: Some("late".into()),
        ..Default::default()
    };
    let err = c.engine.update_appointment(&c.staff, a.id, patch).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

#[tokio::test]
async fn status_patch_follows_lifecycle() {
    let c = Clinic::open(test_journal_path("status_patch.journal"));
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "15:00", 1))
        .await
        .unwrap();
    let patch = AppointmentPatch {
        status: Some(AppointmentStatus::Completed),
        ..Default::default()
    };
    let done = c.engine.update_appointment(&c.staff, a.id, patch).await.unwrap();
    assert_eq!(done.status, AppointmentStatus::Completed);

    // Completed still holds the cabinet.
    let err = c
        .engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, DAY, "15:00", 1))
        .await
        .unwrap_err();
    assert_eq!(conflict_kind(err), ConflictKind::Cabinet);
}

#[tokio::test]
async fn status_patch_cannot_cancel_a_started_appointment() {
    let c = Clinic::open(test_journal_path("status_patch_started.journal"));
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "14:30", 1))
        .await
        .unwrap();
    let mut rx = c.notify.subscribe();
    c.clock.set(date(DAY).and_hms_opt(15, 0, 0).unwrap());

    let err = c.engine.cancel_appointment(&c.staff, a.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let patch = AppointmentPatch {
        status: Some(AppointmentStatus::Cancelled),
        ..Default::default()
    };
    let err = c.engine.update_appointment(&c.staff, a.id, patch).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let unchanged = c.engine.get_appointment(&c.staff, a.id).await.unwrap();
    assert_eq!(unchanged.status, AppointmentStatus::Scheduled);
    assert!(rx.try_recv().is_err());
}

// ── Cancel / delete ──────────────────────────────────────

#[tokio::test]
async fn cancel_frees_the_slot() {
    let c = Clinic::open(test_journal_path("cancel_rebook.journal"));
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "14:30", 1))
        .await
        .unwrap();
    let cancelled = c.engine.cancel_appointment(&c.patient(c.pt1), a.id).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);

    c.engine
        .create_appointment(&c.staff, request(c.pt2, c.p1, DAY, "14:30", 1))
        .await
        .unwrap();

    // The cancelled record is still listed.
    let all = c.engine.list_appointments(&c.staff, ListFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn cancel_rules() {
    let c = Clinic::open(test_journal_path("cancel_rules.journal"));
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "14:30", 1))
        .await
        .unwrap();

    let err = c.engine.cancel_appointment(&c.patient(c.pt2), a.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    c.clock.set(date(DAY).and_hms_opt(15, 0, 0).unwrap());
    let err = c.engine.cancel_appointment(&c.staff, a.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    c.clock.set(date(DAY).and_hms_opt(9, 0, 0).unwrap());
    c.engine.cancel_appointment(&c.staff, a.id).await.unwrap();
    let err = c.engine.cancel_appointment(&c.staff, a.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let err = c.engine.cancel_appointment(&c.staff, Ulid::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound("appointment", _)));
}

#[tokio::test]
async fn delete_twice_is_not_found() {
    let c = Clinic::open(test_journal_path("delete_twice.journal"));
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "14:30", 1))
        .await
        .unwrap();
    let err = c.engine.delete_appointment(&c.patient(c.pt1), a.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    c.engine.delete_appointment(&c.staff, a.id).await.unwrap();
    let err = c.engine.delete_appointment(&c.staff, a.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound("appointment", _)));
    assert!(c.engine.get_appointment(&c.staff, a.id).await.is_err());
    assert!(c.engine.available_slots(date(DAY), Some(c.p1)).await.contains(&slot("14:30")));
}

#[tokio::test]
async fn cancelled_records_do_not_use_up_the_day() {
    let c = Clinic::open(test_journal_path("day_cap.journal"));
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "10:00", 1))
        .await
        .unwrap();
    let cancelled = c.engine.cancel_appointment(&c.staff, a.id).await.unwrap();
    {
        let day = c.engine.store.day(date(DAY));
        let mut day = day.write().await;
        for _ in 1..crate::limits::MAX_APPOINTMENTS_PER_DAY {
            day.insert(Appointment {
                id: Ulid::new(),
                ..cancelled.clone()
            });
        }
        assert_eq!(day.appointments.len(), crate::limits::MAX_APPOINTMENTS_PER_DAY);
    }

    c.engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, DAY, "10:00", 1))
        .await
        .unwrap();
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn listing_is_sorted_and_scoped_to_patients() {
    let c = Clinic::open(test_journal_path("listing.journal"));
    c.engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, "2024-03-21", "09:00", 1))
        .await
        .unwrap();
    c.engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, DAY, "12:00", 2))
        .await
        .unwrap();
    c.engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "10:00", 1))
        .await
        .unwrap();

    let all = c.engine.list_appointments(&c.staff, ListFilter::default()).await.unwrap();
    let keys: Vec<_> = all.iter().map(|a| (a.date, a.time_slot)).collect();
    assert_eq!(
        keys,
        vec![
            (date(DAY), slot("10:00")),
            (date(DAY), slot("12:00")),
            (date("2024-03-21"), slot("09:00")),
        ]
    );

    let mine = c
        .engine
        .list_appointments(&c.patient(c.pt1), ListFilter::default())
        .await
        .unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().all(|a| a.patient_id == c.pt1));

    let filter = ListFilter {
        patient_id: Some(c.pt2),
        ..Default::default()
    };
    let err = c.engine.list_appointments(&c.patient(c.pt1), filter).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let by_provider = ListFilter {
        provider_id: Some(c.p2),
        ..Default::default()
    };
    assert_eq!(c.engine.list_appointments(&c.staff, by_provider).await.unwrap().len(), 1);

    let today = c.engine.todays_appointments(&c.staff, ListFilter::default()).await.unwrap();
    assert_eq!(today.len(), 2);
}

#[tokio::test]
async fn patients_cannot_read_others_appointments() {
    let c = Clinic::open(test_journal_path("get_scope.journal"));
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "10:00", 1))
        .await
        .unwrap();
    assert!(c.engine.get_appointment(&c.patient(c.pt1), a.id).await.is_ok());
    assert!(matches!(
        c.engine.get_appointment(&c.patient(c.pt2), a.id).await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn overview_matches_individual_queries() {
    let c = Clinic::open(test_journal_path("overview.journal"));
    c.engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "10:00", 1))
        .await
        .unwrap();
    let overview = c
        .engine
        .day_overview(date(DAY), Some(c.p1), Some(slot("10:00")))
        .await
        .unwrap();
    assert_eq!(overview.available_slots, c.engine.available_slots(date(DAY), Some(c.p1)).await);
    assert!(!overview.available_slots.contains(&slot("10:00")));
    assert_eq!(overview.booked_slots, c.engine.booked_slots(date(DAY)).await);
    assert_eq!(
        overview.available_cabinets,
        Some(vec![Cabinet(2), Cabinet(3), Cabinet(4)])
    );
    assert!(c.engine.day_overview(date(DAY), None, Some(slot("10:10"))).await.is_err());

    // A day nobody has touched is entirely free.
    let empty = c.engine.available_slots(date("2024-04-01"), None).await;
    assert_eq!(empty, c.engine.schedule().grid.slots());
}

#[tokio::test]
async fn preview_does_not_book() {
    let c = Clinic::open(test_journal_path("preview.journal"));
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "10:00", 1))
        .await
        .unwrap();
    let candidate = Candidate {
        date: date(DAY),
        time_slot: slot("10:00"),
        patient_id: None,
        provider_id: Some(c.p1),
        cabinet: None,
    };
    let report = c.engine.preview_conflict(candidate, None).await;
    assert_eq!(report.kind, Some(ConflictKind::Provider));
    assert!(!c.engine.preview_conflict(candidate, Some(a.id)).await.has_conflict);
    assert_eq!(c.engine.store.appointment_count(), 1);
}

#[tokio::test]
async fn active_in_window_skips_cancelled_and_out_of_window() {
    let c = Clinic::open(test_journal_path("window.journal"));
    let early = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "09:00", 1))
        .await
        .unwrap();
    let cancelled = c
        .engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, DAY, "09:30", 1))
        .await
        .unwrap();
    c.engine.cancel_appointment(&c.staff, cancelled.id).await.unwrap();
    c.engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, "2024-03-22", "09:00", 1))
        .await
        .unwrap();

    let from = date(DAY).and_hms_opt(8, 0, 0).unwrap();
    let to = date("2024-03-21").and_hms_opt(8, 0, 0).unwrap();
    let due = c.engine.active_in_window(from, to).await;
    assert_eq!(due.iter().map(|a| a.id).collect::<Vec<_>>(), vec![early.id]);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn lifecycle_publishes_events() {
    let c = Clinic::open(test_journal_path("events.journal"));
    let mut rx = c.notify.subscribe();

    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "10:00", 1))
        .await
        .unwrap();
    match rx.recv().await.unwrap() {
        AppointmentEvent::Created { appointment } => assert_eq!(appointment.id, a.id),
        other => panic!("unexpected {other:?}"),
    }

    let patch = AppointmentPatch {
        time_slot: Some("11:00".into()),
        kind: Some(AppointmentType::Filling),
        ..Default::default()
    };
    c.engine.update_appointment(&c.staff, a.id, patch).await.unwrap();
    match rx.recv().await.unwrap() {
        AppointmentEvent::Updated { changes, .. } => {
            let fields: Vec<_> = changes.iter().map(|ch| ch.field).collect();
            assert_eq!(fields, vec!["timeSlot", "type"]);
            assert_eq!(changes[0].from, "10:00");
            assert_eq!(changes[0].to, "11:00");
        }
        other => panic!("unexpected {other:?}"),
    }

    c.engine.cancel_appointment(&c.staff, a.id).await.unwrap();
    assert!(matches!(rx.recv().await.unwrap(), AppointmentEvent::Cancelled { .. }));
}

#[tokio::test]
async fn failed_operations_publish_nothing() {
    let c = Clinic::open(test_journal_path("no_events.journal"));
    let mut rx = c.notify.subscribe();
    let _ = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, Ulid::new(), DAY, "10:00", 1))
        .await;
    assert!(rx.try_recv().is_err());
}

// ── Journal ──────────────────────────────────────────────

#[tokio::test]
async fn state_survives_reopen() {
    let path = test_journal_path("reopen.journal");
    let c = Clinic::open(path.clone());
    let a = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "10:00", 1))
        .await
        .unwrap();
    let b = c
        .engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, DAY, "10:00", 2))
        .await
        .unwrap();
    let gone = c
        .engine
        .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "11:00", 1))
        .await
        .unwrap();
    let patch = AppointmentPatch {
        date: Some("2024-03-23".into()),
        ..Default::default()
    };
    let moved = c.engine.update_appointment(&c.staff, a.id, patch).await.unwrap();
    let cancelled = c.engine.cancel_appointment(&c.staff, b.id).await.unwrap();
    c.engine.delete_appointment(&c.staff, gone.id).await.unwrap();

    let reopened = Clinic::with(path, c.clock.clone(), c.directory.clone());
    let all = reopened
        .engine
        .list_appointments(&c.staff, ListFilter::default())
        .await
        .unwrap();
    assert_eq!(all, vec![cancelled, moved]);
    assert_eq!(reopened.engine.store.day_of(&a.id), Some(date("2024-03-23")));
    assert_eq!(reopened.engine.store.day_of(&gone.id), None);
}

#[tokio::test]
async fn compaction_keeps_live_state() {
    let path = test_journal_path("compact.journal");
    let c = Clinic::open(path.clone());
    let mut kept = Vec::new();
    for at in ["09:00", "09:30", "10:00"] {
        kept.push(
            c.engine
                .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, at, 1))
                .await
                .unwrap(),
        );
    }
    let dropped = kept.remove(1);
    c.engine.delete_appointment(&c.staff, dropped.id).await.unwrap();
    assert_eq!(c.engine.journal_appends_since_compact().await, 4);

    c.engine.compact_journal().await.unwrap();
    assert_eq!(c.engine.journal_appends_since_compact().await, 0);

    // Writes after compaction land in the new journal.
    let late = c
        .engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, DAY, "12:00", 2))
        .await
        .unwrap();
    kept.push(late);

    let reopened = Clinic::with(path, c.clock.clone(), c.directory.clone());
    let all = reopened
        .engine
        .list_appointments(&c.staff, ListFilter::default())
        .await
        .unwrap();
    assert_eq!(all, kept);
}

#[tokio::test]
async fn dropped_booking_still_commits() {
    let path = test_journal_path("dropped_booking.journal");
    let c = Clinic::open(path.clone());

    // Poll the booking far enough to hand it to the journal, then abandon it
    // the way a disconnected client would.
    let mut create = Box::pin(
        c.engine
            .create_appointment(&c.staff, request(c.pt1, c.p1, DAY, "14:30", 1)),
    );
    let _ = futures::poll!(&mut create);
    drop(create);

    let err = c
        .engine
        .create_appointment(&c.staff, request(c.pt2, c.p2, DAY, "14:30", 1))
        .await
        .unwrap_err();
    assert_eq!(conflict_kind(err), ConflictKind::Cabinet);

    let live = c
        .engine
        .list_appointments(&c.staff, ListFilter::default())
        .await
        .unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].patient_id, c.pt1);

    let reopened = Clinic::with(path, c.clock.clone(), c.directory.clone());
    let replayed = reopened
        .engine
        .list_appointments(&c.staff, ListFilter::default())
        .await
        .unwrap();
    assert_eq!(replayed, live);
}
