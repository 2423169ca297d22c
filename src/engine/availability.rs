use std::collections::HashSet;

use ulid::Ulid;

use crate::model::*;

use super::slots::Schedule;

// ── Availability ──────────────────────────────────────────────────

/// Free start times for a day.
///
/// Without a provider, a slot is free while at least one cabinet is still
/// unoccupied. With a provider, a slot is free when that provider holds no
/// active appointment in it.
pub fn available_slots(day: &DayState, schedule: &Schedule, provider_id: Option<Ulid>) -> Vec<SlotTime> {
    let cabinets = usize::from(schedule.cabinet_count());
    schedule
        .grid
        .slots()
        .into_iter()
        .filter(|&slot| match provider_id {
            Some(pid) => !day.active_at(slot).any(|a| a.provider_id == pid),
            None => occupied_cabinets(day, slot).len() < cabinets,
        })
        .collect()
}

/// Cabinets with no active appointment at exactly `slot`, in cabinet order.
pub fn available_cabinets(day: &DayState, schedule: &Schedule, slot: SlotTime) -> Vec<Cabinet> {
    let taken = occupied_cabinets(day, slot);
    schedule.cabinets().filter(|c| !taken.contains(c)).collect()
}

/// Every active appointment of the day, ordered by slot then cabinet.
pub fn booked_slots(day: &DayState) -> Vec<BookedSlot> {
    day.active()
        .map(|a| BookedSlot {
            time_slot: a.time_slot,
            cabinet: a.cabinet,
            provider_id: a.provider_id,
            patient_id: a.patient_id,
        })
        .collect()
}

/// All three views from one snapshot of the day.
pub fn day_overview(
    day: &DayState,
    schedule: &Schedule,
    provider_id: Option<Ulid>,
    slot: Option<SlotTime>,
) -> DayOverview {
    DayOverview {
        date: day.date,
        available_slots: available_slots(day, schedule, provider_id),
        booked_slots: booked_slots(day),
        available_cabinets: slot.map(|s| available_cabinets(day, schedule, s)),
    }
}

fn occupied_cabinets(day: &DayState, slot: SlotTime) -> HashSet<Cabinet> {
    day.active_at(slot).map(|a| a.cabinet).collect()
}
