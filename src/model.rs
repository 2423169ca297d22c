use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Minutes in a day; slot times live in `[0, MINUTES_PER_DAY)`.
pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// A wall-clock time of day on the slot grid, stored as minutes since midnight.
/// Rendered as zero-padded `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotTime(u16);

impl SlotTime {
    pub const fn from_minutes(minutes: u16) -> Option<Self> {
        if minutes < MINUTES_PER_DAY {
            Some(Self(minutes))
        } else {
            None
        }
    }

    pub const fn hm(hour: u16, minute: u16) -> Option<Self> {
        if hour >= 24 || minute >= 60 {
            return None;
        }
        Some(Self(hour * 60 + minute))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn hour(self) -> u16 {
        self.0 / 60
    }

    pub fn minute(self) -> u16 {
        self.0 % 60
    }

    /// The instant this slot starts on `date`.
    pub fn on(self, date: NaiveDate) -> NaiveDateTime {
        let time = NaiveTime::from_hms_opt(u32::from(self.hour()), u32::from(self.minute()), 0)
            .unwrap_or_default();
        date.and_time(time)
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for SlotTime {
    type Err = String;

    /// Accepts `HH:MM` and `H:MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid time slot '{s}': expected HH:MM"))?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(format!("invalid time slot '{s}': expected HH:MM"));
        }
        let hour: u16 = h
            .parse()
            .map_err(|_| format!("invalid hour in time slot '{s}'"))?;
        let minute: u16 = m
            .parse()
            .map_err(|_| format!("invalid minute in time slot '{s}'"))?;
        SlotTime::hm(hour, minute).ok_or_else(|| format!("time slot '{s}' out of range"))
    }
}

impl Serialize for SlotTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SlotTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Normalize a calendar day. Accepts `YYYY-MM-DD`, an RFC 3339 timestamp, or a
/// naive `YYYY-MM-DDTHH:MM[:SS]` date-time; any time-of-day part is dropped.
pub fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.date_naive());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(ts.date());
        }
    }
    Err(format!("invalid date '{raw}': expected YYYY-MM-DD"))
}

/// A treatment cabinet, numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cabinet(pub u8);

impl fmt::Display for Cabinet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cabinet-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppointmentType {
    #[default]
    Checkup,
    Cleaning,
    Filling,
    Extraction,
    RootCanal,
    Consultation,
    Other,
}

impl fmt::Display for AppointmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppointmentType::Checkup => "checkup",
            AppointmentType::Cleaning => "cleaning",
            AppointmentType::Filling => "filling",
            AppointmentType::Extraction => "extraction",
            AppointmentType::RootCanal => "root-canal",
            AppointmentType::Consultation => "consultation",
            AppointmentType::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    /// Counts toward the cabinet/provider/patient uniqueness rules.
    pub fn is_active(self) -> bool {
        self != AppointmentStatus::Cancelled
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AppointmentStatus::Completed | AppointmentStatus::Cancelled)
    }

    /// `scheduled → completed` and `scheduled → cancelled` are the only moves.
    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        matches!(
            (self, next),
            (AppointmentStatus::Scheduled, AppointmentStatus::Completed)
                | (AppointmentStatus::Scheduled, AppointmentStatus::Cancelled)
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: Ulid,
    pub patient_id: Ulid,
    /// Display name captured at write time; may go stale.
    pub patient_name: String,
    pub provider_id: Ulid,
    pub provider_name: String,
    pub date: NaiveDate,
    pub time_slot: SlotTime,
    pub cabinet: Cabinet,
    #[serde(rename = "type")]
    pub kind: AppointmentType,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Appointment {
    pub fn starts_at(&self) -> NaiveDateTime {
        self.time_slot.on(self.date)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// All appointments of one clinic day, sorted by `(time_slot, cabinet)`.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date: NaiveDate,
    pub appointments: Vec<Appointment>,
}

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            appointments: Vec::new(),
        }
    }

    /// Insert keeping `(time_slot, cabinet)` order.
    pub fn insert(&mut self, appointment: Appointment) {
        let key = (appointment.time_slot, appointment.cabinet);
        let pos = self
            .appointments
            .partition_point(|a| (a.time_slot, a.cabinet) <= key);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    /// Active appointments starting at exactly `slot`.
    pub fn active_at(&self, slot: SlotTime) -> impl Iterator<Item = &Appointment> {
        let lo = self.appointments.partition_point(|a| a.time_slot < slot);
        let hi = self.appointments.partition_point(|a| a.time_slot <= slot);
        self.appointments[lo..hi].iter().filter(|a| a.is_active())
    }

    pub fn active(&self) -> impl Iterator<Item = &Appointment> {
        self.appointments.iter().filter(|a| a.is_active())
    }
}

/// Journal record format. Status changes and edits are both revisions carrying
/// the full new record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentRevised {
        previous_date: NaiveDate,
        appointment: Appointment,
    },
    AppointmentDeleted {
        id: Ulid,
        date: NaiveDate,
    },
}

impl Event {
    /// Days touched by this event: `(primary, other)` where `other` is set only
    /// when a revision moves an appointment across days.
    pub fn days(&self) -> (NaiveDate, Option<NaiveDate>) {
        match self {
            Event::AppointmentBooked { appointment } => (appointment.date, None),
            Event::AppointmentRevised {
                previous_date,
                appointment,
            } => {
                if *previous_date == appointment.date {
                    (appointment.date, None)
                } else {
                    (*previous_date, Some(appointment.date))
                }
            }
            Event::AppointmentDeleted { date, .. } => (*date, None),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Raw projection of one active booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookedSlot {
    pub time_slot: SlotTime,
    pub cabinet: Cabinet,
    pub provider_id: Ulid,
    pub patient_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayOverview {
    pub date: NaiveDate,
    pub available_slots: Vec<SlotTime>,
    pub booked_slots: Vec<BookedSlot>,
    /// Present only when the query named a time slot.
    pub available_cabinets: Option<Vec<Cabinet>>,
}

/// One field changed by an update, rendered for notification templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub from: String,
    pub to: String,
}
