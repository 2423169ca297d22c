use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{Schedule, SlotGrid};
use crate::model::SlotTime;

/// Process configuration, read from `CHAIRSIDE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub schedule: Schedule,
    pub reminder_interval: Duration,
    /// How far ahead of an appointment its reminder goes out.
    pub reminder_lead: chrono::Duration,
    /// JSON file seeding the patient/provider directory.
    pub directory_seed: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.var, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let open: SlotTime = parse_or(get("CHAIRSIDE_OPEN"), "CHAIRSIDE_OPEN", SlotGrid::default().open())?;
        let close: SlotTime =
            parse_or(get("CHAIRSIDE_CLOSE"), "CHAIRSIDE_CLOSE", SlotGrid::default().close())?;
        let step: u16 = parse_or(get("CHAIRSIDE_SLOT_MINUTES"), "CHAIRSIDE_SLOT_MINUTES", 30)?;
        let cabinets: u8 = parse_or(get("CHAIRSIDE_CABINETS"), "CHAIRSIDE_CABINETS", 4)?;
        let grid = SlotGrid::new(open, close, step).map_err(|e| ConfigError {
            var: "CHAIRSIDE_SLOT_MINUTES",
            message: e.to_string(),
        })?;
        let schedule = Schedule::new(grid, cabinets).map_err(|e| ConfigError {
            var: "CHAIRSIDE_CABINETS",
            message: e.to_string(),
        })?;

        let interval_secs: u64 = parse_or(
            get("CHAIRSIDE_REMINDER_INTERVAL_SECS"),
            "CHAIRSIDE_REMINDER_INTERVAL_SECS",
            300,
        )?;
        if interval_secs == 0 {
            return Err(ConfigError {
                var: "CHAIRSIDE_REMINDER_INTERVAL_SECS",
                message: "must be positive".into(),
            });
        }
        let lead_minutes: i64 = parse_or(
            get("CHAIRSIDE_REMINDER_LEAD_MINUTES"),
            "CHAIRSIDE_REMINDER_LEAD_MINUTES",
            24 * 60,
        )?;
        let reminder_lead = chrono::Duration::try_minutes(lead_minutes)
            .filter(|lead| *lead > chrono::Duration::zero())
            .ok_or_else(|| ConfigError {
                var: "CHAIRSIDE_REMINDER_LEAD_MINUTES",
                message: format!("'{lead_minutes}': must be a positive number of minutes"),
            })?;

        Ok(Self {
            bind: get("CHAIRSIDE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(get("CHAIRSIDE_PORT"), "CHAIRSIDE_PORT", 8080)?,
            data_dir: get("CHAIRSIDE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            compact_threshold: parse_or(
                get("CHAIRSIDE_COMPACT_THRESHOLD"),
                "CHAIRSIDE_COMPACT_THRESHOLD",
                1000,
            )?,
            metrics_port: get("CHAIRSIDE_METRICS_PORT")
                .map(|raw| parse(&raw, "CHAIRSIDE_METRICS_PORT"))
                .transpose()?,
            schedule,
            reminder_interval: Duration::from_secs(interval_secs),
            reminder_lead,
            directory_seed: get("CHAIRSIDE_DIRECTORY").map(PathBuf::from),
        })
    }
}

fn parse<T>(raw: &str, var: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError {
        var,
        message: format!("'{raw}': {e}"),
    })
}

fn parse_or<T>(raw: Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Some(raw) => parse(&raw, var),
        None => Ok(default),
    }
}
