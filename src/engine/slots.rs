use crate::limits::MAX_CABINETS;
use crate::model::{Cabinet, SlotTime};

use super::EngineError;

/// Bookable start times in `[start, end)`, every `step_minutes`.
///
/// The closing time itself is never a slot: an appointment starting at closing
/// would have no time to run.
pub fn generate_slots(start: SlotTime, end: SlotTime, step_minutes: u16) -> Vec<SlotTime> {
    if step_minutes == 0 || start >= end {
        return Vec::new();
    }
    (start.minutes()..end.minutes())
        .step_by(usize::from(step_minutes))
        .filter_map(SlotTime::from_minutes)
        .collect()
}

/// The business-day slot catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrid {
    open: SlotTime,
    close: SlotTime,
    step_minutes: u16,
}

const DEFAULT_OPEN: SlotTime = match SlotTime::hm(8, 0) {
    Some(t) => t,
    None => panic!("invalid default opening time"),
};

const DEFAULT_CLOSE: SlotTime = match SlotTime::hm(21, 0) {
    Some(t) => t,
    None => panic!("invalid default closing time"),
};

impl Default for SlotGrid {
    /// 08:00 to 21:00 every 30 minutes.
    fn default() -> Self {
        Self {
            open: DEFAULT_OPEN,
            close: DEFAULT_CLOSE,
            step_minutes: 30,
        }
    }
}

impl SlotGrid {
    pub fn new(open: SlotTime, close: SlotTime, step_minutes: u16) -> Result<Self, EngineError> {
        if step_minutes == 0 {
            return Err(EngineError::Validation("slot step must be positive".into()));
        }
        if open >= close {
            return Err(EngineError::Validation(format!(
                "opening time {open} must be before closing time {close}"
            )));
        }
        if (close.minutes() - open.minutes()) % step_minutes != 0 {
            return Err(EngineError::Validation(format!(
                "business hours {open}-{close} are not a multiple of {step_minutes} minutes"
            )));
        }
        Ok(Self {
            open,
            close,
            step_minutes,
        })
    }

    pub fn open(&self) -> SlotTime {
        self.open
    }

    pub fn close(&self) -> SlotTime {
        self.close
    }

    pub fn step_minutes(&self) -> u16 {
        self.step_minutes
    }

    pub fn slots(&self) -> Vec<SlotTime> {
        generate_slots(self.open, self.close, self.step_minutes)
    }

    pub fn len(&self) -> usize {
        usize::from((self.close.minutes() - self.open.minutes()) / self.step_minutes)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// On step and inside `[open, close)`.
    pub fn contains(&self, slot: SlotTime) -> bool {
        slot >= self.open
            && slot < self.close
            && (slot.minutes() - self.open.minutes()) % self.step_minutes == 0
    }
}

/// A clinic's bookable capacity: the slot grid and its cabinets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub grid: SlotGrid,
    cabinets: u8,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            grid: SlotGrid::default(),
            cabinets: 4,
        }
    }
}

impl Schedule {
    pub fn new(grid: SlotGrid, cabinets: u8) -> Result<Self, EngineError> {
        if cabinets == 0 || cabinets > MAX_CABINETS {
            return Err(EngineError::Validation(format!(
                "cabinet count must be between 1 and {MAX_CABINETS}"
            )));
        }
        Ok(Self { grid, cabinets })
    }

    pub fn cabinet_count(&self) -> u8 {
        self.cabinets
    }

    pub fn cabinets(&self) -> impl Iterator<Item = Cabinet> {
        (1..=self.cabinets).map(Cabinet)
    }

    pub fn check_cabinet(&self, cabinet: Cabinet) -> Result<(), EngineError> {
        if (1..=self.cabinets).contains(&cabinet.0) {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "unknown cabinet {}: clinic has cabinets 1..={}",
                cabinet.0, self.cabinets
            )))
        }
    }

    pub fn check_slot(&self, slot: SlotTime) -> Result<(), EngineError> {
        if self.grid.contains(slot) {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "time slot {slot} is not on the {}-minute grid between {} and {}",
                self.grid.step_minutes, self.grid.open, self.grid.close
            )))
        }
    }
}
