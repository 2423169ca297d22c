use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Dentist,
    Receptionist,
    Patient,
}

impl Role {
    pub fn is_staff(self) -> bool {
        !matches!(self, Role::Patient)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Admin => "Admin",
            Role::Dentist => "Dentist",
            Role::Receptionist => "Receptionist",
            Role::Patient => "Patient",
        };
        f.write_str(s)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "dentist" => Ok(Role::Dentist),
            "receptionist" => Ok(Role::Receptionist),
            "patient" => Ok(Role::Patient),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// The authenticated caller, as vouched for by the auth layer in front of us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn is_staff(&self) -> bool {
        self.role.is_staff()
    }
}

pub fn ensure_staff(actor: &Actor) -> Result<(), EngineError> {
    if actor.is_staff() {
        Ok(())
    } else {
        Err(EngineError::Forbidden(format!(
            "role {} cannot manage appointments",
            actor.role
        )))
    }
}

pub fn ensure_patient(actor: &Actor) -> Result<(), EngineError> {
    if actor.role == Role::Patient {
        Ok(())
    } else {
        Err(EngineError::Forbidden(
            "self-booking is only available to patients".into(),
        ))
    }
}

/// Staff may act on any appointment; a patient only on their own.
pub fn ensure_owner_or_staff(actor: &Actor, patient_id: Ulid) -> Result<(), EngineError> {
    if actor.is_staff() || actor.id == patient_id {
        Ok(())
    } else {
        Err(EngineError::Forbidden(
            "patients may only act on their own appointments".into(),
        ))
    }
}
