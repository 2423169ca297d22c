use std::collections::HashMap;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PatientProfile {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderProfile {
    pub name: String,
    pub email: Option<String>,
}

/// Lookup of the people an appointment refers to. Patient and provider records
/// are owned elsewhere; the scheduler only reads display names through here.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn patient(&self, id: Ulid) -> Option<PatientProfile>;
    async fn provider(&self, id: Ulid) -> Option<ProviderProfile>;
}

#[derive(Debug, Default, Deserialize)]
struct DirectorySeed {
    #[serde(default)]
    patients: HashMap<Ulid, PatientProfile>,
    #[serde(default)]
    providers: HashMap<Ulid, ProviderProfile>,
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    patients: DashMap<Ulid, PatientProfile>,
    providers: DashMap<Ulid, ProviderProfile>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{"patients": {id: {...}}, "providers": {id: {...}}}`.
    pub fn from_json_file(path: &Path) -> io::Result<Self> {
        let raw = std::fs::read(path)?;
        Self::from_json_slice(&raw)
    }

    pub fn from_json_slice(raw: &[u8]) -> io::Result<Self> {
        let seed: DirectorySeed = serde_json::from_slice(raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let dir = Self::new();
        for (id, p) in seed.patients {
            dir.patients.insert(id, p);
        }
        for (id, p) in seed.providers {
            dir.providers.insert(id, p);
        }
        Ok(dir)
    }

    pub fn insert_patient(&self, id: Ulid, profile: PatientProfile) {
        self.patients.insert(id, profile);
    }

    pub fn insert_provider(&self, id: Ulid, profile: ProviderProfile) {
        self.providers.insert(id, profile);
    }

    pub fn len(&self) -> usize {
        self.patients.len() + self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn patient(&self, id: Ulid) -> Option<PatientProfile> {
        self.patients.get(&id).map(|e| e.value().clone())
    }

    async fn provider(&self, id: Ulid) -> Option<ProviderProfile> {
        self.providers.get(&id).map(|e| e.value().clone())
    }
}
