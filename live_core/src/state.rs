//! Persisted algorithm state.
use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const STATE_VERSION: u32 = 1;

/// SHA-256 hex digest of the algorithm name.
pub fn checksum(algo_name: &str) -> String {
    format!("{:x}", Sha256::digest(algo_name.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub checksum: String,
    /// Values passed to `record`.
    #[serde(default)]
    pub recorded: BTreeMap<String, f64>,
    /// Free-form algorithm variables.
    #[serde(default)]
    pub user: serde_json::Map<String, serde_json::Value>,
}

impl PersistedState {
    pub fn new(algo_name: &str) -> Self {
        Self {
            version: STATE_VERSION,
            checksum: checksum(algo_name),
            recorded: BTreeMap::new(),
            user: serde_json::Map::new(),
        }
    }

    /// Refuses state written by another algorithm or another format version.
    pub fn verify(&self, algo_name: &str) -> Result<()> {
        let expected = checksum(algo_name);
        if self.checksum != expected {
            tracing::error!("State checksum {} does not match algorithm {algo_name}", self.checksum);
            return Err(Error::ChecksumMismatch {
                expected,
                found: self.checksum.clone(),
            });
        }
        if self.version != STATE_VERSION {
            return Err(Error::StateVersion(self.version));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum StateStore {
    /// JSON file replaced atomically on every save.
    File(PathBuf),
    Memory(Arc<Mutex<Option<String>>>),
}

impl StateStore {
    pub fn memory() -> Self {
        StateStore::Memory(Arc::default())
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let text = serde_json::to_string_pretty(state)?;
        match self {
            StateStore::File(path) => {
                let tmp = path.with_extension("tmp");
                fs::write(&tmp, text)?;
                fs::rename(&tmp, path)?;
                tracing::debug!("Saved state to {}", path.display());
            }
            StateStore::Memory(slot) => {
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(text);
            }
        }
        Ok(())
    }

    /// `None` when nothing was saved yet.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        let text = match self {
            StateStore::File(path) => match fs::read_to_string(path) {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            },
            StateStore::Memory(slot) => match slot.lock().unwrap_or_else(PoisonError::into_inner).clone() {
                Some(text) => text,
                None => return Ok(None),
            },
        };
        Ok(Some(serde_json::from_str(&text)?))
    }
}
