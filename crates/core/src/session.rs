//! Session Persistence
//!
//! The whole in-progress encounter is one [`Session`] value, written as a
//! single JSON snapshot after every checkpoint and read back on startup.

use crate::{case::Case, conversation::Message, disease_pool::DiseasePool, error::StorageError};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

pub const SNAPSHOT_FILE: &str = "session.json";

/// Everything needed to resume an encounter.
///
/// Missing fields in a stored snapshot fall back to their defaults, so a
/// partial snapshot still loads.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Session {
    #[serde(
        serialize_with = "serialize_credential",
        deserialize_with = "deserialize_credential"
    )]
    pub credential: Option<SecretString>,
    pub case: Option<Case>,
    pub history: Vec<Message>,
    pub case_count: u32,
    #[serde(flatten)]
    pub pool: DiseasePool,
}

impl Session {
    pub fn has_credential(&self) -> bool {
        self.credential
            .as_ref()
            .is_some_and(|c| !c.expose_secret().is_empty())
    }
}

fn serialize_credential<S: Serializer>(
    credential: &Option<SecretString>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match credential {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_credential<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

/// Raw snapshot storage. The provided methods implement the save/load rules
/// on top of it.
pub trait SessionStore: Send + Sync {
    fn write_snapshot(&self, bytes: &[u8]) -> Result<(), StorageError>;
    fn read_snapshot(&self) -> Result<Option<Vec<u8>>, StorageError>;
    fn remove_snapshot(&self) -> Result<(), StorageError>;

    /// Replaces the stored snapshot. Does nothing while no credential is set.
    fn save(&self, session: &Session) -> Result<(), StorageError> {
        if !session.has_credential() {
            debug!("No credential set; skipping session save");
            return Ok(());
        }
        let bytes = serde_json::to_vec(session)?;
        self.write_snapshot(&bytes)
    }

    fn load(&self) -> Result<Option<Session>, StorageError> {
        let Some(bytes) = self.read_snapshot()? else {
            return Ok(None);
        };
        let mut session: Session = serde_json::from_slice(&bytes)?;
        session.pool.normalize();
        Ok(Some(session))
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.remove_snapshot()
    }
}

/// Stores the snapshot as a JSON file. Writes go to a sibling temp file that
/// is then renamed over the target.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/plantao/session.json`, or the working directory when the
    /// platform has no data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .map(|dir| dir.join("plantao"))
            .unwrap_or_default()
            .join(SNAPSHOT_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for JsonFileStore {
    fn write_snapshot(&self, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "Session snapshot written");
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_snapshot(&self) -> Result<(), StorageError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Session snapshot removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps the snapshot in memory, for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Vec<u8>>> {
        // A panic while holding the lock cannot leave a half-written Vec.
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionStore for MemoryStore {
    fn write_snapshot(&self, bytes: &[u8]) -> Result<(), StorageError> {
        *self.slot() = Some(bytes.to_vec());
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.slot().clone())
    }

    fn remove_snapshot(&self) -> Result<(), StorageError> {
        *self.slot() = None;
        Ok(())
    }
}
