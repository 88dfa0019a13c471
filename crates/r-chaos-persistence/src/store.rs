//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{PersistenceError, Result};

/// Current record envelope version.
pub const RECORD_VERSION: u16 = 1;

/// Sink for terminal experiment records.
///
/// Callers treat saving as fire-and-forget: an error is reported back but must
/// never change the outcome of the experiment that produced the record.
pub trait ExperimentStore: Send + Sync + fmt::Debug {
    /// Persist the JSON form of a record under its experiment identifier.
    fn save(&self, id: &str, record: &serde_json::Value) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordEnvelope {
    version: u16,
    saved_at: DateTime<Utc>,
    hash: String,
    record: serde_json::Value,
}

/// Stores one pretty-printed JSON envelope per experiment under a directory.
#[derive(Debug, Clone)]
pub struct FileExperimentStore {
    root: PathBuf,
}

impl FileExperimentStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory holding the record files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !id.starts_with('.');
        if !valid {
            return Err(PersistenceError::InvalidId(id.to_owned()));
        }
        Ok(self.root.join(format!("{id}.json")))
    }

    /// Load a record, rejecting it when the stored hash does not match.
    pub fn load(&self, id: &str) -> Result<serde_json::Value> {
        let envelope = self.load_envelope(id)?;
        if compute_hash(&envelope.record)? != envelope.hash {
            return Err(PersistenceError::HashMismatch(id.to_owned()));
        }
        Ok(envelope.record)
    }

    /// Verify the integrity of a stored record.
    pub fn verify(&self, id: &str) -> bool {
        match self.load_envelope(id) {
            Ok(envelope) => compute_hash(&envelope.record)
                .map(|hash| hash == envelope.hash)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Identifiers of all stored records, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn load_envelope(&self, id: &str) -> Result<RecordEnvelope> {
        let path = self.path_for(id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(PersistenceError::NotFound(id.to_owned()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl ExperimentStore for FileExperimentStore {
    fn save(&self, id: &str, record: &serde_json::Value) -> Result<()> {
        let path = self.path_for(id)?;
        let envelope = RecordEnvelope {
            version: RECORD_VERSION,
            saved_at: Utc::now(),
            hash: compute_hash(record)?,
            record: record.clone(),
        };

        // Write beside the target and rename so readers never see a torn file.
        let staging = path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&staging)?);
            writer.write_all(&serde_json::to_vec_pretty(&envelope)?)?;
            writer.flush()?;
        }
        fs::rename(&staging, &path)?;
        debug!(target: "r_chaos::persistence", id, path = %path.display(), "experiment record saved");
        Ok(())
    }
}

/// Keeps records in memory, in save order.
#[derive(Debug, Default)]
pub struct MemoryExperimentStore {
    records: Mutex<IndexMap<String, serde_json::Value>>,
}

impl MemoryExperimentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a stored record.
    pub fn get(&self, id: &str) -> Option<serde_json::Value> {
        self.records.lock().get(id).cloned()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Identifiers in save order.
    pub fn ids(&self) -> Vec<String> {
        self.records.lock().keys().cloned().collect()
    }
}

impl ExperimentStore for MemoryExperimentStore {
    fn save(&self, id: &str, record: &serde_json::Value) -> Result<()> {
        self.records.lock().insert(id.to_owned(), record.clone());
        Ok(())
    }
}

fn compute_hash(record: &serde_json::Value) -> Result<String> {
    let serialized = serde_json::to_vec(record)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}
