//! Persistent name → embedding store.
//!
//! The store keeps one L2-normalized embedding per enrolled name. The live map
//! is shared as an `Arc` snapshot: matches clone the `Arc`, enrollments build a
//! new map, persist it, and only then swap it in. A match therefore sees either
//! the pre- or the post-enrollment state, never a half-applied one.
//!
//! # On-disk format
//!
//! Version 2 (current) is a JSON object:
//!
//! ```text
//! {"version": 2, "identities": {"Alice": [0.1, ...], ...}}
//! ```
//!
//! Version 1 (legacy) is a bare JSON list of `[embedding, name]` pairs. It is
//! upgraded once at load time (last duplicate name wins) and immediately
//! rewritten as version 2.

use crate::types::{Embedding, EmbeddingError};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

/// Current on-disk format version.
pub const STORE_FORMAT_VERSION: u32 = 2;

/// Enrolled identities, ordered by name.
pub type Identities = BTreeMap<String, Embedding>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid embedding for {name}: {source}")]
    EmbeddingInvalid {
        name: String,
        #[source]
        source: EmbeddingError,
    },
    #[error("failed to write embedding store {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize embedding store: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("embedding store lock poisoned")]
    Poisoned,
}

/// Why a persisted store was discarded at load time.
#[derive(Error, Debug)]
pub enum StoreCorrupted {
    #[error("store file unreadable: {0}")]
    Unreadable(#[source] std::io::Error),
    #[error("store file unparseable: {0}")]
    Unparseable(#[source] serde_json::Error),
    #[error("unsupported store format version {0}")]
    UnsupportedVersion(u32),
    #[error("legacy store has no usable entries ({0} rejected)")]
    NoUsableEntries(usize),
}

/// Outcome of reading the persisted store.
#[derive(Debug)]
pub enum LoadStatus {
    /// No file yet; started empty.
    Missing,
    /// Current-format file read. `dropped` counts zero-magnitude entries.
    Loaded { identities: usize, dropped: usize },
    /// Legacy list-of-pairs file read and upgraded.
    Upgraded { identities: usize, dropped: usize },
    /// File could not be used; started empty.
    Recovered(StoreCorrupted),
}

impl LoadStatus {
    pub fn is_recovered(&self) -> bool {
        matches!(self, LoadStatus::Recovered(_))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    identities: BTreeMap<String, Vec<f32>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyEntry {
    Pair(Vec<f32>, String),
    Malformed(IgnoredAny),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PersistedStore {
    Versioned(StoreFile),
    Legacy(Vec<LegacyEntry>),
}

/// Result of decoding file bytes into identities.
struct Decoded {
    identities: Identities,
    dropped: usize,
    upgraded: bool,
}

fn decode(bytes: &[u8]) -> Result<Decoded, StoreCorrupted> {
    let persisted: PersistedStore =
        serde_json::from_slice(bytes).map_err(StoreCorrupted::Unparseable)?;

    let (raw, upgraded, mut dropped) = match persisted {
        PersistedStore::Versioned(file) => {
            if file.version != STORE_FORMAT_VERSION {
                return Err(StoreCorrupted::UnsupportedVersion(file.version));
            }
            (file.identities, false, 0)
        }
        PersistedStore::Legacy(entries) => {
            let mut raw = BTreeMap::new();
            let mut malformed = 0;
            for entry in entries {
                match entry {
                    // Later duplicates overwrite earlier ones.
                    LegacyEntry::Pair(values, name) => {
                        raw.insert(name, values);
                    }
                    LegacyEntry::Malformed(_) => malformed += 1,
                }
            }
            (raw, true, malformed)
        }
    };

    let mut identities = Identities::new();
    for (name, values) in raw {
        match Embedding::normalize(&values) {
            Ok(embedding) => {
                identities.insert(name, embedding);
            }
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "dropping unusable stored embedding");
                dropped += 1;
            }
        }
    }

    // A legacy list with nothing usable is a broken file, not an empty store.
    if upgraded && identities.is_empty() && dropped > 0 {
        return Err(StoreCorrupted::NoUsableEntries(dropped));
    }

    Ok(Decoded {
        identities,
        dropped,
        upgraded,
    })
}

fn encode(identities: &Identities) -> Result<Vec<u8>, serde_json::Error> {
    let file = StoreFile {
        version: STORE_FORMAT_VERSION,
        identities: identities
            .iter()
            .map(|(name, e)| (name.clone(), e.values().to_vec()))
            .collect(),
    };
    serde_json::to_vec(&file)
}

/// Read `path`, never failing: a missing file is empty, a bad one is recovered.
fn read_identities(path: &Path) -> (Identities, LoadStatus) {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no embedding store yet; starting empty");
            return (Identities::new(), LoadStatus::Missing);
        }
        Err(e) => {
            let reason = StoreCorrupted::Unreadable(e);
            tracing::warn!(path = %path.display(), error = %reason, "embedding store recovered as empty");
            return (Identities::new(), LoadStatus::Recovered(reason));
        }
    };

    match decode(&bytes) {
        Ok(decoded) => {
            let count = decoded.identities.len();
            let status = if decoded.upgraded {
                LoadStatus::Upgraded {
                    identities: count,
                    dropped: decoded.dropped,
                }
            } else {
                LoadStatus::Loaded {
                    identities: count,
                    dropped: decoded.dropped,
                }
            };
            tracing::info!(
                path = %path.display(),
                identities = count,
                dropped = decoded.dropped,
                upgraded = decoded.upgraded,
                "embedding store loaded"
            );
            (decoded.identities, status)
        }
        Err(reason) => {
            tracing::warn!(path = %path.display(), error = %reason, "embedding store recovered as empty");
            (Identities::new(), LoadStatus::Recovered(reason))
        }
    }
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let written = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .and_then(|mut f| {
            f.write_all(bytes)?;
            f.sync_all()
        })
        .and_then(|()| fs::rename(&tmp_path, path));

    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&tmp_path) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %tmp_path.display(), error = %cleanup, "failed to remove temp store file");
            }
        }
        return Err(io_err(e));
    }
    Ok(())
}

fn invalid(name: &str, source: EmbeddingError) -> StoreError {
    StoreError::EmbeddingInvalid {
        name: name.to_string(),
        source,
    }
}

/// File-backed embedding store with an in-memory snapshot.
pub struct EmbeddingStore {
    path: PathBuf,
    identities: RwLock<Arc<Identities>>,
    /// Serializes enrollments so two writers never persist divergent maps.
    writer: Mutex<()>,
}

impl EmbeddingStore {
    /// Load the store at `path`.
    ///
    /// Never fails: see [`LoadStatus`] for what happened. A legacy file is
    /// rewritten in the current format; a failed rewrite is only logged.
    pub fn load(path: impl Into<PathBuf>) -> (Self, LoadStatus) {
        let path = path.into();
        let (identities, status) = read_identities(&path);

        let store = Self {
            path,
            identities: RwLock::new(Arc::new(identities)),
            writer: Mutex::new(()),
        };

        if matches!(status, LoadStatus::Upgraded { .. }) {
            if let Err(e) = store.save() {
                tracing::warn!(error = %e, "failed to rewrite upgraded embedding store");
            }
        }

        (store, status)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Immutable view of the current identities.
    pub fn snapshot(&self) -> Arc<Identities> {
        let guard = self.identities.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*guard)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Embedding> {
        self.snapshot().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    /// Persist the current snapshot.
    pub fn save(&self) -> Result<(), StoreError> {
        let _writer = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        let bytes = encode(&self.snapshot())?;
        write_atomic(&self.path, &bytes)
    }

    /// Re-read the file, replacing the in-memory snapshot.
    pub fn reload(&self) -> Result<LoadStatus, StoreError> {
        let _writer = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        let (identities, status) = read_identities(&self.path);
        let mut guard = self.identities.write().map_err(|_| StoreError::Poisoned)?;
        *guard = Arc::new(identities);
        Ok(status)
    }

    /// Add `raw` under `name`, merging with any existing embedding.
    ///
    /// New names store `normalize(raw)`. Existing names store
    /// `normalize(existing + normalize(raw))`. The file is rewritten before
    /// the in-memory snapshot is swapped, and nothing changes on error.
    pub fn enroll(&self, name: &str, raw: &[f32]) -> Result<Embedding, StoreError> {
        let incoming = Embedding::normalize(raw).map_err(|source| invalid(name, source))?;
        self.enroll_normalized(name, incoming)
    }

    /// Add the mean of several raw samples under `name` as one enrollment.
    ///
    /// Each sample is normalized first so every photo carries equal weight.
    /// An existing embedding for `name` is merged with the mean as in
    /// [`EmbeddingStore::enroll`].
    pub fn enroll_mean(&self, name: &str, samples: &[Vec<f32>]) -> Result<Embedding, StoreError> {
        let normalized = samples
            .iter()
            .map(|raw| Embedding::normalize(raw))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| invalid(name, source))?;
        let mean = Embedding::mean(&normalized).map_err(|source| invalid(name, source))?;
        self.enroll_normalized(name, mean)
    }

    fn enroll_normalized(&self, name: &str, incoming: Embedding) -> Result<Embedding, StoreError> {
        let _writer = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        let current = self.snapshot();

        let merged = match current.get(name) {
            Some(existing) => existing
                .merge(&incoming)
                .map_err(|source| invalid(name, source))?,
            None => incoming,
        };

        let mut next = Identities::clone(&current);
        let replaced = next.insert(name.to_string(), merged.clone()).is_some();

        write_atomic(&self.path, &encode(&next)?)?;

        let mut guard = self.identities.write().map_err(|_| StoreError::Poisoned)?;
        *guard = Arc::new(next);
        drop(guard);

        tracing::info!(name, merged = replaced, dim = merged.dim(), "identity enrolled");
        Ok(merged)
    }
}
