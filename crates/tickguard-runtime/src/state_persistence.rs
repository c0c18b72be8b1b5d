#![forbid(unsafe_code)]

//! Scheduler state persistence across sessions.
//!
//! Learned coalescing delays and cumulative coalescer counters are saved as
//! one versioned blob in a key/value [`StorageBackend`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        StateStore                            │
//! │   - Serialises PersistedState to JSON under one key          │
//! │   - Checks the schema version on load                        │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     StorageBackend                           │
//! │   - MemoryStorage: in-memory (testing, ephemeral)            │
//! │   - FileStorage: JSON file (requires state-persistence)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | `StorageError::Io` | File I/O failure | Returned to the caller |
//! | Unreadable file or blob | Truncated or hand-edited state | `LoadOutcome::Corrupt`, defaults kept |
//! | Schema version mismatch | State written by another release | `LoadOutcome::Incompatible`, defaults kept |
//! | Missing entry | First run | `LoadOutcome::Missing` |
//!
//! # Feature Gates
//!
//! - `state-persistence`: Enables `FileStorage`. Without this feature only
//!   `MemoryStorage` is available.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tickguard_core::{CoalescerStats, TunerSnapshot};

/// Schema version of [`PersistedState`].
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Storage key the scheduler state is saved under.
pub const STATE_KEY: &str = "tickguard::scheduler";

/// Errors raised by a [`StorageBackend`].
#[derive(Debug)]
pub enum StorageError {
    /// Reading or writing the medium failed.
    Io(std::io::Error),
    /// State could not be encoded.
    Serialization(String),
    /// Stored bytes are not a state file this build understands.
    Corruption(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "I/O error: {e}"),
            StorageError::Serialization(msg) => write!(f, "serialization error: {msg}"),
            StorageError::Corruption(msg) => write!(f, "storage corruption: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Serialization(_) | StorageError::Corruption(_) => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// One versioned blob held by a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEntry {
    /// Storage key.
    pub key: String,
    /// Schema version of `data`.
    pub version: u32,
    /// Serialized payload.
    pub data: Vec<u8>,
}

/// Key/value medium behind a [`StateStore`].
///
/// The scheduler is single-threaded and saves synchronously, so backends
/// are used through `&self` from one thread and need not be `Send`.
pub trait StorageBackend {
    /// Name used in log fields.
    fn name(&self) -> &str;

    /// Every stored entry; empty when nothing was saved yet.
    fn read(&self) -> StorageResult<HashMap<String, StoredEntry>>;

    /// Replace the stored entries with `entries`.
    fn write(&self, entries: &HashMap<String, StoredEntry>) -> StorageResult<()>;

    /// Delete everything the backend holds.
    fn erase(&self) -> StorageResult<()>;

    /// Whether a write is expected to succeed.
    fn is_available(&self) -> bool {
        true
    }
}

/// Backend that keeps entries for the life of the value.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RefCell<HashMap<String, StoredEntry>>,
    writes: Cell<u64>,
}

impl MemoryStorage {
    /// Empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage seeded with `entries`, as if a previous session wrote them.
    #[must_use]
    pub fn with_entries(entries: HashMap<String, StoredEntry>) -> Self {
        Self {
            entries: RefCell::new(entries),
            writes: Cell::new(0),
        }
    }

    /// Number of `write` calls so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.get()
    }
}

impl StorageBackend for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    fn read(&self) -> StorageResult<HashMap<String, StoredEntry>> {
        Ok(self.entries.borrow().clone())
    }

    fn write(&self, entries: &HashMap<String, StoredEntry>) -> StorageResult<()> {
        self.entries.replace(entries.clone());
        self.writes.set(self.writes.get() + 1);
        Ok(())
    }

    fn erase(&self) -> StorageResult<()> {
        self.entries.borrow_mut().clear();
        Ok(())
    }
}

#[cfg(feature = "state-persistence")]
mod file_storage {
    use super::*;
    use std::fs::{self, File};
    use std::io::{BufReader, BufWriter, Write};
    use std::path::{Path, PathBuf};

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    const FILE_FORMAT: u32 = 1;

    #[derive(Serialize, Deserialize)]
    struct OnDisk {
        format_version: u32,
        entries: HashMap<String, OnDiskEntry>,
    }

    #[derive(Serialize, Deserialize)]
    struct OnDiskEntry {
        version: u32,
        /// Base64 of the entry payload.
        data: String,
    }

    /// JSON state file, replaced atomically on every write.
    ///
    /// ```json
    /// {
    ///   "format_version": 1,
    ///   "entries": {
    ///     "tickguard::scheduler": { "version": 1, "data": "eyJ0dW5lciI6ey4uLn19" }
    ///   }
    /// }
    /// ```
    ///
    /// A file in another format, or with an entry that is not valid base64,
    /// reads as [`StorageError::Corruption`] so the caller keeps defaults and
    /// the next save replaces it.
    #[derive(Debug, Clone)]
    pub struct FileStorage {
        path: PathBuf,
    }

    impl FileStorage {
        /// Storage at `path`. Parent directories are created on first write.
        #[must_use]
        pub fn new(path: impl AsRef<Path>) -> Self {
            Self {
                path: path.as_ref().to_path_buf(),
            }
        }

        /// Path of the state file.
        #[must_use]
        pub fn path(&self) -> &Path {
            &self.path
        }

        fn staging_path(&self) -> PathBuf {
            self.path.with_extension("json.tmp")
        }
    }

    fn decode(file: OnDisk) -> StorageResult<HashMap<String, StoredEntry>> {
        if file.format_version != FILE_FORMAT {
            return Err(StorageError::Corruption(format!(
                "state file format {} (expected {FILE_FORMAT})",
                file.format_version
            )));
        }
        file.entries
            .into_iter()
            .map(|(key, entry)| {
                let data = STANDARD.decode(&entry.data).map_err(|e| {
                    StorageError::Corruption(format!("entry {key} is not base64: {e}"))
                })?;
                let stored = StoredEntry {
                    key: key.clone(),
                    version: entry.version,
                    data,
                };
                Ok((key, stored))
            })
            .collect()
    }

    fn encode(entries: &HashMap<String, StoredEntry>) -> OnDisk {
        OnDisk {
            format_version: FILE_FORMAT,
            entries: entries
                .iter()
                .map(|(key, entry)| {
                    let on_disk = OnDiskEntry {
                        version: entry.version,
                        data: STANDARD.encode(&entry.data),
                    };
                    (key.clone(), on_disk)
                })
                .collect(),
        }
    }

    impl StorageBackend for FileStorage {
        fn name(&self) -> &str {
            "file"
        }

        fn read(&self) -> StorageResult<HashMap<String, StoredEntry>> {
            let file = match File::open(&self.path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
                Err(e) => return Err(e.into()),
            };
            let on_disk: OnDisk = serde_json::from_reader(BufReader::new(file))
                .map_err(|e| StorageError::Corruption(format!("unreadable state file: {e}")))?;
            decode(on_disk)
        }

        fn write(&self, entries: &HashMap<String, StoredEntry>) -> StorageResult<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let staging = self.staging_path();
            let mut writer = BufWriter::new(File::create(&staging)?);
            serde_json::to_writer_pretty(&mut writer, &encode(entries))
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            drop(writer);
            fs::rename(&staging, &self.path)?;
            tracing::trace!(path = %self.path.display(), entries = entries.len(), "state file written");
            Ok(())
        }

        fn erase(&self) -> StorageResult<()> {
            match fs::remove_file(&self.path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            }
        }

        /// The nearest existing ancestor directory must be writable.
        fn is_available(&self) -> bool {
            self.path
                .ancestors()
                .skip(1)
                .find(|dir| dir.as_os_str().is_empty() || dir.is_dir())
                .map(|dir| if dir.as_os_str().is_empty() { Path::new(".") } else { dir })
                .and_then(|dir| fs::metadata(dir).ok())
                .is_some_and(|meta| !meta.permissions().readonly())
        }
    }
}

#[cfg(feature = "state-persistence")]
pub use file_storage::FileStorage;

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler state
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the scheduler carries across sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    /// Learned delays per key.
    pub tuner: TunerSnapshot,
    /// Cumulative coalescer counters.
    pub stats: CoalescerStats,
}

/// Result of [`StateStore::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// State was read and decoded.
    Restored(PersistedState),
    /// Nothing stored yet.
    Missing,
    /// Stored state uses another schema version; defaults apply.
    Incompatible {
        /// Version found in storage.
        stored: u32,
        /// Version this build understands.
        expected: u32,
    },
    /// Stored state could not be decoded; defaults apply.
    Corrupt(String),
}

/// Saves and loads [`PersistedState`] through a backend.
pub struct StateStore {
    backend: Box<dyn StorageBackend>,
    key: String,
}

impl StateStore {
    /// Create a store over `backend` using [`STATE_KEY`].
    #[must_use]
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            key: STATE_KEY.to_string(),
        }
    }

    /// In-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStorage::new()))
    }

    /// File-backed store.
    #[cfg(feature = "state-persistence")]
    #[must_use]
    pub fn with_file(path: impl AsRef<std::path::Path>) -> Self {
        Self::new(Box::new(FileStorage::new(path)))
    }

    /// Use a different storage key, for hosts running several schedulers.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Storage key in use.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Name of the backend.
    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Whether the backend is usable.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    /// Save state, keeping any other entries the backend holds.
    pub fn save(&self, state: &PersistedState) -> StorageResult<()> {
        let data = serde_json::to_vec(state)
            .map_err(|e| StorageError::Serialization(format!("failed to encode state: {e}")))?;
        let mut entries = match self.backend.read() {
            Ok(entries) => entries,
            Err(StorageError::Io(e)) => return Err(StorageError::Io(e)),
            Err(e) => {
                tracing::warn!(error = %e, backend = self.backend.name(), "overwriting unreadable state");
                HashMap::new()
            }
        };
        entries.insert(
            self.key.clone(),
            StoredEntry {
                key: self.key.clone(),
                version: STATE_SCHEMA_VERSION,
                data,
            },
        );
        self.backend.write(&entries)?;
        tracing::debug!(key = %self.key, backend = self.backend.name(), "scheduler state saved");
        Ok(())
    }

    /// Load state. Only I/O failures are errors; anything unreadable or
    /// from another schema version is reported so the caller keeps defaults.
    pub fn load(&self) -> StorageResult<LoadOutcome> {
        let entries = match self.backend.read() {
            Ok(entries) => entries,
            Err(StorageError::Io(e)) => return Err(StorageError::Io(e)),
            Err(e) => {
                tracing::warn!(error = %e, "stored state unreadable, using defaults");
                return Ok(LoadOutcome::Corrupt(e.to_string()));
            }
        };
        let Some(entry) = entries.get(&self.key) else {
            return Ok(LoadOutcome::Missing);
        };
        if entry.version != STATE_SCHEMA_VERSION {
            tracing::warn!(
                stored = entry.version,
                expected = STATE_SCHEMA_VERSION,
                "scheduler state schema mismatch, using defaults"
            );
            return Ok(LoadOutcome::Incompatible {
                stored: entry.version,
                expected: STATE_SCHEMA_VERSION,
            });
        }
        match serde_json::from_slice::<PersistedState>(&entry.data) {
            Ok(state) => {
                tracing::debug!(key = %self.key, keys = state.tuner.entries.len(), "scheduler state loaded");
                Ok(LoadOutcome::Restored(state))
            }
            Err(e) => {
                tracing::warn!(error = %e, "scheduler state undecodable, using defaults");
                Ok(LoadOutcome::Corrupt(e.to_string()))
            }
        }
    }

    /// Remove this store's entry, keeping others.
    pub fn clear(&self) -> StorageResult<()> {
        let mut entries = self.backend.read()?;
        if entries.remove(&self.key).is_some() {
            if entries.is_empty() {
                self.backend.erase()?;
            } else {
                self.backend.write(&entries)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.backend.name())
            .field("key", &self.key)
            .finish()
    }
}
