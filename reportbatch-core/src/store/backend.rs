//! Storage backends for the failure store.
//!
//! The JSON file backend keeps three paths side by side:
//!
//! - `{path}`          current snapshot
//! - `{path}.bak`      previous snapshot
//! - `{path}.tmp`      snapshot being written
//!
//! A save writes and syncs the temp file, rotates the current snapshot to
//! `.bak`, then renames the temp file into place. A crash at any point leaves
//! either the new snapshot or the previous one readable.

use super::failure_store::StoreError;
use super::record::FailureRecord;
use crate::writer::temp_path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Records keyed by portfolio id.
pub type RecordMap = BTreeMap<String, FailureRecord>;

const FORMAT_VERSION: u32 = 1;

/// Where a loaded snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    /// Primary missing or unreadable, previous snapshot used.
    Backup,
    /// Nothing stored yet.
    Empty,
    /// Both copies unreadable; started empty.
    Lost,
}

#[derive(Debug, Clone)]
pub struct Loaded {
    pub records: RecordMap,
    pub source: LoadSource,
}

pub trait FailureBackend: Send + Sync {
    /// Short description for log lines.
    fn describe(&self) -> String;

    fn load(&self) -> Result<Loaded, StoreError>;

    /// Replace the stored snapshot with `records`.
    fn save(&self, records: &RecordMap) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    saved_at: DateTime<Utc>,
    records: RecordMap,
}

/// JSON snapshot file with a rotating backup.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        sibling(&self.path, ".bak")
    }

    fn quarantine_path(&self) -> PathBuf {
        sibling(&self.path, ".corrupt")
    }

    fn io_error(&self, path: &Path, source: io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Move an unreadable primary aside so the next save does not rotate it
    /// over a good backup.
    fn quarantine(&self) {
        let target = self.quarantine_path();
        if let Err(e) = fs::rename(&self.path, &target) {
            tracing::warn!(path = %self.path.display(), error = %e, "could not quarantine corrupt failure store");
        } else {
            tracing::warn!(path = %target.display(), "corrupt failure store quarantined");
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

enum ReadResult {
    Ok(RecordMap),
    Missing,
    Corrupt(String),
}

fn read_snapshot(path: &Path) -> ReadResult {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return ReadResult::Missing,
        Err(e) => return ReadResult::Corrupt(e.to_string()),
    };
    match serde_json::from_str::<StoreDocument>(&content) {
        Ok(doc) if doc.version == FORMAT_VERSION => ReadResult::Ok(doc.records),
        Ok(doc) => ReadResult::Corrupt(format!("unsupported version {}", doc.version)),
        Err(e) => ReadResult::Corrupt(e.to_string()),
    }
}

impl FailureBackend for JsonFileBackend {
    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }

    fn load(&self) -> Result<Loaded, StoreError> {
        let primary_problem = match read_snapshot(&self.path) {
            ReadResult::Ok(records) => {
                return Ok(Loaded {
                    records,
                    source: LoadSource::Primary,
                })
            }
            ReadResult::Missing => None,
            ReadResult::Corrupt(reason) => {
                tracing::error!(path = %self.path.display(), %reason, "failure store unreadable, trying backup");
                self.quarantine();
                Some(reason)
            }
        };

        let backup = self.backup_path();
        match read_snapshot(&backup) {
            ReadResult::Ok(records) => {
                tracing::warn!(path = %backup.display(), records = records.len(), "failure store restored from backup");
                Ok(Loaded {
                    records,
                    source: LoadSource::Backup,
                })
            }
            ReadResult::Missing if primary_problem.is_none() => Ok(Loaded {
                records: RecordMap::new(),
                source: LoadSource::Empty,
            }),
            ReadResult::Missing => {
                tracing::error!(path = %self.path.display(), "failure store and backup unreadable, starting empty; outstanding failures were lost");
                Ok(Loaded {
                    records: RecordMap::new(),
                    source: LoadSource::Lost,
                })
            }
            ReadResult::Corrupt(reason) => {
                tracing::error!(path = %backup.display(), %reason, "failure store and backup unreadable, starting empty; outstanding failures were lost");
                Ok(Loaded {
                    records: RecordMap::new(),
                    source: LoadSource::Lost,
                })
            }
        }
    }

    fn save(&self, records: &RecordMap) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(parent, e))?;
        }

        let doc = StoreDocument {
            version: FORMAT_VERSION,
            saved_at: Utc::now(),
            records: records.clone(),
        };
        let json = serde_json::to_vec_pretty(&doc)?;

        let tmp = temp_path(&self.path);
        {
            let mut file = fs::File::create(&tmp).map_err(|e| self.io_error(&tmp, e))?;
            file.write_all(&json).map_err(|e| self.io_error(&tmp, e))?;
            file.sync_all().map_err(|e| self.io_error(&tmp, e))?;
        }

        if self.path.exists() {
            let backup = self.backup_path();
            fs::rename(&self.path, &backup).map_err(|e| self.io_error(&backup, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            self.io_error(&self.path, e)
        })
    }
}

/// In-memory backend. Saves can be made to fail to simulate a broken disk.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<RecordMap>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: RecordMap) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Last successfully saved snapshot.
    pub fn snapshot(&self) -> RecordMap {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FailureBackend for MemoryBackend {
    fn describe(&self) -> String {
        "memory".into()
    }

    fn load(&self) -> Result<Loaded, StoreError> {
        let records = self.snapshot();
        let source = if records.is_empty() {
            LoadSource::Empty
        } else {
            LoadSource::Primary
        };
        Ok(Loaded { records, source })
    }

    fn save(&self, records: &RecordMap) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory backend set to fail".into()));
        }
        *self.records.lock().unwrap_or_else(PoisonError::into_inner) = records.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl<B: FailureBackend + ?Sized> FailureBackend for std::sync::Arc<B> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn load(&self) -> Result<Loaded, StoreError> {
        (**self).load()
    }

    fn save(&self, records: &RecordMap) -> Result<(), StoreError> {
        (**self).save(records)
    }
}
