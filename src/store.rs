//! Durable ledger storage
//!
//! One JSON document per run. Saves go through a temp file that is synced
//! and renamed over the target, so a reader sees either the previous or the
//! new document, never a torn one. A document that exists but cannot be
//! parsed is [`StoreError::Corrupt`]; callers must not treat it as absent.

use crate::state::FORMAT_VERSION;
use crate::MigrationRun;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Ledger storage trait
pub trait LedgerStore: Send + Sync + 'static {
    /// Load the run, distinguishing "no ledger" from "unreadable ledger"
    fn load(&self) -> Result<MigrationRun, StoreError>;
    /// Replace the stored run
    fn save(&self, run: &MigrationRun) -> Result<(), StoreError>;
    /// Human-readable location for logs
    fn location(&self) -> String;
}

/// Ledger storage error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No ledger at this location
    #[error("ledger not found: {0}")]
    NotFound(String),
    /// A ledger exists but cannot be read back
    #[error("ledger corrupt at {location}: {reason}")]
    Corrupt {
        /// Ledger location
        location: String,
        /// Parse failure
        reason: String,
    },
    /// A ledger already exists where a new run was to be initialized
    #[error("ledger already exists: {0}")]
    AlreadyExists(String),
    /// Filesystem failure
    #[error("ledger I/O error at {location}: {source}")]
    Io {
        /// Ledger location
        location: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Run could not be encoded
    #[error("ledger serialization failed: {0}")]
    Serialize(String),
}

/// Create the ledger for a new run. Refuses to overwrite an existing ledger.
pub fn initialize(path: &Path, run: &MigrationRun) -> Result<(), StoreError> {
    if path.exists() {
        return Err(StoreError::AlreadyExists(path.display().to_string()));
    }
    save(path, run)
}

/// Load the run stored at `path`
pub fn load(path: &Path) -> Result<MigrationRun, StoreError> {
    let location = path.display().to_string();
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(location));
        }
        Err(source) => return Err(StoreError::Io { location, source }),
    };
    decode(&bytes, &location)
}

/// Atomically replace the run stored at `path`
pub fn save(path: &Path, run: &MigrationRun) -> Result<(), StoreError> {
    let bytes = encode(run)?;
    write_atomic(path, &bytes).map_err(|source| StoreError::Io {
        location: path.display().to_string(),
        source,
    })
}

fn encode(run: &MigrationRun) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(run).map_err(|e| StoreError::Serialize(e.to_string()))
}

fn decode(bytes: &[u8], location: &str) -> Result<MigrationRun, StoreError> {
    let run: MigrationRun = serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        location: location.to_string(),
        reason: e.to_string(),
    })?;
    if run.format_version > FORMAT_VERSION {
        return Err(StoreError::Corrupt {
            location: location.to_string(),
            reason: format!(
                "format version {} is newer than supported version {}",
                run.format_version, FORMAT_VERSION
            ),
        });
    }
    Ok(run)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}

/// Ledger stored as a JSON file
#[derive(Clone, Debug)]
pub struct FileLedger {
    path: PathBuf,
}

impl FileLedger {
    /// Ledger at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ledger file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for FileLedger {
    fn load(&self) -> Result<MigrationRun, StoreError> {
        load(&self.path)
    }

    fn save(&self, run: &MigrationRun) -> Result<(), StoreError> {
        save(&self.path, run)
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory ledger for testing.
///
/// Keeps the encoded document, so loads exercise the same codec as files.
pub struct InMemoryLedger {
    data: std::sync::RwLock<Option<Vec<u8>>>,
    saves: std::sync::atomic::AtomicU64,
}

impl InMemoryLedger {
    /// Empty ledger
    pub fn new() -> Self {
        Self {
            data: std::sync::RwLock::new(None),
            saves: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Number of successful saves
    pub fn save_count(&self) -> u64 {
        self.saves.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Overwrite the stored bytes verbatim
    pub fn put_raw(&self, bytes: Vec<u8>) {
        if let Ok(mut data) = self.data.write() {
            *data = Some(bytes);
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore for InMemoryLedger {
    fn load(&self) -> Result<MigrationRun, StoreError> {
        let data = self.data.read().map_err(|e| StoreError::Serialize(e.to_string()))?;
        match data.as_deref() {
            Some(bytes) => decode(bytes, "memory"),
            None => Err(StoreError::NotFound("memory".into())),
        }
    }

    fn save(&self, run: &MigrationRun) -> Result<(), StoreError> {
        let bytes = encode(run)?;
        let mut data = self.data.write().map_err(|e| StoreError::Serialize(e.to_string()))?;
        *data = Some(bytes);
        self.saves.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunOptions;
    use crate::{ObjectKey, ObjectStatus, PhaseStatus};

    /// Run with one object in each of the five statuses
    fn every_status_run() -> MigrationRun {
        let mut options = RunOptions::default();
        options.rewrite = options.rewrite.with_rule("@contoso.com", "@fabrikam.com");
        let mut run = MigrationRun::new("contoso", "fabrikam", options);
        run.ensure_phase("users", &[]);
        run.ensure_phase("groups", &["users".to_string()]);

        let keys: Vec<ObjectKey> = ["u1", "u2", "u3", "u4", "u5"]
            .iter()
            .map(|id| ObjectKey::for_source("user", id))
            .collect();
        for (key, id) in keys.iter().zip(["u1", "u2", "u3", "u4", "u5"]) {
            run.observe("users", key, Some(id));
        }
        run.mark_in_progress("users", &keys[1]);
        run.mark_completed("users", &keys[2], "U3", 2, true);
        run.mark_failed("users", &keys[3], "validation failed: bad upn".into(), 1);
        run.mark_skipped("users", &keys[4], "built-in account".into());
        run.set_phase_status("users", PhaseStatus::Failed, None);
        run.set_phase_status("groups", PhaseStatus::Blocked, Some("users not completed".into()));
        run
    }

    #[test]
    fn test_round_trip_every_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let run = every_status_run();

        let statuses: Vec<ObjectStatus> = run.phase("users").unwrap().objects.values().map(|r| r.status).collect();
        for status in ObjectStatus::ALL {
            assert!(statuses.contains(&status), "missing {status}");
        }

        save(&path, &run).unwrap();
        assert_eq!(load(&path).unwrap(), run);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_load_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, b"{\"format_version\": 1, \"run_id\":").unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_truncated_memory_ledger_is_corrupt() {
        let ledger = InMemoryLedger::new();
        ledger.save(&every_status_run()).unwrap();
        let mut bytes = serde_json::to_vec(&every_status_run()).unwrap();
        bytes.truncate(bytes.len() / 2);
        ledger.put_raw(bytes);

        let err = ledger.load().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref location, .. } if location == "memory"));
    }

    #[test]
    fn test_newer_format_is_corrupt() {
        let ledger = InMemoryLedger::new();
        let mut run = every_status_run();
        run.format_version = FORMAT_VERSION + 1;
        ledger.save(&run).unwrap();

        assert!(matches!(ledger.load(), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_initialize_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let run = every_status_run();

        initialize(&path, &run).unwrap();
        assert!(matches!(initialize(&path, &run), Err(StoreError::AlreadyExists(_))));
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("run.json");
        save(&path, &every_status_run()).unwrap();
        save(&path, &every_status_run()).unwrap();

        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("run.json")]);
    }

    #[test]
    fn test_in_memory_counts_saves() {
        let ledger = InMemoryLedger::new();
        assert!(matches!(ledger.load(), Err(StoreError::NotFound(_))));
        ledger.save(&every_status_run()).unwrap();
        ledger.save(&every_status_run()).unwrap();
        assert_eq!(ledger.save_count(), 2);
    }
}
