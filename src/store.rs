use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::section::SectionId;

/// Snapshot persisted per section so a countdown survives a process restart.
///
/// `end_timestamp_ms` is present only while the section is running; recovery
/// diffs it against the wall clock to resume or finalize the countdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRecord {
    pub running: bool,
    pub remaining_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp_ms: Option<u64>,
}

/// Errors raised by a [`TimerStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("store record could not be encoded or decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Durable key-value facade the registry writes through on every state
/// transition worth surviving a restart.
///
/// A write must be durable by the time the call returns; there is no
/// ordering requirement across different sections. The registry treats
/// failures as best-effort durability loss, never as command failure.
#[async_trait]
pub trait TimerStore: Send + Sync {
    async fn put(&self, section: SectionId, record: SectionRecord) -> Result<(), StoreError>;

    /// Erase all persisted state for a section. Removing an absent
    /// section is a no-op.
    async fn remove(&self, section: SectionId) -> Result<(), StoreError>;

    async fn get(&self, section: SectionId) -> Result<Option<SectionRecord>, StoreError>;

    /// Sections that currently have any persisted state.
    async fn active_sections(&self) -> Result<Vec<SectionId>, StoreError>;
}

/// File-backed store keeping all section records in one JSON document.
///
/// Each write lands in a temporary file that is synced and renamed over
/// the live document, so a crash mid-write leaves the previous snapshot
/// intact.
pub struct FileTimerStore {
    path: PathBuf,
    records: Mutex<BTreeMap<SectionId, SectionRecord>>,
}

impl FileTimerStore {
    /// Open a store at `path`, loading any previously persisted records.
    ///
    /// An unreadable or unparseable document is logged and treated as
    /// empty rather than refusing to start.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    log::warn!(
                        "Timer store at {} is unreadable, starting empty: {}",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                log::warn!(
                    "Timer store at {} could not be read, starting empty: {}",
                    path.display(),
                    e
                );
                BTreeMap::new()
            }
        };
        Self {
            path,
            records: Mutex::new(records),
        }
    }

    fn flush(path: &Path, records: &BTreeMap<SectionId, SectionRecord>) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(records)?;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[async_trait]
impl TimerStore for FileTimerStore {
    async fn put(&self, section: SectionId, record: SectionRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        records.insert(section, record);
        Self::flush(&self.path, &records)
    }

    async fn remove(&self, section: SectionId) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.remove(&section).is_none() {
            return Ok(());
        }
        Self::flush(&self.path, &records)
    }

    async fn get(&self, section: SectionId) -> Result<Option<SectionRecord>, StoreError> {
        Ok(self.records.lock().await.get(&section).cloned())
    }

    async fn active_sections(&self) -> Result<Vec<SectionId>, StoreError> {
        Ok(self.records.lock().await.keys().copied().collect())
    }
}

/// In-memory store for tests and embedders that do not need durability.
#[derive(Default)]
pub struct MemoryTimerStore {
    records: Mutex<BTreeMap<SectionId, SectionRecord>>,
}

impl MemoryTimerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimerStore for MemoryTimerStore {
    async fn put(&self, section: SectionId, record: SectionRecord) -> Result<(), StoreError> {
        self.records.lock().await.insert(section, record);
        Ok(())
    }

    async fn remove(&self, section: SectionId) -> Result<(), StoreError> {
        self.records.lock().await.remove(&section);
        Ok(())
    }

    async fn get(&self, section: SectionId) -> Result<Option<SectionRecord>, StoreError> {
        Ok(self.records.lock().await.get(&section).cloned())
    }

    async fn active_sections(&self) -> Result<Vec<SectionId>, StoreError> {
        Ok(self.records.lock().await.keys().copied().collect())
    }
}
