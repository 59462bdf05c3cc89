//! Transfer history tracking for Linkdrop.
//!
//! Sessions keep summaries of terminal transfers in memory. This module
//! persists them so users can review past transfers across runs.
//!
//! ## Features
//!
//! - Records every terminal transfer (sent and received)
//! - Respects `max_entries` limit from configuration
//! - Auto-clears old entries based on `auto_clear_days`
//! - Persists history to a JSON file

use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::HistoryConfig;
use crate::error::{Error, Result};
use crate::transfer::{TransferId, TransferStatus, TransferSummary};

/// A single transfer history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Address of the peer, as the user typed or saw it
    pub peer: String,
    /// What happened
    #[serde(flatten)]
    pub summary: TransferSummary,
}

impl HistoryEntry {
    /// Wrap a terminal summary.
    #[must_use]
    pub fn new(peer: impl Into<String>, summary: TransferSummary) -> Self {
        Self {
            peer: peer.into(),
            summary,
        }
    }

    /// Whether the transfer ended verified.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.summary.status == TransferStatus::Completed
    }

    /// Completion time as a human-readable string.
    #[must_use]
    pub fn formatted_timestamp(&self) -> String {
        self.summary
            .finished_at
            .format("%Y-%m-%d %H:%M")
            .to_string()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryDatabase {
    version: u32,
    entries: Vec<HistoryEntry>,
}

/// Transfer history store.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    /// Newest first
    entries: Vec<HistoryEntry>,
    config: HistoryConfig,
}

impl HistoryStore {
    /// Load the history store from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be loaded.
    pub fn load_with_config(config: HistoryConfig) -> Result<Self> {
        let path = Self::default_path().unwrap_or_else(|| PathBuf::from("history.json"));
        Self::load_from(path, config)
    }

    /// Load from a specific path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HistoryError`] if the file exists but cannot be
    /// read or parsed.
    pub fn load_from(path: PathBuf, config: HistoryConfig) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path,
                entries: Vec::new(),
                config,
            });
        }

        let file = fs::File::open(&path).map_err(|e| {
            Error::HistoryError(format!(
                "Failed to open history store at {}: {e}",
                path.display()
            ))
        })?;

        let db: HistoryDatabase = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::HistoryError(format!(
                "Failed to parse history store at {}: {e}",
                path.display()
            ))
        })?;

        let mut store = Self {
            path,
            entries: db.entries,
            config,
        };
        store.apply_auto_clear();

        Ok(store)
    }

    /// Get the default history store path.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "linkdrop", "Linkdrop")
            .map(|dirs| dirs.data_dir().join("history.json"))
    }

    /// Save the history store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HistoryError`] if the store cannot be written.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::HistoryError(format!(
                    "Failed to create history store directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let db = HistoryDatabase {
            version: 1,
            entries: self.entries.clone(),
        };

        let file = fs::File::create(&self.path).map_err(|e| {
            Error::HistoryError(format!(
                "Failed to create history store at {}: {e}",
                self.path.display()
            ))
        })?;

        serde_json::to_writer_pretty(BufWriter::new(file), &db).map_err(|e| {
            Error::HistoryError(format!(
                "Failed to write history store at {}: {e}",
                self.path.display()
            ))
        })
    }

    /// Add an entry (newest first), prune to `max_entries` and save.
    ///
    /// Does nothing when history is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be saved.
    pub fn add(&mut self, entry: HistoryEntry) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        self.entries.insert(0, entry);
        self.entries.truncate(self.config.max_entries);
        self.save()
    }

    /// List entries, newest first, at most `limit` of them.
    #[must_use]
    pub fn list(&self, limit: Option<usize>) -> &[HistoryEntry] {
        limit.map_or_else(
            || &self.entries[..],
            |n| &self.entries[..n.min(self.entries.len())],
        )
    }

    /// Get an entry by transfer id.
    #[must_use]
    pub fn find_by_id(&self, id: &TransferId) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| &e.summary.id == id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be saved.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.save()
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn apply_auto_clear(&mut self) {
        let Some(days) = self.config.auto_clear_days else {
            return;
        };
        let cutoff = Utc::now() - Duration::days(i64::from(days));

        let len_before = self.entries.len();
        self.entries.retain(|e| e.summary.finished_at >= cutoff);

        if self.entries.len() < len_before {
            tracing::debug!(
                removed = len_before - self.entries.len(),
                "Auto-cleared old history entries"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{TransferDirection, TransferInfo};
    use tempfile::TempDir;

    fn summary(name: &str, status: TransferStatus) -> TransferSummary {
        let info = TransferInfo::new(
            TransferId::generate(),
            name,
            1024,
            256,
            TransferDirection::Sending,
        );
        TransferSummary::from_info(&info, status)
    }

    fn config(max_entries: usize) -> HistoryConfig {
        HistoryConfig {
            enabled: true,
            max_entries,
            auto_clear_days: None,
        }
    }

    #[test]
    fn test_history_store_save_and_load() {
        let tmp_dir = TempDir::new().expect("temp dir");
        let history_path = tmp_dir.path().join("history.json");

        let mut store =
            HistoryStore::load_from(history_path.clone(), HistoryConfig::default()).expect("load");
        let entry = HistoryEntry::new("10.0.0.2:52530", summary("a.txt", TransferStatus::Completed));
        let id = entry.summary.id.clone();
        store.add(entry.clone()).expect("add");

        let loaded = HistoryStore::load_from(history_path, HistoryConfig::default()).expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.find_by_id(&id), Some(&entry));
    }

    #[test]
    fn test_history_max_entries() {
        let tmp_dir = TempDir::new().expect("temp dir");
        let mut store =
            HistoryStore::load_from(tmp_dir.path().join("history.json"), config(3)).expect("load");

        for i in 0..5 {
            let entry = HistoryEntry::new("peer", summary(&format!("f{i}"), TransferStatus::Completed));
            store.add(entry).expect("add");
        }

        let names: Vec<_> = store.list(None).iter().map(|e| e.summary.name.as_str()).collect();
        assert_eq!(names, vec!["f4", "f3", "f2"]);
        assert_eq!(store.list(Some(1)).len(), 1);
    }

    #[test]
    fn test_disabled_history_records_nothing() {
        let tmp_dir = TempDir::new().expect("temp dir");
        let path = tmp_dir.path().join("history.json");
        let mut store = HistoryStore::load_from(
            path.clone(),
            HistoryConfig {
                enabled: false,
                ..HistoryConfig::default()
            },
        )
        .expect("load");

        store
            .add(HistoryEntry::new("peer", summary("x", TransferStatus::Canceled)))
            .expect("add");
        assert!(store.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_auto_clear_drops_old_entries() {
        let tmp_dir = TempDir::new().expect("temp dir");
        let path = tmp_dir.path().join("history.json");

        let mut store = HistoryStore::load_from(path.clone(), config(10)).expect("load");
        let mut old = summary("old", TransferStatus::Completed);
        old.finished_at = Utc::now() - Duration::days(40);
        store.add(HistoryEntry::new("peer", old)).expect("add");
        store
            .add(HistoryEntry::new("peer", summary("new", TransferStatus::Completed)))
            .expect("add");

        let reloaded = HistoryStore::load_from(
            path,
            HistoryConfig {
                auto_clear_days: Some(30),
                ..config(10)
            },
        )
        .expect("load");
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.list(None)[0].summary.name, "new");
    }

    #[test]
    fn test_history_clear() {
        let tmp_dir = TempDir::new().expect("temp dir");
        let mut store =
            HistoryStore::load_from(tmp_dir.path().join("history.json"), config(10)).expect("load");
        store
            .add(HistoryEntry::new("peer", summary("a", TransferStatus::Completed)))
            .expect("add");
        store.clear().expect("clear");
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_a_history_error() {
        let tmp_dir = TempDir::new().expect("temp dir");
        let path = tmp_dir.path().join("history.json");
        fs::write(&path, "not json").expect("write");

        let result = HistoryStore::load_from(path, config(10));
        assert!(matches!(result, Err(Error::HistoryError(_))));
    }

    #[test]
    fn test_entry_succeeded() {
        assert!(HistoryEntry::new("p", summary("a", TransferStatus::Completed)).succeeded());
        assert!(!HistoryEntry::new("p", summary("a", TransferStatus::ChecksumMismatch)).succeeded());
    }
}
