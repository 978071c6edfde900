//! Durable relay state
//!
//! Two independent JSON documents:
//! - the history set: every source post id ever relayed (a JSON array)
//! - the cursor map: newest post id seen per source (a JSON object)
//!
//! Loading never fails. A missing or unparsable document is treated as empty,
//! at the cost of possibly relaying something twice. Saving replaces the
//! whole document through a temp file in the same directory, so readers see
//! either the old or the new version.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::{Result, StateError};
use crate::types::PostId;

/// Post ids already relayed, across all sources
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistorySet {
    ids: BTreeSet<String>,
}

impl HistorySet {
    pub fn contains(&self, id: &PostId) -> bool {
        self.ids.contains(id.as_str())
    }

    /// Returns false if the id was already present
    pub fn insert(&mut self, id: &PostId) -> bool {
        self.ids.insert(id.as_str().to_string())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<String> for HistorySet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

/// Newest post id observed per source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorMap {
    cursors: BTreeMap<String, PostId>,
}

impl CursorMap {
    pub fn get(&self, source: &str) -> Option<&PostId> {
        self.cursors.get(source)
    }

    /// Move the cursor for `source` forward to `seen`
    ///
    /// Never moves backward. Returns true if the stored value changed.
    pub fn advance(&mut self, source: &str, seen: &PostId) -> bool {
        match self.cursors.get(source) {
            Some(current) if current >= seen => false,
            _ => {
                self.cursors.insert(source.to_string(), seen.clone());
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

/// File-backed storage for [`HistorySet`] and [`CursorMap`]
#[derive(Debug, Clone)]
pub struct StateStore {
    history_path: PathBuf,
    cursor_path: PathBuf,
}

impl StateStore {
    pub fn new(history_path: impl Into<PathBuf>, cursor_path: impl Into<PathBuf>) -> Self {
        Self {
            history_path: history_path.into(),
            cursor_path: cursor_path.into(),
        }
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    pub fn cursor_path(&self) -> &Path {
        &self.cursor_path
    }

    /// Load both documents, degrading to empty structures
    pub fn load(&self) -> (HistorySet, CursorMap) {
        let ids: Vec<String> = read_document(&self.history_path).unwrap_or_default();
        let cursors: BTreeMap<String, PostId> =
            read_document(&self.cursor_path).unwrap_or_default();

        (ids.into_iter().collect(), CursorMap { cursors })
    }

    pub fn save_history(&self, history: &HistorySet) -> Result<()> {
        let ids: Vec<&String> = history.ids.iter().collect();
        write_document(&self.history_path, &ids)
    }

    pub fn save_cursors(&self, cursors: &CursorMap) -> Result<()> {
        write_document(&self.cursor_path, &cursors.cursors)
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!("Failed to read {}, treating as empty: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Corrupted state file {}, treating as empty: {}", path.display(), e);
            None
        }
    }
}

fn write_document<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let io_error = |source: std::io::Error| StateError::Io {
        path: path.display().to_string(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(io_error)?;

    let json = serde_json::to_string_pretty(value).map_err(StateError::Serialize)?;

    let mut temp = NamedTempFile::new_in(&dir).map_err(io_error)?;
    temp.write_all(json.as_bytes()).map_err(io_error)?;
    temp.as_file().sync_all().map_err(io_error)?;
    temp.persist(path).map_err(|e| io_error(e.error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> StateStore {
        StateStore::new(
            dir.path().join("posted_history.json"),
            dir.path().join("since_ids.json"),
        )
    }

    #[test]
    fn test_load_missing_files() {
        let dir = TempDir::new().unwrap();
        let (history, cursors) = store_in(&dir).load();
        assert!(history.is_empty());
        assert!(cursors.is_empty());
    }

    #[test]
    fn test_load_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.history_path(), "[\"101\", ").unwrap();
        std::fs::write(store.cursor_path(), "not json at all").unwrap();

        let (history, cursors) = store.load();
        assert!(history.is_empty());
        assert!(cursors.is_empty());
    }

    #[test]
    fn test_load_wrong_shape_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.history_path(), "{\"a\": 1}").unwrap();
        std::fs::write(store.cursor_path(), "[\"103\"]").unwrap();

        let (history, cursors) = store.load();
        assert!(history.is_empty());
        assert!(cursors.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut history = HistorySet::default();
        history.insert(&PostId::from("101"));
        history.insert(&PostId::from("1850000000000000000"));
        let mut cursors = CursorMap::default();
        cursors.advance("a", &PostId::from("103"));
        cursors.advance("b", &PostId::from("7"));

        store.save_history(&history).unwrap();
        store.save_cursors(&cursors).unwrap();

        let (loaded_history, loaded_cursors) = store.load();
        assert_eq!(loaded_history, history);
        assert_eq!(loaded_cursors, cursors);
    }

    #[test]
    fn test_reads_original_file_format() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.history_path(), "[\n  \"101\",\n  \"102\"\n]").unwrap();
        std::fs::write(store.cursor_path(), "{\n  \"nasa\": \"102\"\n}").unwrap();

        let (history, cursors) = store.load();
        assert!(history.contains(&PostId::from("101")));
        assert!(history.contains(&PostId::from("102")));
        assert_eq!(cursors.get("nasa"), Some(&PostId::from("102")));
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(
            dir.path().join("state/nested/history.json"),
            dir.path().join("state/nested/cursors.json"),
        );

        store.save_history(&HistorySet::default()).unwrap();
        assert!(store.history_path().exists());
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut cursors = CursorMap::default();
        cursors.advance("a", &PostId::from("1"));
        store.save_cursors(&cursors).unwrap();
        cursors.advance("a", &PostId::from("2"));
        store.save_cursors(&cursors).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_save_into_missing_location_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let store = StateStore::new(blocker.join("history.json"), blocker.join("cursors.json"));

        assert!(store.save_history(&HistorySet::default()).is_err());
    }

    #[test]
    fn test_cursor_never_moves_backward() {
        let mut cursors = CursorMap::default();
        assert!(cursors.advance("a", &PostId::from("103")));
        assert!(!cursors.advance("a", &PostId::from("99")));
        assert!(!cursors.advance("a", &PostId::from("103")));
        assert_eq!(cursors.get("a"), Some(&PostId::from("103")));
        assert!(cursors.advance("a", &PostId::from("1000")));
        assert_eq!(cursors.get("a"), Some(&PostId::from("1000")));
    }

    #[test]
    fn test_history_insert_reports_new() {
        let mut history = HistorySet::default();
        assert!(history.insert(&PostId::from("5")));
        assert!(!history.insert(&PostId::from("5")));
        assert_eq!(history.len(), 1);
    }
}
