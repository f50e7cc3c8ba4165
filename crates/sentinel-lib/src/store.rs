//! Persisted key-value state
//!
//! Threshold state and identity mappings live behind [`StateStore`] so
//! persistence and concurrency semantics are explicit instead of being
//! scattered whole-file rewrites. The file-backed store writes atomically
//! (temp file + rename) and serializes in-process writers with an interior
//! lock; writers in *other* processes remain last-writer-wins.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// A JSON object document held by a store.
pub type Document = Map<String, Value>;

/// Key-value state with atomic read-modify-write.
pub trait StateStore: Send + Sync {
    /// Read the whole document. Missing or unreadable state yields an empty
    /// document rather than an error so a corrupt file never wedges the
    /// monitor.
    fn read(&self) -> Document;

    /// Apply a mutation to the document and persist the result atomically
    /// with respect to other in-process writers.
    fn update(&self, apply: &mut dyn FnMut(&mut Document)) -> Result<()>;

    fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.update(&mut |doc| {
            doc.insert(key.to_string(), value.clone());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(&mut |doc| {
            doc.remove(key);
        })
    }
}

/// Whole-file JSON store with atomic replace-on-write.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Document {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Document::new(),
        };

        let mut data = Vec::new();
        if file.read_to_end(&mut data).is_err() {
            warn!(path = %self.path.display(), "Failed to read state file, starting empty");
            return Document::new();
        }

        match serde_json::from_slice::<Value>(&data) {
            Ok(Value::Object(doc)) => doc,
            Ok(_) | Err(_) => {
                warn!(path = %self.path.display(), "State file is not a JSON object, starting empty");
                Document::new()
            }
        }
    }

    fn persist(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let json = serde_json::to_vec(doc).context("Failed to serialize state")?;

        // Write atomically using temp file
        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;

        file.write_all(&json).context("Failed to write state")?;
        file.sync_all().context("Failed to sync state file")?;

        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, self.path))?;

        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn read(&self) -> Document {
        let _guard = self.lock.lock().unwrap();
        self.load()
    }

    fn update(&self, apply: &mut dyn FnMut(&mut Document)) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut doc = self.load();
        apply(&mut doc);
        self.persist(&doc)
    }
}

/// In-memory store for tests and embedders that manage persistence
/// themselves.
#[derive(Default)]
pub struct MemoryStore {
    doc: Mutex<Document>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn read(&self) -> Document {
        self.doc.lock().unwrap().clone()
    }

    fn update(&self, apply: &mut dyn FnMut(&mut Document)) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        apply(&mut doc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = JsonFileStore::new(&path);
        store.set("42", json!(80)).unwrap();
        store.set("43", json!(50)).unwrap();
        store.remove("43").unwrap();

        // A fresh handle sees the persisted document
        let reopened = JsonFileStore::new(&path);
        let doc = reopened.read();
        assert_eq!(doc.get("42"), Some(&json!(80)));
        assert!(!doc.contains_key("43"));
    }

    #[test]
    fn file_store_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nope.json"));
        assert!(store.read().is_empty());
    }

    #[test]
    fn file_store_tolerates_corrupt_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(store.read().is_empty());

        // Writing through recovers the file
        store.set("1", json!(0)).unwrap();
        assert_eq!(store.read().get("1"), Some(&json!(0)));
    }

    #[test]
    fn update_is_read_modify_write() {
        let store = MemoryStore::new();
        store.set("counter", json!(1)).unwrap();

        store
            .update(&mut |doc| {
                let current = doc.get("counter").and_then(Value::as_u64).unwrap_or(0);
                doc.insert("counter".to_string(), json!(current + 1));
            })
            .unwrap();

        assert_eq!(store.get("counter"), Some(json!(2)));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonFileStore::new(&path);
        store.set("k", json!("v")).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
