// ABOUTME: In-memory object store used by tests and single-process simulations.
// ABOUTME: Clones share the same contents, so several simulated nodes can use one store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::object_store::{ObjectStore, PersistMode, StoreError, StoreObjectAccessor, validate_path};

#[derive(Debug, Default)]
struct Contents {
    files: BTreeMap<String, (String, DateTime<Utc>)>,
    prepared: bool,
    closed: bool,
}

/// Map-backed store. Every operation takes one lock, so puts are atomic.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    contents: Arc<Mutex<Contents>>,
}

fn lock(contents: &Mutex<Contents>) -> MutexGuard<'_, Contents> {
    contents.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        tracing::info!("using memory-based object store");
        Self::default()
    }

    /// Create a store already prepared in `Auto` mode.
    pub fn prepared() -> Self {
        let store = Self::new();
        lock(&store.contents).prepared = true;
        store
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        lock(&self.contents).files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_usable(&self, contents: &Contents) -> Result<(), StoreError> {
        if contents.closed {
            return Err(StoreError::Closed(self.summary_name()));
        }
        if !contents.prepared {
            return Err(StoreError::NotPrepared(self.summary_name()));
        }
        Ok(())
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn summary_name(&self) -> String {
        "in-memory (test) persistence store".to_string()
    }

    fn prepare_for_use(&self, mode: PersistMode) -> Result<(), StoreError> {
        let mut contents = lock(&self.contents);
        match mode {
            PersistMode::Disabled => return Err(StoreError::PersistenceDisabled(self.summary_name())),
            PersistMode::Rebind if contents.files.is_empty() => {
                return Err(StoreError::NothingToRebind(self.summary_name()));
            }
            PersistMode::Clean => contents.files.clear(),
            PersistMode::Auto | PersistMode::Rebind => {}
        }
        contents.prepared = true;
        contents.closed = false;
        Ok(())
    }

    fn create_sub_path(&self, sub_path: &str) -> Result<(), StoreError> {
        validate_path(sub_path)
    }

    fn new_accessor(&self, path: &str) -> Result<Box<dyn StoreObjectAccessor>, StoreError> {
        validate_path(path)?;
        self.check_usable(&lock(&self.contents))?;
        Ok(Box::new(InMemoryAccessor {
            contents: Arc::clone(&self.contents),
            key: path.to_string(),
        }))
    }

    fn list_contents_with_sub_path(&self, sub_path: &str) -> Result<Vec<String>, StoreError> {
        validate_path(sub_path)?;
        let contents = lock(&self.contents);
        self.check_usable(&contents)?;
        let prefix = format!("{}/", sub_path);
        Ok(contents
            .files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|name| !name.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn delete_completely(&self) -> Result<(), StoreError> {
        lock(&self.contents).files.clear();
        Ok(())
    }

    fn close(&self) {
        // Shared between clones, so closing is a no-op for the contents.
    }
}

struct InMemoryAccessor {
    contents: Arc<Mutex<Contents>>,
    key: String,
}

impl StoreObjectAccessor for InMemoryAccessor {
    fn path(&self) -> &str {
        &self.key
    }

    fn get(&self) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.contents).files.get(&self.key).map(|(v, _)| v.clone()))
    }

    fn put(&self, value: &str) -> Result<(), StoreError> {
        lock(&self.contents)
            .files
            .insert(self.key.clone(), (value.to_string(), Utc::now()));
        Ok(())
    }

    fn append(&self, value: &str) -> Result<(), StoreError> {
        let mut contents = lock(&self.contents);
        let entry = contents
            .files
            .entry(self.key.clone())
            .or_insert_with(|| (String::new(), Utc::now()));
        entry.0.push_str(value);
        entry.1 = Utc::now();
        Ok(())
    }

    fn delete(&self) -> Result<(), StoreError> {
        lock(&self.contents).files.remove(&self.key);
        Ok(())
    }

    fn exists(&self) -> Result<bool, StoreError> {
        Ok(lock(&self.contents).files.contains_key(&self.key))
    }

    fn last_modified(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(lock(&self.contents).files.get(&self.key).map(|(_, t)| *t))
    }
}
