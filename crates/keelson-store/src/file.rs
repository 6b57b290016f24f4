// ABOUTME: File-system object store: one file per object under a base directory.
// ABOUTME: Puts use temp file + fsync + rename so concurrent readers never see a torn write.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::object_store::{ObjectStore, PersistMode, StoreError, StoreObjectAccessor, validate_path};

// Object paths never have a segment starting with '.', so ids cannot collide
const TMP_PREFIX: &str = ".";
const TMP_SUFFIX: &str = ".tmp";

/// Object store rooted at a directory. Sub-paths are directories, objects
/// are files named by id.
#[derive(Debug, Clone)]
pub struct FileObjectStore {
    base: PathBuf,
    prepared: Arc<AtomicBool>,
}

impl FileObjectStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            prepared: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    fn has_contents(&self) -> Result<bool, StoreError> {
        if !self.base.exists() {
            return Ok(false);
        }
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() && fs::read_dir(entry.path())?.next().is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn clear(&self) -> Result<(), StoreError> {
        if self.base.exists() {
            fs::remove_dir_all(&self.base)?;
        }
        fs::create_dir_all(&self.base)?;
        Ok(())
    }

    fn check_prepared(&self) -> Result<(), StoreError> {
        if !self.prepared.load(Ordering::SeqCst) {
            return Err(StoreError::NotPrepared(self.summary_name()));
        }
        Ok(())
    }
}

impl ObjectStore for FileObjectStore {
    fn summary_name(&self) -> String {
        format!("file-based store at {}", self.base.display())
    }

    fn prepare_for_use(&self, mode: PersistMode) -> Result<(), StoreError> {
        match mode {
            PersistMode::Disabled => {
                return Err(StoreError::PersistenceDisabled(self.summary_name()));
            }
            PersistMode::Rebind if !self.has_contents()? => {
                return Err(StoreError::NothingToRebind(self.summary_name()));
            }
            PersistMode::Clean => self.clear()?,
            PersistMode::Auto | PersistMode::Rebind => fs::create_dir_all(&self.base)?,
        }
        tracing::info!(store = %self.summary_name(), mode = %mode, "object store prepared");
        self.prepared.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn create_sub_path(&self, sub_path: &str) -> Result<(), StoreError> {
        validate_path(sub_path)?;
        fs::create_dir_all(self.base.join(sub_path))?;
        Ok(())
    }

    fn new_accessor(&self, path: &str) -> Result<Box<dyn StoreObjectAccessor>, StoreError> {
        validate_path(path)?;
        self.check_prepared()?;
        Ok(Box::new(FileAccessor {
            path: path.to_string(),
            file: self.base.join(path),
        }))
    }

    fn list_contents_with_sub_path(&self, sub_path: &str) -> Result<Vec<String>, StoreError> {
        validate_path(sub_path)?;
        self.check_prepared()?;
        let dir = self.base.join(sub_path);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // Skip in-flight writes from this or another node
            if name.starts_with(TMP_PREFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn delete_completely(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.base) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) {
        self.prepared.store(false, Ordering::SeqCst);
    }
}

struct FileAccessor {
    path: String,
    file: PathBuf,
}

impl FileAccessor {
    fn ensure_parent(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl StoreObjectAccessor for FileAccessor {
    fn path(&self) -> &str {
        &self.path
    }

    fn get(&self) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(&self.file) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, contents: &str) -> Result<(), StoreError> {
        self.ensure_parent()?;

        // Unique temp name: two nodes may write the same object concurrently
        let file_name = self
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = self
            .file
            .with_file_name(format!("{TMP_PREFIX}{file_name}.{}{TMP_SUFFIX}", Ulid::new()));

        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.sync_all()?;
        drop(tmp);

        if let Err(e) = fs::rename(&tmp_path, &self.file) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        // Best-effort: the rename already succeeded and the data is consistent.
        if let Some(parent) = self.file.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn append(&self, contents: &str) -> Result<(), StoreError> {
        self.ensure_parent()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn delete(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self) -> Result<bool, StoreError> {
        Ok(self.file.is_file())
    }

    fn last_modified(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        match fs::metadata(&self.file) {
            Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn prepared_store(dir: &TempDir) -> FileObjectStore {
        let store = FileObjectStore::new(dir.path().join("store"));
        store.prepare_for_use(PersistMode::Auto).unwrap();
        store
    }

    #[test]
    fn put_replaces_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = prepared_store(&dir);
        let acc = store.new_accessor("entities/e1").unwrap();

        acc.put("first").unwrap();
        acc.put("second").unwrap();

        assert_eq!(acc.get().unwrap().as_deref(), Some("second"));
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("store").join("entities"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_object_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = prepared_store(&dir);
        let acc = store.new_accessor("plane/n1").unwrap();

        assert_eq!(acc.get().unwrap(), None);
        assert_eq!(acc.last_modified().unwrap(), None);
        acc.delete().unwrap();
    }

    #[test]
    fn list_skips_temp_files_and_missing_dirs() {
        let dir = TempDir::new().unwrap();
        let store = prepared_store(&dir);

        assert!(store.list_contents_with_sub_path("policies").unwrap().is_empty());

        store.new_accessor("policies/p2").unwrap().put("{}").unwrap();
        store.new_accessor("policies/p1").unwrap().put("{}").unwrap();
        fs::write(
            dir.path().join("store").join("policies").join(".p3.01ABC.tmp"),
            "partial",
        )
        .unwrap();

        assert_eq!(
            store.list_contents_with_sub_path("policies").unwrap(),
            vec!["p1".to_string(), "p2".to_string()]
        );
    }

    #[tokio::test]
    async fn ids_ending_in_tmp_are_listed_and_loaded() {
        use crate::memento_persister::{MementoPersister, StoreMementoPersister};
        use keelson_core::{Memento, PlaceholderLookup, TopologyMemento};

        let dir = TempDir::new().unwrap();
        let store = prepared_store(&dir);
        store.new_accessor("entities/a.tmp").unwrap().put("{}").unwrap();
        assert_eq!(
            store.list_contents_with_sub_path("entities").unwrap(),
            vec!["a.tmp".to_string()]
        );

        let persister = StoreMementoPersister::new(Arc::new(store));
        let memento = TopologyMemento::builder()
            .memento(Memento::entity("a.tmp", "application"))
            .memento(Memento::location("vm.tmp", "ssh-machine"))
            .build();
        persister.checkpoint(&memento).await.unwrap();

        assert_eq!(persister.load_manifest().await.unwrap().len(), 2);
        assert_eq!(persister.load_memento(&PlaceholderLookup).await.unwrap(), memento);
    }

    #[test]
    fn append_creates_and_extends() {
        let dir = TempDir::new().unwrap();
        let store = prepared_store(&dir);
        let acc = store.new_accessor("plane/log").unwrap();

        acc.append("a\n").unwrap();
        acc.append("b\n").unwrap();
        assert_eq!(acc.get().unwrap().as_deref(), Some("a\nb\n"));
    }

    #[test]
    fn rebind_mode_requires_contents() {
        let dir = TempDir::new().unwrap();
        let store = FileObjectStore::new(dir.path().join("store"));
        assert!(matches!(
            store.prepare_for_use(PersistMode::Rebind),
            Err(StoreError::NothingToRebind(_))
        ));

        store.prepare_for_use(PersistMode::Auto).unwrap();
        store.new_accessor("entities/e1").unwrap().put("{}").unwrap();

        let reopened = FileObjectStore::new(dir.path().join("store"));
        reopened.prepare_for_use(PersistMode::Rebind).unwrap();
        assert!(reopened.new_accessor("entities/e1").unwrap().exists().unwrap());
    }

    #[test]
    fn clean_mode_and_delete_completely() {
        let dir = TempDir::new().unwrap();
        let store = prepared_store(&dir);
        store.new_accessor("entities/e1").unwrap().put("{}").unwrap();

        store.prepare_for_use(PersistMode::Clean).unwrap();
        assert!(store.list_contents_with_sub_path("entities").unwrap().is_empty());

        store.delete_completely().unwrap();
        assert!(!dir.path().join("store").exists());
        // idempotent
        store.delete_completely().unwrap();
    }

    #[test]
    fn closed_store_refuses_accessors() {
        let dir = TempDir::new().unwrap();
        let store = prepared_store(&dir);
        store.close();

        assert!(matches!(
            store.new_accessor("entities/e1"),
            Err(StoreError::NotPrepared(_))
        ));
    }
}
