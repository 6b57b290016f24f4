// ABOUTME: Persists the topology memento as one stored object per entity, location, and policy.
// ABOUTME: Checkpoints replace everything, deltas touch only what changed; one mutex serialises writers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keelson_core::{Delta, LookupContext, Memento, MementoKind, PlaceholderLookup, TopologyMemento};
use tokio::sync::Mutex;

use crate::error::PersistenceError;
use crate::memory::InMemoryObjectStore;
use crate::object_store::{ObjectStore, object_path};
use crate::serializer::{MementoSerializer, read_manifest_entry};

/// One item that could not be loaded. The rest of the load still succeeds.
#[derive(Debug)]
pub struct LoadFailure {
    pub kind: MementoKind,
    pub id: String,
    pub error: PersistenceError,
}

/// Result of a lenient load: everything that parsed, plus what did not.
#[derive(Debug)]
pub struct LoadedMemento {
    pub memento: TopologyMemento,
    pub failures: Vec<LoadFailure>,
}

/// The `{id -> type}` listing of every stored object, per kind.
#[derive(Debug, Default)]
pub struct MementoManifest {
    pub entities: BTreeMap<String, String>,
    pub locations: BTreeMap<String, String>,
    pub policies: BTreeMap<String, String>,
    pub failures: Vec<LoadFailure>,
}

impl MementoManifest {
    pub fn types(&self, kind: MementoKind) -> &BTreeMap<String, String> {
        match kind {
            MementoKind::Entity => &self.entities,
            MementoKind::Location => &self.locations,
            MementoKind::Policy => &self.policies,
        }
    }

    fn types_mut(&mut self, kind: MementoKind) -> &mut BTreeMap<String, String> {
        match kind {
            MementoKind::Entity => &mut self.entities,
            MementoKind::Location => &mut self.locations,
            MementoKind::Policy => &mut self.policies,
        }
    }

    /// Every `(kind, id, type)` triple: entities, then locations, then policies.
    pub fn iter(&self) -> impl Iterator<Item = (MementoKind, &str, &str)> {
        MementoKind::ALL.into_iter().flat_map(move |kind| {
            self.types(kind)
                .iter()
                .map(move |(id, t)| (kind, id.as_str(), t.as_str()))
        })
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.locations.len() + self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable storage for the full topology.
#[async_trait]
pub trait MementoPersister: Send + Sync {
    /// Read everything. The first unreadable or corrupt record fails the load.
    async fn load_memento(
        &self,
        lookup: &dyn LookupContext,
    ) -> Result<TopologyMemento, PersistenceError>;

    /// Read everything, collecting corrupt records instead of failing on them.
    /// Unreadable storage still fails the whole load.
    async fn load_memento_lenient(
        &self,
        lookup: &dyn LookupContext,
    ) -> Result<LoadedMemento, PersistenceError>;

    /// Read only the id and type of every stored object.
    async fn load_manifest(&self) -> Result<MementoManifest, PersistenceError>;

    /// Replace durable state with `memento`.
    async fn checkpoint(&self, memento: &TopologyMemento) -> Result<(), PersistenceError>;

    /// Write changed objects and delete removed ones.
    async fn delta(&self, delta: &Delta) -> Result<(), PersistenceError>;

    /// Wait until every write submitted before this call has finished.
    async fn wait_for_writes_completed(&self, timeout: Duration) -> Result<(), PersistenceError>;

    async fn stop(&self);
}

/// [`MementoPersister`] over any [`ObjectStore`].
///
/// The working copy lives inside the write mutex, so only `checkpoint` and
/// `delta` can change it and never at the same time.
pub struct StoreMementoPersister {
    store: Arc<dyn ObjectStore>,
    working: Mutex<TopologyMemento>,
    serializer: MementoSerializer<Memento>,
    verify_on_write: bool,
    stopped: AtomicBool,
}

impl StoreMementoPersister {
    /// The store must already be prepared.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            working: Mutex::new(TopologyMemento::default()),
            serializer: MementoSerializer::new(),
            verify_on_write: false,
            stopped: AtomicBool::new(false),
        }
    }

    /// Memory-backed persister that re-parses everything it writes.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryObjectStore::prepared())).with_verify_on_write(true)
    }

    /// Re-parse each written object with a placeholder-only lookup and fail
    /// the write if it does not parse.
    pub fn with_verify_on_write(mut self, verify: bool) -> Self {
        self.verify_on_write = verify;
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// A copy of the memento as last checkpointed and delta'd by this instance.
    pub async fn working_copy(&self) -> TopologyMemento {
        self.working.lock().await.clone()
    }

    fn check_running(&self) -> Result<(), PersistenceError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PersistenceError::Stopped);
        }
        Ok(())
    }

    fn list(&self, kind: MementoKind) -> Result<Vec<String>, PersistenceError> {
        let sub = kind.sub_path();
        self.store
            .list_contents_with_sub_path(sub)
            .map_err(|e| PersistenceError::store(sub, e))
    }

    fn read(&self, path: &str) -> Result<Option<String>, PersistenceError> {
        self.store
            .new_accessor(path)
            .and_then(|acc| acc.get())
            .map_err(|e| PersistenceError::store(path, e))
    }

    fn write(&self, memento: &Memento) -> Result<usize, PersistenceError> {
        let path = object_path(memento.kind.sub_path(), &memento.id);
        let text = self
            .serializer
            .to_string(memento)
            .map_err(|e| PersistenceError::format(&path, e))?;
        if self.verify_on_write {
            self.serializer
                .from_str(&text, &PlaceholderLookup)
                .map_err(|e| PersistenceError::format(&path, format!("write self-check failed: {}", e)))?;
        }
        self.store
            .new_accessor(&path)
            .and_then(|acc| acc.put(&text))
            .map_err(|e| PersistenceError::store(&path, e))?;
        Ok(text.len())
    }

    fn remove(&self, kind: MementoKind, id: &str) -> Result<(), PersistenceError> {
        let path = object_path(kind.sub_path(), id);
        self.store
            .new_accessor(&path)
            .and_then(|acc| acc.delete())
            .map_err(|e| PersistenceError::store(&path, e))
    }

    fn parse(
        &self,
        kind: MementoKind,
        id: &str,
        text: &str,
        lookup: &dyn LookupContext,
    ) -> Result<Memento, PersistenceError> {
        let path = object_path(kind.sub_path(), id);
        let memento = self
            .serializer
            .from_str(text, lookup)
            .map_err(|e| PersistenceError::format(&path, e))?;
        if memento.kind != kind || memento.id != id {
            return Err(PersistenceError::format(
                &path,
                format!("holds {} {}", memento.kind, memento.id),
            ));
        }
        Ok(memento)
    }

    fn read_all(
        &self,
        lookup: &dyn LookupContext,
        lenient: bool,
    ) -> Result<LoadedMemento, PersistenceError> {
        self.check_running()?;
        let started = Instant::now();
        let mut builder = TopologyMemento::builder();
        let mut failures = Vec::new();

        for kind in MementoKind::ALL {
            for id in self.list(kind)? {
                let path = object_path(kind.sub_path(), &id);
                // Deleted by another writer between list and read
                let Some(text) = self.read(&path)? else {
                    continue;
                };
                match self.parse(kind, &id, &text, lookup) {
                    Ok(memento) => builder = builder.memento(memento),
                    Err(error) if lenient => {
                        tracing::warn!(kind = %kind, id = %id, error = %error, "skipping unreadable memento");
                        failures.push(LoadFailure { kind, id, error });
                    }
                    Err(error) => return Err(error),
                }
            }
        }

        let memento = builder.build();
        tracing::debug!(
            store = %self.store.summary_name(),
            objects = memento.len(),
            failures = failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loaded memento"
        );
        Ok(LoadedMemento { memento, failures })
    }
}

#[async_trait]
impl MementoPersister for StoreMementoPersister {
    async fn load_memento(
        &self,
        lookup: &dyn LookupContext,
    ) -> Result<TopologyMemento, PersistenceError> {
        self.read_all(lookup, false).map(|loaded| loaded.memento)
    }

    async fn load_memento_lenient(
        &self,
        lookup: &dyn LookupContext,
    ) -> Result<LoadedMemento, PersistenceError> {
        self.read_all(lookup, true)
    }

    async fn load_manifest(&self) -> Result<MementoManifest, PersistenceError> {
        self.check_running()?;
        let mut manifest = MementoManifest::default();

        for kind in MementoKind::ALL {
            for id in self.list(kind)? {
                let path = object_path(kind.sub_path(), &id);
                let Some(text) = self.read(&path)? else {
                    continue;
                };
                match read_manifest_entry(&text) {
                    Ok(entry) => {
                        manifest.types_mut(kind).insert(id, entry.object_type);
                    }
                    Err(e) => {
                        let error = PersistenceError::format(&path, e);
                        tracing::warn!(kind = %kind, id = %id, error = %error, "manifest entry unreadable");
                        manifest.failures.push(LoadFailure { kind, id, error });
                    }
                }
            }
        }

        tracing::debug!(
            entities = manifest.entities.len(),
            locations = manifest.locations.len(),
            policies = manifest.policies.len(),
            "loaded manifest"
        );
        Ok(manifest)
    }

    async fn checkpoint(&self, memento: &TopologyMemento) -> Result<(), PersistenceError> {
        let mut working = self.working.lock().await;
        self.check_running()?;
        let started = Instant::now();
        let mut bytes = 0;

        for kind in MementoKind::ALL {
            let sub = kind.sub_path();
            self.store
                .create_sub_path(sub)
                .map_err(|e| PersistenceError::store(sub, e))?;
            let wanted = memento.objects(kind);
            let stale: Vec<String> = self
                .list(kind)?
                .into_iter()
                .filter(|id| !wanted.contains_key(id))
                .collect();

            for m in wanted.values() {
                bytes += self.write(m)?;
            }
            for id in stale {
                self.remove(kind, &id)?;
            }
        }

        *working = memento.clone();
        tracing::debug!(
            objects = memento.len(),
            bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "checkpoint written"
        );
        Ok(())
    }

    async fn delta(&self, delta: &Delta) -> Result<(), PersistenceError> {
        let mut working = self.working.lock().await;
        self.check_running()?;
        if delta.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let mut bytes = 0;

        for kind in MementoKind::ALL {
            for m in delta.changed(kind) {
                bytes += self.write(m)?;
            }
            for id in delta.removed(kind) {
                self.remove(kind, id)?;
            }
        }

        working.fold_delta(delta);
        tracing::debug!(
            objects = delta.len(),
            bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "delta written"
        );
        Ok(())
    }

    async fn wait_for_writes_completed(&self, timeout: Duration) -> Result<(), PersistenceError> {
        tokio::time::timeout(timeout, self.working.lock())
            .await
            .map(|_| ())
            .map_err(|_| PersistenceError::Timeout(timeout))
    }

    async fn stop(&self) {
        // Let an in-flight write finish first
        let _guard = self.working.lock().await;
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.store.close();
            tracing::info!(store = %self.store.summary_name(), "memento persister stopped");
        }
    }
}
