// ABOUTME: Persists management node heartbeat records, one stored object per node under plane/.
// ABOUTME: Loading scans every record and derives the PlaneSyncRecord view from them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keelson_core::{ManagementNodeRecord, PlaceholderLookup, PlaneSyncRecord, SyncRecordDelta};
use tokio::sync::Mutex;

use crate::error::PersistenceError;
use crate::memory::InMemoryObjectStore;
use crate::object_store::{ObjectStore, object_path};
use crate::serializer::MementoSerializer;

pub const PLANE_SUB_PATH: &str = "plane";

/// Durable storage for the per-node heartbeat records.
#[async_trait]
pub trait SyncRecordPersister: Send + Sync {
    /// Read every node record. Corrupt records are skipped.
    async fn load_sync_record(&self) -> Result<PlaneSyncRecord, PersistenceError>;

    /// Make the stored records exactly those in `record`.
    async fn checkpoint(&self, record: &PlaneSyncRecord) -> Result<(), PersistenceError>;

    async fn delta(&self, delta: &SyncRecordDelta) -> Result<(), PersistenceError>;

    async fn wait_for_writes_completed(&self, timeout: Duration) -> Result<(), PersistenceError>;

    async fn stop(&self);
}

pub struct StoreSyncRecordPersister {
    store: Arc<dyn ObjectStore>,
    write_guard: Mutex<()>,
    serializer: MementoSerializer<ManagementNodeRecord>,
    stopped: AtomicBool,
}

impl StoreSyncRecordPersister {
    /// The store must already be prepared.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            write_guard: Mutex::new(()),
            serializer: MementoSerializer::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryObjectStore::prepared()))
    }

    fn check_running(&self) -> Result<(), PersistenceError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PersistenceError::Stopped);
        }
        Ok(())
    }

    fn write(&self, record: &ManagementNodeRecord) -> Result<(), PersistenceError> {
        let path = object_path(PLANE_SUB_PATH, &record.node_id);
        let text = self
            .serializer
            .to_string(record)
            .map_err(|e| PersistenceError::format(&path, e))?;
        self.store
            .new_accessor(&path)
            .and_then(|acc| acc.put(&text))
            .map_err(|e| PersistenceError::store(&path, e))
    }

    fn remove(&self, node_id: &str) -> Result<(), PersistenceError> {
        let path = object_path(PLANE_SUB_PATH, node_id);
        self.store
            .new_accessor(&path)
            .and_then(|acc| acc.delete())
            .map_err(|e| PersistenceError::store(&path, e))
    }

    fn list(&self) -> Result<Vec<String>, PersistenceError> {
        self.store
            .list_contents_with_sub_path(PLANE_SUB_PATH)
            .map_err(|e| PersistenceError::store(PLANE_SUB_PATH, e))
    }
}

#[async_trait]
impl SyncRecordPersister for StoreSyncRecordPersister {
    async fn load_sync_record(&self) -> Result<PlaneSyncRecord, PersistenceError> {
        self.check_running()?;
        let mut records = Vec::new();

        for node_id in self.list()? {
            let path = object_path(PLANE_SUB_PATH, &node_id);
            let text = self
                .store
                .new_accessor(&path)
                .and_then(|acc| acc.get())
                .map_err(|e| PersistenceError::store(&path, e))?;
            let Some(text) = text else {
                continue;
            };
            match self.serializer.from_str(&text, &PlaceholderLookup) {
                Ok(record) if record.node_id == node_id => records.push(record),
                Ok(record) => {
                    tracing::warn!(path = %path, holds = %record.node_id, "node record stored under wrong name, skipping");
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "corrupt node record, skipping");
                }
            }
        }

        Ok(PlaneSyncRecord::from_records(records))
    }

    async fn checkpoint(&self, record: &PlaneSyncRecord) -> Result<(), PersistenceError> {
        let _guard = self.write_guard.lock().await;
        self.check_running()?;
        self.store
            .create_sub_path(PLANE_SUB_PATH)
            .map_err(|e| PersistenceError::store(PLANE_SUB_PATH, e))?;

        let stale: Vec<String> = self
            .list()?
            .into_iter()
            .filter(|id| !record.nodes.contains_key(id))
            .collect();
        for node in record.nodes.values() {
            self.write(node)?;
        }
        for id in stale {
            self.remove(&id)?;
        }
        tracing::debug!(nodes = record.nodes.len(), "plane sync record checkpointed");
        Ok(())
    }

    async fn delta(&self, delta: &SyncRecordDelta) -> Result<(), PersistenceError> {
        let _guard = self.write_guard.lock().await;
        self.check_running()?;
        for node in &delta.nodes {
            self.write(node)?;
        }
        for id in &delta.removed_node_ids {
            self.remove(id)?;
        }
        Ok(())
    }

    async fn wait_for_writes_completed(&self, timeout: Duration) -> Result<(), PersistenceError> {
        tokio::time::timeout(timeout, self.write_guard.lock())
            .await
            .map(|_| ())
            .map_err(|_| PersistenceError::Timeout(timeout))
    }

    async fn stop(&self) {
        let _guard = self.write_guard.lock().await;
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.store.close();
            tracing::info!(store = %self.store.summary_name(), "sync record persister stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelson_core::NodeState;

    #[tokio::test]
    async fn delta_publishes_and_load_derives_master() {
        let persister = StoreSyncRecordPersister::in_memory();
        persister
            .delta(
                &SyncRecordDelta::default()
                    .node(ManagementNodeRecord::new("n1", NodeState::Master, 100))
                    .node(ManagementNodeRecord::new("n2", NodeState::Standby, 110)),
            )
            .await
            .unwrap();

        let plane = persister.load_sync_record().await.unwrap();
        assert_eq!(plane.nodes.len(), 2);
        assert_eq!(plane.master_node_id.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn newer_record_supersedes_older() {
        let persister = StoreSyncRecordPersister::in_memory();
        persister
            .delta(&SyncRecordDelta::default().node(ManagementNodeRecord::new(
                "n1",
                NodeState::Master,
                100,
            )))
            .await
            .unwrap();
        persister
            .delta(&SyncRecordDelta::default().node(ManagementNodeRecord::new(
                "n1",
                NodeState::Terminated,
                200,
            )))
            .await
            .unwrap();

        let plane = persister.load_sync_record().await.unwrap();
        assert_eq!(plane.nodes["n1"].state, NodeState::Terminated);
        assert!(plane.master().is_none());
    }

    #[tokio::test]
    async fn checkpoint_replaces_all_records() {
        let persister = StoreSyncRecordPersister::in_memory();
        persister
            .delta(
                &SyncRecordDelta::default()
                    .node(ManagementNodeRecord::new("old", NodeState::Standby, 1)),
            )
            .await
            .unwrap();

        let plane =
            PlaneSyncRecord::from_records(vec![ManagementNodeRecord::new("n1", NodeState::Master, 5)]);
        persister.checkpoint(&plane).await.unwrap();

        assert_eq!(persister.load_sync_record().await.unwrap(), plane);
    }

    #[tokio::test]
    async fn corrupt_records_are_skipped() {
        let store = InMemoryObjectStore::prepared();
        let persister = StoreSyncRecordPersister::new(Arc::new(store.clone()));
        persister
            .delta(&SyncRecordDelta::default().node(ManagementNodeRecord::new(
                "n1",
                NodeState::Standby,
                1,
            )))
            .await
            .unwrap();
        store.new_accessor("plane/garbage").unwrap().put("%%").unwrap();

        let plane = persister.load_sync_record().await.unwrap();
        assert_eq!(plane.nodes.len(), 1);
    }

    #[tokio::test]
    async fn removed_nodes_disappear() {
        let persister = StoreSyncRecordPersister::in_memory();
        persister
            .delta(&SyncRecordDelta::default().node(ManagementNodeRecord::new(
                "n1",
                NodeState::Standby,
                1,
            )))
            .await
            .unwrap();
        persister
            .delta(&SyncRecordDelta::default().removed_node_id("n1"))
            .await
            .unwrap();

        assert!(persister.load_sync_record().await.unwrap().nodes.is_empty());
    }

    #[tokio::test]
    async fn stop_rejects_further_writes() {
        let persister = StoreSyncRecordPersister::in_memory();
        persister.stop().await;

        let result = persister
            .delta(&SyncRecordDelta::default().removed_node_id("n1"))
            .await;
        assert!(matches!(result, Err(PersistenceError::Stopped)));
        persister
            .wait_for_writes_completed(Duration::from_millis(10))
            .await
            .unwrap();
    }
}
