// ABOUTME: Collects change notifications from the live graph and flushes them as periodic deltas.
// ABOUTME: Runs as a background tokio task while this node is master; stopping drops unflushed changes.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use keelson_core::{Delta, ObjectRef};
use keelson_store::{MementoPersister, PersistenceError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::graph::{ChangeListener, ManagedGraph};

#[derive(Debug, Default)]
struct PendingChanges {
    changed: BTreeSet<ObjectRef>,
    removed: BTreeSet<ObjectRef>,
}

/// Accumulates changes between flushes. The latest notification for an
/// object wins.
#[derive(Debug, Default)]
struct DeltaCollector {
    pending: Mutex<PendingChanges>,
}

impl DeltaCollector {
    fn take(&self) -> PendingChanges {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn clear(&self) {
        self.take();
    }

    /// Put back changes from a failed flush, unless newer ones superseded them.
    fn requeue(&self, failed: PendingChanges) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for object in failed.changed {
            if !pending.removed.contains(&object) {
                pending.changed.insert(object);
            }
        }
        for object in failed.removed {
            if !pending.changed.contains(&object) {
                pending.removed.insert(object);
            }
        }
    }
}

impl ChangeListener for DeltaCollector {
    fn on_changed(&self, object: ObjectRef) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.removed.remove(&object);
        pending.changed.insert(object);
    }

    fn on_removed(&self, object: ObjectRef) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.changed.remove(&object);
        pending.removed.insert(object);
    }
}

pub struct PeriodicDeltaWriter {
    graph: Arc<ManagedGraph>,
    persister: Arc<dyn MementoPersister>,
    period: Duration,
    collector: Arc<DeltaCollector>,
    flush_guard: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicDeltaWriter {
    pub fn new(
        graph: Arc<ManagedGraph>,
        persister: Arc<dyn MementoPersister>,
        period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            graph,
            persister,
            period,
            collector: Arc::new(DeltaCollector::default()),
            flush_guard: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        })
    }

    /// Begin collecting graph changes and flushing them every period.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        self.graph
            .set_change_listener(Some(Arc::clone(&self.collector) as Arc<dyn ChangeListener>));
        *task = Some(tokio::spawn(run_loop(Arc::clone(self))));
        tracing::info!(period_ms = self.period.as_millis() as u64, "periodic delta writer started");
    }

    /// Stop immediately. Changes not yet flushed are dropped.
    pub fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            self.graph.set_change_listener(None);
            self.collector.clear();
            tracing::info!("periodic delta writer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Write every pending change as one delta. Returns how many objects it
    /// touched. On failure the changes stay pending for the next flush.
    /// A stopped writer writes nothing.
    pub async fn flush(&self) -> Result<usize, PersistenceError> {
        let _guard = self.flush_guard.lock().await;
        // No await between this check and the write
        if !self.is_running() {
            return Ok(0);
        }
        let pending = self.collector.take();
        if pending.changed.is_empty() && pending.removed.is_empty() {
            return Ok(0);
        }

        let mut builder = Delta::builder();
        for object in &pending.changed {
            // Removed from the graph after the notification
            builder = match self.graph.get(object.kind, &object.id) {
                Some(live) => builder.changed(live.to_memento()),
                None => builder.removed(object.kind, object.id.clone()),
            };
        }
        for object in &pending.removed {
            builder = builder.removed(object.kind, object.id.clone());
        }
        let delta = builder.build();

        match self.persister.delta(&delta).await {
            Ok(()) => {
                tracing::debug!(objects = delta.len(), "flushed delta");
                Ok(delta.len())
            }
            Err(e) => {
                if self.is_running() {
                    self.collector.requeue(pending);
                }
                Err(e)
            }
        }
    }
}

async fn run_loop(writer: Arc<PeriodicDeltaWriter>) {
    let mut ticker = tokio::time::interval(writer.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = writer.flush().await {
            tracing::warn!(error = %e, "delta flush failed, will retry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::BasicObject;
    use keelson_core::{ManagedObject, MementoKind, MementoValue, PlaceholderLookup};
    use keelson_store::StoreMementoPersister;

    fn setup() -> (Arc<ManagedGraph>, Arc<StoreMementoPersister>) {
        (
            Arc::new(ManagedGraph::new()),
            Arc::new(StoreMementoPersister::in_memory()),
        )
    }

    #[tokio::test]
    async fn flush_writes_collected_changes() {
        let (graph, persister) = setup();
        let writer = PeriodicDeltaWriter::new(
            Arc::clone(&graph),
            Arc::clone(&persister) as Arc<dyn MementoPersister>,
            Duration::from_secs(3600),
        );
        writer.start();

        let web = Arc::new(BasicObject::new(MementoKind::Entity, "web", "web-server"));
        graph.manage(Arc::clone(&web) as Arc<dyn ManagedObject>).unwrap();
        web.set_attribute("up", MementoValue::plain(true));
        graph.mark_changed(MementoKind::Entity, "web").unwrap();

        assert_eq!(writer.flush().await.unwrap(), 1);
        let loaded = persister.load_memento(&PlaceholderLookup).await.unwrap();
        assert_eq!(
            loaded.entities["web"].attributes["up"],
            MementoValue::plain(true)
        );

        graph.unmanage(MementoKind::Entity, "web").unwrap();
        assert_eq!(writer.flush().await.unwrap(), 1);
        assert!(
            persister
                .load_memento(&PlaceholderLookup)
                .await
                .unwrap()
                .is_empty()
        );

        // nothing pending
        assert_eq!(writer.flush().await.unwrap(), 0);
        writer.stop();
    }

    #[tokio::test]
    async fn background_loop_flushes_on_its_own() {
        let (graph, persister) = setup();
        let writer = PeriodicDeltaWriter::new(
            Arc::clone(&graph),
            Arc::clone(&persister) as Arc<dyn MementoPersister>,
            Duration::from_millis(10),
        );
        writer.start();
        assert!(writer.is_running());

        graph
            .manage(Arc::new(BasicObject::new(MementoKind::Location, "vm1", "ssh")))
            .unwrap();

        let mut written = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if !persister.working_copy().await.locations.is_empty() {
                written = true;
                break;
            }
        }
        assert!(written, "loop should flush without being asked");
        writer.stop();
        assert!(!writer.is_running());
    }

    #[tokio::test]
    async fn stop_drops_pending_changes() {
        let (graph, persister) = setup();
        let writer = PeriodicDeltaWriter::new(
            Arc::clone(&graph),
            Arc::clone(&persister) as Arc<dyn MementoPersister>,
            Duration::from_secs(3600),
        );
        writer.start();
        graph
            .manage(Arc::new(BasicObject::new(MementoKind::Entity, "e1", "t")))
            .unwrap();

        writer.stop();
        assert_eq!(writer.flush().await.unwrap(), 0);
        // no longer listening either
        graph
            .manage(Arc::new(BasicObject::new(MementoKind::Entity, "e2", "t")))
            .unwrap();
        assert_eq!(writer.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flush_after_stop_writes_nothing() {
        let (graph, persister) = setup();
        let writer = PeriodicDeltaWriter::new(
            Arc::clone(&graph),
            Arc::clone(&persister) as Arc<dyn MementoPersister>,
            Duration::from_secs(3600),
        );
        writer.start();
        graph
            .manage(Arc::new(BasicObject::new(MementoKind::Entity, "e1", "t")))
            .unwrap();
        writer.stop();

        // a change that reached the collector after stop, e.g. from a flush that was in flight
        writer
            .collector
            .on_changed(ObjectRef::new(MementoKind::Entity, "e1"));
        assert_eq!(writer.flush().await.unwrap(), 0);
        assert!(persister.working_copy().await.is_empty());
    }

    #[tokio::test]
    async fn failed_flush_keeps_changes_pending() {
        let (graph, persister) = setup();
        let writer = PeriodicDeltaWriter::new(
            Arc::clone(&graph),
            Arc::clone(&persister) as Arc<dyn MementoPersister>,
            Duration::from_secs(3600),
        );
        writer.start();
        graph
            .manage(Arc::new(BasicObject::new(MementoKind::Entity, "e1", "t")))
            .unwrap();

        persister.stop().await;
        assert!(matches!(
            writer.flush().await,
            Err(PersistenceError::Stopped)
        ));
        let pending = writer.collector.take();
        assert_eq!(pending.changed.len(), 1);
        writer.stop();
    }
}
