// ABOUTME: Rebuilds the live graph from the memento persister in two phases: manifest, then population.
// ABOUTME: Also owns master-side persistence: the initial checkpoint and the periodic delta writer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use keelson_core::{ManagedObject, MementoKind, ObjectRef, ReconstructionError};
use keelson_store::{MementoPersister, PersistenceError};
use thiserror::Error;

use crate::context::RebindContext;
use crate::graph::ManagedGraph;
use crate::registry::TypeRegistry;
use crate::writer::PeriodicDeltaWriter;

pub const DEFAULT_PERSIST_PERIOD: Duration = Duration::from_millis(1000);

/// What to do when one object cannot be reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebindFailureMode {
    /// Abort on the first failure.
    FailFast,
    /// Skip failed objects and report them.
    Continue,
    /// Process everything, then fail once with every failure.
    #[default]
    FailAtEnd,
}

impl FromStr for RebindFailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "fail-fast" => Ok(Self::FailFast),
            "continue" => Ok(Self::Continue),
            "fail-at-end" => Ok(Self::FailAtEnd),
            other => Err(format!("unknown rebind failure mode: {}", other)),
        }
    }
}

impl fmt::Display for RebindFailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FailFast => "fail-fast",
            Self::Continue => "continue",
            Self::FailAtEnd => "fail-at-end",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RebindOptions {
    pub failure_mode: RebindFailureMode,
    /// Build a warm copy that refuses changes and is never persisted.
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebindReport {
    pub entities: usize,
    pub locations: usize,
    pub policies: usize,
    pub failures: Vec<ReconstructionError>,
    pub read_only: bool,
}

impl RebindReport {
    pub fn object_count(&self) -> usize {
        self.entities + self.locations + self.policies
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

fn describe(failures: &[ReconstructionError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum RebindError {
    #[error("rebind aborted: {0}")]
    FailFast(ReconstructionError),

    #[error("rebind failed for {} object(s): {}", .failures.len(), describe(.failures))]
    FailAtEnd { failures: Vec<ReconstructionError> },

    #[error("persistence error during rebind: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("cannot rebind while persisting changes as master")]
    WhilePersisting,
}

impl RebindError {
    /// A store-level failure that may clear on retry, as opposed to state
    /// that cannot be reconstructed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RebindError::Persistence(_) | RebindError::WhilePersisting)
    }

    /// Every reconstruction failure this error carries.
    pub fn failures(&self) -> &[ReconstructionError] {
        match self {
            RebindError::FailFast(failure) => std::slice::from_ref(failure),
            RebindError::FailAtEnd { failures } => failures,
            RebindError::Persistence(_) | RebindError::WhilePersisting => &[],
        }
    }
}

/// Failures recorded so far, applied against the failure mode.
struct FailureLog {
    mode: RebindFailureMode,
    failures: Vec<ReconstructionError>,
    failed: BTreeSet<ObjectRef>,
}

impl FailureLog {
    fn new(mode: RebindFailureMode) -> Self {
        Self {
            mode,
            failures: Vec::new(),
            failed: BTreeSet::new(),
        }
    }

    fn record(&mut self, failure: ReconstructionError) -> Result<(), RebindError> {
        tracing::error!(kind = %failure.kind(), id = %failure.object_id(), error = %failure, "rebind failure");
        self.failed
            .insert(ObjectRef::new(failure.kind(), failure.object_id()));
        if self.mode == RebindFailureMode::FailFast {
            return Err(RebindError::FailFast(failure));
        }
        self.failures.push(failure);
        Ok(())
    }

    fn has_failed(&self, object: &ObjectRef) -> bool {
        self.failed.contains(object)
    }
}

pub struct RebindManager {
    persister: Arc<dyn MementoPersister>,
    registry: Arc<TypeRegistry>,
    graph: Arc<ManagedGraph>,
    failure_mode: RebindFailureMode,
    persist_period: Duration,
    writer: Mutex<Option<Arc<PeriodicDeltaWriter>>>,
}

impl RebindManager {
    pub fn new(
        persister: Arc<dyn MementoPersister>,
        registry: Arc<TypeRegistry>,
        graph: Arc<ManagedGraph>,
    ) -> Self {
        Self {
            persister,
            registry,
            graph,
            failure_mode: RebindFailureMode::default(),
            persist_period: DEFAULT_PERSIST_PERIOD,
            writer: Mutex::new(None),
        }
    }

    pub fn with_failure_mode(mut self, mode: RebindFailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn with_persist_period(mut self, period: Duration) -> Self {
        self.persist_period = period;
        self
    }

    pub fn failure_mode(&self) -> RebindFailureMode {
        self.failure_mode
    }

    pub fn graph(&self) -> &Arc<ManagedGraph> {
        &self.graph
    }

    pub fn persister(&self) -> &Arc<dyn MementoPersister> {
        &self.persister
    }

    fn current_writer(&self) -> Option<Arc<PeriodicDeltaWriter>> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_persisting(&self) -> bool {
        self.current_writer().is_some()
    }

    /// Rebuild the live graph from persisted state. Once population has run the
    /// graph is replaced, including under `FailAtEnd` with failures; an earlier
    /// abort leaves it as it was.
    pub async fn rebind(&self, options: RebindOptions) -> Result<RebindReport, RebindError> {
        if self.is_persisting() {
            return Err(RebindError::WhilePersisting);
        }
        let started = Instant::now();
        let mut log = FailureLog::new(options.failure_mode);

        // Manifest phase: one empty shell per stored id
        let mut manifest = self.persister.load_manifest().await?;
        for failure in std::mem::take(&mut manifest.failures) {
            log.record(ReconstructionError::Load {
                kind: failure.kind,
                id: failure.id,
                message: failure.error.to_string(),
            })?;
        }

        let mut order = Vec::with_capacity(manifest.len());
        let mut shells: BTreeMap<ObjectRef, Arc<dyn ManagedObject>> = BTreeMap::new();
        for (kind, id, object_type) in manifest.iter() {
            match self.registry.construct(kind, id, object_type) {
                Ok(shell) => {
                    let key = ObjectRef::new(kind, id);
                    order.push(key.clone());
                    shells.insert(key, shell);
                }
                Err(failure) => log.record(failure)?,
            }
        }
        tracing::debug!(shells = shells.len(), "manifest phase complete");

        // Population phase: references resolve to the shells built above
        let context = RebindContext::new(shells);
        let loaded = self.persister.load_memento_lenient(&context).await?;
        for failure in loaded.failures {
            let object = ObjectRef::new(failure.kind, failure.id.clone());
            if log.has_failed(&object) {
                continue;
            }
            log.record(ReconstructionError::Load {
                kind: failure.kind,
                id: failure.id,
                message: failure.error.to_string(),
            })?;
        }

        let mut populated = Vec::with_capacity(order.len());
        for key in &order {
            let Some(shell) = context.shell(key.kind, &key.id) else {
                continue;
            };
            let Some(memento) = loaded.memento.get(key.kind, &key.id) else {
                if !log.has_failed(key) {
                    log.record(ReconstructionError::MissingMemento {
                        kind: key.kind,
                        id: key.id.clone(),
                    })?;
                }
                continue;
            };
            if let Err(failures) = shell.apply_memento(memento, &context) {
                for failure in failures {
                    log.record(failure)?;
                }
            }
            populated.push(Arc::clone(shell));
        }

        for object in &populated {
            object.on_rebind_complete();
        }

        let count = |kind: MementoKind| populated.iter().filter(|o| o.kind() == kind).count();
        let report = RebindReport {
            entities: count(MementoKind::Entity),
            locations: count(MementoKind::Location),
            policies: count(MementoKind::Policy),
            failures: log.failures,
            read_only: options.read_only,
        };
        // Everything that did populate is installed, even when failing at the end
        self.graph.replace_all(populated, options.read_only);

        if options.failure_mode == RebindFailureMode::FailAtEnd && !report.is_clean() {
            tracing::warn!(
                objects = report.object_count(),
                failures = report.failure_count(),
                "rebind finished with failures"
            );
            return Err(RebindError::FailAtEnd {
                failures: report.failures,
            });
        }

        tracing::info!(
            entities = report.entities,
            locations = report.locations,
            policies = report.policies,
            failures = report.failure_count(),
            read_only = report.read_only,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rebind complete"
        );
        Ok(report)
    }

    /// Rebind using this manager's configured failure mode.
    pub async fn rebind_default(&self, read_only: bool) -> Result<RebindReport, RebindError> {
        self.rebind(RebindOptions {
            failure_mode: self.failure_mode,
            read_only,
        })
        .await
    }

    /// Start writing live changes: a full checkpoint now, then periodic deltas.
    pub async fn start_persisting(&self) -> Result<(), PersistenceError> {
        if self.is_persisting() {
            return Ok(());
        }
        let writer = PeriodicDeltaWriter::new(
            Arc::clone(&self.graph),
            Arc::clone(&self.persister),
            self.persist_period,
        );
        // Listen before the checkpoint so nothing changed in between is lost
        writer.start();
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&writer));

        if let Err(e) = self.checkpoint_now().await {
            self.stop_persisting();
            return Err(e);
        }
        tracing::info!("persisting live changes");
        Ok(())
    }

    /// Halt delta writes immediately.
    pub fn stop_persisting(&self) {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            writer.stop();
            tracing::info!("stopped persisting live changes");
        }
    }

    pub async fn checkpoint_now(&self) -> Result<(), PersistenceError> {
        self.persister.checkpoint(&self.graph.snapshot()).await
    }

    /// Flush pending changes now. Returns 0 when not persisting.
    pub async fn flush_now(&self) -> Result<usize, PersistenceError> {
        match self.current_writer() {
            Some(writer) => writer.flush().await,
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::BasicObject;
    use keelson_core::{Memento, MementoValue, PlaceholderLookup, TopologyMemento};
    use keelson_store::{InMemoryObjectStore, ObjectStore, StoreMementoPersister};

    fn registry() -> Arc<TypeRegistry> {
        let mut registry = TypeRegistry::new();
        registry.register_basic(MementoKind::Entity, "application").unwrap();
        registry.register_basic(MementoKind::Entity, "web-server").unwrap();
        registry.register_basic(MementoKind::Location, "ssh-machine").unwrap();
        registry.register_basic(MementoKind::Policy, "restarter").unwrap();
        Arc::new(registry)
    }

    async fn manager_with(memento: &TopologyMemento) -> RebindManager {
        let persister = Arc::new(StoreMementoPersister::in_memory());
        persister.checkpoint(memento).await.unwrap();
        RebindManager::new(persister, registry(), Arc::new(ManagedGraph::new()))
    }

    fn topology() -> TopologyMemento {
        TopologyMemento::builder()
            .memento(
                Memento::entity("app", "application")
                    .with_child("web")
                    .with_config("owner", MementoValue::plain("ops")),
            )
            .memento(
                Memento::entity("web", "web-server")
                    .with_parent("app")
                    .with_location("vm1")
                    .with_policy("p1")
                    .with_attribute("up", MementoValue::plain(true)),
            )
            .memento(Memento::location("vm1", "ssh-machine"))
            .memento(Memento::policy("p1", "restarter").with_parent("web"))
            .build()
    }

    fn a_b_with_missing_location() -> TopologyMemento {
        TopologyMemento::builder()
            .memento(Memento::entity("A", "application").with_child("B"))
            .memento(
                Memento::entity("B", "web-server")
                    .with_parent("A")
                    .with_location("L1")
                    .with_config("port", MementoValue::plain(80)),
            )
            .build()
    }

    #[tokio::test]
    async fn rebind_restores_the_graph() {
        let manager = manager_with(&topology()).await;

        let report = manager.rebind(RebindOptions::default()).await.unwrap();

        assert_eq!(report.object_count(), 4);
        assert!(report.is_clean());
        assert_eq!(manager.graph().snapshot(), topology());

        let web = manager.graph().get(MementoKind::Entity, "web").unwrap();
        assert_eq!(web.parent_id().as_deref(), Some("app"));
        assert_eq!(web.location_ids(), vec!["vm1".to_string()]);
    }

    #[tokio::test]
    async fn rebind_twice_gives_the_same_graph() {
        let manager = manager_with(&topology()).await;

        manager.rebind(RebindOptions::default()).await.unwrap();
        let first = manager.graph().snapshot();
        manager.rebind(RebindOptions::default()).await.unwrap();

        assert_eq!(manager.graph().snapshot(), first);
    }

    #[tokio::test]
    async fn fail_at_end_reports_the_one_missing_location() {
        let built: Arc<Mutex<Vec<Arc<BasicObject>>>> = Arc::default();
        let mut registry = TypeRegistry::new();
        for object_type in ["application", "web-server"] {
            let built = Arc::clone(&built);
            registry
                .register(MementoKind::Entity, object_type, move |spec| {
                    let object = Arc::new(BasicObject::new(spec.kind, &spec.id, &spec.object_type));
                    built.lock().unwrap().push(Arc::clone(&object));
                    object as Arc<dyn ManagedObject>
                })
                .unwrap();
        }
        let persister = Arc::new(StoreMementoPersister::in_memory());
        persister.checkpoint(&a_b_with_missing_location()).await.unwrap();
        let manager = RebindManager::new(persister, Arc::new(registry), Arc::new(ManagedGraph::new()));

        let err = manager
            .rebind(RebindOptions {
                failure_mode: RebindFailureMode::FailAtEnd,
                read_only: false,
            })
            .await
            .unwrap_err();

        assert_eq!(
            err.failures(),
            &[ReconstructionError::UnresolvedReference {
                kind: MementoKind::Entity,
                id: "B".to_string(),
                target_kind: MementoKind::Location,
                target_id: "L1".to_string(),
            }]
        );
        // the objects that did populate are live; the dangling location stays a placeholder
        let a = manager.graph().get(MementoKind::Entity, "A").unwrap();
        assert_eq!(a.child_ids(), vec!["B".to_string()]);
        let b = manager.graph().get(MementoKind::Entity, "B").unwrap();
        assert_eq!(b.parent_id().as_deref(), Some("A"));
        assert_eq!(b.to_memento().config["port"], MementoValue::plain(80));
        assert_eq!(b.location_ids(), vec!["L1".to_string()]);
        assert!(manager.graph().get(MementoKind::Location, "L1").is_none());

        let built = built.lock().unwrap();
        let b = built.iter().find(|o| o.id() == "B").unwrap();
        assert!(b.locations()[0].is_placeholder());
    }

    #[tokio::test]
    async fn continue_populates_everything_it_can() {
        let manager = manager_with(&a_b_with_missing_location()).await;

        let report = manager
            .rebind(RebindOptions {
                failure_mode: RebindFailureMode::Continue,
                read_only: false,
            })
            .await
            .unwrap();

        assert_eq!(report.failure_count(), 1);
        assert_eq!(report.entities, 2);

        let a = manager.graph().get(MementoKind::Entity, "A").unwrap();
        assert_eq!(a.child_ids(), vec!["B".to_string()]);
        let b = manager.graph().get(MementoKind::Entity, "B").unwrap();
        assert_eq!(b.parent_id().as_deref(), Some("A"));
        assert_eq!(
            b.to_memento().config["port"],
            MementoValue::plain(80)
        );
    }

    #[tokio::test]
    async fn fail_fast_stops_at_the_first_failure() {
        let memento = TopologyMemento::builder()
            .memento(Memento::entity("a", "unknown-kind"))
            .memento(Memento::entity("b", "also-unknown"))
            .build();
        let manager = manager_with(&memento).await;

        let err = manager
            .rebind(RebindOptions {
                failure_mode: RebindFailureMode::FailFast,
                read_only: false,
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RebindError::FailFast(ReconstructionError::UnknownType { ref id, .. }) if id == "a"
        ));
    }

    #[tokio::test]
    async fn unknown_type_is_skipped_under_continue() {
        let memento = TopologyMemento::builder()
            .memento(Memento::entity("app", "application"))
            .memento(Memento::location("odd", "teleporter"))
            .build();
        let manager = manager_with(&memento).await;

        let report = manager
            .rebind(RebindOptions {
                failure_mode: RebindFailureMode::Continue,
                read_only: false,
            })
            .await
            .unwrap();

        assert_eq!(report.entities, 1);
        assert_eq!(report.locations, 0);
        assert!(matches!(
            report.failures[0],
            ReconstructionError::UnknownType { .. }
        ));
    }

    #[tokio::test]
    async fn corrupt_memento_is_reported_once() {
        let store = InMemoryObjectStore::prepared();
        let persister = Arc::new(StoreMementoPersister::new(Arc::new(store.clone())));
        persister.checkpoint(&topology()).await.unwrap();
        store
            .new_accessor("entities/broken")
            .unwrap()
            .put("not json at all")
            .unwrap();
        let manager = RebindManager::new(persister, registry(), Arc::new(ManagedGraph::new()));

        let report = manager
            .rebind(RebindOptions {
                failure_mode: RebindFailureMode::Continue,
                read_only: false,
            })
            .await
            .unwrap();

        assert_eq!(report.object_count(), 4);
        assert_eq!(report.failure_count(), 1);
        assert!(matches!(
            report.failures[0],
            ReconstructionError::Load { ref id, .. } if id == "broken"
        ));
    }

    #[tokio::test]
    async fn completion_hook_runs_once_per_rebind() {
        let built: Arc<Mutex<Vec<Arc<BasicObject>>>> = Arc::default();
        let mut registry = TypeRegistry::new();
        for (kind, object_type) in [
            (MementoKind::Entity, "application"),
            (MementoKind::Entity, "web-server"),
            (MementoKind::Location, "ssh-machine"),
            (MementoKind::Policy, "restarter"),
        ] {
            let built = Arc::clone(&built);
            registry
                .register(kind, object_type, move |spec| {
                    let object = Arc::new(BasicObject::new(spec.kind, &spec.id, &spec.object_type));
                    built.lock().unwrap().push(Arc::clone(&object));
                    object as Arc<dyn ManagedObject>
                })
                .unwrap();
        }
        let persister = Arc::new(StoreMementoPersister::in_memory());
        persister.checkpoint(&topology()).await.unwrap();
        let manager = RebindManager::new(persister, Arc::new(registry), Arc::new(ManagedGraph::new()));

        manager.rebind(RebindOptions::default()).await.unwrap();

        let built = built.lock().unwrap();
        assert_eq!(built.len(), 4);
        assert!(built.iter().all(|o| o.rebind_completions() == 1));
    }

    #[tokio::test]
    async fn read_only_rebind_marks_the_graph() {
        let manager = manager_with(&topology()).await;

        let report = manager
            .rebind(RebindOptions {
                failure_mode: RebindFailureMode::FailAtEnd,
                read_only: true,
            })
            .await
            .unwrap();

        assert!(report.read_only);
        assert!(manager.graph().is_read_only());
    }

    #[tokio::test]
    async fn persisting_checkpoints_then_writes_deltas() {
        let persister = Arc::new(StoreMementoPersister::in_memory());
        let graph = Arc::new(ManagedGraph::new());
        let manager = RebindManager::new(
            Arc::clone(&persister) as Arc<dyn MementoPersister>,
            registry(),
            Arc::clone(&graph),
        )
        .with_persist_period(Duration::from_secs(3600));

        graph
            .manage(Arc::new(BasicObject::new(MementoKind::Entity, "app", "application")))
            .unwrap();
        manager.start_persisting().await.unwrap();
        assert!(manager.is_persisting());
        assert_eq!(
            persister.load_memento(&PlaceholderLookup).await.unwrap().len(),
            1
        );

        graph
            .manage(Arc::new(BasicObject::new(MementoKind::Location, "vm1", "ssh-machine")))
            .unwrap();
        assert_eq!(manager.flush_now().await.unwrap(), 1);
        assert_eq!(
            persister.load_memento(&PlaceholderLookup).await.unwrap().len(),
            2
        );

        assert!(matches!(
            manager.rebind(RebindOptions::default()).await,
            Err(RebindError::WhilePersisting)
        ));

        manager.stop_persisting();
        assert!(!manager.is_persisting());
        assert_eq!(manager.flush_now().await.unwrap(), 0);
    }

    #[test]
    fn failure_mode_parses() {
        assert_eq!(
            "FAIL_AT_END".parse::<RebindFailureMode>().unwrap(),
            RebindFailureMode::FailAtEnd
        );
        assert_eq!(
            "fail-fast".parse::<RebindFailureMode>().unwrap(),
            RebindFailureMode::FailFast
        );
        assert!("sometimes".parse::<RebindFailureMode>().is_err());
        assert_eq!(RebindFailureMode::Continue.to_string(), "continue");
    }
}
