// ABOUTME: The live object graph owned by the management node, keyed by kind and id.
// ABOUTME: Changes made through the graph are reported to an optional listener for delta persistence.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use keelson_core::{ManagedObject, MementoKind, ObjectRef, TopologyMemento};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("graph is read-only (hot standby copy)")]
    ReadOnly,

    #[error("{0} {1} is not managed")]
    NotManaged(MementoKind, String),
}

/// Receives a call for every change made through a [`ManagedGraph`].
pub trait ChangeListener: Send + Sync {
    fn on_changed(&self, object: ObjectRef);
    fn on_removed(&self, object: ObjectRef);
}

#[derive(Default)]
pub struct ManagedGraph {
    objects: RwLock<BTreeMap<ObjectRef, Arc<dyn ManagedObject>>>,
    listener: RwLock<Option<Arc<dyn ChangeListener>>>,
    read_only: AtomicBool,
}

impl ManagedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, f: impl FnOnce(&dyn ChangeListener)) {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            f(listener.as_ref());
        }
    }

    fn check_writable(&self) -> Result<(), GraphError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(GraphError::ReadOnly);
        }
        Ok(())
    }

    pub fn set_change_listener(&self, listener: Option<Arc<dyn ChangeListener>>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = listener;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Start managing `object`, replacing any object with the same kind and id.
    pub fn manage(&self, object: Arc<dyn ManagedObject>) -> Result<(), GraphError> {
        self.check_writable()?;
        let key = ObjectRef::new(object.kind(), object.id());
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), object);
        self.notify(|l| l.on_changed(key));
        Ok(())
    }

    pub fn unmanage(&self, kind: MementoKind, id: &str) -> Result<(), GraphError> {
        self.check_writable()?;
        let key = ObjectRef::new(kind, id);
        let removed = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        if removed.is_none() {
            return Err(GraphError::NotManaged(kind, id.to_string()));
        }
        self.notify(|l| l.on_removed(key));
        Ok(())
    }

    /// Report that a managed object's state was changed in place.
    pub fn mark_changed(&self, kind: MementoKind, id: &str) -> Result<(), GraphError> {
        self.check_writable()?;
        let key = ObjectRef::new(kind, id);
        if !self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key)
        {
            return Err(GraphError::NotManaged(kind, id.to_string()));
        }
        self.notify(|l| l.on_changed(key));
        Ok(())
    }

    /// Swap in a freshly rebound set of objects. No change notifications.
    pub fn replace_all(&self, objects: Vec<Arc<dyn ManagedObject>>, read_only: bool) {
        let objects = objects
            .into_iter()
            .map(|o| (ObjectRef::new(o.kind(), o.id()), o))
            .collect();
        *self.objects.write().unwrap_or_else(PoisonError::into_inner) = objects;
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn get(&self, kind: MementoKind, id: &str) -> Option<Arc<dyn ManagedObject>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ObjectRef::new(kind, id))
            .cloned()
    }

    pub fn ids(&self, kind: MementoKind) -> Vec<String> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|r| r.kind == kind)
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export every object as one topology memento.
    pub fn snapshot(&self) -> TopologyMemento {
        let objects: Vec<Arc<dyn ManagedObject>> = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        TopologyMemento::builder()
            .mementos(objects.iter().map(|o| o.to_memento()))
            .build()
    }
}
