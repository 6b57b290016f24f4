// ABOUTME: Lookup context used during a rebind, backed by the shells built in the manifest phase.
// ABOUTME: Ids with no shell come back as placeholders, so parsing never fails on a dangling reference.

use std::collections::BTreeMap;
use std::sync::Arc;

use keelson_core::{Handle, LookupContext, ManagedObject, MementoKind, ObjectRef, Placeholder};

pub struct RebindContext {
    shells: BTreeMap<ObjectRef, Arc<dyn ManagedObject>>,
}

impl RebindContext {
    pub fn new(shells: BTreeMap<ObjectRef, Arc<dyn ManagedObject>>) -> Self {
        Self { shells }
    }

    pub fn shell(&self, kind: MementoKind, id: &str) -> Option<&Arc<dyn ManagedObject>> {
        self.shells.get(&ObjectRef::new(kind, id))
    }

    pub fn shells(&self) -> impl Iterator<Item = (&ObjectRef, &Arc<dyn ManagedObject>)> {
        self.shells.iter()
    }

    pub fn len(&self) -> usize {
        self.shells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shells.is_empty()
    }
}

impl LookupContext for RebindContext {
    fn lookup(&self, kind: MementoKind, object_type: Option<&str>, id: &str) -> Option<Handle> {
        let handle = match self.shell(kind, id) {
            Some(shell) => Handle::Live(Arc::clone(shell)),
            None => Handle::Placeholder(Placeholder {
                kind,
                object_type: object_type.map(str::to_string),
                id: id.to_string(),
            }),
        };
        Some(handle)
    }
}
