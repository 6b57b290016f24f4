// ABOUTME: BasicObject, a generic live entity/location/policy holding config, attributes, and relations.
// ABOUTME: Relations are held as handles; anything that is not a live shell at populate time is reported.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use keelson_core::{
    Handle, LookupContext, ManagedObject, Memento, MementoKind, MementoValue, ObjectRef,
    Placeholder, ReconstructionError, Relations,
};

#[derive(Debug, Default)]
struct BasicState {
    display_name: String,
    config: BTreeMap<String, MementoValue>,
    attributes: BTreeMap<String, MementoValue>,
    parent: Option<Handle>,
    children: Vec<Handle>,
    locations: Vec<Handle>,
    policies: Vec<Handle>,
    tags: Vec<String>,
}

/// A managed object with no behaviour of its own beyond holding state.
pub struct BasicObject {
    id: String,
    kind: MementoKind,
    object_type: String,
    state: RwLock<BasicState>,
    rebind_completions: AtomicUsize,
}

fn placeholder(target: &ObjectRef) -> Handle {
    Handle::Placeholder(Placeholder {
        kind: target.kind,
        object_type: None,
        id: target.id.clone(),
    })
}

impl BasicObject {
    pub fn new(kind: MementoKind, id: impl Into<String>, object_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            state: RwLock::new(BasicState {
                display_name: id.clone(),
                ..Default::default()
            }),
            id,
            kind,
            object_type: object_type.into(),
            rebind_completions: AtomicUsize::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BasicState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BasicState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn display_name(&self) -> String {
        self.read().display_name.clone()
    }

    pub fn set_display_name(&self, name: impl Into<String>) {
        self.write().display_name = name.into();
    }

    pub fn config(&self, key: &str) -> Option<MementoValue> {
        self.read().config.get(key).cloned()
    }

    pub fn set_config(&self, key: impl Into<String>, value: MementoValue) {
        self.write().config.insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<MementoValue> {
        self.read().attributes.get(key).cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: MementoValue) {
        self.write().attributes.insert(key.into(), value);
    }

    pub fn parent(&self) -> Option<Handle> {
        self.read().parent.clone()
    }

    pub fn set_parent(&self, parent: Option<Handle>) {
        self.write().parent = parent;
    }

    pub fn children(&self) -> Vec<Handle> {
        self.read().children.clone()
    }

    pub fn add_child(&self, child: Handle) {
        self.write().children.push(child);
    }

    pub fn locations(&self) -> Vec<Handle> {
        self.read().locations.clone()
    }

    pub fn add_location(&self, location: Handle) {
        self.write().locations.push(location);
    }

    pub fn policies(&self) -> Vec<Handle> {
        self.read().policies.clone()
    }

    pub fn add_policy(&self, policy: Handle) {
        self.write().policies.push(policy);
    }

    pub fn add_tag(&self, tag: impl Into<String>) {
        self.write().tags.push(tag.into());
    }

    /// How many times `on_rebind_complete` has run.
    pub fn rebind_completions(&self) -> usize {
        self.rebind_completions.load(Ordering::SeqCst)
    }

    /// Resolve one reference. Anything other than a live object is kept as a
    /// placeholder so the id survives the next export, and is reported.
    fn resolve(
        &self,
        lookup: &dyn LookupContext,
        target: ObjectRef,
        errors: &mut Vec<ReconstructionError>,
    ) -> Handle {
        match lookup.lookup(target.kind, None, &target.id) {
            Some(handle @ Handle::Live(_)) => handle,
            _ => {
                errors.push(ReconstructionError::UnresolvedReference {
                    kind: self.kind,
                    id: self.id.clone(),
                    target_kind: target.kind,
                    target_id: target.id.clone(),
                });
                placeholder(&target)
            }
        }
    }

    fn check_value(
        &self,
        lookup: &dyn LookupContext,
        value: &MementoValue,
        errors: &mut Vec<ReconstructionError>,
    ) {
        let mut refs = Vec::new();
        value.collect_refs(&mut refs);
        for target in refs {
            self.resolve(lookup, target, errors);
        }
    }
}

impl ManagedObject for BasicObject {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MementoKind {
        self.kind
    }

    fn object_type(&self) -> &str {
        &self.object_type
    }

    fn apply_memento(
        &self,
        memento: &Memento,
        lookup: &dyn LookupContext,
    ) -> Result<(), Vec<ReconstructionError>> {
        let mut errors = Vec::new();
        if memento.id != self.id || memento.kind != self.kind {
            errors.push(ReconstructionError::Populate {
                kind: self.kind,
                id: self.id.clone(),
                message: format!("memento is for {} {}", memento.kind, memento.id),
            });
            return Err(errors);
        }

        let relations = &memento.relations;
        let parent = relations.parent_id.as_ref().map(|id| {
            self.resolve(
                lookup,
                ObjectRef::new(self.kind.parent_kind(), id.clone()),
                &mut errors,
            )
        });
        let children: Vec<Handle> = relations
            .child_ids
            .iter()
            .map(|id| self.resolve(lookup, ObjectRef::new(self.kind, id.clone()), &mut errors))
            .collect();
        let locations: Vec<Handle> = relations
            .location_ids
            .iter()
            .map(|id| {
                self.resolve(
                    lookup,
                    ObjectRef::new(MementoKind::Location, id.clone()),
                    &mut errors,
                )
            })
            .collect();
        let policies: Vec<Handle> = relations
            .policy_ids
            .iter()
            .map(|id| {
                self.resolve(
                    lookup,
                    ObjectRef::new(MementoKind::Policy, id.clone()),
                    &mut errors,
                )
            })
            .collect();
        for value in memento.config.values().chain(memento.attributes.values()) {
            self.check_value(lookup, value, &mut errors);
        }

        // Replace wholesale so applying the same memento twice is a no-op
        *self.write() = BasicState {
            display_name: memento.display_name.clone(),
            config: memento.config.clone(),
            attributes: memento.attributes.clone(),
            parent,
            children,
            locations,
            policies,
            tags: relations.tag_ids.clone(),
        };

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn to_memento(&self) -> Memento {
        let state = self.read();
        let ids = |handles: &[Handle]| -> Vec<String> {
            handles.iter().map(|h| h.id().to_string()).collect()
        };
        Memento {
            id: self.id.clone(),
            kind: self.kind,
            object_type: self.object_type.clone(),
            display_name: state.display_name.clone(),
            config: state.config.clone(),
            attributes: state.attributes.clone(),
            relations: Relations {
                parent_id: state.parent.as_ref().map(|h| h.id().to_string()),
                child_ids: ids(&state.children),
                location_ids: ids(&state.locations),
                tag_ids: state.tags.clone(),
                policy_ids: ids(&state.policies),
            },
        }
    }

    fn on_rebind_complete(&self) {
        self.rebind_completions.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(kind = %self.kind, id = %self.id, "rebind complete");
    }

    fn parent_id(&self) -> Option<String> {
        self.read().parent.as_ref().map(|h| h.id().to_string())
    }

    fn child_ids(&self) -> Vec<String> {
        self.read().children.iter().map(|h| h.id().to_string()).collect()
    }

    fn location_ids(&self) -> Vec<String> {
        self.read()
            .locations
            .iter()
            .map(|h| h.id().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Resolves the given objects as live and everything else as placeholders.
    struct Shells(Vec<Arc<dyn ManagedObject>>);

    impl LookupContext for Shells {
        fn lookup(&self, kind: MementoKind, object_type: Option<&str>, id: &str) -> Option<Handle> {
            let live = self
                .0
                .iter()
                .find(|o| o.kind() == kind && o.id() == id)
                .map(|o| Handle::Live(Arc::clone(o)));
            live.or_else(|| {
                Some(Handle::Placeholder(Placeholder {
                    kind,
                    object_type: object_type.map(str::to_string),
                    id: id.to_string(),
                }))
            })
        }
    }

    #[test]
    fn apply_wires_relations_to_live_shells() {
        let parent: Arc<dyn ManagedObject> =
            Arc::new(BasicObject::new(MementoKind::Entity, "a", "application"));
        let vm: Arc<dyn ManagedObject> =
            Arc::new(BasicObject::new(MementoKind::Location, "vm1", "ssh-machine"));
        let lookup = Shells(vec![parent, vm]);

        let child = BasicObject::new(MementoKind::Entity, "b", "web-server");
        let memento = Memento::entity("b", "web-server")
            .with_display_name("Web")
            .with_parent("a")
            .with_location("vm1")
            .with_tag("prod")
            .with_attribute("up", MementoValue::plain(true));

        child.apply_memento(&memento, &lookup).unwrap();

        assert_eq!(child.display_name(), "Web");
        assert_eq!(child.parent_id().as_deref(), Some("a"));
        assert!(child.parent().unwrap().as_live().is_some());
        assert_eq!(child.location_ids(), vec!["vm1".to_string()]);
        assert_eq!(child.attribute("up"), Some(MementoValue::plain(true)));
        assert_eq!(child.to_memento(), memento);
    }

    #[test]
    fn missing_target_is_reported_but_the_rest_applies() {
        let lookup = Shells(Vec::new());
        let object = BasicObject::new(MementoKind::Entity, "b", "web-server");
        let memento = Memento::entity("b", "web-server")
            .with_location("l1")
            .with_config("port", MementoValue::plain(80));

        let errors = object.apply_memento(&memento, &lookup).unwrap_err();

        assert_eq!(
            errors,
            vec![ReconstructionError::UnresolvedReference {
                kind: MementoKind::Entity,
                id: "b".to_string(),
                target_kind: MementoKind::Location,
                target_id: "l1".to_string(),
            }]
        );
        assert_eq!(object.config("port"), Some(MementoValue::plain(80)));
        // the id is kept so the next export does not lose it
        assert_eq!(object.to_memento(), memento);
    }

    #[test]
    fn apply_is_idempotent() {
        let lookup = Shells(Vec::new());
        let object = BasicObject::new(MementoKind::Location, "region", "cloud");
        let memento = Memento::location("region", "cloud")
            .with_config("zone", MementoValue::plain("eu-1"));

        object.apply_memento(&memento, &lookup).unwrap();
        object.apply_memento(&memento, &lookup).unwrap();

        assert_eq!(object.to_memento(), memento);
    }

    #[test]
    fn memento_for_another_object_is_rejected() {
        let object = BasicObject::new(MementoKind::Entity, "a", "t");
        let errors = object
            .apply_memento(&Memento::entity("z", "t"), &Shells(Vec::new()))
            .unwrap_err();

        assert!(matches!(errors[0], ReconstructionError::Populate { .. }));
        assert_eq!(object.to_memento(), Memento::entity("a", "t"));
    }

    #[test]
    fn embedded_references_are_checked() {
        let object = BasicObject::new(MementoKind::Entity, "a", "t");
        let memento = Memento::entity("a", "t").with_config(
            "members",
            MementoValue::List(vec![MementoValue::EntityRef("ghost".to_string())]),
        );

        let errors = object
            .apply_memento(&memento, &Shells(Vec::new()))
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].object_id(), "a");
    }

    #[test]
    fn rebind_completion_is_counted() {
        let object = BasicObject::new(MementoKind::Policy, "p1", "restarter");
        object.on_rebind_complete();
        assert_eq!(object.rebind_completions(), 1);
    }
}
