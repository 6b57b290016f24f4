// ABOUTME: Reference resolution used while parsing and populating mementos.
// ABOUTME: A lookup returns either a live object or a lightweight placeholder for a forward reference.

use std::fmt;
use std::sync::Arc;

use crate::memento::{MementoKind, ObjectRef};
use crate::object::ManagedObject;

/// Stand-in for an object that does not exist yet. Carries only what is
/// needed to find the real object later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Placeholder {
    pub kind: MementoKind,
    pub object_type: Option<String>,
    pub id: String,
}

impl Placeholder {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind, self.id.clone())
    }
}

/// The result of resolving a reference.
#[derive(Clone)]
pub enum Handle {
    Live(Arc<dyn ManagedObject>),
    Placeholder(Placeholder),
}

impl Handle {
    pub fn id(&self) -> &str {
        match self {
            Handle::Live(obj) => obj.id(),
            Handle::Placeholder(p) => &p.id,
        }
    }

    pub fn kind(&self) -> MementoKind {
        match self {
            Handle::Live(obj) => obj.kind(),
            Handle::Placeholder(p) => p.kind,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Handle::Placeholder(_))
    }

    pub fn as_live(&self) -> Option<&Arc<dyn ManagedObject>> {
        match self {
            Handle::Live(obj) => Some(obj),
            Handle::Placeholder(_) => None,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Live(obj) => f
                .debug_struct("Live")
                .field("kind", &obj.kind())
                .field("id", &obj.id())
                .field("type", &obj.object_type())
                .finish(),
            Handle::Placeholder(p) => f.debug_tuple("Placeholder").field(p).finish(),
        }
    }
}

/// Resolves referenced ids to handles. Returning `None` means the reference
/// cannot be satisfied at all.
pub trait LookupContext: Send + Sync {
    fn lookup(&self, kind: MementoKind, object_type: Option<&str>, id: &str) -> Option<Handle>;

    fn lookup_entity(&self, object_type: Option<&str>, id: &str) -> Option<Handle> {
        self.lookup(MementoKind::Entity, object_type, id)
    }

    fn lookup_location(&self, object_type: Option<&str>, id: &str) -> Option<Handle> {
        self.lookup(MementoKind::Location, object_type, id)
    }

    fn lookup_policy(&self, object_type: Option<&str>, id: &str) -> Option<Handle> {
        self.lookup(MementoKind::Policy, object_type, id)
    }
}

/// Resolves every reference to a placeholder. Used when only the shape of
/// the stored graph matters, e.g. verifying that what was written parses.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderLookup;

impl LookupContext for PlaceholderLookup {
    fn lookup(&self, kind: MementoKind, object_type: Option<&str>, id: &str) -> Option<Handle> {
        Some(Handle::Placeholder(Placeholder {
            kind,
            object_type: object_type.map(str::to_string),
            id: id.to_string(),
        }))
    }
}
