// ABOUTME: The construct-then-populate contract every reconstructible live object implements.
// ABOUTME: Also defines ReconstructionError, the per-object failure recorded during rebind.

use thiserror::Error;

use crate::lookup::LookupContext;
use crate::memento::{Memento, MementoKind};

/// Why one object could not be (fully) reconstructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconstructionError {
    #[error("{kind} {id}: no constructor registered for type {object_type}")]
    UnknownType {
        kind: MementoKind,
        id: String,
        object_type: String,
    },

    #[error("{kind} {id}: unresolved {target_kind} reference {target_id}")]
    UnresolvedReference {
        kind: MementoKind,
        id: String,
        target_kind: MementoKind,
        target_id: String,
    },

    #[error("{kind} {id}: memento could not be loaded: {message}")]
    Load {
        kind: MementoKind,
        id: String,
        message: String,
    },

    #[error("{kind} {id}: listed in the manifest but no memento was found")]
    MissingMemento { kind: MementoKind, id: String },

    #[error("{kind} {id}: {message}")]
    Populate {
        kind: MementoKind,
        id: String,
        message: String,
    },
}

impl ReconstructionError {
    /// The id of the object that failed.
    pub fn object_id(&self) -> &str {
        match self {
            Self::UnknownType { id, .. }
            | Self::UnresolvedReference { id, .. }
            | Self::Load { id, .. }
            | Self::MissingMemento { id, .. }
            | Self::Populate { id, .. } => id,
        }
    }

    pub fn kind(&self) -> MementoKind {
        match self {
            Self::UnknownType { kind, .. }
            | Self::UnresolvedReference { kind, .. }
            | Self::Load { kind, .. }
            | Self::MissingMemento { kind, .. }
            | Self::Populate { kind, .. } => *kind,
        }
    }
}

/// A live object that can be rebuilt from a memento.
///
/// Objects are created as empty shells from `{kind, id, type}` alone and
/// populated later with a single `apply_memento` call. Implementations use
/// interior mutability because shells are shared (`Arc`) before they are
/// populated.
pub trait ManagedObject: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MementoKind;

    fn object_type(&self) -> &str;

    /// Replace this object's state with the memento's, resolving references
    /// through `lookup`. Must be idempotent. Parts that cannot be applied are
    /// skipped and returned as errors; the rest of the memento still applies.
    fn apply_memento(
        &self,
        memento: &Memento,
        lookup: &dyn LookupContext,
    ) -> Result<(), Vec<ReconstructionError>>;

    /// Export current state for a checkpoint or delta.
    fn to_memento(&self) -> Memento;

    /// Called once every object in a rebind has been populated.
    fn on_rebind_complete(&self);

    fn parent_id(&self) -> Option<String>;

    fn child_ids(&self) -> Vec<String>;

    fn location_ids(&self) -> Vec<String>;
}
