// ABOUTME: Converts mementos and node records to pretty JSON text and back.
// ABOUTME: Parsing resolves every embedded reference through a caller-supplied LookupContext.

use std::marker::PhantomData;

use keelson_core::{
    Handle, LookupContext, ManagementNodeRecord, ManifestEntry, Memento, MementoKind, ObjectRef,
    TopologyMemento,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors raised while turning text into a value or back.
#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unresolved {kind} reference {id}")]
    UnresolvedReference { kind: MementoKind, id: String },

    #[error("{expected} reference {id} resolved to a {actual}")]
    KindMismatch {
        expected: MementoKind,
        actual: MementoKind,
        id: String,
    },
}

/// Anything the serializer can write: it must list the objects it points at
/// so they can be resolved on the way back in.
pub trait MementoReferences {
    fn references(&self) -> Vec<ObjectRef>;
}

impl MementoReferences for Memento {
    fn references(&self) -> Vec<ObjectRef> {
        Memento::references(self)
    }
}

impl MementoReferences for TopologyMemento {
    fn references(&self) -> Vec<ObjectRef> {
        self.iter().flat_map(Memento::references).collect()
    }
}

impl MementoReferences for ManagementNodeRecord {
    fn references(&self) -> Vec<ObjectRef> {
        Vec::new()
    }
}

impl MementoReferences for ManifestEntry {
    fn references(&self) -> Vec<ObjectRef> {
        Vec::new()
    }
}

/// Text form for one value type. Stateless; cheap to construct.
#[derive(Debug)]
pub struct MementoSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for MementoSerializer<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for MementoSerializer<T> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<T> MementoSerializer<T>
where
    T: Serialize + DeserializeOwned + MementoReferences,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_string(&self, value: &T) -> Result<String, SerializerError> {
        Ok(serde_json::to_string_pretty(value)?)
    }

    /// Parse `text` and check that every reference it holds resolves through
    /// `lookup`. Forward references are fine as long as the lookup hands back
    /// a placeholder for them.
    pub fn from_str(&self, text: &str, lookup: &dyn LookupContext) -> Result<T, SerializerError> {
        let value: T = serde_json::from_str(text)?;
        self.resolve(&value, lookup)?;
        Ok(value)
    }

    /// Resolve every reference in `value`, in the order the value lists them.
    pub fn resolve(
        &self,
        value: &T,
        lookup: &dyn LookupContext,
    ) -> Result<Vec<(ObjectRef, Handle)>, SerializerError> {
        value
            .references()
            .into_iter()
            .map(|r| {
                let handle = lookup.lookup(r.kind, None, &r.id).ok_or_else(|| {
                    SerializerError::UnresolvedReference {
                        kind: r.kind,
                        id: r.id.clone(),
                    }
                })?;
                if handle.kind() != r.kind {
                    return Err(SerializerError::KindMismatch {
                        expected: r.kind,
                        actual: handle.kind(),
                        id: r.id.clone(),
                    });
                }
                Ok((r, handle))
            })
            .collect()
    }
}

/// Read only the `{id, type}` pair of a stored memento.
pub fn read_manifest_entry(text: &str) -> Result<ManifestEntry, SerializerError> {
    Ok(serde_json::from_str(text)?)
}
