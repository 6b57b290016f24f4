// ABOUTME: Maps a memento's type string to the constructor that builds an empty shell for it.
// ABOUTME: Registrations are validated up front, so rebind never discovers a bad constructor late.

use std::collections::HashMap;
use std::sync::Arc;

use keelson_core::{ManagedObject, MementoKind, ReconstructionError};
use thiserror::Error;

use crate::object::BasicObject;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} type name must not be empty")]
    EmptyType(MementoKind),

    #[error("{kind} type {object_type} is already registered")]
    Duplicate {
        kind: MementoKind,
        object_type: String,
    },
}

/// Everything a constructor gets: enough to build an empty shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSpec {
    pub kind: MementoKind,
    pub id: String,
    pub object_type: String,
}

pub type Constructor = Arc<dyn Fn(&ShellSpec) -> Arc<dyn ManagedObject> + Send + Sync>;

/// `(kind, type) -> constructor`.
#[derive(Default, Clone)]
pub struct TypeRegistry {
    constructors: HashMap<(MementoKind, String), Constructor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(
        &mut self,
        kind: MementoKind,
        object_type: impl Into<String>,
        constructor: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&ShellSpec) -> Arc<dyn ManagedObject> + Send + Sync + 'static,
    {
        let object_type = object_type.into();
        if object_type.trim().is_empty() {
            return Err(RegistryError::EmptyType(kind));
        }
        let key = (kind, object_type);
        if self.constructors.contains_key(&key) {
            return Err(RegistryError::Duplicate {
                kind,
                object_type: key.1,
            });
        }
        self.constructors.insert(key, Arc::new(constructor));
        Ok(())
    }

    /// Register `object_type` as a plain [`BasicObject`].
    pub fn register_basic(
        &mut self,
        kind: MementoKind,
        object_type: impl Into<String>,
    ) -> Result<(), RegistryError> {
        self.register(kind, object_type, |spec| {
            Arc::new(BasicObject::new(spec.kind, &spec.id, &spec.object_type)) as Arc<dyn ManagedObject>
        })
    }

    pub fn is_registered(&self, kind: MementoKind, object_type: &str) -> bool {
        self.constructors
            .contains_key(&(kind, object_type.to_string()))
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    /// Build an empty shell.
    pub fn construct(
        &self,
        kind: MementoKind,
        id: &str,
        object_type: &str,
    ) -> Result<Arc<dyn ManagedObject>, ReconstructionError> {
        let constructor = self
            .constructors
            .get(&(kind, object_type.to_string()))
            .ok_or_else(|| ReconstructionError::UnknownType {
                kind,
                id: id.to_string(),
                object_type: object_type.to_string(),
            })?;
        Ok(constructor(&ShellSpec {
            kind,
            id: id.to_string(),
            object_type: object_type.to_string(),
        }))
    }
}
