// ABOUTME: The durable key/blob store abstraction every persister writes through.
// ABOUTME: Stores hand out per-path accessors; a put must atomically replace the whole object.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by an object store or one of its accessors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store not prepared for use: {0}")]
    NotPrepared(String),

    #[error("store is closed: {0}")]
    Closed(String),

    #[error("invalid object path: {0}")]
    InvalidPath(String),

    #[error("persistence is disabled for {0}")]
    PersistenceDisabled(String),

    #[error("rebind requested but {0} holds no persisted state")]
    NothingToRebind(String),
}

/// How a store treats existing contents when it is prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// No persistence; the store refuses to prepare.
    Disabled,
    /// Use existing contents if present, start empty otherwise.
    Auto,
    /// Existing contents are required.
    Rebind,
    /// Existing contents are deleted.
    Clean,
}

impl FromStr for PersistMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "auto" => Ok(Self::Auto),
            "rebind" => Ok(Self::Rebind),
            "clean" => Ok(Self::Clean),
            other => Err(format!("unknown persist mode: {}", other)),
        }
    }
}

impl fmt::Display for PersistMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Auto => "auto",
            Self::Rebind => "rebind",
            Self::Clean => "clean",
        };
        f.write_str(s)
    }
}

/// Read/write handle on one stored object.
pub trait StoreObjectAccessor: Send + Sync {
    fn path(&self) -> &str;

    /// Current contents, or `None` if the object does not exist.
    fn get(&self) -> Result<Option<String>, StoreError>;

    /// Atomically replace the object. Readers see the old or the new
    /// contents, never a mix.
    fn put(&self, contents: &str) -> Result<(), StoreError>;

    fn append(&self, contents: &str) -> Result<(), StoreError>;

    /// Delete the object. Deleting a missing object is not an error.
    fn delete(&self) -> Result<(), StoreError>;

    fn exists(&self) -> Result<bool, StoreError>;

    fn last_modified(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// A durable store of text objects addressed by `sub_path/name`.
pub trait ObjectStore: Send + Sync {
    /// Human-readable description for logs.
    fn summary_name(&self) -> String;

    /// Must be called before any accessor is created.
    fn prepare_for_use(&self, mode: PersistMode) -> Result<(), StoreError>;

    fn create_sub_path(&self, sub_path: &str) -> Result<(), StoreError>;

    fn new_accessor(&self, path: &str) -> Result<Box<dyn StoreObjectAccessor>, StoreError>;

    /// Names of the objects directly under `sub_path`, sorted.
    fn list_contents_with_sub_path(&self, sub_path: &str) -> Result<Vec<String>, StoreError>;

    fn delete_completely(&self) -> Result<(), StoreError>;

    fn close(&self);
}

/// Join a sub-path and an object name into a store path.
pub fn object_path(sub_path: &str, name: &str) -> String {
    format!("{}/{}", sub_path, name)
}

/// Reject paths that are empty, absolute, escape the store root, or have a
/// segment starting with `.` (reserved for in-flight temp files).
pub fn validate_path(path: &str) -> Result<(), StoreError> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|seg| seg.is_empty() || seg.starts_with('.'));
    if bad {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_path_rejects_escapes() {
        assert!(validate_path("entities/e1").is_ok());
        assert!(validate_path("plane/node-1").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("entities/../plane").is_err());
        assert!(validate_path("entities//e1").is_err());
        assert!(validate_path("entities/.e1.01ABC.tmp").is_err());
        assert!(validate_path("entities/e1.tmp").is_ok());
    }

    #[test]
    fn persist_mode_round_trips_through_strings() {
        for mode in [
            PersistMode::Disabled,
            PersistMode::Auto,
            PersistMode::Rebind,
            PersistMode::Clean,
        ] {
            assert_eq!(mode.to_string().parse::<PersistMode>().unwrap(), mode);
        }
        assert!("sometimes".parse::<PersistMode>().is_err());
    }
}
