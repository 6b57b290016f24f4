// ABOUTME: Error type shared by the memento and sync-record persisters.
// ABOUTME: Separates unreachable storage (Io) from corrupt records (Format).

use std::time::Duration;

use thiserror::Error;

use crate::object_store::StoreError;

#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The store could not be read or written. Callers retry on their next
    /// scheduled operation.
    #[error("persistence io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: StoreError,
    },

    /// A stored record could not be parsed or its references did not resolve.
    #[error("persistence format error at {path}: {message}")]
    Format { path: String, message: String },

    #[error("timed out after {0:?} waiting for writes to complete")]
    Timeout(Duration),

    #[error("persister has been stopped")]
    Stopped,

    #[error("store not prepared for use: {0}")]
    NotPrepared(String),
}

impl PersistenceError {
    pub(crate) fn store(path: impl Into<String>, source: StoreError) -> Self {
        match source {
            StoreError::NotPrepared(summary) | StoreError::Closed(summary) => {
                PersistenceError::NotPrepared(summary)
            }
            source => PersistenceError::Io {
                path: path.into(),
                source,
            },
        }
    }

    pub(crate) fn format(path: impl Into<String>, message: impl ToString) -> Self {
        PersistenceError::Format {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn is_format(&self) -> bool {
        matches!(self, PersistenceError::Format { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprepared_store_maps_to_not_prepared() {
        let err = PersistenceError::store("entities/e1", StoreError::Closed("mem".to_string()));
        assert!(matches!(err, PersistenceError::NotPrepared(ref s) if s == "mem"));

        let err = PersistenceError::store(
            "entities/e1",
            StoreError::Io(std::io::Error::other("disk gone")),
        );
        assert_eq!(
            err.to_string(),
            "persistence io error at entities/e1: io error: disk gone"
        );
        assert!(!err.is_format());
    }
}
