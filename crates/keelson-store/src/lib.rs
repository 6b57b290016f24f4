// ABOUTME: Persistence layer for keelson: object stores, the memento serializer, and the two persisters.
// ABOUTME: Memento persisters hold the topology; sync record persisters hold node heartbeats.

pub mod error;
pub mod file;
pub mod listening;
pub mod memento_persister;
pub mod memory;
pub mod object_store;
pub mod serializer;
pub mod sync_persister;

pub use error::PersistenceError;
pub use file::FileObjectStore;
pub use listening::{
    ListeningObjectStore, ObjectStoreTransactionListener, RecordingTransactionListener,
};
pub use memento_persister::{
    LoadFailure, LoadedMemento, MementoManifest, MementoPersister, StoreMementoPersister,
};
pub use memory::InMemoryObjectStore;
pub use object_store::{ObjectStore, PersistMode, StoreError, StoreObjectAccessor, object_path};
pub use serializer::{MementoReferences, MementoSerializer, SerializerError};
pub use sync_persister::{PLANE_SUB_PATH, StoreSyncRecordPersister, SyncRecordPersister};
