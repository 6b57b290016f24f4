// ABOUTME: Object store decorator that reports every read, write, and listing to a listener.
// ABOUTME: RecordingTransactionListener keeps byte and call counters for tests and diagnostics.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::object_store::{ObjectStore, PersistMode, StoreError, StoreObjectAccessor};

/// Receives a callback for every transfer through a [`ListeningObjectStore`].
pub trait ObjectStoreTransactionListener: Send + Sync {
    fn record_query_out(&self, summary: &str, size: usize);
    fn record_data_out(&self, summary: &str, size: usize);
    fn record_data_in(&self, summary: &str, size: usize);
}

/// Counts bytes and calls in each direction.
#[derive(Debug, Default)]
pub struct RecordingTransactionListener {
    prefix: String,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    queries_out: AtomicU64,
    data_out: AtomicU64,
    data_in: AtomicU64,
}

impl RecordingTransactionListener {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::SeqCst)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::SeqCst)
    }

    pub fn count_queries_out(&self) -> u64 {
        self.queries_out.load(Ordering::SeqCst)
    }

    pub fn count_data_out(&self) -> u64 {
        self.data_out.load(Ordering::SeqCst)
    }

    pub fn count_data_in(&self) -> u64 {
        self.data_in.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        for counter in [
            &self.bytes_in,
            &self.bytes_out,
            &self.queries_out,
            &self.data_out,
            &self.data_in,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }
}

impl ObjectStoreTransactionListener for RecordingTransactionListener {
    fn record_query_out(&self, summary: &str, size: usize) {
        self.bytes_out.fetch_add(size as u64, Ordering::SeqCst);
        self.queries_out.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(prefix = %self.prefix, summary, size, "store query out");
    }

    fn record_data_out(&self, summary: &str, size: usize) {
        self.bytes_out.fetch_add(size as u64, Ordering::SeqCst);
        self.data_out.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(prefix = %self.prefix, summary, size, "store data out");
    }

    fn record_data_in(&self, summary: &str, size: usize) {
        self.bytes_in.fetch_add(size as u64, Ordering::SeqCst);
        self.data_in.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(prefix = %self.prefix, summary, size, "store data in");
    }
}

/// Wraps another store and reports traffic to a listener.
pub struct ListeningObjectStore {
    delegate: Arc<dyn ObjectStore>,
    listener: Arc<dyn ObjectStoreTransactionListener>,
}

impl ListeningObjectStore {
    pub fn new(
        delegate: Arc<dyn ObjectStore>,
        listener: Arc<dyn ObjectStoreTransactionListener>,
    ) -> Self {
        Self { delegate, listener }
    }
}

impl ObjectStore for ListeningObjectStore {
    fn summary_name(&self) -> String {
        format!("listening {}", self.delegate.summary_name())
    }

    fn prepare_for_use(&self, mode: PersistMode) -> Result<(), StoreError> {
        self.delegate.prepare_for_use(mode)
    }

    fn create_sub_path(&self, sub_path: &str) -> Result<(), StoreError> {
        self.listener
            .record_query_out(&format!("creating path {}", sub_path), sub_path.len());
        self.delegate.create_sub_path(sub_path)
    }

    fn new_accessor(&self, path: &str) -> Result<Box<dyn StoreObjectAccessor>, StoreError> {
        Ok(Box::new(ListeningAccessor {
            delegate: self.delegate.new_accessor(path)?,
            listener: Arc::clone(&self.listener),
        }))
    }

    fn list_contents_with_sub_path(&self, sub_path: &str) -> Result<Vec<String>, StoreError> {
        self.listener
            .record_query_out(&format!("requesting list {}", sub_path), sub_path.len());
        let names = self.delegate.list_contents_with_sub_path(sub_path)?;
        let size: usize = names.iter().map(String::len).sum();
        self.listener
            .record_data_in(&format!("receiving list {}", sub_path), size);
        Ok(names)
    }

    fn delete_completely(&self) -> Result<(), StoreError> {
        self.listener.record_data_out("deleting completely", 0);
        self.delegate.delete_completely()
    }

    fn close(&self) {
        self.delegate.close();
    }
}

struct ListeningAccessor {
    delegate: Box<dyn StoreObjectAccessor>,
    listener: Arc<dyn ObjectStoreTransactionListener>,
}

impl StoreObjectAccessor for ListeningAccessor {
    fn path(&self) -> &str {
        self.delegate.path()
    }

    fn get(&self) -> Result<Option<String>, StoreError> {
        let path = self.delegate.path();
        self.listener
            .record_query_out(&format!("requesting {}", path), path.len());
        let result = self.delegate.get()?;
        let size = result.as_ref().map(String::len).unwrap_or(0);
        self.listener
            .record_data_in(&format!("reading {}", path), size);
        Ok(result)
    }

    fn put(&self, contents: &str) -> Result<(), StoreError> {
        self.listener
            .record_data_out(&format!("writing {}", self.delegate.path()), contents.len());
        self.delegate.put(contents)
    }

    fn append(&self, contents: &str) -> Result<(), StoreError> {
        self.listener
            .record_data_out(&format!("appending {}", self.delegate.path()), contents.len());
        self.delegate.append(contents)
    }

    fn delete(&self) -> Result<(), StoreError> {
        let path = self.delegate.path();
        self.listener
            .record_query_out(&format!("deleting {}", path), path.len());
        self.delegate.delete()
    }

    fn exists(&self) -> Result<bool, StoreError> {
        let path = self.delegate.path();
        self.listener
            .record_query_out(&format!("checking exists {}", path), path.len());
        self.delegate.exists()
    }

    fn last_modified(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let path = self.delegate.path();
        self.listener
            .record_query_out(&format!("requesting modified date {}", path), path.len());
        self.delegate.last_modified()
    }
}
