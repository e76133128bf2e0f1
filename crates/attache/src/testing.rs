//! Test fixtures shared by the unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use attache_core::Options;
use attache_storage::{
    BoxIo, MemoryStorage, Storage, StorageError, StorageRegistry, StorageResult, UploadIo,
};
use parking_lot::Mutex;

use crate::plugin::PluginRegistry;
use crate::uploader::Uploader;

/// Build an options map from a JSON object literal
pub(crate) fn options(value: serde_json::Value) -> Options {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Options::new(),
    }
}

/// Uploader with in-memory "cache" and "store" storages
pub(crate) fn memory_uploader() -> (Uploader, Arc<MemoryStorage>, Arc<MemoryStorage>) {
    let cache = Arc::new(MemoryStorage::new());
    let store = Arc::new(MemoryStorage::new());
    let storages = StorageRegistry::new()
        .with("cache", cache.clone())
        .with("store", store.clone());
    let uploader = Uploader::with_registries("TestUploader", storages, PluginRegistry::with_builtins());
    (uploader, cache, store)
}

/// Memory storage that counts calls and can be told to fail
#[derive(Default)]
pub(crate) struct CountingStorage {
    inner: MemoryStorage,
    puts: AtomicUsize,
    deletes: Mutex<HashMap<String, usize>>,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl CountingStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_puts(self) -> Self {
        self.fail_puts.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn set_failing_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub(crate) fn deletes_of(&self, id: &str) -> usize {
        self.deletes.lock().get(id).copied().unwrap_or(0)
    }

    pub(crate) fn total_deletes(&self) -> usize {
        self.deletes.lock().values().sum()
    }

    pub(crate) async fn contains(&self, id: &str) -> bool {
        self.inner.read(id).await.is_some()
    }
}

#[async_trait]
impl Storage for CountingStorage {
    async fn put(&self, id: &str, io: &mut dyn UploadIo, options: &Options) -> StorageResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::BackendError("put rejected".to_string()));
        }
        self.inner.put(id, io, options).await
    }

    async fn open(&self, id: &str) -> StorageResult<BoxIo> {
        self.inner.open(id).await
    }

    async fn exists(&self, id: &str) -> StorageResult<bool> {
        self.inner.exists(id).await
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        *self.deletes.lock().entry(id.to_string()).or_insert(0) += 1;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::BackendError("delete rejected".to_string()));
        }
        self.inner.delete(id).await
    }

    async fn url(&self, id: &str, options: &Options) -> StorageResult<String> {
        self.inner.url(id, options).await
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Uploader whose "cache" and "store" storages count their calls
pub(crate) fn counting_uploader() -> (Uploader, Arc<CountingStorage>, Arc<CountingStorage>) {
    let cache = Arc::new(CountingStorage::new());
    let store = Arc::new(CountingStorage::new());
    let storages = StorageRegistry::new()
        .with("cache", cache.clone())
        .with("store", store.clone());
    let uploader = Uploader::with_registries("CountingUploader", storages, PluginRegistry::with_builtins());
    (uploader, cache, store)
}
