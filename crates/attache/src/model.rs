//! Record persistence lifecycle
//!
//! Records expose their attachers through [`Attachable`]; attachment columns
//! are persisted through a [`ColumnStore`]. [`save`] runs the
//! persist / finalize / persist sequence that keeps every persisted
//! reference pointing at an existing file.

use std::collections::HashMap;

use async_trait::async_trait;
use attache_core::RecordRef;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::attacher::Attacher;
use crate::error::{AttacheError, AttacheResult};

/// Storage of serialized attachment columns
#[async_trait]
pub trait ColumnStore: Send + Sync {
    async fn read(&self, record: &RecordRef, name: &str) -> AttacheResult<Option<String>>;

    /// Write a column; `None` clears it
    async fn write(&self, record: &RecordRef, name: &str, value: Option<&str>) -> AttacheResult<()>;

    /// Write `new` only if the column currently holds `expected`
    async fn compare_and_swap(
        &self,
        record: &RecordRef,
        name: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> AttacheResult<bool>;

    /// Remove every column of a record
    async fn remove(&self, record: &RecordRef) -> AttacheResult<()>;
}

/// In-memory column store for testing
#[derive(Default)]
pub struct MemoryColumnStore {
    columns: RwLock<HashMap<(RecordRef, String), String>>,
}

impl MemoryColumnStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(record: &RecordRef, name: &str) -> AttacheResult<(RecordRef, String)> {
        if !record.is_persisted() {
            return Err(AttacheError::Persistence(format!(
                "record {} has no id",
                record
            )));
        }
        Ok((record.clone(), name.to_string()))
    }
}

#[async_trait]
impl ColumnStore for MemoryColumnStore {
    async fn read(&self, record: &RecordRef, name: &str) -> AttacheResult<Option<String>> {
        let key = Self::key(record, name)?;
        Ok(self.columns.read().await.get(&key).cloned())
    }

    async fn write(&self, record: &RecordRef, name: &str, value: Option<&str>) -> AttacheResult<()> {
        let key = Self::key(record, name)?;
        let mut columns = self.columns.write().await;
        match value {
            Some(value) => {
                columns.insert(key, value.to_string());
            }
            None => {
                columns.remove(&key);
            }
        }
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        record: &RecordRef,
        name: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> AttacheResult<bool> {
        let key = Self::key(record, name)?;
        let mut columns = self.columns.write().await;
        if columns.get(&key).map(String::as_str) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                columns.insert(key, value.to_string());
            }
            None => {
                columns.remove(&key);
            }
        }
        Ok(true)
    }

    async fn remove(&self, record: &RecordRef) -> AttacheResult<()> {
        self.columns
            .write()
            .await
            .retain(|(owner, _), _| owner != record);
        Ok(())
    }
}

/// Record owning one or more attachments
pub trait Attachable: Send {
    fn record_ref(&self) -> RecordRef;

    fn attachers(&self) -> Vec<&Attacher>;

    fn attachers_mut(&mut self) -> Vec<&mut Attacher>;
}

/// Persist a record's attachments
///
/// Columns are written first, so assigned cached references are durable
/// before anything is promoted or deleted. Each attacher is then finalized,
/// changed columns are written again, and only then are superseded cache
/// entries removed. Failures to delete replaced files are logged and do not
/// fail the save.
#[instrument(skip_all, fields(record = %record.record_ref()))]
pub async fn save<R: Attachable>(store: &dyn ColumnStore, record: &mut R) -> AttacheResult<()> {
    for attacher in record.attachers() {
        store
            .write(attacher.record(), attacher.name(), attacher.column_data())
            .await?;
    }

    let mut first_error = None;
    for attacher in record.attachers_mut() {
        let before = attacher.column_data().map(str::to_string);

        match attacher.finalize().await {
            Ok(()) => {}
            Err(e) if e.is_orphan() => {
                warn!(name = %attacher.name(), error = %e, "Replaced file was not deleted");
            }
            Err(e) => {
                warn!(name = %attacher.name(), error = %e, "Failed to finalize attachment");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        if attacher.column_data() != before.as_deref() {
            store
                .write(attacher.record(), attacher.name(), attacher.column_data())
                .await?;
            if let Err(e) = attacher.cleanup().await {
                warn!(name = %attacher.name(), error = %e, "Failed to delete promoted cache entry");
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            info!("Attachments saved");
            Ok(())
        }
    }
}

/// Remove a record's columns and delete its attached files
#[instrument(skip_all, fields(record = %record.record_ref()))]
pub async fn destroy<R: Attachable>(store: &dyn ColumnStore, record: &mut R) -> AttacheResult<()> {
    store.remove(&record.record_ref()).await?;

    let mut first_error = None;
    for attacher in record.attachers_mut() {
        if let Err(e) = attacher.destroy().await {
            warn!(name = %attacher.name(), error = %e, "Failed to delete attached file");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}

/// Load an attacher from its persisted column
pub async fn load_attacher(
    store: &dyn ColumnStore,
    uploader: &crate::uploader::Uploader,
    record: RecordRef,
    name: &str,
) -> AttacheResult<Attacher> {
    let column = store.read(&record, name).await?;
    Attacher::from_column(uploader.clone(), record, name, column.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::AttachmentData;
    use crate::testing::counting_uploader;
    use crate::uploader::Uploader;
    use attache_storage::BytesIo;

    struct Photo {
        id: u64,
        image: Attacher,
    }

    impl Photo {
        fn new(uploader: &Uploader, id: u64) -> Self {
            Self {
                id,
                image: uploader.attacher(RecordRef::new("Photo", id), "image"),
            }
        }
    }

    impl Attachable for Photo {
        fn record_ref(&self) -> RecordRef {
            RecordRef::new("Photo", self.id)
        }

        fn attachers(&self) -> Vec<&Attacher> {
            vec![&self.image]
        }

        fn attachers_mut(&mut self) -> Vec<&mut Attacher> {
            vec![&mut self.image]
        }
    }

    #[tokio::test]
    async fn test_memory_column_store() {
        let store = MemoryColumnStore::new();
        let record = RecordRef::new("Photo", 1);

        assert_eq!(store.read(&record, "image").await.unwrap(), None);
        store.write(&record, "image", Some("a")).await.unwrap();
        assert!(!store
            .compare_and_swap(&record, "image", Some("b"), Some("c"))
            .await
            .unwrap());
        assert!(store
            .compare_and_swap(&record, "image", Some("a"), Some("c"))
            .await
            .unwrap());
        assert_eq!(store.read(&record, "image").await.unwrap().as_deref(), Some("c"));

        store.remove(&record).await.unwrap();
        assert_eq!(store.read(&record, "image").await.unwrap(), None);

        let unsaved = RecordRef::unsaved("Photo");
        assert!(matches!(
            store.write(&unsaved, "image", None).await,
            Err(AttacheError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_save_promotes_and_persists() {
        let (uploader, cache, store) = counting_uploader();
        let columns = MemoryColumnStore::new();
        let mut photo = Photo::new(&uploader, 1);

        photo.image.assign(BytesIo::new("hello text").with_filename("hello.txt")).await.unwrap();
        let cached_id = photo.image.file().unwrap().main_file().unwrap().id.clone();
        save(&columns, &mut photo).await.unwrap();

        let persisted = columns.read(&photo.record_ref(), "image").await.unwrap().unwrap();
        let data = AttachmentData::from_json(&persisted).unwrap();
        assert!(data.is_on("store"));
        assert_eq!(store.puts(), 1);
        assert_eq!(cache.deletes_of(&cached_id), 1);
        assert!(!photo.image.changed());
    }

    #[tokio::test]
    async fn test_save_replaces_and_tolerates_orphans() {
        let (uploader, _, store) = counting_uploader();
        let columns = MemoryColumnStore::new();
        let mut photo = Photo::new(&uploader, 1);

        photo.image.assign(BytesIo::new("first")).await.unwrap();
        save(&columns, &mut photo).await.unwrap();
        let first = photo.image.stored().unwrap().main_file().unwrap().id.clone();

        store.set_failing_deletes(true);
        photo.image.assign(BytesIo::new("second")).await.unwrap();
        save(&columns, &mut photo).await.unwrap();

        let persisted = columns.read(&photo.record_ref(), "image").await.unwrap().unwrap();
        let second = AttachmentData::from_json(&persisted).unwrap();
        assert_ne!(second.main_file().unwrap().id, first);
        assert_eq!(store.deletes_of(&first), 1);
    }

    #[tokio::test]
    async fn test_load_and_destroy() {
        let (uploader, _, store) = counting_uploader();
        let columns = MemoryColumnStore::new();
        let mut photo = Photo::new(&uploader, 7);
        photo.image.assign(BytesIo::new("data")).await.unwrap();
        save(&columns, &mut photo).await.unwrap();
        let id = photo.image.stored().unwrap().main_file().unwrap().id.clone();

        let loaded = load_attacher(&columns, &uploader, RecordRef::new("Photo", 7), "image")
            .await
            .unwrap();
        assert_eq!(loaded.file(), photo.image.file());

        let mut reloaded = Photo {
            id: 7,
            image: loaded,
        };
        destroy(&columns, &mut reloaded).await.unwrap();

        assert_eq!(store.deletes_of(&id), 1);
        assert_eq!(columns.read(&RecordRef::new("Photo", 7), "image").await.unwrap(), None);
    }
}
