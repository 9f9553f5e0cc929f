//! Storage collaborators: record store and blob store.
//!
//! The pipeline never talks to a database or object store directly. It
//! reads and writes records through [`RecordStore`] and file bytes through
//! [`BlobStore`], both assumed strongly consistent within one process.
//!
//! Two implementations ship with the crate:
//! - [`MemoryStore`] / [`MemoryBlobStore`] — in-memory; used by tests and the CLI.
//! - [`FsBlobStore`] — blobs as files under a root directory.

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::{MemoryBlobStore, MemoryStore};

use crate::error::StoreError;
use crate::model::{Document, Page, PageAnnotation};
use async_trait::async_trait;
use uuid::Uuid;

/// Record persistence keyed by document id and page number.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, StoreError>;

    async fn save_document(&self, doc: &Document) -> Result<(), StoreError>;

    async fn find_document_by_hash(&self, hash: &str) -> Result<Option<Document>, StoreError>;

    /// Every document; the reconciliation sweep filters by itself.
    async fn list_documents(&self) -> Result<Vec<Document>, StoreError>;

    async fn get_page(&self, document_id: Uuid, number: u32) -> Result<Option<Page>, StoreError>;

    /// Insert or replace the page identified by `(document_id, number)`.
    async fn upsert_page(&self, page: &Page) -> Result<(), StoreError>;

    /// Pages of a document ordered by number.
    async fn list_pages(&self, document_id: Uuid) -> Result<Vec<Page>, StoreError>;

    async fn count_pages(&self, document_id: Uuid, pending: bool) -> Result<u32, StoreError>;

    /// Ascending page numbers with the given pending flag.
    async fn list_page_numbers(&self, document_id: Uuid, pending: bool)
        -> Result<Vec<u32>, StoreError>;

    async fn get_annotation(&self, id: Uuid) -> Result<Option<PageAnnotation>, StoreError>;

    async fn save_annotation(&self, annotation: &PageAnnotation) -> Result<(), StoreError>;
}

/// Byte storage for PDFs and raster images.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Fails with [`StoreError::BlobNotFound`] for unknown keys.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}
