//! In-memory record and blob stores.

use super::{BlobStore, RecordStore};
use crate::error::StoreError;
use crate::model::{Document, Page, PageAnnotation};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Records kept in ordered maps so page listings come back sorted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<Uuid, Document>>,
    pages: RwLock<BTreeMap<(Uuid, u32), Page>>,
    annotations: RwLock<HashMap<Uuid, PageAnnotation>>,
    writes: std::sync::atomic::AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of document/page/annotation writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, StoreError> {
        Ok(self.documents.read().await.get(&id).cloned())
    }

    async fn save_document(&self, doc: &Document) -> Result<(), StoreError> {
        self.record_write();
        self.documents.write().await.insert(doc.id, doc.clone());
        Ok(())
    }

    async fn find_document_by_hash(&self, hash: &str) -> Result<Option<Document>, StoreError> {
        Ok(self
            .documents
            .read()
            .await
            .values()
            .find(|d| d.content_hash.as_deref() == Some(hash))
            .cloned())
    }

    async fn list_documents(&self) -> Result<Vec<Document>, StoreError> {
        let mut docs: Vec<Document> = self.documents.read().await.values().cloned().collect();
        docs.sort_by_key(|d| d.created_at);
        Ok(docs)
    }

    async fn get_page(&self, document_id: Uuid, number: u32) -> Result<Option<Page>, StoreError> {
        Ok(self.pages.read().await.get(&(document_id, number)).cloned())
    }

    async fn upsert_page(&self, page: &Page) -> Result<(), StoreError> {
        self.record_write();
        self.pages
            .write()
            .await
            .insert((page.document_id, page.number), page.clone());
        Ok(())
    }

    async fn list_pages(&self, document_id: Uuid) -> Result<Vec<Page>, StoreError> {
        Ok(self
            .pages
            .read()
            .await
            .range((document_id, 0)..=(document_id, u32::MAX))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn count_pages(&self, document_id: Uuid, pending: bool) -> Result<u32, StoreError> {
        Ok(self.list_page_numbers(document_id, pending).await?.len() as u32)
    }

    async fn list_page_numbers(
        &self,
        document_id: Uuid,
        pending: bool,
    ) -> Result<Vec<u32>, StoreError> {
        Ok(self
            .pages
            .read()
            .await
            .range((document_id, 0)..=(document_id, u32::MAX))
            .filter(|(_, p)| p.pending == pending)
            .map(|((_, n), _)| *n)
            .collect())
    }

    async fn get_annotation(&self, id: Uuid) -> Result<Option<PageAnnotation>, StoreError> {
        Ok(self.annotations.read().await.get(&id).cloned())
    }

    async fn save_annotation(&self, annotation: &PageAnnotation) -> Result<(), StoreError> {
        self.record_write();
        self.annotations
            .write()
            .await
            .insert(annotation.id, annotation.clone());
        Ok(())
    }
}

/// Blobs held in a map; writes are counted so tests can assert no-op reruns.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
    puts: std::sync::atomic::AtomicU64,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_count(&self) -> u64 {
        self.puts.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.blobs.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.puts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.blobs.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::BlobNotFound {
                key: key.to_string(),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.blobs.read().await.contains_key(key))
    }
}
