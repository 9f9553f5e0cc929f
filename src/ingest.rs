//! Upload entry point: deduplicate, store, create the record, enqueue.

use crate::dispatch::{EnqueueOptions, Task};
use crate::error::PipelineError;
use crate::model::Document;
use crate::orchestrator::Pipeline;
use sha2::{Digest, Sha256};
use tracing::info;

/// Result of [`Pipeline::ingest`].
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub document: Document,
    /// The bytes matched an existing document; nothing was stored or queued.
    pub duplicate: bool,
}

/// Lowercase hex SHA-256 of the uploaded bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl Pipeline {
    /// Store an uploaded PDF and schedule its processing.
    ///
    /// Bytes identical to an existing document return that document.
    /// The title starts as `filename`; [`Pipeline::process_document`]
    /// replaces it with the embedded title or the filename stem.
    pub async fn ingest(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        language: Option<String>,
    ) -> Result<IngestOutcome, PipelineError> {
        let hash = content_hash(&bytes);
        if let Some(existing) = self.records.find_document_by_hash(&hash).await? {
            info!(document_id = %existing.id, %filename, "Duplicate upload");
            return Ok(IngestOutcome {
                document: existing,
                duplicate: true,
            });
        }

        let mut doc = Document::new(filename);
        let key = Document::default_file_key(doc.id);
        doc.file_size = bytes.len() as u64;
        doc.content_hash = Some(hash);
        doc.language = language;
        self.blobs.put(&key, bytes).await?;
        doc.file_key = Some(key);
        self.records.save_document(&doc).await?;
        info!(document_id = %doc.id, %filename, bytes = doc.file_size, "Document uploaded");

        self.dispatcher
            .enqueue(
                Task::ProcessDocument { document_id: doc.id },
                EnqueueOptions::with_time_limit(self.config.job_time_limit()),
            )
            .await?;
        Ok(IngestOutcome {
            document: doc,
            duplicate: false,
        })
    }
}
