//! Document processing orchestrator.
//!
//! [`Pipeline`] owns every collaborator and drives a document from
//! "uploaded" to "ready":
//!
//! ```text
//! ProcessDocument ──▶ queue_missing_pages ──▶ ProcessPages(chunk) ──┐
//!                          ▲                                        │
//!                          └──────────── pages still missing ◀──────┘
//!                          │
//!                          └──▶ ready ──▶ ConvertFormat (webp, …)
//! ```
//!
//! Every entry point re-reads storage before mutating it. Tasks may be
//! delivered more than once, run concurrently for the same document, or be
//! killed mid-chunk; the page-level `pending` flag is the only progress
//! record, so a later trigger always resumes exactly where work stopped.

use crate::config::{AltFormat, PipelineConfig};
use crate::dispatch::{EnqueueOptions, Task, TaskDispatcher};
use crate::error::{PageError, PipelineError, StoreError};
use crate::ingest::content_hash;
use crate::model::{
    alternate_key, Document, FormatMarker, ImageSize, Page, ERROR_KEY, REPAIR_ATTEMPTS_KEY,
    TABLES_KEY,
};
use crate::pipeline::extract::{
    extract_outline, extract_text, OcrEngine, OcrRaster, TesseractOcr, TextRequest,
};
use crate::pipeline::imaging;
use crate::pipeline::pdf::{blocking, PdfBackend, PdfiumBackend};
use crate::pipeline::render::{render_page, PdftoppmRasterizer, Rasterizer};
use crate::pipeline::repair::{open_readable, ReadablePdf, RepairPlan};
use crate::pipeline::tables::{CommandTableDetector, TableDetector};
use crate::pipeline::tools::scratch_dir;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::storage::{BlobStore, RecordStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What [`Pipeline::queue_missing_pages`] decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Every page is done; the document is (now) ready.
    Ready,
    /// A `ProcessPages` task was enqueued for these pages.
    Scheduled { pages: Vec<u32> },
    /// The document was never opened; a `ProcessDocument` task was enqueued.
    NeedsOpen,
}

/// Result of one [`Pipeline::process_pages`] chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    /// Pages rendered and stored by this chunk.
    pub processed: Vec<u32>,
    /// Pages found done when their turn came.
    pub skipped: Vec<u32>,
    pub outcome: QueueOutcome,
}

/// Result of a [`Pipeline::reconcile`] sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Stale pending documents that were re-triggered.
    pub retriggered: Vec<Uuid>,
    /// Stuck alternate-format markers that were reset and re-enqueued.
    pub reset_formats: Vec<(Uuid, AltFormat)>,
}

/// A stored PDF materialised on local disk and opened.
///
/// Both the downloaded copy and any repaired scratch copy live as long as
/// this value.
pub struct OpenedPdf {
    pub readable: ReadablePdf,
    /// Size of the bytes as stored, before any repair.
    pub stored_size: u64,
    /// Hex SHA-256 of the bytes as stored.
    pub stored_sha256: String,
    _local: TempDir,
}

impl OpenedPdf {
    pub fn path(&self) -> &Path {
        self.readable.path()
    }

    pub fn page_count(&self) -> u32 {
        self.readable.page_count()
    }
}

/// The orchestrator and its collaborators.
pub struct Pipeline {
    pub(crate) config: PipelineConfig,
    pub(crate) records: Arc<dyn RecordStore>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) dispatcher: Arc<dyn TaskDispatcher>,
    pub(crate) pdf: Arc<dyn PdfBackend>,
    pub(crate) rasterizer: Arc<dyn Rasterizer>,
    pub(crate) ocr: Arc<dyn OcrEngine>,
    pub(crate) tables: Option<Arc<dyn TableDetector>>,
    pub(crate) repair: RepairPlan,
    pub(crate) progress: ProgressCallback,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("repair", &self.repair)
            .field("tables", &self.tables.is_some())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Start a builder. Records, blobs and dispatcher are required; every
    /// engine defaults to the external tool named in the config.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    // ── Entry points ─────────────────────────────────────────────────────

    /// Open the stored PDF (repairing it if needed), record document-level
    /// facts, then schedule the missing pages.
    pub async fn process_document(&self, id: Uuid) -> Result<QueueOutcome, PipelineError> {
        let mut doc = self.load_document(id).await?;
        info!(document_id = %id, title = %doc.title, "Processing document");

        // ── Step 1: Materialise and open ─────────────────────────────────
        let opened = self.open_document(&doc).await?;
        let info = &opened.readable.info;
        doc.num_pages = info.page_count;
        doc.file_size = opened.stored_size;

        // ── Step 2: Persist repaired bytes ───────────────────────────────
        if opened.readable.was_repaired() {
            let key = doc.file_key.clone().ok_or(PipelineError::NoFile { id })?;
            let bytes = tokio::fs::read(opened.path())
                .await
                .map_err(|e| PipelineError::io(opened.path(), e))?;
            doc.file_size = bytes.len() as u64;
            self.blobs.put(&key, bytes).await?;
            doc.properties.insert(
                REPAIR_ATTEMPTS_KEY.to_string(),
                Value::from(opened.readable.repair_attempts),
            );
            info!(
                document_id = %id,
                attempts = opened.readable.repair_attempts,
                "Stored repaired PDF"
            );
        }

        // ── Step 3: Metadata and title ───────────────────────────────────
        doc.properties.extend(info.metadata.to_properties());
        doc.apply_extracted_title(info.metadata.title.as_deref());

        // ── Step 4: Outline ──────────────────────────────────────────────
        if doc.outline.is_empty() {
            match extract_outline(Arc::clone(&self.pdf), opened.path()).await {
                Ok(outline) => doc.outline = outline,
                Err(e) => warn!(document_id = %id, error = %e, "Outline extraction failed"),
            }
        }

        // ── Step 5: Tables ───────────────────────────────────────────────
        if self.config.detect_tables {
            let tables = self.detect_tables_value(opened.path()).await;
            doc.properties.insert(TABLES_KEY.to_string(), tables);
        }

        doc.properties.remove(ERROR_KEY);
        doc.touch();
        self.records.save_document(&doc).await?;
        self.progress.on_document_opened(id, doc.num_pages);
        info!(document_id = %id, pages = doc.num_pages, "Document opened");

        self.queue_missing_pages(id).await
    }

    /// Mark the document ready if every page is done, otherwise enqueue one
    /// `ProcessPages` task for the missing pages.
    pub async fn queue_missing_pages(&self, id: Uuid) -> Result<QueueOutcome, PipelineError> {
        let doc = self.load_document(id).await?;
        if doc.num_pages == 0 {
            debug!(document_id = %id, "Document not opened yet, scheduling open");
            self.dispatcher
                .enqueue(
                    Task::ProcessDocument { document_id: id },
                    EnqueueOptions::with_time_limit(self.config.job_time_limit()),
                )
                .await?;
            return Ok(QueueOutcome::NeedsOpen);
        }

        let missing = self.missing_pages(&doc).await?;
        if missing.is_empty() {
            self.mark_ready(doc).await?;
            return Ok(QueueOutcome::Ready);
        }

        let pages: Vec<u32> = missing.into_iter().collect();
        let chunk = pages.len().min(self.config.chunk_limit);
        debug!(document_id = %id, missing = pages.len(), chunk, "Scheduling missing pages");
        self.dispatcher
            .enqueue(
                Task::ProcessPages {
                    document_id: id,
                    page_numbers: pages.clone(),
                    chunk_limit: self.config.chunk_limit,
                },
                EnqueueOptions::with_time_limit(self.config.chunk_time_limit(chunk)),
            )
            .await?;
        Ok(QueueOutcome::Scheduled { pages })
    }

    /// Render and extract up to `chunk_limit` of the still-missing pages in
    /// `page_numbers`, then either finish the document or re-queue.
    ///
    /// A page failure aborts the rest of the chunk. Pages completed before
    /// the failure stay done; the document stays pending.
    pub async fn process_pages(
        &self,
        id: Uuid,
        page_numbers: &[u32],
        chunk_limit: usize,
    ) -> Result<ChunkReport, PipelineError> {
        let doc = self.load_document(id).await?;
        let missing = self.missing_pages(&doc).await?;
        let requested: BTreeSet<u32> = page_numbers.iter().copied().collect();
        let selected: Vec<u32> = requested
            .intersection(&missing)
            .copied()
            .take(chunk_limit.max(1))
            .collect();

        let mut report = ChunkReport {
            processed: Vec::new(),
            skipped: requested.difference(&missing).copied().collect(),
            outcome: QueueOutcome::Ready,
        };

        if !selected.is_empty() {
            let opened = self.open_document(&doc).await?;
            let total = opened.page_count();
            self.progress.on_chunk_start(id, &selected, total);
            info!(document_id = %id, pages = ?selected, "Processing chunk");

            for &number in &selected {
                match self.process_page(&doc, &opened, number).await {
                    Ok(true) => {
                        report.processed.push(number);
                        self.progress.on_page_complete(id, number, total);
                    }
                    Ok(false) => {
                        report.skipped.push(number);
                        self.progress.on_page_skipped(id, number);
                    }
                    Err(e) => {
                        error!(document_id = %id, page = number, error = %e, "Page failed, aborting chunk");
                        self.progress.on_page_error(id, number, &e.to_string());
                        return Err(e);
                    }
                }
            }
        }

        // ── Finish or re-queue ───────────────────────────────────────────
        let done = self.records.count_pages(id, false).await?;
        report.outcome = if done >= doc.num_pages && doc.num_pages > 0 {
            self.mark_ready(self.load_document(id).await?).await?;
            QueueOutcome::Ready
        } else {
            self.queue_missing_pages(id).await?
        };
        Ok(report)
    }

    /// Clear every page and format marker and run the document again.
    ///
    /// Pages flagged `corrected` keep their content.
    pub async fn reprocess(&self, id: Uuid) -> Result<(), PipelineError> {
        let mut doc = self.load_document(id).await?;
        for mut page in self.records.list_pages(id).await? {
            if !page.pending {
                page.pending = true;
                self.records.upsert_page(&page).await?;
            }
        }
        for format in self.config.alternate_formats.iter().copied() {
            doc.set_format_marker(format, FormatMarker::Unset);
        }
        doc.pending = true;
        doc.touch();
        self.records.save_document(&doc).await?;
        info!(document_id = %id, "Document queued for reprocessing");
        self.dispatcher
            .enqueue(
                Task::ProcessDocument { document_id: id },
                EnqueueOptions::with_time_limit(self.config.job_time_limit()),
            )
            .await?;
        Ok(())
    }

    /// Re-trigger documents whose tasks were lost.
    ///
    /// A pending document untouched for `stale_pending_secs` is resumed; an
    /// alternate format stuck in progress for `stale_format_secs` is reset and
    /// converted again. Run this periodically.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport, PipelineError> {
        let stale_pending = ChronoDuration::seconds(self.config.stale_pending_secs as i64);
        let stale_format = ChronoDuration::seconds(self.config.stale_format_secs as i64);
        let mut report = ReconcileReport::default();

        for mut doc in self.records.list_documents().await? {
            if doc.pending {
                if now - doc.updated_at < stale_pending {
                    continue;
                }
                warn!(document_id = %doc.id, updated_at = %doc.updated_at, "Re-triggering stale document");
                doc.updated_at = now;
                self.records.save_document(&doc).await?;
                self.queue_missing_pages(doc.id).await?;
                report.retriggered.push(doc.id);
                continue;
            }

            for format in self.config.alternate_formats.iter().copied() {
                if doc.format_marker(format) != FormatMarker::InProgress {
                    continue;
                }
                let stuck = match doc.format_started_at(format) {
                    Some(started) => now - started >= stale_format,
                    None => now - doc.updated_at >= stale_format,
                };
                if !stuck {
                    continue;
                }
                warn!(document_id = %doc.id, %format, "Resetting stuck format conversion");
                doc.set_format_marker(format, FormatMarker::Unset);
                doc.updated_at = now;
                self.records.save_document(&doc).await?;
                self.enqueue_conversion(doc.id, format, None).await?;
                report.reset_formats.push((doc.id, format));
            }
        }

        if !report.retriggered.is_empty() || !report.reset_formats.is_empty() {
            info!(
                retriggered = report.retriggered.len(),
                reset_formats = report.reset_formats.len(),
                "Reconciliation sweep finished"
            );
        }
        Ok(report)
    }

    /// Execute one dispatched task.
    ///
    /// Permanent failures are recorded under `_error` on the document.
    pub async fn run_task(&self, task: Task) -> Result<(), PipelineError> {
        let id = task.document_id();
        let name = task.name();
        debug!(task = name, document_id = %id, "Running task");
        let result = match task {
            Task::ProcessDocument { document_id } => {
                self.process_document(document_id).await.map(|_| ())
            }
            Task::ProcessPages {
                document_id,
                page_numbers,
                chunk_limit,
            } => self
                .process_pages(document_id, &page_numbers, chunk_limit)
                .await
                .map(|_| ()),
            Task::ConvertFormat {
                document_id,
                format,
                page_numbers,
            } => {
                self.convert_format(document_id, format, page_numbers.as_deref())
                    .await
            }
            Task::RotatePages {
                document_id,
                page_numbers,
                angle,
            } => self.rotate_pages(document_id, &page_numbers, angle).await,
            Task::DetectTables { document_id } => self.detect_tables(document_id).await,
        };

        if let Err(e) = &result {
            error!(task = name, document_id = %id, error = %e, "Task failed");
            if !e.is_transient() {
                self.record_failure(id, e).await;
            }
        }
        result
    }

    // ── Page work ────────────────────────────────────────────────────────

    /// Process one page. Returns `false` when the page turned out done.
    async fn process_page(
        &self,
        doc: &Document,
        opened: &OpenedPdf,
        number: u32,
    ) -> Result<bool, PipelineError> {
        if self.page_is_done(doc.id, number).await? {
            return Ok(false);
        }

        let rendered = render_page(
            &opened.readable,
            number,
            self.rasterizer.as_ref(),
            self.config.max_dpi,
            self.config.max_long_edge_px,
        )
        .await?;

        // The chunk may have raced with another worker; check again.
        let Some(mut page) = self.pending_page(doc.id, number).await? else {
            return Ok(false);
        };

        if !page.corrected {
            page.content = extract_text(
                Arc::clone(&self.pdf),
                self.ocr.as_ref(),
                TextRequest {
                    pdf: &opened.readable,
                    page: number,
                    rendered: Some(&rendered),
                    raster: OcrRaster {
                        rasterizer: self.rasterizer.as_ref(),
                        max_dpi: self.config.max_dpi,
                        max_long_edge_px: self.config.max_long_edge_px,
                    },
                    use_ocr: self.config.ocr_enabled,
                    ocr_language: self.config.ocr_language(doc.language.as_deref()),
                },
            )
            .await?;
        }

        let png = rendered.read_bytes().await?;
        let (width, height, images) = blocking(move || {
            let img = imaging::decode(&png)
                .map_err(|source| PageError::ImageFailed { page: number, source })?;
            let variants = imaging::scaled_variants(&img)
                .map_err(|source| PageError::ImageFailed { page: number, source })?;
            let mut images = vec![(ImageSize::Original, png)];
            images.extend(variants);
            Ok((img.width(), img.height(), images))
        })
        .await?;

        self.store_page_images(&mut page, images).await?;

        page.width = Some(width);
        page.height = Some(height);
        page.pending = false;
        self.records
            .upsert_page(&page)
            .await
            .map_err(|source| PageError::StoreFailed { page: number, source })?;
        debug!(document_id = %doc.id, page = number, width, height, "Page stored");
        Ok(true)
    }

    /// Replace each size's image. Derived alternate encodings of the old
    /// object are deleted before the new one is written; an old object under
    /// a different key is deleted too.
    pub(crate) async fn store_page_images(
        &self,
        page: &mut Page,
        images: Vec<(ImageSize, Vec<u8>)>,
    ) -> Result<(), PipelineError> {
        let number = page.number;
        let store_err = |source: StoreError| PageError::StoreFailed { page: number, source };
        for (size, bytes) in images {
            let key = page.image_key(size);
            if let Some(old) = page.images.get(size).map(str::to_string) {
                // Same key: the put below replaces it in one step.
                if old != key {
                    self.blobs.delete(&old).await.map_err(store_err)?;
                }
                for format in self.config.alternate_formats.iter().copied() {
                    self.blobs
                        .delete(&alternate_key(&old, format))
                        .await
                        .map_err(store_err)?;
                }
            }
            self.blobs.put(&key, bytes).await.map_err(store_err)?;
            page.images.set(size, Some(key));
        }
        Ok(())
    }

    async fn page_is_done(&self, id: Uuid, number: u32) -> Result<bool, PipelineError> {
        Ok(self
            .records
            .get_page(id, number)
            .await?
            .is_some_and(|p| !p.pending))
    }

    /// The current page record if it still needs work, or a fresh one.
    async fn pending_page(&self, id: Uuid, number: u32) -> Result<Option<Page>, PipelineError> {
        match self.records.get_page(id, number).await? {
            Some(page) if !page.pending => Ok(None),
            Some(page) => Ok(Some(page)),
            None => Ok(Some(Page::new(id, number))),
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    pub(crate) async fn load_document(&self, id: Uuid) -> Result<Document, PipelineError> {
        self.records
            .get_document(id)
            .await?
            .ok_or(PipelineError::DocumentNotFound { id })
    }

    /// Page numbers in `1..=num_pages` without a done page record.
    async fn missing_pages(&self, doc: &Document) -> Result<BTreeSet<u32>, PipelineError> {
        let done: BTreeSet<u32> = self
            .records
            .list_page_numbers(doc.id, false)
            .await?
            .into_iter()
            .collect();
        Ok((1..=doc.num_pages).filter(|n| !done.contains(n)).collect())
    }

    /// Download the stored PDF to scratch space and open it.
    pub(crate) async fn open_document(&self, doc: &Document) -> Result<OpenedPdf, PipelineError> {
        let key = doc.file_key.as_deref().ok_or(PipelineError::NoFile { id: doc.id })?;
        let bytes = self.blobs.get(key).await?;
        let stored_size = bytes.len() as u64;
        let stored_sha256 = content_hash(&bytes);

        let local = scratch_dir("pdfindex-doc-")?;
        let path = local.path().join("document.pdf");
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PipelineError::io(&path, e))?;

        let readable = open_readable(Arc::clone(&self.pdf), &self.repair, &path).await?;
        Ok(OpenedPdf {
            readable,
            stored_size,
            stored_sha256,
            _local: local,
        })
    }

    /// `_tables` value: the detector's array, `[]` on failure, `null` when
    /// no detector is configured.
    pub(crate) async fn detect_tables_value(&self, pdf: &Path) -> Value {
        let Some(detector) = &self.tables else {
            return Value::Null;
        };
        match detector.detect(pdf).await {
            Ok(tables) => {
                debug!(tables = tables.len(), "Tables detected");
                Value::Array(tables)
            }
            Err(e) => {
                warn!(error = %e, "Table detection failed, recording no tables");
                Value::Array(Vec::new())
            }
        }
    }

    /// Flip a pending document to ready and schedule alternate formats.
    ///
    /// A document that is already ready is left untouched.
    async fn mark_ready(&self, mut doc: Document) -> Result<(), PipelineError> {
        if !doc.pending {
            return Ok(());
        }
        doc.pending = false;
        doc.properties.remove(ERROR_KEY);
        doc.touch();
        self.records.save_document(&doc).await?;
        self.progress.on_document_ready(doc.id, doc.num_pages);
        info!(document_id = %doc.id, pages = doc.num_pages, "Document ready");

        for format in self.config.alternate_formats.iter().copied() {
            if doc.format_marker(format) == FormatMarker::Unset {
                self.enqueue_conversion(doc.id, format, None).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn enqueue_conversion(
        &self,
        id: Uuid,
        format: AltFormat,
        pages: Option<Vec<u32>>,
    ) -> Result<(), PipelineError> {
        self.dispatcher
            .enqueue(
                Task::ConvertFormat {
                    document_id: id,
                    format,
                    page_numbers: pages,
                },
                EnqueueOptions::with_time_limit(self.config.job_time_limit()),
            )
            .await?;
        Ok(())
    }

    /// Store the error text on the document; failures here are only logged.
    async fn record_failure(&self, id: Uuid, err: &PipelineError) {
        let doc = match self.records.get_document(id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return,
            Err(e) => {
                warn!(document_id = %id, error = %e, "Could not load document to record failure");
                return;
            }
        };
        let mut doc = doc;
        doc.properties
            .insert(ERROR_KEY.to_string(), Value::String(err.to_string()));
        doc.touch();
        if let Err(e) = self.records.save_document(&doc).await {
            warn!(document_id = %id, error = %e, "Could not record failure");
        }
    }
}

// ── Builder ──────────────────────────────────────────────────────────────

/// Builder for [`Pipeline`].
///
/// # Example
/// ```rust,no_run
/// use edgequake_pdfindex::{MemoryBlobStore, MemoryQueue, MemoryStore, Pipeline, PipelineConfig};
/// use std::sync::Arc;
///
/// let pipeline = Pipeline::builder()
///     .config(PipelineConfig::default())
///     .records(Arc::new(MemoryStore::new()))
///     .blobs(Arc::new(MemoryBlobStore::new()))
///     .dispatcher(Arc::new(MemoryQueue::new()))
///     .build()
///     .unwrap();
/// ```
#[derive(Default)]
pub struct PipelineBuilder {
    config: Option<PipelineConfig>,
    records: Option<Arc<dyn RecordStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    pdf: Option<Arc<dyn PdfBackend>>,
    rasterizer: Option<Arc<dyn Rasterizer>>,
    ocr: Option<Arc<dyn OcrEngine>>,
    tables: Option<Option<Arc<dyn TableDetector>>>,
    repair: Option<RepairPlan>,
    progress: Option<ProgressCallback>,
}

impl PipelineBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Override the PDF engine (default: pdfium).
    pub fn pdf_backend(mut self, backend: Arc<dyn PdfBackend>) -> Self {
        self.pdf = Some(backend);
        self
    }

    /// Override the rasterizer (default: pdftoppm).
    pub fn rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    /// Override the OCR engine (default: tesseract).
    pub fn ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    /// Override the table detector. `None` records tables as unavailable.
    pub fn table_detector(mut self, detector: Option<Arc<dyn TableDetector>>) -> Self {
        self.tables = Some(detector);
        self
    }

    /// Override the repair strategy table (default: gs, pdftocairo, qpdf).
    pub fn repair_plan(mut self, plan: RepairPlan) -> Self {
        self.repair = Some(plan);
        self
    }

    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let config = self.config.unwrap_or_default();
        let missing = |what: &str| PipelineError::InvalidConfig(format!("{what} is required"));

        let tables = self.tables.unwrap_or_else(|| {
            config.table_detector.clone().map(|command| {
                Arc::new(CommandTableDetector::new(command, config.page_timeout()))
                    as Arc<dyn TableDetector>
            })
        });

        Ok(Pipeline {
            records: self.records.ok_or_else(|| missing("record store"))?,
            blobs: self.blobs.ok_or_else(|| missing("blob store"))?,
            dispatcher: self.dispatcher.ok_or_else(|| missing("task dispatcher"))?,
            pdf: self
                .pdf
                .unwrap_or_else(|| Arc::new(PdfiumBackend::new(config.pdfium_library_path.clone()))),
            rasterizer: self.rasterizer.unwrap_or_else(|| {
                Arc::new(PdftoppmRasterizer::new(
                    &config.tools.rasterizer,
                    config.page_timeout(),
                ))
            }),
            ocr: self.ocr.unwrap_or_else(|| {
                Arc::new(TesseractOcr::new(
                    &config.tools.ocr,
                    config.tessdata_dir.clone(),
                    config.ocr_timeout(),
                ))
            }),
            tables,
            repair: self.repair.unwrap_or_else(|| RepairPlan::from_config(&config)),
            progress: self
                .progress
                .unwrap_or_else(|| Arc::new(NoopProgressCallback)),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MemoryQueue;
    use crate::storage::{MemoryBlobStore, MemoryStore};

    #[test]
    fn build_requires_stores() {
        let err = Pipeline::builder().build().unwrap_err();
        assert!(err.to_string().contains("record store"));

        let err = Pipeline::builder()
            .records(Arc::new(MemoryStore::new()))
            .blobs(Arc::new(MemoryBlobStore::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("task dispatcher"));
    }

    #[test]
    fn build_uses_config_defaults() {
        let pipeline = Pipeline::builder()
            .records(Arc::new(MemoryStore::new()))
            .blobs(Arc::new(MemoryBlobStore::new()))
            .dispatcher(Arc::new(MemoryQueue::new()))
            .build()
            .unwrap();
        assert_eq!(pipeline.config().chunk_limit, 10);
        assert!(pipeline.tables.is_none());
        assert_eq!(pipeline.repair.rewrite.len(), 2);
    }

    #[tokio::test]
    async fn missing_document_is_reported() {
        let pipeline = Pipeline::builder()
            .records(Arc::new(MemoryStore::new()))
            .blobs(Arc::new(MemoryBlobStore::new()))
            .dispatcher(Arc::new(MemoryQueue::new()))
            .build()
            .unwrap();
        let id = Uuid::new_v4();
        let err = pipeline.queue_missing_pages(id).await.unwrap_err();
        assert!(matches!(err, PipelineError::DocumentNotFound { id: got } if got == id));
    }

    #[tokio::test]
    async fn unopened_document_schedules_open() {
        let records = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let pipeline = Pipeline::builder()
            .records(records.clone())
            .blobs(Arc::new(MemoryBlobStore::new()))
            .dispatcher(queue.clone())
            .build()
            .unwrap();
        let doc = Document::new("scan.pdf");
        records.save_document(&doc).await.unwrap();

        let outcome = pipeline.queue_missing_pages(doc.id).await.unwrap();
        assert_eq!(outcome, QueueOutcome::NeedsOpen);
        assert_eq!(
            queue.pending_tasks().await,
            vec![Task::ProcessDocument { document_id: doc.id }]
        );
    }
}
