//! # edgequake-pdfindex
//!
//! Turn uploaded PDFs into browsable, searchable, annotatable documents.
//!
//! ## Why this crate?
//!
//! Real-world PDFs are damaged, encrypted or enormous, and the tools that
//! read them (pdftoppm, tesseract, ghostscript, qpdf) are slow and can hang.
//! This crate wraps each of them behind a bounded call and drives documents
//! through small, re-runnable tasks, so a crash or a redelivered task only
//! ever costs the page that was in flight.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Ingest   hash, dedupe, store bytes, enqueue ProcessDocument
//!  ├─ 2. Open     pdfium probe, bounded repair (gs / pdftocairo / qpdf)
//!  ├─ 3. Document page count, metadata, title, outline, tables
//!  ├─ 4. Pages    chunked: render → text (native, OCR fallback) → 4 sizes
//!  ├─ 5. Ready    every page done ⇒ pending=false
//!  └─ 6. Jobs     webp/jpeg variants, rotation, annotation crops
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdfindex::{
//!     LocalWorker, MemoryBlobStore, MemoryQueue, MemoryStore, Pipeline, PipelineConfig, RecordStore,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = Arc::new(MemoryQueue::new());
//!     let pipeline = Pipeline::builder()
//!         .config(PipelineConfig::default())
//!         .records(Arc::new(MemoryStore::new()))
//!         .blobs(Arc::new(MemoryBlobStore::new()))
//!         .dispatcher(queue.clone())
//!         .build()?;
//!
//!     let bytes = std::fs::read("document.pdf")?;
//!     let upload = pipeline.ingest(bytes, "document.pdf", None).await?;
//!     LocalWorker::new(&pipeline, &queue).run_until_idle().await;
//!
//!     let doc = pipeline.records().get_document(upload.document.id).await?;
//!     println!("{:?}", doc.map(|d| (d.title, d.num_pages, d.pending)));
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfindex` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdfindex = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod storage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{AltFormat, PipelineConfig, PipelineConfigBuilder, ToolCommand, ToolPaths};
pub use dispatch::{EnqueueOptions, LocalWorker, MemoryQueue, Task, TaskDispatcher, WorkerReport};
pub use error::{PageError, PipelineError, StoreError, ToolError};
pub use ingest::{content_hash, IngestOutcome};
pub use model::{
    Document, FormatMarker, Highlight, ImageSize, Page, PageAnnotation, PageImages, Rect,
};
pub use orchestrator::{ChunkReport, OpenedPdf, Pipeline, PipelineBuilder, QueueOutcome, ReconcileReport};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use storage::{BlobStore, FsBlobStore, MemoryBlobStore, MemoryStore, RecordStore};
