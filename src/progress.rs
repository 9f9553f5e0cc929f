//! Progress-callback trait for per-page processing events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::orchestrator::PipelineBuilder::progress_callback`] to receive
//! events as chunks run. Callers can forward them to a progress bar, a
//! websocket or a metrics sink without the library knowing how.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdfindex::PipelineProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use uuid::Uuid;
//!
//! struct Counter(AtomicUsize);
//!
//! impl PipelineProgressCallback for Counter {
//!     fn on_page_complete(&self, _doc: Uuid, page: u32, total: u32) {
//!         let done = self.0.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("page {page}/{total} ({done} this run)");
//!     }
//! }
//! ```

use std::sync::Arc;
use uuid::Uuid;

/// Called by the orchestrator as it processes pages.
///
/// All methods default to no-ops. Implementations must be `Send + Sync`:
/// chunks for different documents may run concurrently on a worker pool.
pub trait PipelineProgressCallback: Send + Sync {
    /// A document was opened and its page count is known.
    fn on_document_opened(&self, document_id: Uuid, total_pages: u32) {
        let _ = (document_id, total_pages);
    }

    /// A chunk is about to run over `pages`.
    fn on_chunk_start(&self, document_id: Uuid, pages: &[u32], total_pages: u32) {
        let _ = (document_id, pages, total_pages);
    }

    /// A page was rendered, extracted and stored.
    fn on_page_complete(&self, document_id: Uuid, page: u32, total_pages: u32) {
        let _ = (document_id, page, total_pages);
    }

    /// A page was already done and left untouched.
    fn on_page_skipped(&self, document_id: Uuid, page: u32) {
        let _ = (document_id, page);
    }

    /// A page failed; the rest of its chunk is abandoned.
    fn on_page_error(&self, document_id: Uuid, page: u32, error: &str) {
        let _ = (document_id, page, error);
    }

    /// Every page is done and the document is ready.
    fn on_document_ready(&self, document_id: Uuid, total_pages: u32) {
        let _ = (document_id, total_pages);
    }
}

/// A no-op implementation; the default when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias for the type held by [`crate::orchestrator::Pipeline`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
