//! Error types for the edgequake-pdfindex library.
//!
//! Four error types mirror the four places a failure can originate:
//!
//! * [`PipelineError`] — **Fatal** for the operation that returned it: the
//!   document cannot be opened, a tool is missing, a collaborator failed.
//!   Returned from every orchestrator and job entry point.
//!
//! * [`PageError`] — **Page-scoped**: one page of a chunk failed. Reported
//!   through the progress callback; the chunk aborts and the document stays
//!   pending so a later trigger resumes it.
//!
//! * [`ToolError`] — an external process (rasterizer, OCR engine, repair
//!   tool, table detector) did not produce usable output.
//!
//! * [`StoreError`] — the record store, blob store or task dispatcher
//!   rejected an operation.

use crate::pipeline::repair::RepairReason;
use std::path::PathBuf;
use thiserror::Error;

/// All document-level errors returned by the library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Document id is not present in the record store.
    #[error("Document {id} not found")]
    DocumentNotFound { id: uuid::Uuid },

    /// Page record is not present in the record store.
    #[error("Page {page} of document {id} not found")]
    PageNotFound { id: uuid::Uuid, page: u32 },

    /// Annotation id is not present in the record store.
    #[error("Annotation {id} not found")]
    AnnotationNotFound { id: uuid::Uuid },

    /// Document record has no stored PDF bytes attached.
    #[error("Document {id} has no stored file")]
    NoFile { id: uuid::Uuid },

    /// Requested page number is outside 1..=num_pages.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: u32, total: u32 },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// The repair budget ran out and the PDF still does not open.
    #[error("PDF repair error: '{path}' still unreadable after {attempts} repair attempts ({reason}): {detail}")]
    RepairExhausted {
        path: PathBuf,
        attempts: u32,
        reason: RepairReason,
        detail: String,
    },

    /// Every recovery strategy for a failure reason failed.
    #[error("PDF {reason} failed for '{path}': {source}")]
    RepairFailed {
        path: PathBuf,
        reason: RepairReason,
        #[source]
        source: ToolError,
    },

    /// The PDF engine rejected an operation on an already readable file.
    #[error("PDF engine error on '{path}': {detail}")]
    PdfEngine { path: PathBuf, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFINDEX_PDFIUM_LIB=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Page processing errors ────────────────────────────────────────────
    /// A page failed inside a chunk; the remaining pages were not attempted.
    #[error(transparent)]
    Page(#[from] PageError),

    /// Rotation angle is not a multiple of 90 degrees.
    #[error("Rotation angle must be a multiple of 90, got {0}")]
    InvalidAngle(i32),

    /// Annotation rectangle or highlight list cannot be applied.
    #[error("Invalid annotation: {0}")]
    InvalidAnnotation(String),

    /// Image decode or encode failed.
    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    // ── Collaborator errors ───────────────────────────────────────────────
    /// Record store, blob store or dispatcher failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// External process failure outside a page or repair context.
    #[error(transparent)]
    Tool(#[from] ToolError),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Scratch file or directory could not be created, written or read.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a later retry of the same work may succeed.
    ///
    /// Tool timeouts and I/O failures are transient; everything else needs an
    /// operator or a replaced input.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Page(e) => e.is_transient(),
            Self::Tool(e) => e.is_transient(),
            Self::RepairFailed { source, .. } => source.is_transient(),
            Self::Io { .. } => true,
            Self::Store(StoreError::Io(_)) => true,
            _ => false,
        }
    }
}

/// A failure scoped to a single page of a chunk.
#[derive(Debug, Error)]
pub enum PageError {
    /// The external rasterizer failed or timed out.
    #[error("Page {page}: rasterisation failed: {source}")]
    RenderFailed {
        page: u32,
        #[source]
        source: ToolError,
    },

    /// Neither native extraction nor OCR produced a result.
    #[error("Page {page}: text extraction failed: {detail}")]
    ExtractFailed { page: u32, detail: String },

    /// The rendered image could not be decoded or resized.
    #[error("Page {page}: image processing failed: {source}")]
    ImageFailed {
        page: u32,
        #[source]
        source: image::ImageError,
    },

    /// A store write for this page failed.
    #[error("Page {page}: storage failed: {source}")]
    StoreFailed {
        page: u32,
        #[source]
        source: StoreError,
    },
}

impl PageError {
    pub fn page(&self) -> u32 {
        match self {
            Self::RenderFailed { page, .. }
            | Self::ExtractFailed { page, .. }
            | Self::ImageFailed { page, .. }
            | Self::StoreFailed { page, .. } => *page,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::RenderFailed { source, .. } => source.is_transient(),
            Self::StoreFailed { source, .. } => matches!(source, StoreError::Io(_)),
            _ => false,
        }
    }
}

/// Failure of a bounded external-process invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The program is not installed or not on PATH.
    #[error("External tool '{program}' not found")]
    NotFound { program: String },

    /// The process ran past its timeout and was killed.
    #[error("External tool '{program}' timed out after {secs}s and was killed")]
    Timeout { program: String, secs: u64 },

    /// The process exited with a code outside the accepted set.
    #[error("External tool '{program}' exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The process succeeded but did not write its expected output file.
    #[error("External tool '{program}' produced no output at '{path}'")]
    MissingOutput { program: String, path: PathBuf },

    /// The tool's output could not be interpreted.
    #[error("External tool '{program}' produced unusable output: {detail}")]
    BadOutput { program: String, detail: String },

    /// Spawning or talking to the process failed.
    #[error("External tool '{program}' I/O error: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io { .. })
    }
}

/// Failure reported by a storage or dispatch collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No blob exists under the key.
    #[error("Blob '{key}' not found")]
    BlobNotFound { key: String },

    /// Backend rejected the operation.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// Task could not be enqueued.
    #[error("Task dispatch failed: {0}")]
    Dispatch(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repair_exhausted_display() {
        let e = PipelineError::RepairExhausted {
            path: PathBuf::from("/tmp/broken.pdf"),
            attempts: 2,
            reason: RepairReason::Rewrite,
            detail: "bad xref".into(),
        };
        let msg = e.to_string();
        assert!(msg.starts_with("PDF repair error"), "got: {msg}");
        assert!(msg.contains("2 repair attempts"), "got: {msg}");
        assert!(msg.contains("rewrite"), "got: {msg}");
    }

    #[test]
    fn tool_timeout_is_transient() {
        let e = ToolError::Timeout {
            program: "pdftoppm".into(),
            secs: 240,
        };
        assert!(e.is_transient());
        assert!(e.to_string().contains("240s"));

        let page = PageError::RenderFailed { page: 3, source: e };
        assert_eq!(page.page(), 3);
        assert!(PipelineError::from(page).is_transient());
    }

    #[test]
    fn tool_failure_is_fatal() {
        let e = ToolError::Failed {
            program: "qpdf".into(),
            code: Some(2),
            stderr: "invalid password".into(),
        };
        assert!(!e.is_transient());
        assert!(e.to_string().contains("invalid password"));
        assert!(!PipelineError::Tool(e).is_transient());
    }

    #[test]
    fn not_found_display() {
        let e = ToolError::NotFound {
            program: "tesseract".into(),
        };
        assert!(e.to_string().contains("tesseract"));
    }

    #[test]
    fn invalid_angle_display() {
        assert!(PipelineError::InvalidAngle(45).to_string().contains("45"));
    }
}
