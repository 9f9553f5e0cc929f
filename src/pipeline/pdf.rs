//! PDF engine seam: structural open, metadata, native text, bookmarks, rotation.
//!
//! [`PdfBackend`] is synchronous on purpose. pdfium keeps thread-local state
//! and must not run on Tokio worker threads, so callers go through
//! [`blocking`], which moves the call onto the blocking pool.
//!
//! [`PdfiumBackend`] binds pdfium per call, trying an explicit library path,
//! then `./`, then the system library.

use crate::error::PipelineError;
use crate::model::strip_nul;
use crate::pipeline::repair::RepairReason;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Deepest bookmark nesting followed; deeper levels are cut.
const MAX_OUTLINE_DEPTH: usize = 32;
/// Total bookmarks visited; guards against sibling cycles in broken files.
const MAX_OUTLINE_NODES: usize = 20_000;

// ── Types ────────────────────────────────────────────────────────────────

/// Document information fields, NUL-stripped, empty values dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub subject: Option<String>,
}

impl PdfMetadata {
    /// Entries to merge into `Document::properties`.
    pub fn to_properties(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let fields = [
            ("title", &self.title),
            ("author", &self.author),
            ("creator", &self.creator),
            ("producer", &self.producer),
            ("subject", &self.subject),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                map.insert(key.to_string(), Value::String(v.clone()));
            }
        }
        map
    }
}

/// Physical crop-box size of a page in points (1/72 inch).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width_pt: f32,
    pub height_pt: f32,
}

/// Everything learned from a successful structural open.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfInfo {
    pub page_count: u32,
    pub metadata: PdfMetadata,
    /// Indexed by `page_number - 1`.
    pub page_sizes: Vec<PageSize>,
}

impl PdfInfo {
    pub fn page_size(&self, number: u32) -> Option<PageSize> {
        number
            .checked_sub(1)
            .and_then(|i| self.page_sizes.get(i as usize))
            .copied()
    }
}

/// One bookmark; `page` is `None` when the destination does not resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineNode {
    pub title: String,
    /// 1-based page number.
    pub page: Option<u32>,
    pub children: Vec<OutlineNode>,
}

/// Why a structural open failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenFailure {
    /// The file is damaged or locked in a way an external tool may fix.
    Damaged { reason: RepairReason, detail: String },
    /// The engine itself is unusable; repairing the file cannot help.
    Engine(String),
}

/// Synchronous PDF engine operations. Call through [`blocking`].
pub trait PdfBackend: Send + Sync + 'static {
    /// Open structurally: readable, not encrypted, page count retrievable.
    fn open(&self, path: &Path) -> Result<PdfInfo, OpenFailure>;

    /// Native text of a 1-based page, NUL-stripped, untrimmed.
    fn page_text(&self, path: &Path, page: u32) -> Result<String, PipelineError>;

    /// Bookmark tree in document order.
    fn outline(&self, path: &Path) -> Result<Vec<OutlineNode>, PipelineError>;

    /// Rotate the given 1-based pages by `angle` (multiple of 90) relative to
    /// their current rotation and rewrite the file in place.
    fn rotate_pages(&self, path: &Path, pages: &[u32], angle: i32) -> Result<(), PipelineError>;
}

/// Run a blocking engine call on the blocking pool.
pub async fn blocking<T, F>(f: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Internal(format!("PDF engine task panicked: {e}")))?
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// [`PdfBackend`] over pdfium-render.
#[derive(Debug, Clone, Default)]
pub struct PdfiumBackend {
    library_path: Option<PathBuf>,
}

impl PdfiumBackend {
    /// `library_path` may name the shared library or the directory holding it.
    pub fn new(library_path: Option<PathBuf>) -> Self {
        Self { library_path }
    }

    fn bind(&self) -> Result<Pdfium, PipelineError> {
        let bindings = match &self.library_path {
            Some(p) if p.is_dir() => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(p))
            }
            Some(p) => Pdfium::bind_to_library(p),
            None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                .or_else(|_| Pdfium::bind_to_system_library()),
        }
        .map_err(|e| PipelineError::PdfiumBindingFailed(format!("{e:?}")))?;
        Ok(Pdfium::new(bindings))
    }

    fn engine_error(path: &Path, e: impl std::fmt::Debug) -> PipelineError {
        PipelineError::PdfEngine {
            path: path.to_path_buf(),
            detail: format!("{e:?}"),
        }
    }
}

impl PdfBackend for PdfiumBackend {
    fn open(&self, path: &Path) -> Result<PdfInfo, OpenFailure> {
        let pdfium = self.bind().map_err(|e| OpenFailure::Engine(e.to_string()))?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(classify_load_error)?;

        if is_encrypted(&document) {
            return Err(OpenFailure::Damaged {
                reason: RepairReason::Decrypt,
                detail: "document is encrypted".into(),
            });
        }

        let pages = document.pages();
        let count = pages.len();
        if count == 0 {
            return Err(OpenFailure::Damaged {
                reason: RepairReason::Rewrite,
                detail: "page tree is empty or unreadable".into(),
            });
        }

        let mut page_sizes = Vec::with_capacity(count as usize);
        for index in 0..count {
            let page = pages.get(index).map_err(|e| OpenFailure::Damaged {
                reason: RepairReason::Rewrite,
                detail: format!("page {} unreadable: {e:?}", index + 1),
            })?;
            page_sizes.push(crop_box_size(&page));
        }

        let metadata = read_metadata(&document);
        info!(path = %path.display(), pages = count, "PDF opened");
        Ok(PdfInfo {
            page_count: u32::from(count),
            metadata,
            page_sizes,
        })
    }

    fn page_text(&self, path: &Path, page: u32) -> Result<String, PipelineError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| Self::engine_error(path, e))?;
        let index = page_index(page)?;
        let pdf_page = document
            .pages()
            .get(index)
            .map_err(|e| Self::engine_error(path, e))?;
        let text = pdf_page.text().map_err(|e| Self::engine_error(path, e))?;
        Ok(strip_nul(&text.all()))
    }

    fn outline(&self, path: &Path) -> Result<Vec<OutlineNode>, PipelineError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| Self::engine_error(path, e))?;
        let mut visited = 0usize;
        let nodes = match document.bookmarks().root() {
            Some(first) => collect_siblings(first, 0, &mut visited),
            None => Vec::new(),
        };
        debug!(path = %path.display(), bookmarks = visited, "Outline read");
        Ok(nodes)
    }

    fn rotate_pages(&self, path: &Path, pages: &[u32], angle: i32) -> Result<(), PipelineError> {
        if angle % 90 != 0 {
            return Err(PipelineError::InvalidAngle(angle));
        }
        let pdfium = self.bind()?;
        let bytes = {
            let document = pdfium
                .load_pdf_from_file(path, None)
                .map_err(|e| Self::engine_error(path, e))?;
            let total = u32::from(document.pages().len());
            for &number in pages {
                if number == 0 || number > total {
                    return Err(PipelineError::PageOutOfRange {
                        page: number,
                        total,
                    });
                }
                let mut page = document
                    .pages()
                    .get(page_index(number)?)
                    .map_err(|e| Self::engine_error(path, e))?;
                let current = page.rotation().map(rotation_degrees).unwrap_or(0);
                page.set_rotation(rotation_from_degrees(current + angle));
            }
            // Saving over the file pdfium is still reading from corrupts it.
            document
                .save_to_bytes()
                .map_err(|e| Self::engine_error(path, e))?
        };
        std::fs::write(path, bytes).map_err(|e| PipelineError::io(path, e))?;
        info!(path = %path.display(), pages = ?pages, angle, "Rotated PDF pages");
        Ok(())
    }
}

fn classify_load_error(e: PdfiumError) -> OpenFailure {
    match e {
        PdfiumError::PdfiumLibraryInternalError(
            PdfiumInternalError::PasswordError | PdfiumInternalError::SecurityError,
        ) => OpenFailure::Damaged {
            reason: RepairReason::Decrypt,
            detail: format!("{e:?}"),
        },
        PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::FileError) => {
            OpenFailure::Engine(format!("file could not be read: {e:?}"))
        }
        other => OpenFailure::Damaged {
            reason: RepairReason::Rewrite,
            detail: format!("{other:?}"),
        },
    }
}

fn is_encrypted(document: &PdfDocument) -> bool {
    !matches!(
        document.permissions().security_handler_revision(),
        Ok(PdfSecurityHandlerRevision::Unprotected) | Err(_)
    )
}

fn crop_box_size(page: &PdfPage) -> PageSize {
    match page.boundaries().crop() {
        Ok(boundary) => PageSize {
            width_pt: boundary.bounds.width().value,
            height_pt: boundary.bounds.height().value,
        },
        Err(_) => PageSize {
            width_pt: page.width().value,
            height_pt: page.height().value,
        },
    }
}

fn read_metadata(document: &PdfDocument) -> PdfMetadata {
    let metadata = document.metadata();
    let get = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata.get(tag).and_then(|t| {
            let v = strip_nul(t.value());
            let v = v.trim();
            if v.is_empty() {
                None
            } else {
                Some(v.to_string())
            }
        })
    };
    PdfMetadata {
        title: get(PdfDocumentMetadataTagType::Title),
        author: get(PdfDocumentMetadataTagType::Author),
        creator: get(PdfDocumentMetadataTagType::Creator),
        producer: get(PdfDocumentMetadataTagType::Producer),
        subject: get(PdfDocumentMetadataTagType::Subject),
    }
}

fn collect_siblings(first: PdfBookmark, depth: usize, visited: &mut usize) -> Vec<OutlineNode> {
    let mut nodes = Vec::new();
    let mut current = Some(first);
    while let Some(bookmark) = current {
        if *visited >= MAX_OUTLINE_NODES {
            break;
        }
        *visited += 1;
        let children = match bookmark.first_child() {
            Some(child) if depth + 1 < MAX_OUTLINE_DEPTH => {
                collect_siblings(child, depth + 1, visited)
            }
            _ => Vec::new(),
        };
        let page = bookmark
            .destination()
            .and_then(|d| d.page_index().ok())
            .map(|i| u32::from(i) + 1);
        nodes.push(OutlineNode {
            title: bookmark.title().map(|t| strip_nul(&t)).unwrap_or_default(),
            page,
            children,
        });
        current = bookmark.next_sibling();
    }
    nodes
}

fn page_index(number: u32) -> Result<PdfPageIndex, PipelineError> {
    number
        .checked_sub(1)
        .and_then(|i| PdfPageIndex::try_from(i).ok())
        .ok_or(PipelineError::PageOutOfRange {
            page: number,
            total: u32::from(PdfPageIndex::MAX),
        })
}

fn rotation_degrees(rotation: PdfPageRenderRotation) -> i32 {
    match rotation {
        PdfPageRenderRotation::None => 0,
        PdfPageRenderRotation::Degrees90 => 90,
        PdfPageRenderRotation::Degrees180 => 180,
        PdfPageRenderRotation::Degrees270 => 270,
    }
}

fn rotation_from_degrees(degrees: i32) -> PdfPageRenderRotation {
    match degrees.rem_euclid(360) {
        90 => PdfPageRenderRotation::Degrees90,
        180 => PdfPageRenderRotation::Degrees180,
        270 => PdfPageRenderRotation::Degrees270,
        _ => PdfPageRenderRotation::None,
    }
}
