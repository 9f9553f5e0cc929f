//! Records the pipeline reads and writes: documents, pages and annotations.
//!
//! These are plain serde structs. Persistence belongs to the
//! [`crate::storage::RecordStore`] collaborator; the types only carry the
//! invariants that the orchestrator maintains:
//!
//! * `Document::pending == false` ⇒ every page `1..=num_pages` has a
//!   non-pending [`Page`].
//! * a non-pending [`Page`] has all four image slots filled and
//!   `width`/`height` set.

use crate::config::AltFormat;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const TITLE_MAX_CHARS: usize = 500;
pub const SLUG_MAX_CHARS: usize = 250;

/// Property key for the last fatal processing error.
pub const ERROR_KEY: &str = "_error";
/// Property key for detected tables (`null` when no detector is available).
pub const TABLES_KEY: &str = "_tables";
/// Property key for the number of repair attempts the stored PDF needed.
pub const REPAIR_ATTEMPTS_KEY: &str = "_repair_attempts";
/// Property key for a page rotation that has started but not finished.
pub const ROTATION_KEY: &str = "_rotation";

// ── Document ─────────────────────────────────────────────────────────────

/// An uploaded PDF and its derived document-level state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub slug: String,
    /// Blob key of the PDF bytes.
    pub file_key: Option<String>,
    /// SHA-256 hex digest of the uploaded bytes.
    pub content_hash: Option<String>,
    pub num_pages: u32,
    pub file_size: u64,
    pub pending: bool,
    /// Open metadata map: title/author/… plus `_`-prefixed pipeline markers.
    pub properties: Map<String, Value>,
    /// Nested markdown bullets linking to `#page-N`.
    pub outline: String,
    /// Drives OCR language selection.
    pub language: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A freshly uploaded document: pending, zero pages.
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            slug: slugify(&title),
            title,
            file_key: None,
            content_hash: None,
            num_pages: 0,
            file_size: 0,
            pending: true,
            properties: Map::new(),
            outline: String::new(),
            language: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn default_file_key(id: Uuid) -> String {
        format!("documents/{id}/document.pdf")
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn format_marker(&self, format: AltFormat) -> FormatMarker {
        FormatMarker::from_value(self.properties.get(&format.marker_key()))
    }

    pub fn set_format_marker(&mut self, format: AltFormat, marker: FormatMarker) {
        let key = format.marker_key();
        match marker {
            FormatMarker::Unset => {
                self.properties.remove(&key);
                self.properties.remove(&format.started_key());
            }
            FormatMarker::InProgress => {
                self.properties.insert(key, Value::Bool(false));
                self.properties.insert(
                    format.started_key(),
                    Value::String(Utc::now().to_rfc3339()),
                );
            }
            FormatMarker::Done => {
                self.properties.insert(key, Value::Bool(true));
                self.properties.remove(&format.started_key());
            }
        }
    }

    /// When an in-progress conversion was started, if recorded.
    pub fn format_started_at(&self, format: AltFormat) -> Option<DateTime<Utc>> {
        self.properties
            .get(&format.started_key())
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    /// Replace a filename-like or empty title with the extracted one.
    ///
    /// Falls back to the filename stem when the PDF carries no title.
    /// Always re-derives the slug and enforces the length limits.
    pub fn apply_extracted_title(&mut self, extracted: Option<&str>) {
        let mirrors_filename = self.title.trim().is_empty()
            || self.title.to_ascii_lowercase().ends_with(".pdf");
        if mirrors_filename {
            let extracted = extracted.map(str::trim).filter(|t| !t.is_empty());
            self.title = match extracted {
                Some(t) => t.to_string(),
                None => strip_pdf_suffix(self.title.trim()).to_string(),
            };
        }
        self.title = truncate_chars(&self.title, TITLE_MAX_CHARS);
        self.slug = truncate_chars(&slugify(&self.title), SLUG_MAX_CHARS);
    }
}

/// Tri-state completion marker stored at `_format_<name>`.
///
/// Set to `InProgress` before any work starts so a crash mid-conversion
/// leaves a detectable `false` behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatMarker {
    Unset,
    InProgress,
    Done,
}

impl FormatMarker {
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Bool(true)) => Self::Done,
            Some(Value::Bool(false)) => Self::InProgress,
            _ => Self::Unset,
        }
    }
}

// ── Page ─────────────────────────────────────────────────────────────────

/// Named raster sizes stored for every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSize {
    Original,
    Large,
    Normal,
    Small,
}

impl ImageSize {
    pub const ALL: [ImageSize; 4] = [Self::Original, Self::Large, Self::Normal, Self::Small];
    /// Sizes derived from the original by downscaling.
    pub const SCALED: [ImageSize; 3] = [Self::Large, Self::Normal, Self::Small];

    /// Target width in pixels; `None` for the original resolution.
    pub fn width(self) -> Option<u32> {
        match self {
            Self::Original => None,
            Self::Large => Some(1000),
            Self::Normal => Some(700),
            Self::Small => Some(180),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Large => "large",
            Self::Normal => "normal",
            Self::Small => "small",
        }
    }
}

/// Blob keys of the four raster variants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImages {
    pub original: Option<String>,
    pub large: Option<String>,
    pub normal: Option<String>,
    pub small: Option<String>,
}

impl PageImages {
    pub fn get(&self, size: ImageSize) -> Option<&str> {
        match size {
            ImageSize::Original => self.original.as_deref(),
            ImageSize::Large => self.large.as_deref(),
            ImageSize::Normal => self.normal.as_deref(),
            ImageSize::Small => self.small.as_deref(),
        }
    }

    pub fn set(&mut self, size: ImageSize, key: Option<String>) {
        let slot = match size {
            ImageSize::Original => &mut self.original,
            ImageSize::Large => &mut self.large,
            ImageSize::Normal => &mut self.normal,
            ImageSize::Small => &mut self.small,
        };
        *slot = key;
    }

    pub fn is_complete(&self) -> bool {
        ImageSize::ALL.iter().all(|s| self.get(*s).is_some())
    }
}

/// One page of a document, unique on `(document_id, number)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub document_id: Uuid,
    /// 1-based page number.
    pub number: u32,
    pub pending: bool,
    /// A human edited `content`; re-extraction must not overwrite it.
    pub corrected: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub content: String,
    pub images: PageImages,
}

impl Page {
    pub fn new(document_id: Uuid, number: u32) -> Self {
        Self {
            document_id,
            number,
            pending: true,
            corrected: false,
            width: None,
            height: None,
            content: String::new(),
            images: PageImages::default(),
        }
    }

    /// Deterministic blob key for a raster variant of this page.
    pub fn image_key(&self, size: ImageSize) -> String {
        format!(
            "documents/{}/pages/{}/{}.png",
            self.document_id,
            self.number,
            size.name()
        )
    }

    pub fn is_done(&self) -> bool {
        !self.pending && self.images.is_complete() && self.width.is_some() && self.height.is_some()
    }
}

/// Blob key of an alternate encoding stored next to `key`.
pub fn alternate_key(key: &str, format: AltFormat) -> String {
    format!("{key}.{}", format.extension())
}

// ── Annotations ──────────────────────────────────────────────────────────

/// Pixel rectangle relative to a page's original-resolution image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// One coloured sub-rectangle of an annotation, relative to the crop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
    pub color: String,
}

/// A user annotation on a page, with a derived crop image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageAnnotation {
    pub id: Uuid,
    pub document_id: Uuid,
    /// `None` once the page is gone.
    pub page_number: Option<u32>,
    pub title: String,
    pub description: String,
    pub top: Option<u32>,
    pub left: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// JSON list of [`Highlight`]s.
    pub highlight: Option<String>,
    /// Blob key of the derived crop.
    pub image: Option<String>,
    /// Inputs the cached crop was computed from.
    pub image_fingerprint: Option<String>,
}

impl PageAnnotation {
    pub fn new(document_id: Uuid, page_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            page_number: Some(page_number),
            title: String::new(),
            description: String::new(),
            top: None,
            left: None,
            width: None,
            height: None,
            highlight: None,
            image: None,
            image_fingerprint: None,
        }
    }

    pub fn with_rect(mut self, rect: Rect) -> Self {
        self.left = Some(rect.left);
        self.top = Some(rect.top);
        self.width = Some(rect.width);
        self.height = Some(rect.height);
        self
    }

    /// The rectangle, if all four coordinates are set.
    pub fn rect(&self) -> Option<Rect> {
        Some(Rect {
            left: self.left?,
            top: self.top?,
            width: self.width?,
            height: self.height?,
        })
    }

    /// Parsed highlight list; empty when unset or blank.
    pub fn highlights(&self) -> Result<Vec<Highlight>, serde_json::Error> {
        match self.highlight.as_deref().map(str::trim) {
            None | Some("") => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(raw),
        }
    }

    pub fn image_key(&self) -> String {
        format!("documents/{}/annotations/{}.png", self.document_id, self.id)
    }
}

// ── Text helpers ─────────────────────────────────────────────────────────

static RE_SLUG_STRIP: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s-]").unwrap());
static RE_SLUG_DASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-\s_]+").unwrap());

/// Lowercase ASCII slug: word characters joined by single hyphens.
pub fn slugify(input: &str) -> String {
    let ascii: String = input
        .chars()
        .filter(char::is_ascii)
        .collect::<String>()
        .to_ascii_lowercase();
    let stripped = RE_SLUG_STRIP.replace_all(&ascii, "");
    let dashed = RE_SLUG_DASH.replace_all(stripped.trim(), "-");
    dashed.trim_matches('-').to_string()
}

/// Strip embedded NUL characters (PDF strings are often NUL-padded).
pub fn strip_nul(input: &str) -> String {
    input.replace('\0', "")
}

fn strip_pdf_suffix(title: &str) -> &str {
    let len = title.len();
    if len >= 4 && title.is_char_boundary(len - 4) && title[len - 4..].eq_ignore_ascii_case(".pdf") {
        &title[..len - 4]
    } else {
        title
    }
}

fn truncate_chars(input: &str, max: usize) -> String {
    input.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_document_is_pending_with_no_pages() {
        let doc = Document::new("Report.pdf");
        assert!(doc.pending);
        assert_eq!(doc.num_pages, 0);
        assert_eq!(doc.format_marker(AltFormat::Webp), FormatMarker::Unset);
    }

    #[test]
    fn filename_title_replaced_by_metadata_title() {
        let mut doc = Document::new("scan_0001.pdf");
        doc.apply_extracted_title(Some("Annual Report 2023"));
        assert_eq!(doc.title, "Annual Report 2023");
        assert_eq!(doc.slug, "annual-report-2023");
    }

    #[test]
    fn filename_title_stripped_without_metadata() {
        let mut doc = Document::new("Council Minutes.PDF");
        doc.apply_extracted_title(Some("   "));
        assert_eq!(doc.title, "Council Minutes");
        assert_eq!(doc.slug, "council-minutes");
    }

    #[test]
    fn human_title_kept() {
        let mut doc = Document::new("Letter to the ministry");
        doc.apply_extracted_title(Some("Untitled-1"));
        assert_eq!(doc.title, "Letter to the ministry");
    }

    #[test]
    fn title_and_slug_truncated() {
        let mut doc = Document::new(format!("{}.pdf", "a".repeat(700)));
        doc.apply_extracted_title(None);
        assert_eq!(doc.title.chars().count(), TITLE_MAX_CHARS);
        assert_eq!(doc.slug.len(), SLUG_MAX_CHARS);
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("  Hello,  World -- 2024! "), "hello-world-2024");
        assert_eq!(slugify("Über café"), "ber-caf");
        assert_eq!(slugify("___"), "");
    }

    #[test]
    fn format_marker_tri_state() {
        let mut doc = Document::new("x");
        doc.set_format_marker(AltFormat::Webp, FormatMarker::InProgress);
        assert_eq!(doc.properties["_format_webp"], Value::Bool(false));
        assert!(doc.format_started_at(AltFormat::Webp).is_some());
        doc.set_format_marker(AltFormat::Webp, FormatMarker::Done);
        assert_eq!(doc.format_marker(AltFormat::Webp), FormatMarker::Done);
        assert!(doc.format_started_at(AltFormat::Webp).is_none());
        doc.set_format_marker(AltFormat::Webp, FormatMarker::Unset);
        assert!(!doc.properties.contains_key("_format_webp"));
    }

    #[test]
    fn page_done_requires_all_images() {
        let mut page = Page::new(Uuid::new_v4(), 1);
        page.pending = false;
        page.width = Some(100);
        page.height = Some(140);
        assert!(!page.is_done());
        for size in ImageSize::ALL {
            let key = page.image_key(size);
            page.images.set(size, Some(key));
        }
        assert!(page.is_done());
        assert!(page.images.get(ImageSize::Small).unwrap().ends_with("/1/small.png"));
    }

    #[test]
    fn annotation_rect_requires_all_coordinates() {
        let mut ann = PageAnnotation::new(Uuid::new_v4(), 1);
        assert!(ann.rect().is_none());
        ann.top = Some(5);
        ann.left = Some(5);
        ann.width = Some(10);
        assert!(ann.rect().is_none());
        ann.height = Some(0);
        assert_eq!(ann.rect().map(|r| r.height), Some(0));
    }

    #[test]
    fn annotation_highlights_parse() {
        let mut ann = PageAnnotation::new(Uuid::new_v4(), 1);
        assert!(ann.highlights().unwrap().is_empty());
        ann.highlight = Some(r##"[{"left":1,"top":2,"width":3,"height":4,"color":"#ff0"}]"##.into());
        let hl = ann.highlights().unwrap();
        assert_eq!(hl.len(), 1);
        assert_eq!(hl[0].color, "#ff0");
        ann.highlight = Some("not json".into());
        assert!(ann.highlights().is_err());
    }

    #[test]
    fn nul_stripped() {
        assert_eq!(strip_nul("Ti\0tle\0\0"), "Title");
    }
}
