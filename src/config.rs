//! Configuration for the ingestion pipeline.
//!
//! Every tunable lives in [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`]. Chunk sizes and timeouts are deployment knobs,
//! not correctness contracts: the orchestrator stays correct for any chunk
//! limit ≥ 1 and any timeout, it only changes how often work is re-queued.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration shared by the orchestrator and every job.
///
/// # Example
/// ```rust
/// use edgequake_pdfindex::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .chunk_limit(5)
///     .max_dpi(200)
///     .ocr_enabled(false)
///     .build()
///     .unwrap();
/// assert_eq!(config.chunk_limit, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on render DPI. Default: 300.
    pub max_dpi: u32,

    /// Longest rendered edge in pixels. Default: 3507 (A4 height at 300 DPI).
    ///
    /// Oversized physical pages get a lower DPI so the raster never exceeds
    /// this edge; normal pages render at `max_dpi`.
    pub max_long_edge_px: u32,

    /// Pages processed by one `ProcessPages` task before re-queueing. Default: 10.
    pub chunk_limit: usize,

    /// Timeout for one rasterizer or repair-tool invocation, in seconds. Default: 240.
    pub page_timeout_secs: u64,

    /// Run OCR when a page has no native text. Default: true.
    pub ocr_enabled: bool,

    /// Timeout for one OCR invocation, in seconds. Default: 30.
    ///
    /// OCR is best-effort: a timeout yields empty text, not a failed page.
    pub ocr_timeout_secs: u64,

    /// Overrides the OCR engine's language data directory.
    pub tessdata_dir: Option<PathBuf>,

    /// Document language → OCR language code. Default: en→eng, de→deu.
    pub ocr_languages: BTreeMap<String, String>,

    /// Fixed slack added to every task time limit, in seconds. Default: 60.
    pub task_padding_secs: u64,

    /// Expected cost of one page in a chunk, in seconds. Default: 20.
    pub page_cost_secs: u64,

    /// Derived encodings produced once a document is ready. Default: [webp].
    pub alternate_formats: Vec<AltFormat>,

    /// Run table detection during `process_document`. Default: true.
    pub detect_tables: bool,

    /// External table detector. `None` records tables as unavailable.
    pub table_detector: Option<ToolCommand>,

    /// Pending documents untouched for this long are re-triggered by the
    /// reconciliation sweep, in seconds. Default: 3600.
    pub stale_pending_secs: u64,

    /// Alternate-format markers stuck in progress for this long are reset by
    /// the reconciliation sweep, in seconds. Default: 3600.
    pub stale_format_secs: u64,

    /// Explicit pdfium shared library. Falls back to `./` then the system library.
    pub pdfium_library_path: Option<PathBuf>,

    /// Names or paths of the external binaries.
    pub tools: ToolPaths,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut ocr_languages = BTreeMap::new();
        ocr_languages.insert("en".to_string(), "eng".to_string());
        ocr_languages.insert("de".to_string(), "deu".to_string());
        Self {
            max_dpi: 300,
            max_long_edge_px: 3507,
            chunk_limit: 10,
            page_timeout_secs: 240,
            ocr_enabled: true,
            ocr_timeout_secs: 30,
            tessdata_dir: None,
            ocr_languages,
            task_padding_secs: 60,
            page_cost_secs: 20,
            alternate_formats: vec![AltFormat::Webp],
            detect_tables: true,
            table_detector: None,
            stale_pending_secs: 3600,
            stale_format_secs: 3600,
            pdfium_library_path: None,
            tools: ToolPaths::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a new builder starting from the defaults.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }

    /// Time limit for a `ProcessPages` task covering `pages` pages.
    ///
    /// Never below one full page timeout plus padding, so a single slow
    /// render always fits.
    pub fn chunk_time_limit(&self, pages: usize) -> Duration {
        let per_chunk = self.page_cost_secs.saturating_mul(pages as u64);
        let floor = self.page_timeout_secs;
        Duration::from_secs(per_chunk.max(floor) + self.task_padding_secs)
    }

    /// Time limit for document-level and side jobs.
    ///
    /// Covers the worst-case repair path: two attempts, each of which may run
    /// both rewrite tools.
    pub fn job_time_limit(&self) -> Duration {
        let repair = self.page_timeout_secs.saturating_mul(4);
        Duration::from_secs(repair + self.page_timeout_secs + self.task_padding_secs)
    }

    /// OCR language code for a document language, if mapped.
    pub fn ocr_language(&self, language: Option<&str>) -> Option<&str> {
        language
            .and_then(|l| self.ocr_languages.get(l))
            .map(String::as_str)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn max_dpi(mut self, dpi: u32) -> Self {
        self.config.max_dpi = dpi;
        self
    }

    pub fn max_long_edge_px(mut self, px: u32) -> Self {
        self.config.max_long_edge_px = px;
        self
    }

    pub fn chunk_limit(mut self, n: usize) -> Self {
        self.config.chunk_limit = n;
        self
    }

    pub fn page_timeout_secs(mut self, secs: u64) -> Self {
        self.config.page_timeout_secs = secs;
        self
    }

    pub fn ocr_enabled(mut self, v: bool) -> Self {
        self.config.ocr_enabled = v;
        self
    }

    pub fn ocr_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ocr_timeout_secs = secs;
        self
    }

    pub fn tessdata_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.tessdata_dir = Some(dir.into());
        self
    }

    pub fn ocr_language(mut self, language: impl Into<String>, code: impl Into<String>) -> Self {
        self.config.ocr_languages.insert(language.into(), code.into());
        self
    }

    pub fn task_padding_secs(mut self, secs: u64) -> Self {
        self.config.task_padding_secs = secs;
        self
    }

    pub fn page_cost_secs(mut self, secs: u64) -> Self {
        self.config.page_cost_secs = secs;
        self
    }

    pub fn alternate_formats(mut self, formats: Vec<AltFormat>) -> Self {
        self.config.alternate_formats = formats;
        self
    }

    pub fn detect_tables(mut self, v: bool) -> Self {
        self.config.detect_tables = v;
        self
    }

    pub fn table_detector(mut self, command: ToolCommand) -> Self {
        self.config.table_detector = Some(command);
        self
    }

    pub fn stale_pending_secs(mut self, secs: u64) -> Self {
        self.config.stale_pending_secs = secs;
        self
    }

    pub fn stale_format_secs(mut self, secs: u64) -> Self {
        self.config.stale_format_secs = secs;
        self
    }

    pub fn pdfium_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library_path = Some(path.into());
        self
    }

    pub fn tools(mut self, tools: ToolPaths) -> Self {
        self.config.tools = tools;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if !(36..=1200).contains(&c.max_dpi) {
            return Err(PipelineError::InvalidConfig(format!(
                "max_dpi must be 36–1200, got {}",
                c.max_dpi
            )));
        }
        if c.max_long_edge_px < 100 {
            return Err(PipelineError::InvalidConfig(format!(
                "max_long_edge_px must be ≥ 100, got {}",
                c.max_long_edge_px
            )));
        }
        if c.chunk_limit == 0 {
            return Err(PipelineError::InvalidConfig(
                "chunk_limit must be ≥ 1".into(),
            ));
        }
        if c.page_timeout_secs == 0 || c.ocr_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "timeouts must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── External tools ───────────────────────────────────────────────────────

/// Names (or absolute paths) of the external binaries the pipeline shells out to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolPaths {
    pub rasterizer: String,
    pub ghostscript: String,
    pub cairo_rewriter: String,
    pub decryptor: String,
    pub ocr: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            rasterizer: "pdftoppm".into(),
            ghostscript: "gs".into(),
            cairo_rewriter: "pdftocairo".into(),
            decryptor: "qpdf".into(),
            ocr: "tesseract".into(),
        }
    }
}

/// A program plus leading arguments; the pipeline appends its own operands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl FromStr for ToolCommand {
    type Err = PipelineError;

    /// Whitespace-separated `program arg1 arg2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| PipelineError::InvalidConfig("empty tool command".into()))?;
        Ok(Self {
            program: program.to_string(),
            args: parts.map(str::to_string).collect(),
        })
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Alternate image encoding generated for every stored page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AltFormat {
    /// Lossless WebP.
    Webp,
    /// JPEG at quality 80.
    Jpeg,
}

impl AltFormat {
    pub fn name(self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Jpeg => "jpeg",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Jpeg => "jpg",
        }
    }

    /// Property key holding the tri-state completion marker.
    pub fn marker_key(self) -> String {
        format!("_format_{}", self.name())
    }

    /// Property key holding the time the conversion started.
    pub fn started_key(self) -> String {
        format!("_format_{}_started", self.name())
    }
}

impl fmt::Display for AltFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AltFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webp" => Ok(Self::Webp),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown alternate format '{other}' (expected webp or jpeg)"
            ))),
        }
    }
}
