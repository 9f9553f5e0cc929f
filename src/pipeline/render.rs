//! Page rasterisation through an external converter.
//!
//! ## DPI selection
//!
//! Each page renders at
//! `min(max_dpi, max_long_edge / (width_pt / 72), max_long_edge / (height_pt / 72))`,
//! so an A0 poster drops to a DPI that keeps its long edge at the pixel cap
//! while ordinary pages render at full `max_dpi`.
//!
//! ## Lifetimes of artefacts
//!
//! Every page renders into its own [`TempDir`], owned by the yielded
//! [`RenderedPage`]. Dropping the page, or the whole stream, removes the
//! files on every exit path.

use crate::error::{PageError, PipelineError, ToolError};
use crate::pipeline::pdf::PageSize;
use crate::pipeline::repair::ReadablePdf;
use crate::pipeline::tools::{run_tool, scratch_dir, ToolInvocation};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tempfile::TempDir;
use tracing::debug;

/// A lazily rendered sequence of pages, in the order requested.
pub type RenderStream<'a> = Pin<Box<dyn Stream<Item = Result<RenderedPage, PipelineError>> + Send + 'a>>;

/// Rasterise one page of a PDF to a PNG file inside `workdir`.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn render_page(
        &self,
        pdf: &Path,
        page: u32,
        dpi: f32,
        workdir: &Path,
    ) -> Result<PathBuf, ToolError>;
}

/// `pdftoppm -png -cropbox -r <dpi> -singlefile -f N -l N in out`
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    program: String,
    timeout: Duration,
}

impl PdftoppmRasterizer {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Rasterizer for PdftoppmRasterizer {
    async fn render_page(
        &self,
        pdf: &Path,
        page: u32,
        dpi: f32,
        workdir: &Path,
    ) -> Result<PathBuf, ToolError> {
        let prefix = workdir.join("page");
        let page_arg = page.to_string();
        let invocation = ToolInvocation::new(&self.program, self.timeout)
            .args(["-png", "-cropbox", "-r"])
            .arg(format!("{dpi:.2}"))
            .arg("-singlefile")
            .args(["-f", page_arg.as_str(), "-l", page_arg.as_str()])
            .arg(pdf)
            .arg(&prefix);
        run_tool(&invocation, workdir).await?;

        let output = prefix.with_extension("png");
        match tokio::fs::metadata(&output).await {
            Ok(m) if m.len() > 0 => Ok(output),
            _ => Err(ToolError::MissingOutput {
                program: self.program.clone(),
                path: output,
            }),
        }
    }
}

/// A rendered page. The PNG is deleted when this value is dropped.
#[derive(Debug)]
pub struct RenderedPage {
    pub number: u32,
    pub dpi: f32,
    pub path: PathBuf,
    _dir: TempDir,
}

impl RenderedPage {
    pub async fn read_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| PipelineError::io(&self.path, e))
    }
}

#[cfg(test)]
impl RenderedPage {
    pub(crate) fn from_file(number: u32, path: PathBuf, dir: TempDir) -> Self {
        Self {
            number,
            dpi: 150.0,
            path,
            _dir: dir,
        }
    }
}

/// DPI that keeps the longer edge at `max_long_edge_px`, capped at `max_dpi`.
pub fn compute_dpi(size: Option<PageSize>, max_dpi: u32, max_long_edge_px: u32) -> f32 {
    let max_dpi = max_dpi as f32;
    let Some(size) = size else {
        return max_dpi;
    };
    let edge = max_long_edge_px as f32;
    let by_width = edge / (size.width_pt / 72.0);
    let by_height = edge / (size.height_pt / 72.0);
    [by_width, by_height]
        .into_iter()
        .filter(|d| d.is_finite() && *d > 0.0)
        .fold(max_dpi, f32::min)
}

/// Render one page into a fresh scratch directory.
pub async fn render_page(
    pdf: &ReadablePdf,
    number: u32,
    rasterizer: &dyn Rasterizer,
    max_dpi: u32,
    max_long_edge_px: u32,
) -> Result<RenderedPage, PipelineError> {
    let total = pdf.page_count();
    if number == 0 || number > total {
        return Err(PipelineError::PageOutOfRange { page: number, total });
    }
    let dpi = compute_dpi(pdf.info.page_size(number), max_dpi, max_long_edge_px);
    let dir = scratch_dir("pdfindex-render-")?;
    let path = rasterizer
        .render_page(pdf.path(), number, dpi, dir.path())
        .await
        .map_err(|source| PageError::RenderFailed { page: number, source })?;
    debug!(page = number, dpi, "Rendered page");
    Ok(RenderedPage {
        number,
        dpi,
        path,
        _dir: dir,
    })
}

/// Lazily render `pages` one at a time. A failure is yielded, not skipped.
pub fn render_pages<'a>(
    pdf: &'a ReadablePdf,
    pages: Vec<u32>,
    rasterizer: &'a dyn Rasterizer,
    max_dpi: u32,
    max_long_edge_px: u32,
) -> RenderStream<'a> {
    stream::iter(pages)
        .then(move |number| render_page(pdf, number, rasterizer, max_dpi, max_long_edge_px))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    const A4: PageSize = PageSize {
        width_pt: 595.0,
        height_pt: 842.0,
    };

    #[test]
    fn a4_renders_at_max_dpi() {
        let dpi = compute_dpi(Some(A4), 300, 3507);
        assert!((dpi - 299.87).abs() < 0.1, "got {dpi}");
    }

    #[test]
    fn oversized_page_lowers_dpi() {
        // A0: 2384 × 3370 pt.
        let a0 = PageSize {
            width_pt: 2384.0,
            height_pt: 3370.0,
        };
        let dpi = compute_dpi(Some(a0), 300, 3507);
        let long_edge_px = 3370.0 / 72.0 * dpi;
        assert!((long_edge_px - 3507.0).abs() < 1.0, "got {long_edge_px}");
        assert!(dpi < 100.0);
    }

    #[test]
    fn small_page_capped_at_max_dpi() {
        let card = PageSize {
            width_pt: 252.0,
            height_pt: 144.0,
        };
        assert_eq!(compute_dpi(Some(card), 300, 3507), 300.0);
    }

    #[test]
    fn degenerate_size_falls_back_to_max_dpi() {
        let zero = PageSize {
            width_pt: 0.0,
            height_pt: 0.0,
        };
        assert_eq!(compute_dpi(Some(zero), 150, 3507), 150.0);
        assert_eq!(compute_dpi(None, 150, 3507), 150.0);
    }

    /// Renders a stub file per page and times out on the listed pages.
    struct ScriptedRaster {
        timeouts: Vec<u32>,
        calls: std::sync::Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Rasterizer for ScriptedRaster {
        async fn render_page(
            &self,
            _: &Path,
            page: u32,
            _: f32,
            workdir: &Path,
        ) -> Result<PathBuf, ToolError> {
            self.calls.lock().unwrap().push(page);
            if self.timeouts.contains(&page) {
                return Err(ToolError::Timeout {
                    program: "pdftoppm".into(),
                    secs: 240,
                });
            }
            let path = workdir.join("page.png");
            std::fs::write(&path, b"png").unwrap();
            Ok(path)
        }
    }

    fn three_pages() -> ReadablePdf {
        ReadablePdf::for_tests(
            "doc.pdf",
            crate::pipeline::pdf::PdfInfo {
                page_count: 3,
                metadata: Default::default(),
                page_sizes: vec![A4; 3],
            },
        )
    }

    #[tokio::test]
    async fn stream_renders_lazily_and_yields_failures() {
        let pdf = three_pages();
        let raster = ScriptedRaster {
            timeouts: vec![2],
            calls: std::sync::Mutex::new(Vec::new()),
        };
        let mut pages = render_pages(&pdf, vec![1, 2, 3], &raster, 150, 3507);
        assert!(raster.calls.lock().unwrap().is_empty());

        let first = pages.next().await.unwrap().unwrap();
        assert_eq!(first.number, 1);
        assert_eq!(*raster.calls.lock().unwrap(), vec![1]);
        let scratch = first.path.parent().unwrap().to_path_buf();
        assert!(first.path.exists());
        drop(first);
        assert!(!scratch.exists(), "scratch dir outlived its page");

        let err = pages.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Page(PageError::RenderFailed { page: 2, .. })
        ));
        assert!(err.is_transient());
        assert_eq!(*raster.calls.lock().unwrap(), vec![1, 2]);

        let third = pages.next().await.unwrap().unwrap();
        assert_eq!(third.number, 3);
        let scratch = third.path.parent().unwrap().to_path_buf();
        assert!(pages.next().await.is_none());
        drop(pages);
        drop(third);
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn out_of_range_page_is_rejected() {
        let pdf = three_pages();
        let raster = ScriptedRaster {
            timeouts: Vec::new(),
            calls: std::sync::Mutex::new(Vec::new()),
        };
        let err = render_page(&pdf, 4, &raster, 150, 3507).await.unwrap_err();
        assert!(matches!(err, PipelineError::PageOutOfRange { page: 4, total: 3 }));
        assert!(raster.calls.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pdftoppm_missing_output_detected() {
        let dir = tempfile::tempdir().unwrap();
        let r = PdftoppmRasterizer::new("true", Duration::from_secs(5));
        let err = r
            .render_page(Path::new("in.pdf"), 1, 150.0, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::MissingOutput { .. }));
    }
}
