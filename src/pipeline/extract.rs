//! Text and outline extraction.
//!
//! Native text comes from the PDF page object. Pages without a text layer
//! (scans) fall back to an external OCR engine on the rendered image. OCR is
//! best-effort: a timeout yields empty text instead of failing the page.

use crate::error::{PageError, PipelineError, ToolError};
use crate::model::strip_nul;
use crate::pipeline::pdf::{blocking, OutlineNode, PdfBackend};
use crate::pipeline::render::{render_page, Rasterizer, RenderedPage};
use crate::pipeline::repair::ReadablePdf;
use crate::pipeline::tools::{run_tool, scratch_dir, ToolInvocation};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Recognise text in a raster image.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// `language` is the engine's code (e.g. `eng`), already mapped.
    async fn recognize(&self, image: &Path, language: Option<&str>) -> Result<String, ToolError>;
}

/// `tesseract <image> stdout [-l lang] [--tessdata-dir dir]`
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    program: String,
    data_dir: Option<PathBuf>,
    timeout: Duration,
}

impl TesseractOcr {
    pub fn new(program: impl Into<String>, data_dir: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            data_dir,
            timeout,
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize(&self, image: &Path, language: Option<&str>) -> Result<String, ToolError> {
        let home = scratch_dir("pdfindex-ocr-")?;
        let mut invocation = ToolInvocation::new(&self.program, self.timeout)
            .arg(image)
            .arg("stdout");
        if let Some(lang) = language {
            invocation = invocation.args(["-l", lang]);
        }
        if let Some(dir) = &self.data_dir {
            invocation = invocation.arg("--tessdata-dir").arg(dir);
        }
        let output = run_tool(&invocation, home.path()).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// How to rasterise a page for OCR when the caller has no image of it.
#[derive(Clone, Copy)]
pub struct OcrRaster<'a> {
    pub rasterizer: &'a dyn Rasterizer,
    pub max_dpi: u32,
    pub max_long_edge_px: u32,
}

/// Inputs for one page's text extraction.
pub struct TextRequest<'a> {
    pub pdf: &'a ReadablePdf,
    pub page: u32,
    /// An image already rendered by the caller, reused for OCR.
    pub rendered: Option<&'a RenderedPage>,
    pub raster: OcrRaster<'a>,
    pub use_ocr: bool,
    pub ocr_language: Option<&'a str>,
}

/// Native text, falling back to OCR when the page has none.
///
/// Returns trimmed, NUL-free text. Without a rendered image the page is
/// rasterised on demand into a scratch directory dropped before returning.
pub async fn extract_text(
    backend: Arc<dyn PdfBackend>,
    ocr: &dyn OcrEngine,
    request: TextRequest<'_>,
) -> Result<String, PipelineError> {
    let page = request.page;
    let path = request.pdf.path().to_path_buf();
    let native = blocking(move || backend.page_text(&path, page)).await;

    let native_error = match native {
        Ok(text) => {
            let text = strip_nul(&text).trim().to_string();
            if !text.is_empty() {
                return Ok(text);
            }
            None
        }
        Err(e) => {
            warn!(page, error = %e, "Native text extraction failed");
            Some(e)
        }
    };

    if !request.use_ocr {
        return match native_error {
            Some(e) => Err(PageError::ExtractFailed {
                page,
                detail: e.to_string(),
            }
            .into()),
            None => Ok(String::new()),
        };
    }

    let on_demand;
    let image = match request.rendered {
        Some(rendered) => &rendered.path,
        None => {
            let raster = request.raster;
            on_demand = render_page(
                request.pdf,
                page,
                raster.rasterizer,
                raster.max_dpi,
                raster.max_long_edge_px,
            )
            .await?;
            debug!(page, "Rendered page for OCR");
            &on_demand.path
        }
    };

    match ocr.recognize(image, request.ocr_language).await {
        Ok(text) => {
            debug!(page, chars = text.len(), "OCR text extracted");
            Ok(strip_nul(&text).trim().to_string())
        }
        Err(ToolError::Timeout { secs, .. }) => {
            warn!(page, secs, "OCR timed out, keeping empty text");
            Ok(String::new())
        }
        Err(e) => match native_error {
            Some(native) => Err(PageError::ExtractFailed {
                page,
                detail: format!("native: {native}; ocr: {e}"),
            }
            .into()),
            None => Err(PageError::ExtractFailed {
                page,
                detail: e.to_string(),
            }
            .into()),
        },
    }
}

/// Outline as nested markdown bullets linking to `#page-N`.
///
/// Entries whose destination does not resolve are left out together with
/// everything nested under them.
pub fn outline_markdown(nodes: &[OutlineNode]) -> String {
    let mut out = String::new();
    write_outline(nodes, 0, &mut out);
    out
}

fn write_outline(nodes: &[OutlineNode], depth: usize, out: &mut String) {
    for node in nodes {
        let Some(page) = node.page else {
            continue;
        };
        let title = strip_nul(&node.title).replace(['\r', '\n'], " ");
        let _ = writeln!(out, "{}- [{}](#page-{})", "  ".repeat(depth), title.trim(), page);
        write_outline(&node.children, depth + 1, out);
    }
}

/// Read the bookmark tree and serialise it.
pub async fn extract_outline(
    backend: Arc<dyn PdfBackend>,
    pdf_path: &Path,
) -> Result<String, PipelineError> {
    let path = pdf_path.to_path_buf();
    let nodes = blocking(move || backend.outline(&path)).await?;
    Ok(outline_markdown(&nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::pdf::{OpenFailure, PdfInfo};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct TextBackend {
        text: Result<String, String>,
    }

    impl PdfBackend for TextBackend {
        fn open(&self, _: &Path) -> Result<PdfInfo, OpenFailure> {
            Err(OpenFailure::Engine("unused".into()))
        }
        fn page_text(&self, path: &Path, _: u32) -> Result<String, PipelineError> {
            self.text.clone().map_err(|detail| PipelineError::PdfEngine {
                path: path.to_path_buf(),
                detail,
            })
        }
        fn outline(&self, _: &Path) -> Result<Vec<OutlineNode>, PipelineError> {
            Ok(vec![node("Intro", Some(1), vec![])])
        }
        fn rotate_pages(&self, _: &Path, _: &[u32], _: i32) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    enum OcrBehaviour {
        Text(&'static str),
        Timeout,
        Fail,
    }

    struct FakeOcr {
        behaviour: OcrBehaviour,
        calls: AtomicU32,
        last_language: std::sync::Mutex<Option<String>>,
    }

    impl FakeOcr {
        fn new(behaviour: OcrBehaviour) -> Self {
            Self {
                behaviour,
                calls: AtomicU32::new(0),
                last_language: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl OcrEngine for FakeOcr {
        async fn recognize(&self, _: &Path, language: Option<&str>) -> Result<String, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_language.lock().unwrap() = language.map(str::to_string);
            match self.behaviour {
                OcrBehaviour::Text(t) => Ok(t.to_string()),
                OcrBehaviour::Timeout => Err(ToolError::Timeout {
                    program: "tesseract".into(),
                    secs: 30,
                }),
                OcrBehaviour::Fail => Err(ToolError::Failed {
                    program: "tesseract".into(),
                    code: Some(1),
                    stderr: "bad image".into(),
                }),
            }
        }
    }

    fn node(title: &str, page: Option<u32>, children: Vec<OutlineNode>) -> OutlineNode {
        OutlineNode {
            title: title.into(),
            page,
            children,
        }
    }

    /// Writes a stub PNG and remembers where.
    struct StubRaster {
        outputs: std::sync::Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl Rasterizer for StubRaster {
        async fn render_page(
            &self,
            _: &Path,
            _: u32,
            _: f32,
            workdir: &Path,
        ) -> Result<PathBuf, ToolError> {
            let path = workdir.join("page.png");
            std::fs::write(&path, b"png").map_err(|source| ToolError::Io {
                program: "stub".into(),
                source,
            })?;
            self.outputs.lock().unwrap().push(path.clone());
            Ok(path)
        }
    }

    struct Fixture {
        pdf: ReadablePdf,
        raster: StubRaster,
    }

    fn fixture() -> Fixture {
        Fixture {
            pdf: ReadablePdf::for_tests(
                "doc.pdf",
                PdfInfo {
                    page_count: 1,
                    metadata: Default::default(),
                    page_sizes: Vec::new(),
                },
            ),
            raster: StubRaster {
                outputs: std::sync::Mutex::new(Vec::new()),
            },
        }
    }

    fn rendered() -> RenderedPage {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.png");
        std::fs::write(&path, b"png").unwrap();
        RenderedPage::from_file(1, path, dir)
    }

    fn request<'a>(
        fx: &'a Fixture,
        rendered: Option<&'a RenderedPage>,
        use_ocr: bool,
    ) -> TextRequest<'a> {
        TextRequest {
            pdf: &fx.pdf,
            page: 1,
            rendered,
            raster: OcrRaster {
                rasterizer: &fx.raster,
                max_dpi: 150,
                max_long_edge_px: 3507,
            },
            use_ocr,
            ocr_language: Some("deu"),
        }
    }

    #[tokio::test]
    async fn native_text_wins_and_is_cleaned() {
        let backend = Arc::new(TextBackend {
            text: Ok("  Hello\0 world \n".into()),
        });
        let ocr = FakeOcr::new(OcrBehaviour::Text("ocr"));
        let fx = fixture();
        let page = rendered();
        let text = extract_text(backend, &ocr, request(&fx, Some(&page), true)).await.unwrap();
        assert_eq!(text, "Hello world");
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_native_text_falls_back_to_ocr() {
        let backend = Arc::new(TextBackend { text: Ok(" \n ".into()) });
        let ocr = FakeOcr::new(OcrBehaviour::Text(" scanned text\n"));
        let fx = fixture();
        let page = rendered();
        let text = extract_text(backend, &ocr, request(&fx, Some(&page), true)).await.unwrap();
        assert_eq!(text, "scanned text");
        assert_eq!(ocr.last_language.lock().unwrap().as_deref(), Some("deu"));
    }

    #[tokio::test]
    async fn ocr_disabled_keeps_empty_text() {
        let backend = Arc::new(TextBackend { text: Ok(String::new()) });
        let ocr = FakeOcr::new(OcrBehaviour::Text("ocr"));
        let fx = fixture();
        let page = rendered();
        let text = extract_text(backend, &ocr, request(&fx, Some(&page), false)).await.unwrap();
        assert_eq!(text, "");
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ocr_timeout_yields_empty_text() {
        let backend = Arc::new(TextBackend { text: Ok(String::new()) });
        let ocr = FakeOcr::new(OcrBehaviour::Timeout);
        let fx = fixture();
        let page = rendered();
        let text = extract_text(backend, &ocr, request(&fx, Some(&page), true)).await.unwrap();
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn native_and_ocr_failure_is_fatal_for_page() {
        let backend = Arc::new(TextBackend {
            text: Err("broken content stream".into()),
        });
        let ocr = FakeOcr::new(OcrBehaviour::Fail);
        let fx = fixture();
        let page = rendered();
        let err = extract_text(backend, &ocr, request(&fx, Some(&page), true))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("broken content stream"), "got: {msg}");
        assert!(msg.contains("bad image"), "got: {msg}");
    }

    #[tokio::test]
    async fn unrendered_page_is_rasterised_for_ocr() {
        let backend = Arc::new(TextBackend { text: Ok(String::new()) });
        let ocr = FakeOcr::new(OcrBehaviour::Text("from the scan"));
        let fx = fixture();
        let text = extract_text(backend, &ocr, request(&fx, None, true)).await.unwrap();
        assert_eq!(text, "from the scan");
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);

        let outputs = fx.raster.outputs.lock().unwrap().clone();
        assert_eq!(outputs.len(), 1);
        assert!(!outputs[0].exists(), "scratch image left behind");
    }

    #[tokio::test]
    async fn native_text_needs_no_raster() {
        let backend = Arc::new(TextBackend { text: Ok("typed".into()) });
        let ocr = FakeOcr::new(OcrBehaviour::Text("ocr"));
        let fx = fixture();
        let text = extract_text(backend, &ocr, request(&fx, None, true)).await.unwrap();
        assert_eq!(text, "typed");
        assert!(fx.raster.outputs.lock().unwrap().is_empty());
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn outline_nested_bullets() {
        let nodes = vec![
            node("Chapter 1", Some(1), vec![node("Section 1.1", Some(2), vec![])]),
            node("Chapter\0 2", Some(4), vec![]),
        ];
        assert_eq!(
            outline_markdown(&nodes),
            "- [Chapter 1](#page-1)\n  - [Section 1.1](#page-2)\n- [Chapter 2](#page-4)\n"
        );
    }

    #[test]
    fn unresolved_entries_skipped() {
        let nodes = vec![
            node("Broken", None, vec![node("Child", Some(3), vec![])]),
            node("Ok", Some(5), vec![node("Dangling", None, vec![])]),
        ];
        assert_eq!(outline_markdown(&nodes), "- [Ok](#page-5)\n");
    }

    #[test]
    fn no_bookmarks_is_empty_outline() {
        assert_eq!(outline_markdown(&[]), "");
    }

    #[tokio::test]
    async fn outline_through_backend() {
        let backend = Arc::new(TextBackend { text: Ok(String::new()) });
        let md = extract_outline(backend, Path::new("doc.pdf")).await.unwrap();
        assert_eq!(md, "- [Intro](#page-1)\n");
    }
}
