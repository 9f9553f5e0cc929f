//! In-process fakes for the PDF engine, rasterizer, OCR engine and repair
//! tools, plus a harness wiring them into a [`Pipeline`] over memory stores.

#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_pdfindex::pipeline::extract::OcrEngine;
use edgequake_pdfindex::pipeline::pdf::{
    OpenFailure, OutlineNode, PageSize, PdfBackend, PdfInfo, PdfMetadata,
};
use edgequake_pdfindex::pipeline::render::Rasterizer;
use edgequake_pdfindex::pipeline::repair::{RepairPlan, RepairReason, RepairStrategy};
use edgequake_pdfindex::pipeline::tables::TableDetector;
use edgequake_pdfindex::{
    BlobStore, LocalWorker, MemoryBlobStore, MemoryQueue, MemoryStore, Pipeline, PipelineConfig,
    PipelineError, StoreError, ToolError, WorkerReport,
};
use image::{ImageBuffer, Rgb};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const RASTER_WIDTH: u32 = 240;
pub const RASTER_HEIGHT: u32 = 320;

// ── PDF engine ───────────────────────────────────────────────────────────

/// A PDF engine that ignores file contents.
pub struct FakePdf {
    pub pages: u32,
    pub metadata: PdfMetadata,
    /// Native text per page; missing pages get "Native text of page N".
    pub texts: HashMap<u32, String>,
    pub outline: Vec<OutlineNode>,
    /// The first `fail_opens` opens report a damaged file.
    pub fail_opens: u32,
    pub opens: AtomicU32,
    pub rotations: Mutex<Vec<(Vec<u32>, i32)>>,
}

impl FakePdf {
    pub fn new(pages: u32) -> Self {
        Self {
            pages,
            metadata: PdfMetadata::default(),
            texts: HashMap::new(),
            outline: Vec::new(),
            fail_opens: 0,
            opens: AtomicU32::new(0),
            rotations: Mutex::new(Vec::new()),
        }
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl PdfBackend for FakePdf {
    fn open(&self, _path: &Path) -> Result<PdfInfo, OpenFailure> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_opens {
            return Err(OpenFailure::Damaged {
                reason: RepairReason::Rewrite,
                detail: "xref table broken".into(),
            });
        }
        Ok(PdfInfo {
            page_count: self.pages,
            metadata: self.metadata.clone(),
            page_sizes: vec![
                PageSize {
                    width_pt: 595.0,
                    height_pt: 842.0,
                };
                self.pages as usize
            ],
        })
    }

    fn page_text(&self, _path: &Path, page: u32) -> Result<String, PipelineError> {
        Ok(self
            .texts
            .get(&page)
            .cloned()
            .unwrap_or_else(|| format!("Native text of page {page}")))
    }

    fn outline(&self, _path: &Path) -> Result<Vec<OutlineNode>, PipelineError> {
        Ok(self.outline.clone())
    }

    fn rotate_pages(&self, path: &Path, pages: &[u32], angle: i32) -> Result<(), PipelineError> {
        self.rotations
            .lock()
            .unwrap()
            .push((pages.to_vec(), angle));
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        writeln!(file, "% rotated {pages:?} by {angle}")
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        Ok(())
    }
}

// ── Rasterizer ───────────────────────────────────────────────────────────

/// Writes a white portrait PNG with a dark band across the top.
pub struct FakeRasterizer {
    pub calls: Mutex<Vec<u32>>,
    /// Pages that time out.
    pub failing: Mutex<BTreeSet<u32>>,
}

impl FakeRasterizer {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn rendered(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_on(&self, page: u32) {
        self.failing.lock().unwrap().insert(page);
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }
}

pub fn page_png() -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    ImageBuffer::from_fn(RASTER_WIDTH, RASTER_HEIGHT, |_, y| {
        if y < 20 {
            Rgb([20, 20, 20])
        } else {
            Rgb([255, 255, 255])
        }
    })
}

#[async_trait]
impl Rasterizer for FakeRasterizer {
    async fn render_page(
        &self,
        _pdf: &Path,
        page: u32,
        _dpi: f32,
        workdir: &Path,
    ) -> Result<PathBuf, ToolError> {
        self.calls.lock().unwrap().push(page);
        if self.failing.lock().unwrap().contains(&page) {
            return Err(ToolError::Timeout {
                program: "pdftoppm".into(),
                secs: 240,
            });
        }
        let path = workdir.join("page.png");
        page_png().save(&path).map_err(|e| ToolError::BadOutput {
            program: "pdftoppm".into(),
            detail: e.to_string(),
        })?;
        Ok(path)
    }
}

// ── OCR ──────────────────────────────────────────────────────────────────

pub struct FakeOcr {
    pub calls: AtomicU32,
}

impl FakeOcr {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl OcrEngine for FakeOcr {
    async fn recognize(&self, _image: &Path, _language: Option<&str>) -> Result<String, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("  recognised text\n".into())
    }
}

// ── Repair and tables ────────────────────────────────────────────────────

/// Always "repairs" by returning fixed bytes.
pub struct FakeRewrite {
    pub calls: AtomicU32,
}

#[async_trait]
impl RepairStrategy for FakeRewrite {
    fn name(&self) -> &str {
        "fake-rewrite"
    }

    async fn repair(&self, _input: &Path, _workdir: &Path) -> Result<Vec<u8>, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(b"%PDF-1.7 rewritten".to_vec())
    }
}

pub struct FailingTables;

#[async_trait]
impl TableDetector for FailingTables {
    async fn detect(&self, _pdf: &Path) -> Result<Vec<Value>, ToolError> {
        Err(ToolError::Failed {
            program: "tables".into(),
            code: Some(1),
            stderr: "cannot parse".into(),
        })
    }
}

// ── Blob store ───────────────────────────────────────────────────────────

/// Memory blobs whose next put of a chosen key fails once with an I/O error.
pub struct FlakyBlobs {
    pub inner: Arc<MemoryBlobStore>,
    fail_put: Mutex<Option<String>>,
}

impl FlakyBlobs {
    pub fn new(inner: Arc<MemoryBlobStore>) -> Self {
        Self {
            inner,
            fail_put: Mutex::new(None),
        }
    }

    /// Fail the next put whose key ends with `suffix`.
    pub fn fail_next_put(&self, suffix: &str) {
        *self.fail_put.lock().unwrap() = Some(suffix.to_string());
    }
}

#[async_trait]
impl BlobStore for FlakyBlobs {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let armed = {
            let mut fail = self.fail_put.lock().unwrap();
            let hit = fail.as_deref().is_some_and(|suffix| key.ends_with(suffix));
            if hit {
                *fail = None;
            }
            hit
        };
        if armed {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                format!("connection reset writing {key}"),
            )));
        }
        self.inner.put(key, bytes).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key).await
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

pub struct Harness {
    pub pipeline: Pipeline,
    pub records: Arc<MemoryStore>,
    pub blobs: Arc<MemoryBlobStore>,
    /// The pipeline's view of `blobs`.
    pub flaky: Arc<FlakyBlobs>,
    pub queue: Arc<MemoryQueue>,
    pub pdf: Arc<FakePdf>,
    pub raster: Arc<FakeRasterizer>,
    pub ocr: Arc<FakeOcr>,
    pub rewrite: Arc<FakeRewrite>,
}

impl Harness {
    pub fn new(pages: u32) -> Self {
        Self::with(FakePdf::new(pages), PipelineConfig::default())
    }

    pub fn with(pdf: FakePdf, config: PipelineConfig) -> Self {
        Self::with_tables(pdf, config, None)
    }

    pub fn with_tables(
        pdf: FakePdf,
        config: PipelineConfig,
        tables: Option<Arc<dyn TableDetector>>,
    ) -> Self {
        let records = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let flaky = Arc::new(FlakyBlobs::new(blobs.clone()));
        let queue = Arc::new(MemoryQueue::new());
        let pdf = Arc::new(pdf);
        let raster = Arc::new(FakeRasterizer::new());
        let ocr = Arc::new(FakeOcr::new());
        let rewrite = Arc::new(FakeRewrite {
            calls: AtomicU32::new(0),
        });
        let pipeline = Pipeline::builder()
            .config(config)
            .records(records.clone())
            .blobs(flaky.clone())
            .dispatcher(queue.clone())
            .pdf_backend(pdf.clone())
            .rasterizer(raster.clone())
            .ocr(ocr.clone())
            .table_detector(tables)
            .repair_plan(RepairPlan {
                rewrite: vec![rewrite.clone() as Arc<dyn RepairStrategy>],
                decrypt: Vec::new(),
            })
            .build()
            .unwrap();
        Self {
            pipeline,
            records,
            blobs,
            flaky,
            queue,
            pdf,
            raster,
            ocr,
            rewrite,
        }
    }

    /// Store an upload named `report.pdf` and return its id.
    pub async fn upload(&self) -> Uuid {
        self.pipeline
            .ingest(b"%PDF-1.7 fake upload".to_vec(), "report.pdf", None)
            .await
            .unwrap()
            .document
            .id
    }

    pub async fn drain(&self) -> WorkerReport {
        LocalWorker::new(&self.pipeline, &self.queue)
            .run_until_idle()
            .await
    }
}
