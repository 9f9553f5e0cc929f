//! CLI binary for edgequake-pdfindex.
//!
//! Runs the whole pipeline in-process: an in-memory record store and queue,
//! blobs written under the output directory, and a local worker draining
//! the queue until the document is ready.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_pdfindex::pipeline::extract::extract_outline;
use edgequake_pdfindex::pipeline::pdf::{blocking, PdfBackend, PdfiumBackend};
use edgequake_pdfindex::pipeline::render::{render_pages, PdftoppmRasterizer};
use edgequake_pdfindex::pipeline::repair::{open_readable, RepairPlan};
use edgequake_pdfindex::{
    AltFormat, FsBlobStore, LocalWorker, MemoryQueue, MemoryStore, Pipeline, PipelineConfig,
    PipelineProgressCallback, ProgressCallback, RecordStore, ToolCommand,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ── ANSI colour helpers ──────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────

/// Spinner until the page count is known, then a page bar.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicU32,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner);
        bar.set_prefix("Opening");
        bar.set_message("Reading PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicU32::new(0),
        })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_document_opened(&self, _document_id: Uuid, total_pages: u32) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_length(u64::from(total_pages));
        self.bar.set_style(style);
        self.bar.set_prefix("Indexing");
        self.bar.reset_eta();
    }

    fn on_chunk_start(&self, _document_id: Uuid, pages: &[u32], _total: u32) {
        if let (Some(first), Some(last)) = (pages.first(), pages.last()) {
            self.bar.set_message(format!("pages {first}-{last}"));
        }
    }

    fn on_page_complete(&self, _document_id: Uuid, page: u32, total: u32) {
        self.bar
            .println(format!("  {} Page {:>3}/{:<3}", green("✓"), page, total));
        self.bar.inc(1);
    }

    fn on_page_skipped(&self, _document_id: Uuid, _page: u32) {
        self.bar.inc(1);
    }

    fn on_page_error(&self, _document_id: Uuid, page: u32, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = error.chars().take(100).collect();
        self.bar
            .println(format!("  {} Page {:>3}  {}", red("✗"), page, red(&msg)));
    }

    fn on_document_ready(&self, _document_id: Uuid, total_pages: u32) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} pages indexed",
            green("✔"),
            bold(&total_pages.to_string())
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Index a PDF: page images, text, outline, webp variants
  pdfindex process report.pdf --out ./report

  # Only the first chunk of pages per task, no OCR
  pdfindex process scan.pdf --out ./scan --chunk-limit 4 --no-ocr

  # Page count, metadata and outline
  pdfindex inspect report.pdf

  # Rotate pages 2 and 3 clockwise into a new file
  pdfindex rotate report.pdf --pages 2,3 --angle 90 --out rotated.pdf

  # Render selected pages as PNG
  pdfindex render report.pdf --pages 1-3 --out ./pages

EXTERNAL TOOLS:
  pdftoppm     page rasterisation (poppler-utils)
  tesseract    OCR for pages without native text
  gs           rewrite of damaged PDFs (ghostscript)
  pdftocairo   second rewrite strategy (poppler-utils)
  qpdf         decryption of encrypted PDFs

ENVIRONMENT VARIABLES:
  PDFINDEX_PDFIUM_LIB     Path to libpdfium (file or directory)
  PDFINDEX_TESSDATA_DIR   Tesseract language data directory
  RUST_LOG                Log filter, e.g. edgequake_pdfindex=debug
"#;

/// Index PDF documents: page images, text, outline and derived formats.
#[derive(Parser, Debug)]
#[command(
    name = "pdfindex",
    version,
    about = "Index PDF documents into page images, text and outlines",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to libpdfium (file or directory).
    #[arg(long, global = true, env = "PDFINDEX_PDFIUM_LIB")]
    pdfium_lib: Option<PathBuf>,

    /// Per-invocation timeout for rasterizer and repair tools, in seconds.
    #[arg(long, global = true, env = "PDFINDEX_PAGE_TIMEOUT", default_value_t = 240)]
    page_timeout: u64,

    /// Upper bound on render DPI.
    #[arg(long, global = true, env = "PDFINDEX_MAX_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(36..=1200))]
    max_dpi: u32,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDFINDEX_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDFINDEX_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline and write images, document.json and pages.json.
    Process(ProcessArgs),
    /// Print page count, metadata and outline.
    Inspect {
        pdf: PathBuf,
        /// Output JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Rotate pages of a PDF into a new file.
    Rotate {
        pdf: PathBuf,
        /// Pages to rotate: 5, 3-15 or 1,3,5.
        #[arg(long)]
        pages: String,
        /// Clockwise angle, a multiple of 90.
        #[arg(long, allow_hyphen_values = true)]
        angle: i32,
        #[arg(long)]
        out: PathBuf,
    },
    /// Render pages as PNG files.
    Render {
        pdf: PathBuf,
        /// Pages to render: all, 5, 3-15 or 1,3,5.
        #[arg(long, default_value = "all")]
        pages: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ProcessArgs {
    pdf: PathBuf,

    /// Output directory for blobs and JSON records.
    #[arg(long, env = "PDFINDEX_OUT")]
    out: PathBuf,

    /// Pages per ProcessPages task.
    #[arg(long, env = "PDFINDEX_CHUNK_LIMIT", default_value_t = 10)]
    chunk_limit: usize,

    /// Disable OCR fallback.
    #[arg(long, env = "PDFINDEX_NO_OCR")]
    no_ocr: bool,

    /// Document language (drives OCR language), e.g. en, de.
    #[arg(long, env = "PDFINDEX_LANGUAGE")]
    language: Option<String>,

    /// Tesseract language data directory.
    #[arg(long, env = "PDFINDEX_TESSDATA_DIR")]
    tessdata_dir: Option<PathBuf>,

    /// Alternate formats to generate: webp, jpeg (comma separated, empty for none).
    #[arg(long, env = "PDFINDEX_FORMATS", default_value = "webp", value_delimiter = ',')]
    formats: Vec<String>,

    /// Table detector command; receives the PDF path as last argument.
    #[arg(long, env = "PDFINDEX_TABLE_DETECTOR")]
    table_detector: Option<String>,

    /// Disable the progress bar.
    #[arg(long, env = "PDFINDEX_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the user-facing feedback; library INFO logs
    // would tear it.
    let progress_active = matches!(&cli.command, Command::Process(a) if !a.no_progress);
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || progress_active {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Process(args) => process(&cli, args).await,
        Command::Inspect { pdf, json } => inspect(&cli, pdf, *json).await,
        Command::Rotate {
            pdf,
            pages,
            angle,
            out,
        } => rotate(&cli, pdf, pages, *angle, out).await,
        Command::Render { pdf, pages, out } => render(&cli, pdf, pages, out).await,
    }
}

// ── Commands ─────────────────────────────────────────────────────────────

async fn process(cli: &Cli, args: &ProcessArgs) -> Result<()> {
    let config = build_config(cli, Some(args))?;
    let bytes = tokio::fs::read(&args.pdf)
        .await
        .with_context(|| format!("Failed to read {}", args.pdf.display()))?;
    let filename = args
        .pdf
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string());

    tokio::fs::create_dir_all(&args.out)
        .await
        .with_context(|| format!("Failed to create {}", args.out.display()))?;

    let records = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let mut builder = Pipeline::builder()
        .config(config)
        .records(records.clone())
        .blobs(Arc::new(FsBlobStore::new(&args.out)))
        .dispatcher(queue.clone());
    if !cli.quiet && !args.no_progress {
        builder = builder.progress_callback(CliProgressCallback::new() as ProgressCallback);
    }
    let pipeline = builder.build().context("Invalid configuration")?;

    let upload = pipeline
        .ingest(bytes, &filename, args.language.clone())
        .await
        .context("Failed to store upload")?;
    let report = LocalWorker::new(&pipeline, &queue).run_until_idle().await;

    // ── Write records ────────────────────────────────────────────────────
    let id = upload.document.id;
    let doc = records
        .get_document(id)
        .await?
        .context("Document record vanished")?;
    let pages = records.list_pages(id).await?;
    write_json(&args.out.join("document.json"), &doc).await?;
    write_json(&args.out.join("pages.json"), &pages).await?;

    for (task, error) in &report.failed {
        eprintln!("{} {} failed: {}", red("✘"), task.name(), error);
    }
    if doc.pending {
        bail!(
            "Document still pending: {}/{} pages done",
            pages.iter().filter(|p| !p.pending).count(),
            doc.num_pages
        );
    }
    if !cli.quiet {
        eprintln!(
            "{}  {}  {} pages  →  {}",
            green("✔"),
            bold(&doc.title),
            doc.num_pages,
            bold(&args.out.display().to_string()),
        );
    }
    Ok(())
}

async fn inspect(cli: &Cli, pdf: &Path, json: bool) -> Result<()> {
    let config = build_config(cli, None)?;
    let backend: Arc<dyn PdfBackend> =
        Arc::new(PdfiumBackend::new(config.pdfium_library_path.clone()));
    let readable = open_readable(Arc::clone(&backend), &RepairPlan::from_config(&config), pdf)
        .await
        .context("Failed to open PDF")?;
    let outline = extract_outline(backend, readable.path())
        .await
        .unwrap_or_default();
    let info = &readable.info;

    if json {
        let value = serde_json::json!({
            "file": pdf.display().to_string(),
            "pages": info.page_count,
            "repair_attempts": readable.repair_attempts,
            "metadata": info.metadata.to_properties(),
            "outline": outline,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("Failed to serialise metadata")?
        );
        return Ok(());
    }

    println!("File:         {}", pdf.display());
    println!("Pages:        {}", info.page_count);
    if readable.was_repaired() {
        println!("Repaired:     {} attempt(s)", readable.repair_attempts);
    }
    for (key, value) in info.metadata.to_properties() {
        if let Some(s) = value.as_str() {
            println!("{:<13} {}", format!("{}:", capitalise(&key)), s);
        }
    }
    if let Some(size) = info.page_size(1) {
        println!(
            "Page 1:       {:.0} × {:.0} pt",
            size.width_pt, size.height_pt
        );
    }
    if !outline.is_empty() {
        println!("\nOutline:\n{outline}");
    }
    Ok(())
}

async fn rotate(cli: &Cli, pdf: &Path, pages: &str, angle: i32, out: &Path) -> Result<()> {
    if angle % 90 != 0 {
        bail!("Angle must be a multiple of 90 (got {angle})");
    }
    let config = build_config(cli, None)?;
    let backend = PdfiumBackend::new(config.pdfium_library_path.clone());
    let total = {
        let probe = backend.clone();
        let path = pdf.to_path_buf();
        blocking(move || {
            probe
                .open(&path)
                .map(|info| info.page_count)
                .map_err(|e| edgequake_pdfindex::PipelineError::Internal(format!("{e:?}")))
        })
        .await
        .context("Failed to open PDF")?
    };
    let pages = parse_pages(pages, total)?;

    tokio::fs::copy(pdf, out)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;
    let path = out.to_path_buf();
    let targets = pages.clone();
    blocking(move || backend.rotate_pages(&path, &targets, angle))
        .await
        .context("Rotation failed")?;

    if !cli.quiet {
        eprintln!(
            "{} rotated pages {:?} by {}°  →  {}",
            green("✔"),
            pages,
            angle,
            bold(&out.display().to_string())
        );
    }
    Ok(())
}

async fn render(cli: &Cli, pdf: &Path, pages: &str, out: &Path) -> Result<()> {
    let config = build_config(cli, None)?;
    let backend: Arc<dyn PdfBackend> =
        Arc::new(PdfiumBackend::new(config.pdfium_library_path.clone()));
    let readable = open_readable(backend, &RepairPlan::from_config(&config), pdf)
        .await
        .context("Failed to open PDF")?;
    let pages = parse_pages(pages, readable.page_count())?;
    let rasterizer = PdftoppmRasterizer::new(&config.tools.rasterizer, config.page_timeout());

    tokio::fs::create_dir_all(out)
        .await
        .with_context(|| format!("Failed to create {}", out.display()))?;

    let mut stream = render_pages(
        &readable,
        pages,
        &rasterizer,
        config.max_dpi,
        config.max_long_edge_px,
    );
    while let Some(rendered) = stream.next().await {
        let rendered = rendered.context("Render failed")?;
        let target = out.join(format!("page-{}.png", rendered.number));
        tokio::fs::copy(&rendered.path, &target)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;
        if !cli.quiet {
            eprintln!(
                "  {} Page {:>3}  {}",
                green("✓"),
                rendered.number,
                dim(&format!("{:.0} dpi", rendered.dpi))
            );
        }
    }
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, args: Option<&ProcessArgs>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .max_dpi(cli.max_dpi)
        .page_timeout_secs(cli.page_timeout);
    if let Some(lib) = &cli.pdfium_lib {
        builder = builder.pdfium_library_path(lib);
    }

    if let Some(args) = args {
        let formats = args
            .formats
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(|f| f.parse::<AltFormat>().map_err(anyhow::Error::msg))
            .collect::<Result<Vec<_>>>()?;
        builder = builder
            .chunk_limit(args.chunk_limit)
            .ocr_enabled(!args.no_ocr)
            .alternate_formats(formats);
        if let Some(dir) = &args.tessdata_dir {
            builder = builder.tessdata_dir(dir);
        }
        if let Some(cmd) = &args.table_detector {
            let command: ToolCommand = cmd.parse().map_err(anyhow::Error::msg)?;
            builder = builder.table_detector(command);
        }
    }

    builder.build().context("Invalid configuration")
}

/// Parse `all`, `5`, `3-15` or `1,3,5` against a page count.
fn parse_pages(s: &str, total: u32) -> Result<Vec<u32>> {
    let s = s.trim().to_lowercase();
    if s == "all" {
        return Ok((1..=total).collect());
    }

    let mut pages = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start.trim().parse().context("Invalid start page in range")?;
            let end: u32 = end.trim().parse().context("Invalid end page in range")?;
            if start > end {
                bail!("Invalid page range '{start}-{end}': start must be <= end");
            }
            pages.extend(start..=end);
        } else {
            pages.push(
                part.parse()
                    .with_context(|| format!("Invalid page number: '{part}'"))?,
            );
        }
    }

    if let Some(&bad) = pages.iter().find(|&&p| p == 0 || p > total) {
        bail!("Page {bad} is out of range (document has {total} pages)");
    }
    pages.sort_unstable();
    pages.dedup();
    Ok(pages)
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("Failed to serialise records")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}
