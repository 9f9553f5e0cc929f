//! Bounded PDF repair protocol.
//!
//! Opening a PDF is a small state machine:
//!
//! ```text
//!            ┌────────────── readable ──────────────┐
//!   open ──► probe ── Damaged{reason} ──► repair ──┘ (≤ MAX_REPAIR_ATTEMPTS)
//!              │                             │
//!              └── Engine error ──► fail     └── all strategies fail ──► fail
//! ```
//!
//! The failure reason ([`RepairReason`]) selects an ordered list of
//! [`RepairStrategy`]s from the [`RepairPlan`]; the first strategy that
//! produces output wins. The input file is never modified: on the first
//! failure it is copied into a scratch directory and every repair mutates
//! that copy.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, ToolError};
use crate::pipeline::pdf::{blocking, OpenFailure, PdfBackend, PdfInfo};
use crate::pipeline::tools::{run_tool_for_file, scratch_dir, ToolInvocation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{info, warn};

/// Repairs attempted before the file is declared unreadable.
pub const MAX_REPAIR_ATTEMPTS: u32 = 2;

/// Failure classification driving strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairReason {
    /// Structural damage: bad xref/trailer, recursion, malformed numbers.
    Rewrite,
    /// The document is encrypted or the parser hit an encryption error.
    Decrypt,
}

impl fmt::Display for RepairReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rewrite => "rewrite",
            Self::Decrypt => "decrypt",
        })
    }
}

/// One recovery function: read `input`, return repaired PDF bytes.
#[async_trait]
pub trait RepairStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn repair(&self, input: &Path, workdir: &Path) -> Result<Vec<u8>, ToolError>;
}

/// Strategy table: failure reason → ordered recovery functions.
#[derive(Clone)]
pub struct RepairPlan {
    pub rewrite: Vec<Arc<dyn RepairStrategy>>,
    pub decrypt: Vec<Arc<dyn RepairStrategy>>,
}

impl RepairPlan {
    /// Ghostscript then pdftocairo for rewrites, qpdf for decryption.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let timeout = config.page_timeout();
        let tools = &config.tools;
        Self {
            rewrite: vec![
                Arc::new(GhostscriptRewrite::new(&tools.ghostscript, timeout)),
                Arc::new(CairoRewrite::new(&tools.cairo_rewriter, timeout)),
            ],
            decrypt: vec![Arc::new(QpdfDecrypt::new(&tools.decryptor, timeout))],
        }
    }

    pub fn strategies(&self, reason: RepairReason) -> &[Arc<dyn RepairStrategy>] {
        match reason {
            RepairReason::Rewrite => &self.rewrite,
            RepairReason::Decrypt => &self.decrypt,
        }
    }
}

impl fmt::Debug for RepairPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |v: &[Arc<dyn RepairStrategy>]| -> Vec<String> {
            v.iter().map(|s| s.name().to_string()).collect()
        };
        f.debug_struct("RepairPlan")
            .field("rewrite", &names(&self.rewrite))
            .field("decrypt", &names(&self.decrypt))
            .finish()
    }
}

/// A PDF that opened structurally, possibly from a repaired scratch copy.
///
/// The scratch directory lives as long as this handle.
#[derive(Debug)]
pub struct ReadablePdf {
    path: PathBuf,
    pub info: PdfInfo,
    pub repair_attempts: u32,
    _scratch: Option<TempDir>,
}

impl ReadablePdf {
    /// Path to the readable bytes: the input, or the repaired scratch copy.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn was_repaired(&self) -> bool {
        self.repair_attempts > 0
    }

    pub fn page_count(&self) -> u32 {
        self.info.page_count
    }
}

#[cfg(test)]
impl ReadablePdf {
    pub(crate) fn for_tests(path: impl Into<PathBuf>, info: PdfInfo) -> Self {
        Self {
            path: path.into(),
            info,
            repair_attempts: 0,
            _scratch: None,
        }
    }
}

/// Open `path`, repairing a scratch copy when needed.
pub async fn open_readable(
    backend: Arc<dyn PdfBackend>,
    plan: &RepairPlan,
    path: &Path,
) -> Result<ReadablePdf, PipelineError> {
    let mut current = path.to_path_buf();
    let mut scratch: Option<TempDir> = None;
    let mut attempts = 0u32;

    loop {
        let probe_path = current.clone();
        let engine = Arc::clone(&backend);
        let probe = blocking(move || Ok(engine.open(&probe_path))).await?;

        let (reason, detail) = match probe {
            Ok(info) => {
                if attempts > 0 {
                    info!(path = %path.display(), attempts, "PDF readable after repair");
                }
                return Ok(ReadablePdf {
                    path: current,
                    info,
                    repair_attempts: attempts,
                    _scratch: scratch,
                });
            }
            Err(OpenFailure::Engine(detail)) => {
                return Err(PipelineError::PdfEngine {
                    path: path.to_path_buf(),
                    detail,
                })
            }
            Err(OpenFailure::Damaged { reason, detail }) => (reason, detail),
        };

        if attempts >= MAX_REPAIR_ATTEMPTS {
            return Err(PipelineError::RepairExhausted {
                path: path.to_path_buf(),
                attempts,
                reason,
                detail,
            });
        }

        if scratch.is_none() {
            let dir = scratch_dir("pdfindex-repair-")?;
            let copy = dir.path().join("document.pdf");
            tokio::fs::copy(path, &copy)
                .await
                .map_err(|e| PipelineError::io(&copy, e))?;
            current = copy;
            scratch = Some(dir);
        }
        attempts += 1;
        warn!(path = %path.display(), %reason, %detail, attempt = attempts, "PDF needs repair");

        let workdir = scratch
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| PipelineError::Internal("repair scratch directory missing".into()))?;
        let repaired = apply_strategies(plan.strategies(reason), &current, &workdir)
            .await
            .map_err(|source| PipelineError::RepairFailed {
                path: path.to_path_buf(),
                reason,
                source,
            })?;
        tokio::fs::write(&current, repaired)
            .await
            .map_err(|e| PipelineError::io(&current, e))?;
    }
}

/// First strategy to succeed wins; otherwise the last error surfaces.
async fn apply_strategies(
    strategies: &[Arc<dyn RepairStrategy>],
    input: &Path,
    workdir: &Path,
) -> Result<Vec<u8>, ToolError> {
    let mut last_error = None;
    for strategy in strategies {
        match strategy.repair(input, workdir).await {
            Ok(bytes) => {
                info!(strategy = strategy.name(), bytes = bytes.len(), "Repair strategy succeeded");
                return Ok(bytes);
            }
            Err(e) => {
                warn!(strategy = strategy.name(), error = %e, "Repair strategy failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| ToolError::BadOutput {
        program: "repair".into(),
        detail: "no repair strategy configured".into(),
    }))
}

// ── Strategies ───────────────────────────────────────────────────────────

/// `gs -o out -sDEVICE=pdfwrite -dPDFSETTINGS=/prepress in`
#[derive(Debug, Clone)]
pub struct GhostscriptRewrite {
    program: String,
    timeout: Duration,
}

impl GhostscriptRewrite {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RepairStrategy for GhostscriptRewrite {
    fn name(&self) -> &str {
        "ghostscript-rewrite"
    }

    async fn repair(&self, input: &Path, workdir: &Path) -> Result<Vec<u8>, ToolError> {
        let home = scratch_dir("pdfindex-gs-")?;
        let output = workdir.join("gs-output.pdf");
        let invocation = ToolInvocation::new(&self.program, self.timeout)
            .arg("-o")
            .arg(&output)
            .args(["-sDEVICE=pdfwrite", "-dPDFSETTINGS=/prepress"])
            .arg(input);
        let result = run_tool_for_file(&invocation, home.path(), &output).await;
        let _ = tokio::fs::remove_file(&output).await;
        result
    }
}

/// `pdftocairo -pdf in out`
#[derive(Debug, Clone)]
pub struct CairoRewrite {
    program: String,
    timeout: Duration,
}

impl CairoRewrite {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RepairStrategy for CairoRewrite {
    fn name(&self) -> &str {
        "cairo-rewrite"
    }

    async fn repair(&self, input: &Path, workdir: &Path) -> Result<Vec<u8>, ToolError> {
        let home = scratch_dir("pdfindex-cairo-")?;
        let output = workdir.join("cairo-output.pdf");
        let invocation = ToolInvocation::new(&self.program, self.timeout)
            .arg("-pdf")
            .arg(input)
            .arg(&output);
        let result = run_tool_for_file(&invocation, home.path(), &output).await;
        let _ = tokio::fs::remove_file(&output).await;
        result
    }
}

/// `qpdf --decrypt in out`; exit 3 means "succeeded with warnings".
#[derive(Debug, Clone)]
pub struct QpdfDecrypt {
    program: String,
    timeout: Duration,
}

impl QpdfDecrypt {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RepairStrategy for QpdfDecrypt {
    fn name(&self) -> &str {
        "qpdf-decrypt"
    }

    async fn repair(&self, input: &Path, workdir: &Path) -> Result<Vec<u8>, ToolError> {
        let home = scratch_dir("pdfindex-qpdf-")?;
        let output = workdir.join("qpdf-output.pdf");
        let invocation = ToolInvocation::new(&self.program, self.timeout)
            .arg("--decrypt")
            .arg(input)
            .arg(&output)
            .success_codes(&[0, 3]);
        let result = run_tool_for_file(&invocation, home.path(), &output).await;
        let _ = tokio::fs::remove_file(&output).await;
        result
    }
}
