//! Pipeline stages used by the orchestrator and the side jobs.
//!
//! Each submodule owns one concern and one external collaborator, so tests
//! can swap a real tool for a fake without touching the other stages.
//!
//! ## Data Flow
//!
//! ```text
//! stored PDF ──▶ repair ──▶ render ──▶ extract ──▶ imaging
//!               (gs/qpdf)  (pdftoppm) (pdfium/OCR) (sizes, crops)
//! ```
//!
//! 1. [`tools`]   — bounded subprocess calls (timeout, private HOME, exit codes)
//! 2. [`pdf`]     — structural open, metadata, native text, bookmarks, rotation
//! 3. [`repair`]  — bounded rewrite/decrypt state machine over a scratch copy
//! 4. [`render`]  — DPI selection and per-page rasterisation
//! 5. [`extract`] — native text with OCR fallback; outline markdown
//! 6. [`imaging`] — scaled variants, rotation, highlights, alternate encodings
//! 7. [`tables`]  — best-effort table detection

pub mod extract;
pub mod imaging;
pub mod pdf;
pub mod render;
pub mod repair;
pub mod tables;
pub mod tools;
