//! Side jobs that run after (or beside) page processing.
//!
//! Each job re-reads its inputs from storage and can be retried as a whole:
//!
//! * [`Pipeline::save_annotation`] — crop + highlight cache for annotations
//! * [`Pipeline::rotate_pages`] — PDF page objects and stored rasters together
//! * [`Pipeline::convert_format`] — alternate encodings behind a tri-state marker
//! * [`Pipeline::detect_tables`] — best-effort table detection

use crate::config::AltFormat;
use crate::error::PipelineError;
use crate::ingest::content_hash;
use crate::model::{
    alternate_key, Document, FormatMarker, ImageSize, PageAnnotation, Rect, ROTATION_KEY,
    TABLES_KEY,
};
use crate::orchestrator::{OpenedPdf, Pipeline};
use crate::pipeline::imaging;
use crate::pipeline::pdf::blocking;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inputs an annotation crop is a pure function of.
#[derive(Serialize)]
struct CropInputs<'a> {
    page_image: String,
    rect: Rect,
    highlight: &'a str,
}

impl Pipeline {
    // ── Annotations ──────────────────────────────────────────────────────

    /// Persist an annotation, regenerating its crop image first when the
    /// rectangle, highlights or page image changed since the cached crop.
    ///
    /// The record is only written after the new crop is stored, so a failure
    /// never leaves a record pointing at a stale or half-written image.
    /// Without a rectangle or a page there is nothing to crop: the old crop
    /// is dropped and the record saved as is.
    pub async fn save_annotation(
        &self,
        mut annotation: PageAnnotation,
    ) -> Result<PageAnnotation, PipelineError> {
        let Some((rect, number)) = annotation.rect().zip(annotation.page_number) else {
            if let Some(old) = annotation.image.take() {
                self.blobs.delete(&old).await?;
            }
            annotation.image_fingerprint = None;
            self.records.save_annotation(&annotation).await?;
            return Ok(annotation);
        };

        let page = self
            .records
            .get_page(annotation.document_id, number)
            .await?
            .ok_or(PipelineError::PageNotFound {
                id: annotation.document_id,
                page: number,
            })?;
        let original_key = page.images.get(ImageSize::Original).ok_or_else(|| {
            PipelineError::InvalidAnnotation(format!("page {number} has no image yet"))
        })?;
        let page_png = self.blobs.get(original_key).await?;

        let highlights = annotation
            .highlights()
            .map_err(|e| PipelineError::InvalidAnnotation(format!("highlight list: {e}")))?;
        let fingerprint = crop_fingerprint(&page_png, rect, annotation.highlight.as_deref())?;

        let cached = annotation.image.is_some()
            && annotation.image_fingerprint.as_deref() == Some(fingerprint.as_str());
        if !cached {
            let crop = blocking(move || imaging::render_annotation(&page_png, rect, &highlights))
                .await?;
            let key = annotation.image_key();
            self.blobs.put(&key, crop).await?;
            debug!(annotation_id = %annotation.id, %key, "Annotation crop stored");
            annotation.image = Some(key);
            annotation.image_fingerprint = Some(fingerprint);
        }

        self.records.save_annotation(&annotation).await?;
        Ok(annotation)
    }

    /// Recompute a stored annotation's crop, e.g. after its page was
    /// re-rendered or rotated.
    pub async fn refresh_annotation(&self, id: Uuid) -> Result<PageAnnotation, PipelineError> {
        let annotation = self
            .records
            .get_annotation(id)
            .await?
            .ok_or(PipelineError::AnnotationNotFound { id })?;
        self.save_annotation(annotation).await
    }

    // ── Rotation ─────────────────────────────────────────────────────────

    /// Rotate pages of the stored PDF and their stored rasters by `angle`.
    ///
    /// The PDF is rewritten first; the four images of each affected page are
    /// rotated right after the write succeeds, in the same job. Pages that
    /// have not been rendered yet are left alone: they will render from the
    /// rotated PDF.
    ///
    /// Before the first write the job records the request and fingerprints
    /// of the bytes it will turn under `_rotation`. A retry of an interrupted job resumes it: a PDF or page
    /// image whose bytes no longer match the recorded fingerprint is already
    /// rotated and is not turned again. A different request finishes the
    /// interrupted one first.
    pub async fn rotate_pages(
        &self,
        id: Uuid,
        page_numbers: &[u32],
        angle: i32,
    ) -> Result<(), PipelineError> {
        if angle % 90 != 0 {
            return Err(PipelineError::InvalidAngle(angle));
        }
        let pages: Vec<u32> = page_numbers
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let angle = angle.rem_euclid(360);
        if pages.is_empty() || angle == 0 {
            return Ok(());
        }

        let mut doc = self.load_document(id).await?;
        if let Some(pending) = PendingRotation::from_document(&doc)? {
            let same = pending.pages == pages && pending.angle == angle;
            info!(
                document_id = %id,
                pages = ?pending.pages,
                angle = pending.angle,
                "Resuming interrupted rotation"
            );
            self.finish_rotation(id, &pending, None).await?;
            if same {
                return Ok(());
            }
            doc = self.load_document(id).await?;
        }

        let opened = self.open_document(&doc).await?;
        let total = opened.page_count();
        if let Some(&bad) = pages.iter().find(|&&n| n == 0 || n > total) {
            return Err(PipelineError::PageOutOfRange { page: bad, total });
        }

        let mut page_sources = BTreeMap::new();
        for &number in &pages {
            let Some(page) = self.records.get_page(id, number).await? else {
                continue;
            };
            let Some(key) = page.images.get(ImageSize::Original) else {
                debug!(document_id = %id, page = number, "Page not rendered yet, nothing to rotate");
                continue;
            };
            page_sources.insert(number, content_hash(&self.blobs.get(key).await?));
        }
        let plan = PendingRotation {
            pages,
            angle,
            pdf_source: opened.stored_sha256.clone(),
            page_sources,
        };
        doc.properties.insert(ROTATION_KEY.to_string(), plan.to_value()?);
        doc.touch();
        self.records.save_document(&doc).await?;

        self.finish_rotation(id, &plan, Some(opened)).await
    }

    async fn finish_rotation(
        &self,
        id: Uuid,
        plan: &PendingRotation,
        opened: Option<OpenedPdf>,
    ) -> Result<(), PipelineError> {
        let angle = plan.angle;

        // ── Step 1: PDF page objects ─────────────────────────────────────
        let opened = match opened {
            Some(opened) => opened,
            None => {
                let doc = self.load_document(id).await?;
                self.open_document(&doc).await?
            }
        };
        if opened.stored_sha256 == plan.pdf_source {
            let doc = self.load_document(id).await?;
            let file_key = doc.file_key.ok_or(PipelineError::NoFile { id })?;
            let path = opened.path().to_path_buf();
            let backend = Arc::clone(&self.pdf);
            let targets = plan.pages.clone();
            blocking(move || backend.rotate_pages(&path, &targets, angle)).await?;
            let bytes = tokio::fs::read(opened.path())
                .await
                .map_err(|e| PipelineError::io(opened.path(), e))?;
            self.blobs.put(&file_key, bytes).await?;
            info!(document_id = %id, pages = ?plan.pages, angle, "Rotated PDF pages");
        } else {
            debug!(document_id = %id, "Stored PDF already rotated");
        }
        drop(opened);

        // ── Step 2: Stored rasters ───────────────────────────────────────
        let mut rotated = Vec::new();
        for (&number, source) in &plan.page_sources {
            let Some(mut page) = self.records.get_page(id, number).await? else {
                continue;
            };
            let Some(original_key) = page.images.get(ImageSize::Original).map(str::to_string)
            else {
                continue;
            };
            let png = self.blobs.get(&original_key).await?;
            let turn = if content_hash(&png) == *source { angle } else { 0 };
            if turn == 0 {
                debug!(document_id = %id, page = number, "Original already rotated");
            }
            let (width, height, images) = blocking(move || {
                let img = imaging::decode(&png)?;
                let mut images = Vec::new();
                let img = if turn == 0 {
                    img
                } else {
                    let img = imaging::rotate(&img, turn)?;
                    images.push((ImageSize::Original, imaging::encode_png(&img)?));
                    img
                };
                images.extend(imaging::scaled_variants(&img)?);
                Ok((img.width(), img.height(), images))
            })
            .await?;
            self.store_page_images(&mut page, images).await?;
            page.width = Some(width);
            page.height = Some(height);
            self.records.upsert_page(&page).await?;
            rotated.push(number);
        }

        // ── Step 3: Alternate encodings of the new rasters ───────────────
        if !rotated.is_empty() {
            for format in self.config.alternate_formats.iter().copied() {
                self.enqueue_conversion(id, format, Some(rotated.clone()))
                    .await?;
            }
        }

        let mut doc = self.load_document(id).await?;
        doc.properties.remove(ROTATION_KEY);
        doc.touch();
        self.records.save_document(&doc).await?;
        Ok(())
    }

    // ── Alternate formats ────────────────────────────────────────────────

    /// Write an alternate encoding next to every stored raster.
    ///
    /// Whole-document conversions (`pages == None`) are guarded by the
    /// `_format_<name>` marker: skipped unless unset (or while the document
    /// is still pending), flipped to in-progress before any work, and to done
    /// at the end. Conversions for specific
    /// pages always run and leave the marker alone.
    pub async fn convert_format(
        &self,
        id: Uuid,
        format: AltFormat,
        pages: Option<&[u32]>,
    ) -> Result<(), PipelineError> {
        let mut doc = self.load_document(id).await?;
        if pages.is_none() {
            if doc.pending {
                debug!(document_id = %id, %format, "Document not ready, conversion deferred");
                return Ok(());
            }
            match doc.format_marker(format) {
                FormatMarker::Unset => {}
                marker => {
                    debug!(document_id = %id, %format, ?marker, "Conversion already claimed");
                    return Ok(());
                }
            }
            doc.set_format_marker(format, FormatMarker::InProgress);
            doc.touch();
            self.records.save_document(&doc).await?;
        }

        let wanted: Option<BTreeSet<u32>> = pages.map(|p| p.iter().copied().collect());
        let mut converted = 0usize;
        for page in self.records.list_pages(id).await? {
            if wanted.as_ref().is_some_and(|w| !w.contains(&page.number)) {
                continue;
            }
            for size in ImageSize::ALL {
                let Some(key) = page.images.get(size) else {
                    continue;
                };
                let png = self.blobs.get(key).await?;
                let encoded = blocking(move || Ok(imaging::encode_alternate(&png, format)?)).await?;
                self.blobs.put(&alternate_key(key, format), encoded).await?;
                converted += 1;
            }
        }

        if pages.is_none() {
            let mut doc = self.load_document(id).await?;
            doc.set_format_marker(format, FormatMarker::Done);
            doc.touch();
            self.records.save_document(&doc).await?;
        }
        info!(document_id = %id, %format, images = converted, "Alternate format written");
        Ok(())
    }

    // ── Tables ───────────────────────────────────────────────────────────

    /// Re-run table detection and store the result under `_tables`.
    ///
    /// Never fails because of the detector itself; an unreadable PDF is
    /// recorded as "no tables".
    pub async fn detect_tables(&self, id: Uuid) -> Result<(), PipelineError> {
        let mut doc = self.load_document(id).await?;
        let tables = if self.tables.is_none() {
            serde_json::Value::Null
        } else {
            match self.open_document(&doc).await {
                Ok(opened) => self.detect_tables_value(opened.path()).await,
                Err(e) => {
                    warn!(document_id = %id, error = %e, "Cannot open PDF for table detection");
                    serde_json::Value::Array(Vec::new())
                }
            }
        };
        doc.properties.insert(TABLES_KEY.to_string(), tables);
        doc.touch();
        self.records.save_document(&doc).await?;
        Ok(())
    }
}

/// A rotation recorded before its first write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PendingRotation {
    pages: Vec<u32>,
    /// Clockwise, in `90..360`.
    angle: i32,
    /// Hash of the stored PDF before rotation.
    pdf_source: String,
    /// Hash of each rendered page's original image before rotation.
    page_sources: BTreeMap<u32, String>,
}

impl PendingRotation {
    fn from_document(doc: &Document) -> Result<Option<Self>, PipelineError> {
        doc.properties
            .get(ROTATION_KEY)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| PipelineError::Internal(format!("unreadable {ROTATION_KEY}: {e}")))
    }

    fn to_value(&self) -> Result<serde_json::Value, PipelineError> {
        serde_json::to_value(self)
            .map_err(|e| PipelineError::Internal(format!("rotation serialisation: {e}")))
    }
}

/// SHA-256 over the page image bytes, the rectangle and the raw highlight text.
fn crop_fingerprint(
    page_png: &[u8],
    rect: Rect,
    highlight: Option<&str>,
) -> Result<String, PipelineError> {
    let inputs = CropInputs {
        page_image: hex::encode(Sha256::digest(page_png)),
        rect,
        highlight: highlight.map(str::trim).unwrap_or(""),
    };
    let json = serde_json::to_vec(&inputs)
        .map_err(|e| PipelineError::Internal(format!("fingerprint serialisation: {e}")))?;
    Ok(hex::encode(Sha256::digest(&json)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECT: Rect = Rect {
        left: 1,
        top: 2,
        width: 3,
        height: 4,
    };

    #[test]
    fn pending_rotation_survives_properties() {
        let plan = PendingRotation {
            pages: vec![2, 3],
            angle: 270,
            pdf_source: "ab".into(),
            page_sources: BTreeMap::from([(2, "cd".to_string())]),
        };
        let mut doc = Document::new("a.pdf");
        assert_eq!(PendingRotation::from_document(&doc).unwrap(), None);
        doc.properties
            .insert(ROTATION_KEY.to_string(), plan.to_value().unwrap());
        assert_eq!(PendingRotation::from_document(&doc).unwrap(), Some(plan));

        doc.properties
            .insert(ROTATION_KEY.to_string(), serde_json::json!({"pages": "x"}));
        assert!(matches!(
            PendingRotation::from_document(&doc),
            Err(PipelineError::Internal(_))
        ));
    }

    #[test]
    fn fingerprint_tracks_every_input() {
        let base = crop_fingerprint(b"png", RECT, None).unwrap();
        assert_eq!(base, crop_fingerprint(b"png", RECT, Some("  ")).unwrap());
        assert_ne!(base, crop_fingerprint(b"png2", RECT, None).unwrap());
        let moved = Rect { left: 2, ..RECT };
        assert_ne!(base, crop_fingerprint(b"png", moved, None).unwrap());
        assert_ne!(base, crop_fingerprint(b"png", RECT, Some("[]")).unwrap());
        assert_eq!(base.len(), 64);
    }
}
