//! Raster operations on stored page images.
//!
//! Everything here is a pure function of its inputs (bytes in, bytes out),
//! CPU-bound, and meant to run inside `spawn_blocking`:
//!
//! - scaled variants for the three display sizes
//! - quarter-turn rotation
//! - annotation crops with colour highlights
//! - alternate encodings (WebP, JPEG)

use crate::config::AltFormat;
use crate::error::PipelineError;
use crate::model::{Highlight, ImageSize, Rect};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgba};
use std::io::Cursor;

/// JPEG quality for the lossy alternate format.
const JPEG_QUALITY: u8 = 80;

/// Highlight fuzz: fraction of the channel range a pixel may differ from
/// white and still be repainted.
const HIGHLIGHT_FUZZ: f32 = 0.3;

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    image::load_from_memory(bytes)
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

// ── Sizes ────────────────────────────────────────────────────────────────

/// Resize to exactly `target_width`, keeping the aspect ratio.
///
/// Narrow originals are enlarged so each slot always has its named width.
pub fn scale_to_width(img: &DynamicImage, target_width: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w == target_width || w == 0 || target_width == 0 {
        return img.clone();
    }
    let target_height = ((h as f64) * (target_width as f64) / (w as f64)).round().max(1.0) as u32;
    img.resize_exact(target_width, target_height, FilterType::Lanczos3)
}

/// PNG bytes for every scaled size, in [`ImageSize::SCALED`] order.
pub fn scaled_variants(original: &DynamicImage) -> Result<Vec<(ImageSize, Vec<u8>)>, image::ImageError> {
    ImageSize::SCALED
        .iter()
        .filter_map(|size| size.width().map(|w| (*size, w)))
        .map(|(size, width)| Ok((size, encode_png(&scale_to_width(original, width))?)))
        .collect()
}

// ── Rotation ─────────────────────────────────────────────────────────────

/// Rotate clockwise by a multiple of 90 degrees.
pub fn rotate(img: &DynamicImage, angle: i32) -> Result<DynamicImage, PipelineError> {
    if angle % 90 != 0 {
        return Err(PipelineError::InvalidAngle(angle));
    }
    Ok(match angle.rem_euclid(360) {
        90 => img.rotate90(),
        180 => img.rotate180(),
        270 => img.rotate270(),
        _ => img.clone(),
    })
}

// ── Annotations ──────────────────────────────────────────────────────────

/// Crop `rect` out of the page image, clamped to the image bounds.
pub fn crop(img: &DynamicImage, rect: Rect) -> Result<DynamicImage, PipelineError> {
    let (w, h) = img.dimensions();
    let left = rect.left.min(w);
    let top = rect.top.min(h);
    let width = rect.width.min(w - left);
    let height = rect.height.min(h - top);
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidAnnotation(format!(
            "rectangle {rect:?} does not overlap the {w}×{h} page image"
        )));
    }
    Ok(img.crop_imm(left, top, width, height))
}

/// Repaint near-white pixels inside each highlight rectangle.
///
/// Highlight coordinates are relative to `img`; areas outside it are ignored.
pub fn apply_highlights(img: &DynamicImage, highlights: &[Highlight]) -> Result<DynamicImage, PipelineError> {
    let mut canvas = img.to_rgba8();
    let (w, h) = canvas.dimensions();
    let max_distance = HIGHLIGHT_FUZZ * 255.0;
    for hl in highlights {
        let color = parse_color(&hl.color)?;
        let x_end = hl.left.saturating_add(hl.width).min(w);
        let y_end = hl.top.saturating_add(hl.height).min(h);
        for y in hl.top.min(h)..y_end {
            for x in hl.left.min(w)..x_end {
                let px = canvas.get_pixel_mut(x, y);
                if distance_from_white(px) <= max_distance {
                    *px = Rgba([color[0], color[1], color[2], px[3]]);
                }
            }
        }
    }
    Ok(DynamicImage::ImageRgba8(canvas))
}

/// Crop, highlight and encode an annotation image as PNG.
pub fn render_annotation(
    page_png: &[u8],
    rect: Rect,
    highlights: &[Highlight],
) -> Result<Vec<u8>, PipelineError> {
    let page = decode(page_png)?;
    let cropped = crop(&page, rect)?;
    let out = if highlights.is_empty() {
        cropped
    } else {
        apply_highlights(&cropped, highlights)?
    };
    Ok(encode_png(&out)?)
}

fn distance_from_white(px: &Rgba<u8>) -> f32 {
    let sum: f32 = px.0[..3]
        .iter()
        .map(|c| {
            let d = 255.0 - f32::from(*c);
            d * d
        })
        .sum();
    (sum / 3.0).sqrt()
}

/// `#rgb`, `#rrggbb`, `#rrggbbaa` or a CSS basic colour name.
pub fn parse_color(input: &str) -> Result<[u8; 4], PipelineError> {
    let s = input.trim().to_ascii_lowercase();
    let invalid = || PipelineError::InvalidAnnotation(format!("unknown highlight colour '{input}'"));
    if let Some(hex) = s.strip_prefix('#') {
        let digits: Option<Vec<u8>> = match hex.len() {
            3 => hex
                .chars()
                .map(|c| c.to_digit(16).map(|d| (d * 17) as u8))
                .collect(),
            6 | 8 => (0..hex.len())
                .step_by(2)
                .map(|i| hex.get(i..i + 2).and_then(|p| u8::from_str_radix(p, 16).ok()))
                .collect(),
            _ => None,
        };
        let digits = digits.ok_or_else(invalid)?;
        return Ok([digits[0], digits[1], digits[2], digits.get(3).copied().unwrap_or(255)]);
    }
    let rgb = match s.as_str() {
        "black" => [0, 0, 0],
        "white" => [255, 255, 255],
        "red" => [255, 0, 0],
        "lime" => [0, 255, 0],
        "green" => [0, 128, 0],
        "blue" => [0, 0, 255],
        "yellow" => [255, 255, 0],
        "cyan" | "aqua" => [0, 255, 255],
        "magenta" | "fuchsia" => [255, 0, 255],
        "orange" => [255, 165, 0],
        "pink" => [255, 192, 203],
        "purple" => [128, 0, 128],
        "gray" | "grey" => [128, 128, 128],
        "silver" => [192, 192, 192],
        "maroon" => [128, 0, 0],
        "navy" => [0, 0, 128],
        "olive" => [128, 128, 0],
        "teal" => [0, 128, 128],
        _ => return Err(invalid()),
    };
    Ok([rgb[0], rgb[1], rgb[2], 255])
}

// ── Alternate formats ────────────────────────────────────────────────────

/// Re-encode PNG bytes in an alternate format.
pub fn encode_alternate(png: &[u8], format: AltFormat) -> Result<Vec<u8>, image::ImageError> {
    let img = decode(png)?;
    let mut buf = Vec::new();
    match format {
        AltFormat::Webp => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_with_encoder(WebPEncoder::new_lossless(&mut buf))?;
        }
        AltFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY))?;
        }
    }
    Ok(buf)
}
