use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;

use crate::capture::writer::read_segment_frames;

/// Frames sampled per segment for one transcription request.
pub const MAX_FRAMES_PER_SEGMENT: usize = 8;

/// Sampled frames are bounded to this size before upload.
const MAX_WIDTH: u32 = 1280;
const MAX_HEIGHT: u32 = 720;
const UPLOAD_JPEG_QUALITY: u8 = 70;

/// Picks up to `max_frames` frames evenly spaced across the segment,
/// bounds their size, and returns them base64-encoded for inline
/// image_url content parts.
pub fn sample_frames_base64(path: &Path, max_frames: usize) -> Result<Vec<String>> {
    let frames = read_segment_frames(path)?;
    if frames.is_empty() {
        return Ok(Vec::new());
    }

    let take = max_frames.min(frames.len());
    let mut encoded = Vec::with_capacity(take);
    for i in 0..take {
        let idx = i * frames.len() / take;
        let jpeg = recompress(&frames[idx])
            .with_context(|| format!("failed to prepare frame {idx} of {}", path.display()))?;
        encoded.push(base64::engine::general_purpose::STANDARD.encode(jpeg));
    }
    Ok(encoded)
}

fn recompress(jpeg: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(jpeg).context("failed to decode stored frame")?;
    let img = if img.width() > MAX_WIDTH || img.height() > MAX_HEIGHT {
        img.resize(MAX_WIDTH, MAX_HEIGHT, image::imageops::FilterType::Triangle)
    } else {
        img
    };

    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, UPLOAD_JPEG_QUALITY)
        .encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )
        .context("failed to re-encode frame")?;
    Ok(out)
}
