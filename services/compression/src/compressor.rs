//! Adaptive JPEG re-encoding.
//!
//! The requested quality is used as-is unless the detector found regions, in
//! which case it is raised to [`REGION_QUALITY_FLOOR`]. Output is always JPEG.

use crate::models::DetectedRegion;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat, Rgb, RgbImage};
use thiserror::Error;

/// Quality used when the client sends none (or an unusable value)
pub const DEFAULT_QUALITY: i64 = 60;

/// Lowest quality applied to images with detected regions
pub const REGION_QUALITY_FLOOR: i64 = 40;

/// Accepted range for the requested quality
pub const MIN_QUALITY: i64 = 1;
pub const MAX_QUALITY: i64 = 100;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("failed to decode image: {0}")]
    DecodeError(String),

    #[error("image dimensions are zero")]
    ZeroDimensions,

    #[error("failed to encode image: {0}")]
    EncodeError(String),

    #[error("quality must be between 1 and 100, got {0}")]
    InvalidQuality(i64),
}

/// Result of a re-encode
#[derive(Debug, Clone)]
pub struct CompressedOutput {
    pub data: Vec<u8>,
    pub quality: u8,
    pub width: u32,
    pub height: u32,
}

/// Parse the `quality` form field with integer-prefix semantics.
///
/// Leading whitespace and a sign are accepted and parsing stops at the first
/// non-digit, so `"75abc"` is 75 and `"4.5"` is 4. Missing, unparsable and
/// zero values fall back to [`DEFAULT_QUALITY`].
pub fn parse_quality(raw: Option<&str>) -> i64 {
    let Some(raw) = raw else {
        return DEFAULT_QUALITY;
    };

    let trimmed = raw.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());

    let value = match digits[..end].parse::<i64>() {
        Ok(value) if negative => -value,
        Ok(value) => value,
        Err(_) => return DEFAULT_QUALITY,
    };

    if value == 0 {
        DEFAULT_QUALITY
    } else {
        value
    }
}

/// Reject qualities the codec cannot honour
pub fn validate_quality(quality: i64) -> Result<i64, CompressionError> {
    if (MIN_QUALITY..=MAX_QUALITY).contains(&quality) {
        Ok(quality)
    } else {
        Err(CompressionError::InvalidQuality(quality))
    }
}

/// Quality actually applied: floored at 40 when regions were detected
pub fn effective_quality(requested: i64, regions: &[DetectedRegion]) -> i64 {
    if regions.is_empty() {
        requested
    } else {
        requested.max(REGION_QUALITY_FLOOR)
    }
}

/// Detect the source format from the raw bytes (e.g. "jpeg", "png")
pub fn detect_format(input: &[u8]) -> Result<String, CompressionError> {
    let format =
        image::guess_format(input).map_err(|e| CompressionError::DecodeError(e.to_string()))?;

    let name = match format {
        ImageFormat::Jpeg => "jpeg".to_string(),
        ImageFormat::Png => "png".to_string(),
        other => format!("{:?}", other).to_lowercase(),
    };

    Ok(name)
}

/// MIME type for a format name returned by [`detect_format`]
pub fn mime_for_format(format: &str) -> &'static str {
    match format {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Decode input bytes into a `DynamicImage`
fn decode_image(input: &[u8]) -> Result<DynamicImage, CompressionError> {
    image::load_from_memory(input).map_err(|e| CompressionError::DecodeError(e.to_string()))
}

/// Composite any alpha channel over a white background
pub(crate) fn flatten_alpha(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());

    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = f32::from(a) / 255.0;
        let blend = |channel: u8| (f32::from(channel) * alpha + 255.0 * (1.0 - alpha)).round() as u8;
        rgb.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }

    rgb
}

/// Re-encode `input` as JPEG at `quality`, flattening any alpha channel
pub fn compress(input: &[u8], quality: i64) -> Result<CompressedOutput, CompressionError> {
    let quality = validate_quality(quality)? as u8;
    let decoded = decode_image(input)?;

    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(CompressionError::ZeroDimensions);
    }

    let rgb = flatten_alpha(&decoded);
    let mut buffer = Vec::new();

    JpegEncoder::new_with_quality(&mut buffer, quality)
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|e| CompressionError::EncodeError(e.to_string()))?;

    Ok(CompressedOutput {
        data: buffer,
        quality,
        width: rgb.width(),
        height: rgb.height(),
    })
}

/// Floor the quality by the detected regions, then re-encode
pub fn compress_adaptive(
    input: &[u8],
    regions: &[DetectedRegion],
    requested_quality: i64,
) -> Result<CompressedOutput, CompressionError> {
    compress(input, effective_quality(requested_quality, regions))
}
