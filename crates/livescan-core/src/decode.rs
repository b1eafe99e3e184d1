//! Incoming frame decoding: base64 payload to RGB pixels.

use base64::Engine as _;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty image payload")]
    Empty,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unsupported or corrupt image: {0}")]
    Image(#[from] image::ImageError),
    #[error("image has no pixels ({width}x{height})")]
    ZeroSize { width: u32, height: u32 },
}

/// Decode a base64-encoded image (PNG, JPEG, ...) into an RGB buffer.
///
/// Leading/trailing whitespace and a `data:<mime>;base64,` prefix are accepted.
pub fn decode_base64_image(payload: &str) -> Result<RgbImage, DecodeError> {
    let payload = payload.trim();
    let payload = match payload.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => payload,
    };
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }

    let bytes = base64::engine::general_purpose::STANDARD.decode(payload)?;
    decode_image_bytes(&bytes)
}

/// Decode encoded image bytes, sniffing the format from the content.
///
/// Frames with a zero width or height are rejected.
pub fn decode_image_bytes(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let image = image::load_from_memory(bytes)?;
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(DecodeError::ZeroSize { width, height });
    }
    Ok(image.to_rgb8())
}
