/// Image attachments: decode, downscale, re-encode as JPEG, embed as a data URL
///
/// Images travel inside the message content column, so every attachment is
/// shrunk before it is sent.
use crate::error::{ChatError, Result};
use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::ImageReader;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

const DATA_URL_PREFIX: &str = "data:image/";
const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    /// `data:image/jpeg;base64,...`, ready to be sent as message content
    pub data_url: String,
    pub width: u32,
    pub height: u32,
}

/// Decode `data`, scale it down to at most `max_width` pixels wide (aspect
/// ratio kept) and re-encode as JPEG at `quality`.
pub fn prepare_image(data: &[u8], max_width: u32, quality: u8) -> Result<EncodedImage> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ChatError::Image(format!("Failed to read image: {}", e)))?;
    let mut img = reader
        .decode()
        .map_err(|e| ChatError::Image(format!("Failed to decode image: {}", e)))?;

    if img.width() > max_width {
        let height = scaled_height(img.width(), img.height(), max_width);
        debug!(
            "Downscaling image {}x{} -> {}x{}",
            img.width(),
            img.height(),
            max_width,
            height
        );
        img = img.resize_exact(max_width, height, FilterType::Triangle);
    }

    // JPEG has no alpha channel
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|e| ChatError::Image(format!("Failed to encode JPEG: {}", e)))?;

    Ok(EncodedImage {
        data_url: format!("{}{}", JPEG_DATA_URL_PREFIX, general_purpose::STANDARD.encode(&out)),
        width: rgb.width(),
        height: rgb.height(),
    })
}

/// Read and prepare an image file on the blocking pool
pub async fn prepare_image_file(path: &Path, max_width: u32, quality: u8) -> Result<EncodedImage> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| ChatError::Image(format!("Failed to read {}: {}", path.display(), e)))?;
    tokio::task::spawn_blocking(move || prepare_image(&data, max_width, quality))
        .await
        .map_err(|e| ChatError::Image(format!("Image task failed: {}", e)))?
}

fn scaled_height(width: u32, height: u32, max_width: u32) -> u32 {
    let scaled = (u64::from(height) * u64::from(max_width)) / u64::from(width.max(1));
    (scaled as u32).max(1)
}

/// Does this message content carry an embedded image?
pub fn is_image_content(content: &str) -> bool {
    content.starts_with(DATA_URL_PREFIX) && content.contains(";base64,")
}

/// Raw bytes of an embedded image
pub fn decode_data_url(content: &str) -> Result<Vec<u8>> {
    if !is_image_content(content) {
        return Err(ChatError::Image("Not an embedded image".to_string()));
    }
    let (_, payload) = content
        .split_once(";base64,")
        .ok_or_else(|| ChatError::Image("Malformed data URL".to_string()))?;
    general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| ChatError::Image(format!("Invalid base64 in data URL: {}", e)))
}
