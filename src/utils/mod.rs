use crate::models::ImagePayload;
use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose};
use regex::Regex;
use std::any::Any;
use std::sync::LazyLock;

static DATA_URI_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^data:(image/[A-Za-z0-9.+-]+)?(;[A-Za-z0-9=._-]+)*;base64,")
        .expect("data uri pattern is valid")
});

/// Split an optional `data:image/...;base64,` prefix off an encoded image.
///
/// Returns the MIME type named by the prefix (if any) and the bare base64 body.
pub fn strip_data_uri(encoded: &str) -> (Option<&str>, &str) {
    let trimmed = encoded.trim();
    match DATA_URI_PREFIX.captures(trimmed) {
        Some(captures) => {
            let prefix_len = captures.get(0).map(|m| m.end()).unwrap_or(0);
            let mime = captures.get(1).map(|m| m.as_str());
            (mime, &trimmed[prefix_len..])
        }
        None => (None, trimmed),
    }
}

/// Decode a base64 image that may carry a data-URI prefix.
pub fn decode_image(encoded: &str) -> Result<ImagePayload> {
    let (mime, body) = strip_data_uri(encoded);
    let data = general_purpose::STANDARD
        .decode(body)
        .context("Image is not valid base64")?;
    let mime_type = mime
        .map(str::to_string)
        .unwrap_or_else(|| sniff_mime_type(&data).to_string());
    Ok(ImagePayload::new(mime_type, data))
}

/// Build a payload from raw uploaded bytes. The declared content type wins
/// when it names an image; otherwise the bytes are sniffed.
pub fn image_from_upload(data: Vec<u8>, content_type: Option<&str>) -> ImagePayload {
    let mime_type = match content_type {
        Some(ct) if ct.starts_with("image/") => ct.to_string(),
        _ => sniff_mime_type(&data).to_string(),
    };
    ImagePayload::new(mime_type, data)
}

pub fn sniff_mime_type(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "image/webp"
    } else if data.starts_with(b"GIF8") {
        "image/gif"
    } else {
        "image/png"
    }
}

pub fn encode_base64(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
