use std::io::Read;

use flate2::read::GzDecoder;

use crate::error::{AppError, AppResult};
use crate::types::StreamPayload;

fn is_gzip(content_encoding: Option<&str>) -> bool {
    content_encoding
        .map(|encoding| encoding.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false)
}

/// Upper bound on a gunzipped delivery.
pub const MAX_DECODED_BODY: usize = 64 * 1024 * 1024;

/// Turns the raw delivery body into UTF-8 text, gunzipping first when the
/// delivery says it is gzip-encoded.
pub fn decode_body(body: &[u8], content_encoding: Option<&str>) -> AppResult<String> {
    decode_body_within(body, content_encoding, MAX_DECODED_BODY)
}

fn decode_body_within(body: &[u8], content_encoding: Option<&str>, limit: usize) -> AppResult<String> {
    let bytes = if is_gzip(content_encoding) {
        let mut bytes = Vec::new();
        GzDecoder::new(body)
            .take(limit as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| AppError::MalformedPayload(format!("Failed to decompress body: {}", e)))?;
        if bytes.len() > limit {
            return Err(AppError::MalformedPayload(format!(
                "Decompressed body exceeds {} bytes",
                limit
            )));
        }
        bytes
    } else {
        body.to_vec()
    };

    String::from_utf8(bytes)
        .map_err(|e| AppError::MalformedPayload(format!("Body is not valid UTF-8: {}", e)))
}

pub fn parse_payload(text: &str) -> AppResult<StreamPayload> {
    serde_json::from_str(text)
        .map_err(|e| AppError::MalformedPayload(format!("Invalid stream payload: {}", e)))
}
