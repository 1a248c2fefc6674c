//! Content-type detection from the leading bytes of an upload.
//!
//! Only a handful of common signatures are recognised; the result is used for
//! display and the `Content-Type` of downloads, never for storage decisions.

/// Number of leading bytes consulted when classifying content.
pub const SNIFF_LEN: usize = 512;

const OCTET_STREAM: &str = "application/octet-stream";

const SIGNATURES: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"BM", "image/bmp"),
    (b"%PDF-", "application/pdf"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b\x08", "application/x-gzip"),
    (b"\x00asm", "application/wasm"),
    (b"ID3", "audio/mpeg"),
    (b"OggS", "application/ogg"),
    (b"\x1a\x45\xdf\xa3", "video/webm"),
];

/// Classify `head` (at most [`SNIFF_LEN`] bytes are inspected).
pub fn detect_content_type(head: &[u8]) -> &'static str {
    let head = &head[..head.len().min(SNIFF_LEN)];
    if head.is_empty() {
        return "text/plain; charset=utf-8";
    }

    if let Some((_, mime)) = SIGNATURES.iter().find(|(magic, _)| head.starts_with(magic)) {
        return *mime;
    }

    if head.len() >= 12 && &head[0..4] == b"RIFF" {
        match &head[8..12] {
            b"WEBP" => return "image/webp",
            b"WAVE" => return "audio/wave",
            b"AVI " => return "video/avi",
            _ => {}
        }
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return "video/mp4";
    }

    if looks_like_text(head) {
        return classify_text(head);
    }
    OCTET_STREAM
}

/// Binary data contains control bytes that text formats never use.
fn looks_like_text(head: &[u8]) -> bool {
    !head
        .iter()
        .any(|&b| b <= 0x08 || b == 0x0b || (0x0e..=0x1a).contains(&b) || (0x1c..=0x1f).contains(&b))
}

fn classify_text(head: &[u8]) -> &'static str {
    let trimmed = trim_leading(head);
    let lower: Vec<u8> = trimmed
        .iter()
        .take(16)
        .map(u8::to_ascii_lowercase)
        .collect();

    if lower.starts_with(b"<!doctype html") || lower.starts_with(b"<html") {
        "text/html; charset=utf-8"
    } else if lower.starts_with(b"<?xml") {
        "text/xml; charset=utf-8"
    } else if matches!(trimmed.first(), Some(b'{') | Some(b'[')) {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    }
}

fn trim_leading(head: &[u8]) -> &[u8] {
    let head = head.strip_prefix(b"\xef\xbb\xbf").unwrap_or(head);
    let start = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(head.len());
    &head[start..]
}
