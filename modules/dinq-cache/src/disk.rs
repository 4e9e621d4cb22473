//! Shared on-disk blob encoding used by the per-job artifact store (§4.E) and
//! the analysis cache's L1 tier (§4.D): a one-byte prefix (`z` = zlib-compressed
//! JSON, `j` = raw JSON) plus body, written atomically via tmp-then-rename.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::{Read, Write};
use std::path::Path;

/// Encode `value`, preferring zlib compression when it actually shrinks the
/// payload. Returns `None` if the encoded size exceeds `max_bytes` (0 = no cap).
pub fn encode(value: &Value, compress: bool, max_bytes: usize) -> Option<Vec<u8>> {
    let raw = serde_json::to_vec(value).ok()?;

    let compressed = if compress && !raw.is_empty() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(6));
        encoder.write_all(&raw).ok()?;
        encoder.finish().ok()
    } else {
        None
    };

    let mut out = match compressed {
        Some(comp) if comp.len() < raw.len() => {
            let mut v = Vec::with_capacity(comp.len() + 1);
            v.push(b'z');
            v.extend_from_slice(&comp);
            v
        }
        _ => {
            let mut v = Vec::with_capacity(raw.len() + 1);
            v.push(b'j');
            v.extend_from_slice(&raw);
            v
        }
    };
    out.shrink_to_fit();

    if max_bytes > 0 && out.len() > max_bytes {
        return None;
    }
    Some(out)
}

pub fn decode(raw: &[u8]) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    let (prefix, body) = raw.split_at(1);
    let text = match prefix {
        b"z" => {
            let mut decoder = ZlibDecoder::new(body);
            let mut out = String::new();
            decoder.read_to_string(&mut out).ok()?;
            out
        }
        b"j" => String::from_utf8_lossy(body).into_owned(),
        // Backward-compat: treat unknown prefixes as plain JSON.
        _ => String::from_utf8_lossy(raw).into_owned(),
    };
    if text.is_empty() {
        return None;
    }
    serde_json::from_str(&text).ok()
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let result = std::fs::write(&tmp, bytes).and_then(|_| std::fs::rename(&tmp, path));
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Filesystem-safe, reversible-enough encoding for cache/artifact keys used as
/// file names (they may contain characters not valid in a path component).
pub fn b64(value: &str) -> String {
    URL_SAFE_NO_PAD.encode(value.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_decode_roundtrip_compressed() {
        let value = json!({"cards": {"profile": "x".repeat(200)}});
        let encoded = encode(&value, true, 0).unwrap();
        assert_eq!(encoded[0], b'z');
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn encode_decode_roundtrip_uncompressed_when_disabled() {
        let value = json!({"a": 1});
        let encoded = encode(&value, false, 0).unwrap();
        assert_eq!(encoded[0], b'j');
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn encode_respects_max_bytes() {
        let value = json!({"a": "x".repeat(1000)});
        assert!(encode(&value, false, 16).is_none());
    }
}
