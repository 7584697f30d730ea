use crate::error::{IndiError, Result};
use crate::protocol::BlobPayload;
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Decode a base64 BLOB body and check it against the declared length.
///
/// Servers wrap long bodies across lines, so all ASCII whitespace is ignored.
/// The decoded length must equal `size`. Compressed (`.z`) frames announce the
/// uncompressed size there, so for them a `len` attribute is checked instead.
pub fn decode(payload: &BlobPayload) -> Result<Vec<u8>> {
    let compact: Vec<u8> = payload
        .encoded
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    let data = STANDARD.decode(&compact).map_err(|e| {
        IndiError::protocol(format!("invalid base64 in BLOB body: {}", e), &compact)
    })?;

    let expected = match payload.len {
        Some(len) if payload.format.ends_with(".z") => len,
        _ => payload.size,
    };
    if data.len() != expected {
        return Err(IndiError::protocol(
            format!(
                "BLOB size mismatch: declared {} bytes, decoded {}",
                expected,
                data.len()
            ),
            &compact,
        ));
    }

    log::debug!(
        "📦 Decoded {} byte BLOB ({})",
        data.len(),
        if payload.format.is_empty() {
            "no format"
        } else {
            payload.format.as_str()
        }
    );
    Ok(data)
}

/// Encode bytes as a single-line base64 body
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(size: usize, len: Option<usize>, encoded: &str) -> BlobPayload {
        BlobPayload {
            size,
            len,
            format: ".fits".to_string(),
            encoded: encoded.to_string(),
        }
    }

    fn compressed(size: usize, len: Option<usize>, encoded: &str) -> BlobPayload {
        BlobPayload {
            format: ".fits.z".to_string(),
            ..payload(size, len, encoded)
        }
    }

    #[test]
    fn test_decode_ignores_line_breaks() {
        let data = decode(&payload(12, None, "aGVsbG8g\n  d29y\r\nbGQh\n")).unwrap();
        assert_eq!(data, b"hello world!");
    }

    #[test]
    fn test_size_mismatch_is_protocol_error() {
        let err = decode(&payload(13, None, "aGVsbG8gd29ybGQh")).unwrap_err();
        match err {
            IndiError::Protocol { reason, .. } => assert!(reason.contains("size mismatch")),
            other => panic!("Expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_len_counts_only_for_compressed_frames() {
        // Compressed frames announce the uncompressed size and the transmitted len
        let data = decode(&compressed(4096, Some(12), "aGVsbG8gd29ybGQh")).unwrap();
        assert_eq!(data.len(), 12);
        assert!(decode(&compressed(12, Some(4096), "aGVsbG8gd29ybGQh")).is_err());
    }

    #[test]
    fn test_len_does_not_excuse_wrong_size() {
        let err = decode(&payload(99, Some(12), "aGVsbG8gd29ybGQh")).unwrap_err();
        assert!(matches!(err, IndiError::Protocol { .. }));
        assert_eq!(decode(&payload(12, Some(99), "aGVsbG8gd29ybGQh")).unwrap().len(), 12);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        assert!(decode(&payload(3, None, "!!!!")).is_err());
    }

    #[test]
    fn test_empty_body() {
        assert!(decode(&payload(0, None, "")).unwrap().is_empty());
        assert_eq!(encode(b"hello world!"), "aGVsbG8gd29ybGQh");
    }
}
