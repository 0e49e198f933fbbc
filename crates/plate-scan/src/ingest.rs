//! Image ingestion: raw bytes from stdin or a capture frame, or a base64
//! payload from the HTTP service, decoded into the luma raster the engine
//! consumes.

use std::fmt;
use std::io;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::AsyncReadExt;

use plate_scan_types::{FrameError, LumaFrame};

#[derive(Debug)]
pub enum IngestError {
    EmptyInput,
    Base64 { source: base64::DecodeError },
    Decode { source: image::ImageError },
    Frame { source: FrameError },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::EmptyInput => f.write_str("no image data provided"),
            IngestError::Base64 { source } => {
                write!(f, "invalid base64 image payload: {source}")
            }
            IngestError::Decode { source } => {
                write!(f, "failed to decode image: {source}")
            }
            IngestError::Frame { source } => {
                write!(f, "decoded image is not a usable frame: {source}")
            }
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IngestError::EmptyInput => None,
            IngestError::Base64 { source } => Some(source),
            IngestError::Decode { source } => Some(source),
            IngestError::Frame { source } => Some(source),
        }
    }
}

/// Decode encoded image bytes (jpeg/png/webp) into a luma frame.
pub fn decode_image(bytes: &[u8]) -> Result<LumaFrame, IngestError> {
    if bytes.is_empty() {
        return Err(IngestError::EmptyInput);
    }
    let image =
        image::load_from_memory(bytes).map_err(|source| IngestError::Decode { source })?;
    let luma = image.to_luma8();
    let (width, height) = luma.dimensions();
    LumaFrame::from_owned(width, height, width as usize, luma.into_raw())
        .map_err(|source| IngestError::Frame { source })
}

/// Decode a service image payload: a bare base64 string, or a
/// `data:...;base64,` URI whose prefix (everything up to and including the
/// first comma) is discarded.
pub fn decode_base64_payload(payload: &str) -> Result<Vec<u8>, IngestError> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Err(IngestError::EmptyInput);
    }
    let encoded = match trimmed.find(',') {
        Some(position) => &trimmed[position + 1..],
        None => trimmed,
    };
    BASE64
        .decode(encoded)
        .map_err(|source| IngestError::Base64 { source })
}

pub async fn read_stdin() -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    tokio::io::stdin().read_to_end(&mut bytes).await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1x1 PNG, the same shape the mock capture backend emits.
    const TINY_PNG: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48,
        0x44, 0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00,
        0x00, 0x1F, 0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78,
        0x9C, 0x63, 0x00, 0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00,
        0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
    ];

    #[test]
    fn decodes_png_bytes_into_luma_frame() {
        let frame = decode_image(TINY_PNG).unwrap();
        assert_eq!(frame.width(), 1);
        assert_eq!(frame.height(), 1);
    }

    #[test]
    fn rejects_undecodable_bytes() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, IngestError::Decode { .. }));
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(decode_image(b""), Err(IngestError::EmptyInput)));
    }

    #[test]
    fn strips_data_uri_prefix_up_to_first_comma() {
        let encoded = BASE64.encode(TINY_PNG);
        let payload = format!("data:image/png;base64,{encoded}");
        assert_eq!(decode_base64_payload(&payload).unwrap(), TINY_PNG);
    }

    #[test]
    fn accepts_bare_base64() {
        let encoded = BASE64.encode(b"hello");
        assert_eq!(decode_base64_payload(&encoded).unwrap(), b"hello");
    }

    #[test]
    fn rejects_malformed_base64() {
        let err = decode_base64_payload("data:image/png;base64,@@@@").unwrap_err();
        assert!(matches!(err, IngestError::Base64 { .. }));
    }
}
