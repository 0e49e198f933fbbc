//! Shared domain models for the plate-scan workspace.
//!
//! This crate centralizes the lightweight data structures exchanged between
//! the ingestion, OCR, and delivery crates. Keep it backend-agnostic and free
//! of heavy dependencies so every crate can depend on it without pulling in
//! inference runtimes or async machinery.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub type FrameResult<T> = Result<T, FrameError>;

/// A decoded single-channel (luma) raster image.
///
/// Rows are `stride` bytes apart; only the first `width` bytes of each row
/// carry pixel data. The buffer is validated once at construction so that
/// consumers can index rows without re-checking bounds.
#[derive(Clone)]
pub struct LumaFrame {
    width: u32,
    height: u32,
    stride: usize,
    data: Arc<[u8]>,
}

impl fmt::Debug for LumaFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LumaFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl LumaFrame {
    pub fn from_owned(
        width: u32,
        height: u32,
        stride: usize,
        data: Vec<u8>,
    ) -> FrameResult<Self> {
        if stride < width as usize {
            return Err(FrameError::InvalidFrame {
                reason: format!("stride {stride} is smaller than width {width}"),
            });
        }
        let required =
            stride
                .checked_mul(height as usize)
                .ok_or_else(|| FrameError::InvalidFrame {
                    reason: "calculated luma plane length overflowed".into(),
                })?;
        if data.len() < required {
            return Err(FrameError::InvalidFrame {
                reason: format!(
                    "insufficient luma bytes: got {} expected at least {}",
                    data.len(),
                    required
                ),
            });
        }
        Ok(Self {
            width,
            height,
            stride,
            data: Arc::from(data.into_boxed_slice()),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Pixel bytes of row `y`, without the stride padding.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.width as usize]
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_owned_validates_buffer_length() {
        let err = LumaFrame::from_owned(4, 4, 4, vec![0; 8]).unwrap_err();
        assert!(matches!(err, FrameError::InvalidFrame { .. }));
    }

    #[test]
    fn from_owned_rejects_stride_below_width() {
        let err = LumaFrame::from_owned(8, 2, 4, vec![0; 16]).unwrap_err();
        assert!(matches!(err, FrameError::InvalidFrame { .. }));
    }

    #[test]
    fn row_skips_stride_padding() {
        let mut data = vec![0u8; 6 * 2];
        data[6] = 1;
        data[7] = 2;
        let frame = LumaFrame::from_owned(4, 2, 6, data).unwrap();
        assert_eq!(frame.row(1), &[1, 2, 0, 0]);
        assert_eq!(frame.row(0).len(), 4);
    }
}
