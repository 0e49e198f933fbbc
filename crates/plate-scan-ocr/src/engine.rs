use crate::error::OcrError;
use crate::request::OcrRequest;
use crate::response::OcrOutput;

/// Common interface for all plate OCR engines.
///
/// An engine must return an empty token list for a legible image that
/// contains no text, and an error only for inputs it cannot process.
pub trait PlateOcrEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time preparation after construction (kernel warm-up, dummy
    /// inference). Called once before the first `recognize`.
    fn warm_up(&self) -> Result<(), OcrError> {
        Ok(())
    }

    fn recognize(&self, request: &OcrRequest<'_>) -> Result<OcrOutput, OcrError>;
}

/// Placeholder engine used while no recognition model is configured.
#[derive(Debug, Default)]
pub struct NoopOcrEngine;

impl PlateOcrEngine for NoopOcrEngine {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn recognize(&self, _: &OcrRequest<'_>) -> Result<OcrOutput, OcrError> {
        Ok(OcrOutput::empty())
    }
}
