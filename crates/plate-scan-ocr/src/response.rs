/// One recognized text fragment with its confidence score.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrToken {
    pub text: String,
    /// Recognition confidence in `[0.0, 1.0]`.
    pub confidence: f32,
}

impl OcrToken {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Raw engine output for a single image, in emission order.
#[derive(Debug, Clone, Default)]
pub struct OcrOutput {
    pub tokens: Vec<OcrToken>,
}

impl OcrOutput {
    pub fn new(tokens: Vec<OcrToken>) -> Self {
        Self { tokens }
    }

    pub fn empty() -> Self {
        Self { tokens: Vec::new() }
    }
}
