use plate_scan_types::LumaFrame;

/// OCR invocation input.
#[derive(Debug)]
pub struct OcrRequest<'a> {
    frame: &'a LumaFrame,
}

impl<'a> OcrRequest<'a> {
    pub fn new(frame: &'a LumaFrame) -> Self {
        Self { frame }
    }

    pub fn frame(&self) -> &'a LumaFrame {
        self.frame
    }
}
