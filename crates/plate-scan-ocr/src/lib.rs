mod backends;
mod engine;
mod error;
mod request;
mod response;

#[cfg(feature = "engine-onnx")]
pub use backends::onnx::OnnxPlateEngine;
pub use engine::{NoopOcrEngine, PlateOcrEngine};
pub use error::OcrError;
pub use request::OcrRequest;
pub use response::{OcrOutput, OcrToken};
