use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;
use futures_util::stream::unfold;
use thiserror::Error;
use tokio::sync::mpsc::{self, Sender};

pub type CaptureResult<T> = Result<T, CaptureError>;

pub type CaptureStream = Pin<Box<dyn Stream<Item = CaptureResult<CapturedFrame>> + Send>>;

pub type DynFrameProvider = Box<dyn FrameProvider>;

/// One captured image, still encoded (jpeg/png/...).
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    bytes: Arc<[u8]>,
    source: Option<PathBuf>,
    index: u64,
}

impl CapturedFrame {
    pub fn new(bytes: Vec<u8>, source: Option<PathBuf>, index: u64) -> Self {
        Self {
            bytes: Arc::from(bytes.into_boxed_slice()),
            source,
            index,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn source(&self) -> Option<&PathBuf> {
        self.source.as_ref()
    }

    pub fn index(&self) -> u64 {
        self.index
    }
}

pub trait FrameProvider: Send + 'static {
    fn into_stream(self: Box<Self>) -> CaptureStream;
}

pub fn spawn_stream_from_channel(
    capacity: usize,
    task: impl FnOnce(Sender<CaptureResult<CapturedFrame>>) + Send + 'static,
) -> CaptureStream {
    let (tx, rx) = mpsc::channel(capacity);
    tokio::task::spawn_blocking(move || task(tx));
    let stream = unfold(rx, |mut receiver| async {
        receiver.recv().await.map(|item| (item, receiver))
    });
    Box::pin(stream)
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("backend {backend} is not supported in this build")]
    Unsupported { backend: &'static str },

    #[error("{backend} backend failed: {message}")]
    BackendFailure {
        backend: &'static str,
        message: String,
    },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("filesystem error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl CaptureError {
    pub fn unsupported(backend: &'static str) -> Self {
        Self::Unsupported { backend }
    }

    pub fn backend_failure(backend: &'static str, message: impl Into<String>) -> Self {
        Self::BackendFailure {
            backend,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn io(path: PathBuf, source: std::io::Error) -> Self {
        Self::Io { path, source }
    }
}
