use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::Sender;

use crate::core::{
    CaptureError, CaptureResult, CapturedFrame, DynFrameProvider, FrameProvider,
    spawn_stream_from_channel,
};

/// A 1x1 PNG used when no input file is supplied.
const EMBEDDED_FRAME: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

pub struct MockProvider {
    bytes: Vec<u8>,
    source: Option<PathBuf>,
    frame_count: usize,
    frame_interval: Duration,
    channel_capacity: usize,
}

impl MockProvider {
    const DEFAULT_CHANNEL_CAPACITY: usize = 8;
    const DEFAULT_FRAME_COUNT: usize = 8;

    pub fn new(
        input: Option<PathBuf>,
        frame_count: Option<usize>,
        channel_capacity: Option<usize>,
    ) -> CaptureResult<Self> {
        let (bytes, source) = match input {
            Some(path) => {
                let bytes = fs::read(&path).map_err(|source| CaptureError::io(path.clone(), source))?;
                (bytes, Some(path))
            }
            None => (EMBEDDED_FRAME.to_vec(), None),
        };
        Ok(Self {
            bytes,
            source,
            frame_count: frame_count.unwrap_or(Self::DEFAULT_FRAME_COUNT),
            frame_interval: Duration::from_millis(4),
            channel_capacity: channel_capacity
                .unwrap_or(Self::DEFAULT_CHANNEL_CAPACITY)
                .max(1),
        })
    }

    fn emit_frames(&self, tx: Sender<CaptureResult<CapturedFrame>>) {
        for index in 0..self.frame_count {
            if tx.is_closed() {
                break;
            }
            let frame =
                CapturedFrame::new(self.bytes.clone(), self.source.clone(), index as u64);
            if tx.blocking_send(Ok(frame)).is_err() {
                break;
            }
            if !self.frame_interval.is_zero() {
                thread::sleep(self.frame_interval);
            }
        }
    }
}

impl FrameProvider for MockProvider {
    fn into_stream(self: Box<Self>) -> crate::core::CaptureStream {
        let provider = *self;
        let capacity = provider.channel_capacity;
        spawn_stream_from_channel(capacity, move |tx| {
            provider.emit_frames(tx);
        })
    }
}

pub fn boxed_mock(
    input: Option<PathBuf>,
    frame_count: Option<usize>,
    channel_capacity: Option<usize>,
) -> CaptureResult<DynFrameProvider> {
    Ok(Box::new(MockProvider::new(
        input,
        frame_count,
        channel_capacity,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test(flavor = "multi_thread")]
    async fn mock_backend_emits_embedded_frames() {
        let provider = Box::new(MockProvider::new(None, Some(3), None).unwrap());
        let mut stream = (provider as DynFrameProvider).into_stream();
        let mut count = 0usize;
        while let Some(frame) = stream.next().await {
            let frame = frame.unwrap();
            assert_eq!(frame.bytes(), EMBEDDED_FRAME);
            assert_eq!(frame.index(), count as u64);
            count += 1;
        }
        assert_eq!(count, 3);
    }
}
