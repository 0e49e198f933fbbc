use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::Sender;

use crate::core::{
    CaptureError, CaptureResult, CapturedFrame, DynFrameProvider, FrameProvider,
    spawn_stream_from_channel,
};

const ALLOWED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Polls a spool directory for encoded frames dropped by the camera process.
///
/// Each file is emitted exactly once, in file-name order within a scan; the
/// stream runs until the consumer drops it.
pub struct SpoolProvider {
    dir: PathBuf,
    poll_interval: Duration,
    channel_capacity: usize,
}

impl SpoolProvider {
    const DEFAULT_CHANNEL_CAPACITY: usize = 8;

    pub fn new(
        dir: PathBuf,
        poll_interval: Duration,
        channel_capacity: Option<usize>,
    ) -> CaptureResult<Self> {
        if !dir.is_dir() {
            return Err(CaptureError::backend_failure(
                "spool",
                format!("'{}' is not a directory", dir.display()),
            ));
        }
        Ok(Self {
            dir,
            poll_interval,
            channel_capacity: channel_capacity
                .unwrap_or(Self::DEFAULT_CHANNEL_CAPACITY)
                .max(1),
        })
    }

    fn emit_frames(&self, tx: Sender<CaptureResult<CapturedFrame>>) {
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut index = 0u64;

        loop {
            if tx.is_closed() {
                return;
            }

            let mut fresh = match scan_directory(&self.dir, &seen) {
                Ok(paths) => paths,
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                    return;
                }
            };
            fresh.sort();

            for path in fresh {
                seen.insert(path.clone());
                match fs::read(&path) {
                    Ok(bytes) => {
                        let frame = CapturedFrame::new(bytes, Some(path), index);
                        index = index.saturating_add(1);
                        if tx.blocking_send(Ok(frame)).is_err() {
                            return;
                        }
                    }
                    Err(source) => {
                        let err = CaptureError::io(path, source);
                        if tx.blocking_send(Err(err)).is_err() {
                            return;
                        }
                    }
                }
            }

            if !self.poll_interval.is_zero() {
                thread::sleep(self.poll_interval);
            }
        }
    }
}

fn scan_directory(dir: &Path, seen: &HashSet<PathBuf>) -> CaptureResult<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).map_err(|source| CaptureError::io(dir.to_path_buf(), source))?;
    let mut fresh = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| CaptureError::io(dir.to_path_buf(), source))?;
        let path = entry.path();
        if !path.is_file() || seen.contains(&path) {
            continue;
        }
        if has_allowed_extension(&path) {
            fresh.push(path);
        }
    }
    Ok(fresh)
}

fn has_allowed_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            ALLOWED_EXTENSIONS.iter().any(|allowed| *allowed == ext)
        })
        .unwrap_or(false)
}

impl FrameProvider for SpoolProvider {
    fn into_stream(self: Box<Self>) -> crate::core::CaptureStream {
        let provider = *self;
        let capacity = provider.channel_capacity;
        spawn_stream_from_channel(capacity, move |tx| {
            provider.emit_frames(tx);
        })
    }
}

pub fn boxed_spool(
    dir: PathBuf,
    poll_interval: Duration,
    channel_capacity: Option<usize>,
) -> CaptureResult<DynFrameProvider> {
    Ok(Box::new(SpoolProvider::new(
        dir,
        poll_interval,
        channel_capacity,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_filter_is_case_insensitive() {
        assert!(has_allowed_extension(Path::new("a/b/frame-001.JPG")));
        assert!(has_allowed_extension(Path::new("frame.png")));
        assert!(!has_allowed_extension(Path::new("frame.tmp")));
        assert!(!has_allowed_extension(Path::new("frame")));
    }
}
