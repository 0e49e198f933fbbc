use std::env;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::core::{CaptureError, CaptureResult, DynFrameProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Spool,
    Mock,
}

impl FromStr for Backend {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spool" => Ok(Backend::Spool),
            "mock" => Ok(Backend::Mock),
            other => Err(CaptureError::configuration(format!(
                "unknown capture backend '{other}'"
            ))),
        }
    }
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Spool => "spool",
            Backend::Mock => "mock",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub backend: Backend,
    /// Directory polled by the spool backend for new encoded frames.
    pub spool_dir: Option<PathBuf>,
    /// Image file the mock backend repeats (falls back to an embedded frame).
    pub input: Option<PathBuf>,
    pub poll_interval: Duration,
    /// Frames the mock backend emits before finishing.
    pub mock_frame_count: Option<usize>,
    pub channel_capacity: Option<NonZeroUsize>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            backend: Backend::Spool,
            spool_dir: None,
            input: None,
            poll_interval: Duration::from_millis(500),
            mock_frame_count: None,
            channel_capacity: None,
        }
    }
}

impl Configuration {
    pub fn from_env() -> CaptureResult<Self> {
        let mut config = Configuration::default();
        if let Ok(backend) = env::var("PLATE_SCAN_BACKEND") {
            config.backend = Backend::from_str(&backend)?;
        }
        if let Ok(dir) = env::var("PLATE_SCAN_SPOOL_DIR") {
            config.spool_dir = Some(PathBuf::from(dir));
        }
        if let Ok(path) = env::var("PLATE_SCAN_INPUT") {
            config.input = Some(PathBuf::from(path));
        }
        if let Ok(interval) = env::var("PLATE_SCAN_POLL_INTERVAL_MS") {
            let parsed: u64 = interval.parse().map_err(|_| {
                CaptureError::configuration(format!(
                    "failed to parse PLATE_SCAN_POLL_INTERVAL_MS='{interval}' as milliseconds"
                ))
            })?;
            config.poll_interval = Duration::from_millis(parsed);
        }
        if let Ok(capacity) = env::var("PLATE_SCAN_CHANNEL_CAPACITY") {
            let parsed: usize = capacity.parse().map_err(|_| {
                CaptureError::configuration(format!(
                    "failed to parse PLATE_SCAN_CHANNEL_CAPACITY='{capacity}' as a positive integer"
                ))
            })?;
            let Some(value) = NonZeroUsize::new(parsed) else {
                return Err(CaptureError::configuration(
                    "PLATE_SCAN_CHANNEL_CAPACITY must be greater than zero",
                ));
            };
            config.channel_capacity = Some(value);
        }
        Ok(config)
    }

    pub fn available_backends() -> Vec<Backend> {
        vec![Backend::Spool, Backend::Mock]
    }

    pub fn create_provider(&self) -> CaptureResult<DynFrameProvider> {
        let channel_capacity = self.channel_capacity.map(NonZeroUsize::get);

        match self.backend {
            Backend::Spool => {
                let dir = self.spool_dir.clone().ok_or_else(|| {
                    CaptureError::configuration(
                        "spool backend requires a spool directory (PLATE_SCAN_SPOOL_DIR)",
                    )
                })?;
                crate::backends::spool::boxed_spool(dir, self.poll_interval, channel_capacity)
            }
            Backend::Mock => crate::backends::mock::boxed_mock(
                self.input.clone(),
                self.mock_frame_count,
                channel_capacity,
            ),
        }
    }
}
