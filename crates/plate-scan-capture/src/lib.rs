//! Frame acquisition for plate-scan.
//!
//! Cameras themselves stay outside this crate: whatever acquires images is
//! expected to drop encoded stills into a spool directory, which the spool
//! backend polls. The mock backend emits synthetic frames for tests and CI.
//! Frames are delivered still-encoded; decoding happens at ingestion.

mod backends;
mod config;
mod core;

pub use config::{Backend, Configuration};
pub use core::{
    CaptureError, CaptureResult, CaptureStream, CapturedFrame, DynFrameProvider, FrameProvider,
    spawn_stream_from_channel,
};
