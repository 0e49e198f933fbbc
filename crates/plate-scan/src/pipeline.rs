//! Mode orchestration: engine construction, the one-shot stdin channel, and
//! the watch loop.

use std::fmt;
use std::sync::Arc;

use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::aggregate::{MergePolicy, format_processing_time, read_plate_blocking};
use crate::ingest::{self, IngestError};
use crate::model::{self, ModelError};
use crate::notify::{GateNotifier, NotifyError};
use crate::settings::{ConfigError, EffectiveSettings};
use plate_scan_capture::{CaptureError, Configuration};
use plate_scan_ocr::{NoopOcrEngine, OcrError, OnnxPlateEngine, PlateOcrEngine};

#[derive(Debug)]
pub enum RunError {
    Config(ConfigError),
    Model(ModelError),
    Engine(OcrError),
    Ingest(IngestError),
    Capture(CaptureError),
    Notify(NotifyError),
    Bind(std::io::Error),
    Stdin(std::io::Error),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Config(err) => err.fmt(f),
            RunError::Model(err) => err.fmt(f),
            RunError::Engine(err) => err.fmt(f),
            RunError::Ingest(err) => err.fmt(f),
            RunError::Capture(err) => err.fmt(f),
            RunError::Notify(err) => err.fmt(f),
            RunError::Bind(err) => write!(f, "server error: {err}"),
            RunError::Stdin(err) => write!(f, "failed to read image from stdin: {err}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Config(err) => Some(err),
            RunError::Model(err) => Some(err),
            RunError::Engine(err) => Some(err),
            RunError::Ingest(err) => Some(err),
            RunError::Capture(err) => Some(err),
            RunError::Notify(err) => Some(err),
            RunError::Bind(err) | RunError::Stdin(err) => Some(err),
        }
    }
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        RunError::Config(err)
    }
}

impl From<ModelError> for RunError {
    fn from(err: ModelError) -> Self {
        RunError::Model(err)
    }
}

impl From<OcrError> for RunError {
    fn from(err: OcrError) -> Self {
        RunError::Engine(err)
    }
}

impl From<IngestError> for RunError {
    fn from(err: IngestError) -> Self {
        RunError::Ingest(err)
    }
}

impl From<CaptureError> for RunError {
    fn from(err: CaptureError) -> Self {
        RunError::Capture(err)
    }
}

impl From<NotifyError> for RunError {
    fn from(err: NotifyError) -> Self {
        RunError::Notify(err)
    }
}

/// Construct the process-wide engine: resolve the configured model (possibly
/// downloading it) and load it once. Falls back to the noop engine when no
/// model is configured so the pipeline stays exercisable end to end.
pub async fn build_engine(
    settings: &EffectiveSettings,
) -> Result<Arc<dyn PlateOcrEngine>, RunError> {
    let model_path = model::resolve_model_path(
        settings.model.as_deref(),
        settings.model_from_cli,
        settings.config_dir.as_deref(),
    )
    .await?;

    match model_path {
        Some(path) => {
            info!(model = %path.display(), "loading recognition model");
            let mut engine = OnnxPlateEngine::new(path)?;
            if let Some(alphabet) = &settings.alphabet {
                engine = engine.with_alphabet_file(alphabet)?;
            }
            Ok(Arc::new(engine))
        }
        None => {
            warn!("no recognition model configured; using the noop engine");
            Ok(Arc::new(NoopOcrEngine))
        }
    }
}

async fn warm_up(engine: &Arc<dyn PlateOcrEngine>) -> Result<(), RunError> {
    let warming = Arc::clone(engine);
    tokio::task::spawn_blocking(move || warming.warm_up())
        .await
        .map_err(|err| OcrError::backend(format!("warm-up task failed: {err}")))??;
    Ok(())
}

/// One-shot channel: image bytes on stdin, plate text on stdout.
///
/// Undecodable input terminates with a diagnostic; an engine failure prints
/// an empty plate and exits cleanly, matching the pipe contract.
pub async fn run_oneshot(settings: EffectiveSettings, timing: bool) -> Result<(), RunError> {
    let engine = build_engine(&settings).await?;
    warm_up(&engine).await?;

    let bytes = ingest::read_stdin().await.map_err(RunError::Stdin)?;
    let frame = ingest::decode_image(&bytes)?;

    let options = settings.aggregation_options(MergePolicy::StarDelimited);
    match read_plate_blocking(engine, frame, options, settings.engine_timeout).await {
        Ok(reading) => {
            if timing {
                println!(
                    "{}|{}",
                    reading.plate_text,
                    format_processing_time(reading.processing_time_ms)
                );
            } else {
                println!("{}", reading.plate_text);
            }
        }
        Err(failure) => {
            warn!("recognition failed: {failure}");
            if timing {
                println!("|{}", format_processing_time(0.0));
            } else {
                println!();
            }
        }
    }
    Ok(())
}

/// Watch channel: consume the capture stream, recognize each frame, and
/// notify the parking gate about non-empty plates.
pub async fn run_watch(settings: EffectiveSettings) -> Result<(), RunError> {
    let engine = build_engine(&settings).await?;
    warm_up(&engine).await?;

    let notifier = match &settings.gate_endpoint {
        Some(endpoint) => Some(GateNotifier::new(endpoint.clone(), settings.rfid.clone())?),
        None => {
            warn!("no gate endpoint configured; recognitions will only be logged");
            None
        }
    };

    let mut capture = Configuration::from_env()?;
    if let Some(backend) = settings.capture_backend {
        capture.backend = backend;
    }
    if let Some(dir) = &settings.spool_dir {
        capture.spool_dir = Some(dir.clone());
    }
    if let Some(interval) = settings.poll_interval {
        capture.poll_interval = interval;
    }

    let provider = capture.create_provider()?;
    info!(backend = capture.backend.as_str(), "watching for captured frames");

    let options = settings.aggregation_options(MergePolicy::Concat);
    let mut stream = provider.into_stream();

    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down watch loop");
                break;
            }
        };
        let Some(event) = event else {
            break;
        };
        let frame = match event {
            Ok(frame) => frame,
            Err(err) => {
                warn!("capture error: {err}");
                continue;
            }
        };
        let decoded = match ingest::decode_image(frame.bytes()) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(index = frame.index(), "skipping frame: {err}");
                continue;
            }
        };
        match read_plate_blocking(
            Arc::clone(&engine),
            decoded,
            options,
            settings.engine_timeout,
        )
        .await
        {
            Ok(reading) if reading.plate_text.is_empty() => {
                info!(index = frame.index(), "no plate recognized");
            }
            Ok(reading) => {
                info!(
                    index = frame.index(),
                    plate = %reading.plate_text,
                    elapsed = %format_processing_time(reading.processing_time_ms),
                    "plate recognized"
                );
                if let Some(notifier) = &notifier {
                    if let Err(err) = notifier.notify(&reading.plate_text).await {
                        warn!("gate notification failed: {err}");
                    }
                }
            }
            Err(failure) => {
                warn!(index = frame.index(), "recognition failed: {failure}");
            }
        }
    }
    Ok(())
}
