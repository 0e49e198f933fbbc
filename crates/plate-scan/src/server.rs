//! HTTP delivery channel.
//!
//! `POST /recognize` accepts a base64 image payload and answers with the
//! aggregated plate reading; `GET /health` reports engine readiness. The
//! engine warms up in a background task so the server binds immediately but
//! never claims to be healthy before the model is loaded.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::aggregate::{
    AggregationOptions, MergePolicy, PlateReading, format_processing_time, read_plate_blocking,
};
use crate::ingest::{decode_base64_payload, decode_image};
use crate::pipeline::{self, RunError};
use crate::settings::EffectiveSettings;
use plate_scan_ocr::PlateOcrEngine;

enum EngineStatus {
    Initializing,
    Ready(Arc<dyn PlateOcrEngine>),
    Failed(String),
}

pub struct ServiceState {
    status: RwLock<EngineStatus>,
    /// Serializes engine invocations; the engine is not assumed thread-safe
    /// for concurrent inference.
    inference: Mutex<()>,
    options: AggregationOptions,
    timeout: Option<Duration>,
}

impl ServiceState {
    pub fn new(options: AggregationOptions, timeout: Option<Duration>) -> Self {
        Self {
            status: RwLock::new(EngineStatus::Initializing),
            inference: Mutex::new(()),
            options,
            timeout,
        }
    }

    pub async fn set_ready(&self, engine: Arc<dyn PlateOcrEngine>) {
        *self.status.write().await = EngineStatus::Ready(engine);
    }

    pub async fn set_failed(&self, message: String) {
        *self.status.write().await = EngineStatus::Failed(message);
    }

    async fn engine(&self) -> Result<Arc<dyn PlateOcrEngine>, RecognizeReply> {
        match &*self.status.read().await {
            EngineStatus::Ready(engine) => Ok(Arc::clone(engine)),
            EngineStatus::Initializing => Err(failure_reply(
                StatusCode::SERVICE_UNAVAILABLE,
                "recognition model is still initializing".to_string(),
            )),
            EngineStatus::Failed(message) => Err(failure_reply(
                StatusCode::SERVICE_UNAVAILABLE,
                message.clone(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecognizeRequest {
    image: String,
}

#[derive(Debug, Serialize)]
struct RecognizeResponse {
    #[serde(rename = "licensePlate")]
    license_plate: String,
    #[serde(rename = "processingTime")]
    processing_time: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<DebugInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct DebugInfo {
    #[serde(rename = "totalResults")]
    total_results: usize,
    #[serde(rename = "allTexts")]
    all_texts: Vec<String>,
    confidences: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    model: &'static str,
}

type RecognizeReply = (StatusCode, Json<RecognizeResponse>);

impl RecognizeResponse {
    fn from_reading(reading: &PlateReading) -> Self {
        Self {
            license_plate: reading.plate_text.clone(),
            processing_time: format_processing_time(reading.processing_time_ms),
            success: true,
            debug: Some(DebugInfo {
                total_results: reading.total_results,
                all_texts: reading.kept_texts.clone(),
                confidences: reading.kept_confidences.clone(),
            }),
            error: None,
        }
    }

    fn from_error(message: String) -> Self {
        Self {
            license_plate: String::new(),
            processing_time: format_processing_time(0.0),
            success: false,
            debug: None,
            error: Some(message),
        }
    }
}

fn failure_reply(status: StatusCode, message: String) -> RecognizeReply {
    (status, Json(RecognizeResponse::from_error(message)))
}

async fn recognize(
    State(state): State<Arc<ServiceState>>,
    Json(request): Json<RecognizeRequest>,
) -> RecognizeReply {
    let engine = match state.engine().await {
        Ok(engine) => engine,
        Err(reply) => return reply,
    };

    let bytes = match decode_base64_payload(&request.image) {
        Ok(bytes) => bytes,
        Err(err) => return failure_reply(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let frame = match decode_image(&bytes) {
        Ok(frame) => frame,
        Err(err) => return failure_reply(StatusCode::BAD_REQUEST, err.to_string()),
    };

    let _serialize = state.inference.lock().await;
    match read_plate_blocking(engine, frame, state.options, state.timeout).await {
        Ok(reading) => (StatusCode::OK, Json(RecognizeResponse::from_reading(&reading))),
        Err(failure) => {
            warn!("recognition failed: {failure}");
            (
                StatusCode::OK,
                Json(RecognizeResponse::from_error(failure.message)),
            )
        }
    }
}

async fn health(State(state): State<Arc<ServiceState>>) -> (StatusCode, Json<HealthResponse>) {
    let body = match &*state.status.read().await {
        EngineStatus::Ready(_) => {
            return (
                StatusCode::OK,
                Json(HealthResponse {
                    status: "healthy",
                    model: "loaded",
                }),
            );
        }
        EngineStatus::Initializing => HealthResponse {
            status: "initializing",
            model: "loading",
        },
        EngineStatus::Failed(_) => HealthResponse {
            status: "unhealthy",
            model: "failed",
        },
    };
    (StatusCode::SERVICE_UNAVAILABLE, Json(body))
}

pub async fn run_server(settings: EffectiveSettings) -> Result<(), RunError> {
    let options = settings.aggregation_options(MergePolicy::StarDelimited);
    let state = Arc::new(ServiceState::new(options, settings.engine_timeout));
    let bind = settings.server_bind;

    let init_state = Arc::clone(&state);
    tokio::spawn(async move {
        match pipeline::build_engine(&settings).await {
            Ok(engine) => {
                let warming = Arc::clone(&engine);
                let warmed =
                    tokio::task::spawn_blocking(move || warming.warm_up().map(|()| warming)).await;
                match warmed {
                    Ok(Ok(engine)) => {
                        info!(engine = engine.name(), "recognition engine ready");
                        init_state.set_ready(engine).await;
                    }
                    Ok(Err(err)) => {
                        error!("engine warm-up failed: {err}");
                        init_state.set_failed(err.to_string()).await;
                    }
                    Err(err) => {
                        error!("engine warm-up task failed: {err}");
                        init_state.set_failed(format!("warm-up task failed: {err}")).await;
                    }
                }
            }
            Err(err) => {
                error!("failed to initialize recognition engine: {err}");
                init_state.set_failed(err.to_string()).await;
            }
        }
    });

    let app = Router::new()
        .route("/recognize", post(recognize))
        .route("/health", get(health))
        .with_state(state);

    let listener = TcpListener::bind(bind).await.map_err(RunError::Bind)?;
    info!("serving recognition API on http://{bind}");
    axum::serve(listener, app).await.map_err(RunError::Bind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plate_scan_ocr::{NoopOcrEngine, OcrError, OcrOutput, OcrRequest, OcrToken};

    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;

    const TINY_PNG: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48,
        0x44, 0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00,
        0x00, 0x1F, 0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78,
        0x9C, 0x63, 0x00, 0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00,
        0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
    ];

    struct FixedEngine {
        tokens: Vec<OcrToken>,
    }

    impl PlateOcrEngine for FixedEngine {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn recognize(&self, _: &OcrRequest<'_>) -> Result<OcrOutput, OcrError> {
            Ok(OcrOutput::new(self.tokens.clone()))
        }
    }

    struct FailingEngine;

    impl PlateOcrEngine for FailingEngine {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn recognize(&self, _: &OcrRequest<'_>) -> Result<OcrOutput, OcrError> {
            Err(OcrError::backend("model blew up"))
        }
    }

    fn test_state() -> Arc<ServiceState> {
        Arc::new(ServiceState::new(AggregationOptions::default(), None))
    }

    fn png_payload() -> RecognizeRequest {
        RecognizeRequest {
            image: format!("data:image/png;base64,{}", BASE64.encode(TINY_PNG)),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_is_not_ready_until_engine_loads() {
        let state = test_state();
        let (status, Json(body)) = health(State(Arc::clone(&state))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "initializing");
        assert_eq!(body.model, "loading");

        state.set_ready(Arc::new(NoopOcrEngine)).await;
        let (status, Json(body)) = health(State(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "healthy");
        assert_eq!(body.model, "loaded");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requests_before_warm_up_are_rejected_as_unavailable() {
        let state = test_state();
        let (status, Json(body)) = recognize(State(state), Json(png_payload())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.success);
        assert!(body.error.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_base64_is_a_bad_request_not_a_crash() {
        let state = test_state();
        state.set_ready(Arc::new(NoopOcrEngine)).await;
        let request = RecognizeRequest {
            image: "data:image/png;base64,@@@@".to_string(),
        };
        let (status, Json(body)) = recognize(State(Arc::clone(&state)), Json(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.success);
        assert_eq!(body.license_plate, "");

        // The service keeps answering after the bad payload.
        let (status, Json(body)) = recognize(State(state), Json(png_payload())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn undecodable_image_bytes_are_a_bad_request() {
        let state = test_state();
        state.set_ready(Arc::new(NoopOcrEngine)).await;
        let request = RecognizeRequest {
            image: BASE64.encode(b"not an image"),
        };
        let (status, Json(body)) = recognize(State(state), Json(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.success);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_recognition_reports_debug_details() {
        let state = test_state();
        state
            .set_ready(Arc::new(FixedEngine {
                tokens: vec![
                    OcrToken::new("29A", 0.91),
                    OcrToken::new(" 123 45", 0.42),
                    OcrToken::new("67", 0.88),
                ],
            }))
            .await;
        let (status, Json(body)) = recognize(State(state), Json(png_payload())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        assert_eq!(body.license_plate, "29A*67");
        assert!(body.processing_time.ends_with("ms"));
        let debug = body.debug.expect("debug block missing");
        assert_eq!(debug.total_results, 3);
        assert_eq!(debug.all_texts, vec!["29A", "67"]);
        assert_eq!(debug.confidences, vec![0.91, 0.88]);
        assert!(body.error.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn engine_failure_becomes_structured_error_response() {
        let state = test_state();
        state.set_ready(Arc::new(FailingEngine)).await;
        let (status, Json(body)) = recognize(State(state), Json(png_payload())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.success);
        assert_eq!(body.license_plate, "");
        assert_eq!(body.processing_time, "0.00ms");
        assert!(body.error.unwrap().contains("model blew up"));
        assert!(body.debug.is_none());
    }
}
