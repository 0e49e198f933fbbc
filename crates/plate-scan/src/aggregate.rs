//! Recognition-result aggregation.
//!
//! Takes the engine's raw token output and produces the final plate string:
//! tokens are kept when their confidence clears the threshold, stripped of
//! whitespace, and joined under the configured merge policy. The invocation
//! wrapper times the engine call and converts engine errors into a typed
//! failure instead of letting them escape.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use plate_scan_ocr::{OcrError, OcrOutput, OcrRequest, PlateOcrEngine};
use plate_scan_types::LumaFrame;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// How kept tokens are joined into one plate string.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MergePolicy {
    /// Join with no separator; one contiguous label.
    Concat,
    /// Join with `*` so physically separate regions (stacked plate lines)
    /// stay distinguishable.
    StarDelimited,
}

impl MergePolicy {
    pub fn separator(self) -> &'static str {
        match self {
            MergePolicy::Concat => "",
            MergePolicy::StarDelimited => "*",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MergePolicy::Concat => "concat",
            MergePolicy::StarDelimited => "star-delimited",
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "concat" => Ok(MergePolicy::Concat),
            "star-delimited" | "star" => Ok(MergePolicy::StarDelimited),
            other => Err(format!("unknown merge policy '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AggregationOptions {
    pub threshold: f32,
    pub policy: MergePolicy,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            policy: MergePolicy::StarDelimited,
        }
    }
}

/// Successful recognition of one image.
///
/// An empty `plate_text` means no token cleared the threshold — a valid
/// "no plate visible" result, not a failure.
#[derive(Clone, Debug)]
pub struct PlateReading {
    pub plate_text: String,
    pub processing_time_ms: f64,
    /// Raw token count before filtering.
    pub total_results: usize,
    /// Normalized texts of the kept tokens, in emission order.
    pub kept_texts: Vec<String>,
    pub kept_confidences: Vec<f32>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    Engine,
    Timeout,
}

/// Typed failure produced at the invocation boundary.
#[derive(Clone, Debug)]
pub struct RecognitionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RecognitionFailure {
    pub fn engine(err: OcrError) -> Self {
        Self {
            kind: FailureKind::Engine,
            message: err.to_string(),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!(
                "engine invocation exceeded the {}ms timeout",
                limit.as_millis()
            ),
        }
    }
}

impl fmt::Display for RecognitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Engine => write!(f, "engine failure: {}", self.message),
            FailureKind::Timeout => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RecognitionFailure {}

/// Strip every whitespace character, internal ones included.
pub fn normalize_text(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

pub fn format_processing_time(ms: f64) -> String {
    format!("{ms:.2}ms")
}

struct Aggregated {
    plate_text: String,
    kept_texts: Vec<String>,
    kept_confidences: Vec<f32>,
}

fn aggregate(output: &OcrOutput, options: AggregationOptions) -> Aggregated {
    let mut kept_texts = Vec::new();
    let mut kept_confidences = Vec::new();
    for token in &output.tokens {
        // Strictly greater: a token at exactly the threshold is discarded.
        if token.confidence > options.threshold {
            kept_texts.push(normalize_text(&token.text));
            kept_confidences.push(token.confidence);
        }
    }
    let plate_text = kept_texts.join(options.policy.separator());
    Aggregated {
        plate_text,
        kept_texts,
        kept_confidences,
    }
}

/// Run one recognition: invoke the engine, time it, aggregate its tokens.
///
/// Engine errors never propagate past this function; they come back as a
/// `RecognitionFailure` the delivery channel can shape.
pub fn read_plate(
    engine: &dyn PlateOcrEngine,
    frame: &LumaFrame,
    options: AggregationOptions,
) -> Result<PlateReading, RecognitionFailure> {
    let request = OcrRequest::new(frame);
    let started = Instant::now();
    let output = engine
        .recognize(&request)
        .map_err(RecognitionFailure::engine)?;
    let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;

    let aggregated = aggregate(&output, options);
    Ok(PlateReading {
        plate_text: aggregated.plate_text,
        processing_time_ms,
        total_results: output.tokens.len(),
        kept_texts: aggregated.kept_texts,
        kept_confidences: aggregated.kept_confidences,
    })
}

/// Async wrapper used by the service and watch modes: runs the engine on the
/// blocking pool and maps a stalled invocation to a recoverable timeout
/// failure.
pub async fn read_plate_blocking(
    engine: Arc<dyn PlateOcrEngine>,
    frame: LumaFrame,
    options: AggregationOptions,
    limit: Option<Duration>,
) -> Result<PlateReading, RecognitionFailure> {
    let task =
        tokio::task::spawn_blocking(move || read_plate(engine.as_ref(), &frame, options));
    let joined = match limit {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => return Err(RecognitionFailure::timeout(limit)),
        },
        None => task.await,
    };
    joined.unwrap_or_else(|err| {
        Err(RecognitionFailure {
            kind: FailureKind::Engine,
            message: format!("recognition task failed: {err}"),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use plate_scan_ocr::{OcrToken, PlateOcrEngine};

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
            Err(OcrError::backend("inference exploded"))
        }
    }

    fn blank_frame() -> LumaFrame {
        LumaFrame::from_owned(4, 4, 4, vec![0; 16]).unwrap()
    }

    fn options(policy: MergePolicy) -> AggregationOptions {
        AggregationOptions {
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            policy,
        }
    }

    #[test]
    fn threshold_is_strictly_greater_than() {
        let output = OcrOutput::new(vec![
            OcrToken::new("AT", 0.5),
            OcrToken::new("ABOVE", 0.500_000_1),
            OcrToken::new("BELOW", 0.49),
        ]);
        let aggregated = aggregate(&output, options(MergePolicy::StarDelimited));
        assert_eq!(aggregated.plate_text, "ABOVE");
        assert_eq!(aggregated.kept_confidences, vec![0.500_000_1]);
    }

    #[test]
    fn normalization_strips_all_whitespace() {
        assert_eq!(normalize_text(" 51F 123\t45\n"), "51F12345");
        assert_eq!(normalize_text("no\u{00a0}break"), "nobreak");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_text("  2 9 A ");
        assert_eq!(normalize_text(&once), once);
    }

    #[test]
    fn merge_preserves_emission_order() {
        let output = OcrOutput::new(vec![
            OcrToken::new("51F", 0.9),
            OcrToken::new("12345", 0.8),
        ]);
        assert_eq!(
            aggregate(&output, options(MergePolicy::StarDelimited)).plate_text,
            "51F*12345"
        );
        assert_eq!(
            aggregate(&output, options(MergePolicy::Concat)).plate_text,
            "51F12345"
        );
    }

    #[test]
    fn no_kept_tokens_is_success_with_empty_plate() {
        let engine = FixedEngine {
            tokens: vec![OcrToken::new("29A", 0.4), OcrToken::new("67", 0.5)],
        };
        let reading = read_plate(
            &engine,
            &blank_frame(),
            options(MergePolicy::StarDelimited),
        )
        .unwrap();
        assert_eq!(reading.plate_text, "");
        assert_eq!(reading.total_results, 2);
        assert!(reading.kept_texts.is_empty());
    }

    #[test]
    fn mixed_confidence_scenario_keeps_order_and_strips_spaces() {
        let engine = FixedEngine {
            tokens: vec![
                OcrToken::new("29A", 0.91),
                OcrToken::new(" 123 45", 0.42),
                OcrToken::new("67", 0.88),
            ],
        };
        let reading = read_plate(
            &engine,
            &blank_frame(),
            options(MergePolicy::StarDelimited),
        )
        .unwrap();
        assert_eq!(reading.plate_text, "29A*67");
        assert_eq!(reading.kept_texts, vec!["29A", "67"]);
        assert_eq!(reading.kept_confidences, vec![0.91, 0.88]);
        assert_eq!(reading.total_results, 3);
    }

    #[test]
    fn engine_error_becomes_typed_failure() {
        let failure = read_plate(
            &FailingEngine,
            &blank_frame(),
            options(MergePolicy::StarDelimited),
        )
        .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Engine);
        assert!(failure.message.contains("inference exploded"));
    }

    #[test]
    fn single_token_has_no_separator() {
        let output = OcrOutput::new(vec![OcrToken::new("29 A", 0.95)]);
        assert_eq!(
            aggregate(&output, options(MergePolicy::StarDelimited)).plate_text,
            "29A"
        );
    }

    #[test]
    fn processing_time_renders_two_decimals() {
        assert_eq!(format_processing_time(12.345), "12.35ms");
        assert_eq!(format_processing_time(0.0), "0.00ms");
    }

    #[test]
    fn merge_policy_parses_config_names() {
        assert_eq!(
            "star-delimited".parse::<MergePolicy>().unwrap(),
            MergePolicy::StarDelimited
        );
        assert_eq!("concat".parse::<MergePolicy>().unwrap(), MergePolicy::Concat);
        assert!("join".parse::<MergePolicy>().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_wrapper_reports_timeout_as_recoverable_failure() {
        struct SlowEngine;

        impl PlateOcrEngine for SlowEngine {
            fn name(&self) -> &'static str {
                "slow"
            }

            fn recognize(&self, _: &OcrRequest<'_>) -> Result<OcrOutput, OcrError> {
                std::thread::sleep(Duration::from_millis(200));
                Ok(OcrOutput::empty())
            }
        }

        let failure = read_plate_blocking(
            Arc::new(SlowEngine),
            blank_frame(),
            AggregationOptions::default(),
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
    }
}
