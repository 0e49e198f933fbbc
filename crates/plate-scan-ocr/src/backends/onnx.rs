use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ndarray::{Array4, CowArray, IxDyn};
use once_cell::sync::OnceCell;
use ort::environment::Environment;
use ort::error::OrtError;
use ort::session::{Session, SessionBuilder};
use ort::value::Value;

use crate::{OcrError, OcrOutput, OcrRequest, OcrToken, PlateOcrEngine};
use plate_scan_types::LumaFrame;

const INPUT_HEIGHT: usize = 48;
const INPUT_WIDTH: usize = 320;

// Row-profile segmentation constants. A row whose mean absolute deviation
// exceeds the activity threshold is considered part of a text band.
const BAND_ACTIVITY_THRESHOLD: f32 = 12.0;
const BAND_MIN_HEIGHT: usize = 8;
const BAND_MERGE_GAP: usize = 2;

#[derive(Debug, Clone)]
struct ModelHandle {
    _environment: Arc<Environment>,
    session: Arc<Session>,
}

struct ModelRegistry {
    environment: Arc<Environment>,
    handles: Mutex<HashMap<PathBuf, Arc<ModelHandle>>>,
}

impl ModelRegistry {
    fn new() -> Result<Self, OcrError> {
        let environment = Environment::builder()
            .with_name("plate-scan-ocr")
            .build()
            .map_err(map_environment_error)?;
        Ok(Self {
            environment: Arc::new(environment),
            handles: Mutex::new(HashMap::new()),
        })
    }

    fn get(&self, path: &Path) -> Result<Arc<ModelHandle>, OcrError> {
        if !path.exists() {
            return Err(OcrError::backend(format!(
                "onnx model file '{}' does not exist",
                path.display()
            )));
        }

        let mut guard = self.handles.lock().expect("onnx registry poisoned");
        if let Some(handle) = guard.get(path) {
            return Ok(handle.clone());
        }

        let session = SessionBuilder::new(&self.environment)
            .map_err(map_session_error)?
            .with_model_from_file(path)
            .map_err(map_session_error)?;

        let handle = Arc::new(ModelHandle {
            _environment: Arc::clone(&self.environment),
            session: Arc::new(session),
        });
        guard.insert(path.to_path_buf(), handle.clone());
        Ok(handle)
    }
}

static MODEL_REGISTRY: OnceCell<ModelRegistry> = OnceCell::new();

fn registry() -> Result<&'static ModelRegistry, OcrError> {
    MODEL_REGISTRY.get_or_try_init(ModelRegistry::new)
}

/// CRNN/CTC plate recognition over ONNX Runtime.
///
/// The frame is split into horizontal text bands via a row-activity profile
/// (stacked two-line plates produce one token per line); each band is resized
/// to the model's fixed input and decoded greedily.
#[derive(Debug)]
pub struct OnnxPlateEngine {
    model: Arc<ModelHandle>,
    alphabet: Arc<Vec<char>>,
}

impl OnnxPlateEngine {
    pub fn new(model_path: PathBuf) -> Result<Self, OcrError> {
        let registry = registry()?;
        let model = registry.get(&model_path)?;
        Ok(Self {
            model,
            alphabet: Arc::new(default_alphabet()),
        })
    }

    /// Replace the built-in alphabet with a recognition dictionary file,
    /// one entry per line (the PaddleOCR keys format).
    pub fn with_alphabet_file(mut self, path: &Path) -> Result<Self, OcrError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            OcrError::backend(format!(
                "failed to read alphabet file '{}': {err}",
                path.display()
            ))
        })?;
        let alphabet: Vec<char> = contents
            .lines()
            .filter_map(|line| line.chars().next())
            .collect();
        if alphabet.is_empty() {
            return Err(OcrError::backend(format!(
                "alphabet file '{}' contains no entries",
                path.display()
            )));
        }
        self.alphabet = Arc::new(alphabet);
        Ok(self)
    }

    fn recognize_band(
        &self,
        frame: &LumaFrame,
        band: RowBand,
    ) -> Result<Option<OcrToken>, OcrError> {
        let roi = extract_band(frame, band);
        if roi.is_empty() {
            return Ok(None);
        }

        let resized = resize_with_padding(
            &roi,
            frame.width() as usize,
            band.height,
            INPUT_WIDTH,
            INPUT_HEIGHT,
        );
        let input = prepare_input_tensor(&resized, INPUT_WIDTH, INPUT_HEIGHT)?;
        let (data, shape) = self.run_model(&input)?;
        let (text, confidence) = decode_sequence(&data, &shape, &self.alphabet)?;
        if text.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(OcrToken::new(text, confidence)))
        }
    }

    fn run_model(&self, input: &Array4<f32>) -> Result<(Vec<f32>, Vec<usize>), OcrError> {
        let session = &self.model.session;
        let allocator = session.allocator();
        let input_dyn: CowArray<'_, f32, IxDyn> = CowArray::from(input.view().into_dyn());
        let tensor = Value::from_array(allocator, &input_dyn).map_err(map_input_error)?;
        let outputs = session.run(vec![tensor]).map_err(map_inference_error)?;
        let tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| OcrError::backend("onnx model produced no output"))?
            .try_extract::<f32>()
            .map_err(map_inference_error)?;
        let view = tensor.view();
        let shape = view.shape().to_vec();
        let data = view.iter().copied().collect::<Vec<f32>>();
        Ok((data, shape))
    }
}

impl PlateOcrEngine for OnnxPlateEngine {
    fn name(&self) -> &'static str {
        "onnx_plate"
    }

    fn warm_up(&self) -> Result<(), OcrError> {
        // Dummy inference so the first real request does not pay for kernel
        // initialization.
        let blank = vec![0.0f32; INPUT_WIDTH * INPUT_HEIGHT];
        let input = prepare_input_tensor(&blank, INPUT_WIDTH, INPUT_HEIGHT)?;
        self.run_model(&input)?;
        Ok(())
    }

    fn recognize(&self, request: &OcrRequest<'_>) -> Result<OcrOutput, OcrError> {
        let frame = request.frame();
        let mut tokens = Vec::new();
        for band in text_bands(frame) {
            if let Some(token) = self.recognize_band(frame, band)? {
                tokens.push(token);
            }
        }
        Ok(OcrOutput::new(tokens))
    }
}

fn map_environment_error(err: OrtError) -> OcrError {
    map_schema_conflict(err, "failed to initialise ONNX runtime environment")
}

fn map_session_error(err: OrtError) -> OcrError {
    map_schema_conflict(err, "failed to load ONNX model")
}

fn map_input_error(err: OrtError) -> OcrError {
    OcrError::backend(format!("failed to prepare ONNX input: {err}"))
}

fn map_inference_error(err: OrtError) -> OcrError {
    OcrError::backend(format!("ONNX inference failed: {err}"))
}

fn map_schema_conflict(err: OrtError, context: &str) -> OcrError {
    let message = err.to_string();
    if message.contains("Trying to register schema with name") {
        OcrError::backend(format!(
            "{context}: detected ONNX Runtime schema registration conflict ({message})"
        ))
    } else {
        OcrError::backend(format!("{context}: {message}"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RowBand {
    y: usize,
    height: usize,
}

/// Horizontal text bands, top to bottom.
///
/// Plate characters produce high contrast against the plate background, so
/// rows that intersect a text line have a large mean absolute deviation while
/// background rows are close to uniform. Falls back to the whole frame when
/// no band stands out.
fn text_bands(frame: &LumaFrame) -> Vec<RowBand> {
    let height = frame.height() as usize;
    if height == 0 || frame.width() == 0 {
        return Vec::new();
    }

    let active: Vec<bool> = (0..frame.height())
        .map(|y| row_activity(frame.row(y)) > BAND_ACTIVITY_THRESHOLD)
        .collect();

    let mut bands = Vec::new();
    let mut start = None;
    let mut gap = 0usize;
    for (y, is_active) in active.iter().copied().enumerate() {
        match (start, is_active) {
            (None, true) => {
                start = Some(y);
                gap = 0;
            }
            (Some(_), true) => gap = 0,
            (Some(from), false) => {
                gap += 1;
                if gap > BAND_MERGE_GAP {
                    push_band(&mut bands, from, y - gap + 1);
                    start = None;
                }
            }
            (None, false) => {}
        }
    }
    if let Some(from) = start {
        push_band(&mut bands, from, height - gap);
    }

    if bands.is_empty() {
        bands.push(RowBand { y: 0, height });
    }
    bands
}

fn push_band(bands: &mut Vec<RowBand>, from: usize, to: usize) {
    let height = to.saturating_sub(from);
    if height >= BAND_MIN_HEIGHT {
        bands.push(RowBand { y: from, height });
    }
}

fn row_activity(row: &[u8]) -> f32 {
    if row.is_empty() {
        return 0.0;
    }
    let len = row.len() as f32;
    let mean = row.iter().map(|&value| value as f32).sum::<f32>() / len;
    row.iter()
        .map(|&value| (value as f32 - mean).abs())
        .sum::<f32>()
        / len
}

fn extract_band(frame: &LumaFrame, band: RowBand) -> Vec<u8> {
    let width = frame.width() as usize;
    if width == 0 || band.height == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(width * band.height);
    for row in 0..band.height {
        out.extend_from_slice(frame.row((band.y + row) as u32));
    }
    out
}

fn resize_with_padding(
    src: &[u8],
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
) -> Vec<f32> {
    if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
        return vec![0.0; dst_width * dst_height];
    }
    let mut scaled_width =
        ((dst_height as f32 / src_height as f32) * src_width as f32).round() as usize;
    scaled_width = scaled_width.clamp(1, dst_width);
    let resized = resize_bilinear(src, src_width, src_height, scaled_width, dst_height);
    let mut canvas = vec![0.0f32; dst_width * dst_height];
    for row in 0..dst_height {
        let dst_row = &mut canvas[row * dst_width..(row + 1) * dst_width];
        let src_row = &resized[row * scaled_width..(row + 1) * scaled_width];
        dst_row[..scaled_width].copy_from_slice(src_row);
    }
    canvas
}

fn resize_bilinear(
    src: &[u8],
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
) -> Vec<f32> {
    if dst_width == 0 || dst_height == 0 {
        return Vec::new();
    }
    let mut out = vec![0.0f32; dst_width * dst_height];
    let scale_x = if dst_width > 1 {
        (src_width - 1) as f32 / (dst_width - 1) as f32
    } else {
        0.0
    };
    let scale_y = if dst_height > 1 {
        (src_height - 1) as f32 / (dst_height - 1) as f32
    } else {
        0.0
    };

    for dy in 0..dst_height {
        let fy = scale_y * dy as f32;
        let y0 = fy.floor() as usize;
        let y1 = (y0 + 1).min(src_height - 1);
        let wy = fy - y0 as f32;
        for dx in 0..dst_width {
            let fx = scale_x * dx as f32;
            let x0 = fx.floor() as usize;
            let x1 = (x0 + 1).min(src_width - 1);
            let wx = fx - x0 as f32;

            let top_left = src[y0 * src_width + x0] as f32;
            let top_right = src[y0 * src_width + x1] as f32;
            let bottom_left = src[y1 * src_width + x0] as f32;
            let bottom_right = src[y1 * src_width + x1] as f32;

            let top = top_left + (top_right - top_left) * wx;
            let bottom = bottom_left + (bottom_right - bottom_left) * wx;
            let value = top + (bottom - top) * wy;
            out[dy * dst_width + dx] = (value / 255.0).clamp(0.0, 1.0);
        }
    }
    out
}

fn prepare_input_tensor(
    normalized: &[f32],
    width: usize,
    height: usize,
) -> Result<Array4<f32>, OcrError> {
    if normalized.len() != width * height {
        return Err(OcrError::backend(
            "normalized image has unexpected length for ONNX input",
        ));
    }
    let mut data = vec![0.0f32; normalized.len() * 3];
    let area = width * height;
    for i in 0..area {
        let value = normalized[i];
        data[i] = value;
        data[i + area] = value;
        data[i + 2 * area] = value;
    }
    Array4::from_shape_vec((1, 3, height, width), data)
        .map_err(|err| OcrError::backend(format!("failed to build ONNX input tensor: {err}")))
}

fn decode_sequence(
    data: &[f32],
    shape: &[usize],
    alphabet: &[char],
) -> Result<(String, f32), OcrError> {
    let mut dims: Vec<usize> = shape.iter().copied().collect();
    while dims.len() > 2 && dims.first() == Some(&1) {
        dims.remove(0);
    }
    while dims.len() > 2 && dims.last() == Some(&1) {
        dims.pop();
    }
    if dims.len() > 2 {
        return Err(OcrError::backend(format!(
            "unsupported ONNX output shape: {shape:?}"
        )));
    }

    let classes = alphabet.len() + 1;
    let (sequence_len, layout) = match dims.as_slice() {
        [seq, class] if *class == classes => (*seq, OutputLayout::SequenceMajor),
        [class, seq] if *class == classes => (*seq, OutputLayout::ClassMajor),
        [] | [1] => (1, OutputLayout::SequenceMajor),
        other => {
            return Err(OcrError::backend(format!(
                "unexpected ONNX output dimensions {other:?} for alphabet of size {classes}"
            )));
        }
    };

    if data.len() < sequence_len * classes {
        return Err(OcrError::backend(
            "onnx output buffer shorter than expected",
        ));
    }

    let mut result = String::new();
    let mut previous_idx: Option<usize> = None;
    let mut confidence_sum = 0.0f32;
    let mut confidence_count = 0usize;

    for step in 0..sequence_len {
        let mut max_logit = f32::NEG_INFINITY;
        for class in 0..classes {
            let value = get_logit(data, step, class, sequence_len, classes, layout);
            if value > max_logit {
                max_logit = value;
            }
        }
        let mut sum = 0.0f32;
        let mut best_index = 0usize;
        let mut best_prob = 0.0f32;
        for class in 0..classes {
            let value = get_logit(data, step, class, sequence_len, classes, layout);
            let exp = (value - max_logit).exp();
            sum += exp;
            if exp > best_prob {
                best_prob = exp;
                best_index = class;
            }
        }
        if sum <= 0.0 {
            continue;
        }
        let prob = best_prob / sum;
        if best_index != 0 && previous_idx != Some(best_index) {
            if let Some(character) = alphabet.get(best_index - 1) {
                result.push(*character);
                confidence_sum += prob;
                confidence_count += 1;
            }
        }
        if best_index == 0 {
            previous_idx = None;
        } else {
            previous_idx = Some(best_index);
        }
    }

    let confidence = if confidence_count > 0 {
        confidence_sum / confidence_count as f32
    } else {
        0.0
    };
    Ok((result, confidence))
}

#[derive(Clone, Copy)]
enum OutputLayout {
    SequenceMajor,
    ClassMajor,
}

fn get_logit(
    data: &[f32],
    step: usize,
    class: usize,
    sequence_len: usize,
    classes: usize,
    layout: OutputLayout,
) -> f32 {
    match layout {
        OutputLayout::SequenceMajor => data[step * classes + class],
        OutputLayout::ClassMajor => data[class * sequence_len + step],
    }
}

fn default_alphabet() -> Vec<char> {
    // Digits first, then Latin letters and the punctuation seen on plates.
    "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-. "
        .chars()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_rows(width: u32, rows: &[&[u8]]) -> LumaFrame {
        let mut data = Vec::new();
        for row in rows {
            data.extend_from_slice(row);
        }
        LumaFrame::from_owned(width, rows.len() as u32, width as usize, data).unwrap()
    }

    fn logits_for(alphabet: &[char], indices: &[usize]) -> (Vec<f32>, Vec<usize>) {
        let classes = alphabet.len() + 1;
        let mut data = vec![0.0f32; indices.len() * classes];
        for (step, &class) in indices.iter().enumerate() {
            data[step * classes + class] = 10.0;
        }
        (data, vec![indices.len(), classes])
    }

    #[test]
    fn decode_collapses_repeats_and_blanks() {
        let alphabet: Vec<char> = "AB1".chars().collect();
        // blank=0, 'A'=1, 'B'=2, '1'=3
        let (data, shape) = logits_for(&alphabet, &[1, 1, 0, 2, 2, 0, 3]);
        let (text, confidence) = decode_sequence(&data, &shape, &alphabet).unwrap();
        assert_eq!(text, "AB1");
        assert!(confidence > 0.9);
    }

    #[test]
    fn decode_emits_repeated_character_across_blank() {
        let alphabet: Vec<char> = "7".chars().collect();
        let (data, shape) = logits_for(&alphabet, &[1, 0, 1]);
        let (text, _) = decode_sequence(&data, &shape, &alphabet).unwrap();
        assert_eq!(text, "77");
    }

    #[test]
    fn decode_rejects_mismatched_shape() {
        let alphabet: Vec<char> = "AB".chars().collect();
        let data = vec![0.0f32; 10];
        let err = decode_sequence(&data, &[2, 5], &alphabet).unwrap_err();
        assert!(matches!(err, OcrError::Backend { .. }));
    }

    #[test]
    fn uniform_frame_falls_back_to_single_band() {
        let rows: Vec<Vec<u8>> = (0..32).map(|_| vec![128u8; 64]).collect();
        let refs: Vec<&[u8]> = rows.iter().map(|row| row.as_slice()).collect();
        let frame = frame_with_rows(64, &refs);
        let bands = text_bands(&frame);
        assert_eq!(bands, vec![RowBand { y: 0, height: 32 }]);
    }

    #[test]
    fn two_text_stripes_become_two_bands() {
        let mut stripe = vec![0u8; 64];
        for (i, value) in stripe.iter_mut().enumerate() {
            *value = if i % 2 == 0 { 0 } else { 255 };
        }
        let flat = vec![128u8; 64];
        let mut rows: Vec<Vec<u8>> = Vec::new();
        for _ in 0..4 {
            rows.push(flat.clone());
        }
        for _ in 0..10 {
            rows.push(stripe.clone());
        }
        for _ in 0..6 {
            rows.push(flat.clone());
        }
        for _ in 0..10 {
            rows.push(stripe.clone());
        }
        for _ in 0..4 {
            rows.push(flat.clone());
        }
        let refs: Vec<&[u8]> = rows.iter().map(|row| row.as_slice()).collect();
        let frame = frame_with_rows(64, &refs);
        let bands = text_bands(&frame);
        assert_eq!(bands.len(), 2);
        assert_eq!(bands[0].y, 4);
        assert_eq!(bands[0].height, 10);
        assert_eq!(bands[1].y, 20);
        assert_eq!(bands[1].height, 10);
    }

    #[test]
    fn resize_with_padding_preserves_aspect_and_pads_right() {
        let src = vec![255u8; 10 * 24];
        let out = resize_with_padding(&src, 10, 24, INPUT_WIDTH, INPUT_HEIGHT);
        assert_eq!(out.len(), INPUT_WIDTH * INPUT_HEIGHT);
        // 10/24 aspect at height 48 -> scaled width 20; the rest is padding.
        assert!(out[0] > 0.99);
        assert!(out[19] > 0.99);
        assert_eq!(out[21], 0.0);
    }
}
