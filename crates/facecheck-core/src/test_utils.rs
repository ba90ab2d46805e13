//! Fakes shared by the unit tests.

use crate::detector::{prior_boxes, DetectorOutputs, VARIANCES};
use crate::model::{InferenceEngine, ModelError, NamedTensors};
use crate::sampler::Image;
use crate::types::Point;
use ndarray::Array4;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Engine that returns the same outputs for every call.
pub struct CannedEngine {
    outputs: NamedTensors,
    calls: Arc<AtomicUsize>,
    shapes: Arc<Mutex<Vec<Vec<usize>>>>,
}

impl CannedEngine {
    pub fn new(outputs: NamedTensors) -> Self {
        Self {
            outputs,
            calls: Arc::new(AtomicUsize::new(0)),
            shapes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared call counter, readable after the engine has been boxed.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Shapes of every input tensor seen so far.
    pub fn shapes(&self) -> Arc<Mutex<Vec<Vec<usize>>>> {
        self.shapes.clone()
    }

    pub fn boxed(self) -> Box<dyn InferenceEngine> {
        Box::new(self)
    }
}

impl InferenceEngine for CannedEngine {
    fn run(&mut self, input: &Array4<f32>) -> Result<NamedTensors, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut shapes) = self.shapes.lock() {
            shapes.push(input.shape().to_vec());
        }
        Ok(self.outputs.clone())
    }
}

/// Engine whose every call fails.
pub struct FailingEngine;

impl InferenceEngine for FailingEngine {
    fn run(&mut self, _input: &Array4<f32>) -> Result<NamedTensors, ModelError> {
        Err(ModelError::InferenceFailed("canned failure".into()))
    }
}

/// Raw detector tensors (320×320 anchors) holding a single face at `anchor`.
///
/// The regression values invert the decoder, so decoding yields exactly the
/// given corner box and landmarks in detector pixels.
pub fn encode_face(
    anchor: usize,
    corners: [f32; 4],
    landmarks: [Point; 5],
    score: f32,
) -> NamedTensors {
    let anchors = prior_boxes(320, 320);
    let n = anchors.len();
    let a = anchors[anchor];
    let size = 320.0f32;

    let mut boxes = vec![0.0f32; n * 4];
    let mut scores = vec![0.0f32; n * 2];
    let mut lms = vec![0.0f32; n * 10];

    let [x1, y1, x2, y2] = corners.map(|v| v / size);
    let (cx, cy) = ((x1 + x2) / 2.0, (y1 + y2) / 2.0);
    boxes[anchor * 4] = (cx - a.cx) / (VARIANCES[0] * a.width);
    boxes[anchor * 4 + 1] = (cy - a.cy) / (VARIANCES[0] * a.height);
    boxes[anchor * 4 + 2] = ((x2 - x1) / a.width).ln() / VARIANCES[1];
    boxes[anchor * 4 + 3] = ((y2 - y1) / a.height).ln() / VARIANCES[1];

    scores[anchor * 2] = 1.0 - score;
    scores[anchor * 2 + 1] = score;

    for (k, p) in landmarks.iter().enumerate() {
        lms[anchor * 10 + k * 2] = (p.x / size - a.cx) / (VARIANCES[0] * a.width);
        lms[anchor * 10 + k * 2 + 1] = (p.y / size - a.cy) / (VARIANCES[0] * a.height);
    }

    let names = DetectorOutputs::default();
    [
        (names.boxes, boxes),
        (names.scores, scores),
        (names.landmarks, lms),
    ]
    .into_iter()
    .collect()
}

/// Deterministic high-contrast checkerboard with 4 px cells.
pub fn checkerboard(width: u32, height: u32) -> Image {
    let mut img = Image::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let v = if (x / 4 + y / 4) % 2 == 0 { 230 } else { 70 };
            img.put_pixel(x, y, [v, v, v]);
        }
    }
    img
}

/// Image filled with one colour.
pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Image {
    let mut img = Image::new(width, height);
    for y in 0..height {
        for x in 0..width {
            img.put_pixel(x, y, rgb);
        }
    }
    img
}
