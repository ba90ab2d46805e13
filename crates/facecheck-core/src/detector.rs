//! RetinaFace face detector via ONNX Runtime.
//!
//! Prior-box (anchor) decoding of the box, confidence and landmark regression
//! tensors, followed by greedy NMS. Coordinates are in pixels of the
//! letterboxed detector input.

use crate::model::{self, ModelError, ModelHandle, ModelSpec, NamedTensors};
use crate::sampler::{self, Image, ImageView, Letterbox};
use crate::types::{BoundingBox, Landmarks, Point, FACE_LABEL};
use serde::{Deserialize, Serialize};

// --- Named constants (no magic numbers) ---
const STEPS: [u32; 3] = [8, 16, 32];
const MIN_SIZES: [[f32; 2]; 3] = [[16.0, 32.0], [64.0, 128.0], [256.0, 512.0]];
/// Centre offsets scale by `VARIANCES[0]`, log-sizes by `VARIANCES[1]`.
pub const VARIANCES: [f32; 2] = [0.1, 0.2];

const BOX_STRIDE: usize = 4;
const SCORE_STRIDE: usize = 2;
const LANDMARK_STRIDE: usize = 10;

/// Prior box in coordinates normalised to the input size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub cx: f32,
    pub cy: f32,
    pub width: f32,
    pub height: f32,
}

/// Prior boxes in the order the detector emits its rows: stride level, then
/// grid row, then grid column, then anchor size.
pub fn prior_boxes(input_width: u32, input_height: u32) -> Vec<Anchor> {
    let (w, h) = (input_width as f32, input_height as f32);
    let mut anchors = Vec::new();

    for (level, &step) in STEPS.iter().enumerate() {
        let rows = input_height.div_ceil(step);
        let cols = input_width.div_ceil(step);
        let step = step as f32;
        for i in 0..rows {
            for j in 0..cols {
                for &size in &MIN_SIZES[level] {
                    anchors.push(Anchor {
                        cx: (j as f32 + 0.5) * step / w,
                        cy: (i as f32 + 0.5) * step / h,
                        width: size / w,
                        height: size / h,
                    });
                }
            }
        }
    }

    anchors
}

/// Decoder thresholds and input geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Maximum faces kept after NMS.
    pub limit: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            input_width: 320,
            input_height: 320,
            confidence_threshold: 0.8,
            iou_threshold: 0.5,
            limit: 1,
        }
    }
}

/// Raw detector tensors, flattened per anchor.
#[derive(Debug, Clone, Copy)]
pub struct RawDetections<'a> {
    /// `[dx, dy, dw, dh]` per anchor.
    pub boxes: &'a [f32],
    /// `[background, face]` per anchor.
    pub scores: &'a [f32],
    /// Five `(dx, dy)` pairs per anchor.
    pub landmarks: &'a [f32],
}

/// Decode every anchor whose face score reaches the threshold.
///
/// Only anchors fully covered by all three tensors are decoded.
pub fn decode(
    raw: RawDetections<'_>,
    anchors: &[Anchor],
    config: &DecoderConfig,
) -> Vec<BoundingBox> {
    let available = anchors
        .len()
        .min(raw.boxes.len() / BOX_STRIDE)
        .min(raw.scores.len() / SCORE_STRIDE)
        .min(raw.landmarks.len() / LANDMARK_STRIDE);
    if available < anchors.len() {
        tracing::warn!(
            expected = anchors.len(),
            available,
            "detector outputs shorter than the anchor grid"
        );
    }

    let (w, h) = (config.input_width as f32, config.input_height as f32);
    let mut detections = Vec::new();

    for (idx, anchor) in anchors.iter().take(available).enumerate() {
        let score = raw.scores[idx * SCORE_STRIDE + 1];
        if score.is_nan() || score < config.confidence_threshold {
            continue;
        }

        let b = &raw.boxes[idx * BOX_STRIDE..(idx + 1) * BOX_STRIDE];
        let cx = anchor.cx + b[0] * VARIANCES[0] * anchor.width;
        let cy = anchor.cy + b[1] * VARIANCES[0] * anchor.height;
        let bw = anchor.width * (b[2] * VARIANCES[1]).exp();
        let bh = anchor.height * (b[3] * VARIANCES[1]).exp();

        let l = &raw.landmarks[idx * LANDMARK_STRIDE..(idx + 1) * LANDMARK_STRIDE];
        let landmarks = Landmarks(std::array::from_fn(|k| {
            Point::new(
                (anchor.cx + l[k * 2] * VARIANCES[0] * anchor.width) * w,
                (anchor.cy + l[k * 2 + 1] * VARIANCES[0] * anchor.height) * h,
            )
        }));

        detections.push(BoundingBox {
            x: (cx - bw / 2.0) * w,
            y: (cy - bh / 2.0) * h,
            width: bw * w,
            height: bh * h,
            confidence: score,
            landmarks,
            label: FACE_LABEL.to_string(),
        });
    }

    tracing::trace!(candidates = detections.len(), "decoded detector outputs");
    detections
}

/// Intersection-over-Union; zero when either box has no area.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let area_a = a.area();
    let area_b = b.area();
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }

    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = a.right().min(b.right());
    let y2 = a.bottom().min(b.bottom());

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

/// Greedy Non-Maximum Suppression keeping at most `limit` boxes.
///
/// The sort is stable, so equal confidences keep their anchor order.
pub fn non_max_suppression(
    mut detections: Vec<BoundingBox>,
    limit: usize,
    iou_threshold: f32,
) -> Vec<BoundingBox> {
    if limit == 0 {
        return Vec::new();
    }

    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());
        if keep.len() == limit {
            break;
        }

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Output tensor names of the detector model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorOutputs {
    pub boxes: String,
    pub scores: String,
    pub landmarks: String,
}

impl Default for DetectorOutputs {
    fn default() -> Self {
        Self {
            boxes: "output0".into(),
            scores: "595".into(),
            landmarks: "594".into(),
        }
    }
}

/// Find the three detector tensors.
///
/// Exports of the same network do not always keep the tensor names. When the
/// configured names are absent, tensors are matched by length against the
/// anchor count (4, 2 and 10 values per anchor).
fn discover_outputs<'a>(
    outputs: &'a NamedTensors,
    names: &DetectorOutputs,
    anchors: usize,
) -> Option<RawDetections<'a>> {
    if let (Some(boxes), Some(scores), Some(landmarks)) = (
        outputs.get(&names.boxes),
        outputs.get(&names.scores),
        outputs.get(&names.landmarks),
    ) {
        return Some(RawDetections {
            boxes,
            scores,
            landmarks,
        });
    }

    let by_len = |per_anchor: usize| {
        outputs
            .names()
            .find(|n| outputs.get(n).map(<[f32]>::len) == Some(anchors * per_anchor))
    };
    let boxes = by_len(BOX_STRIDE)?;
    let scores = by_len(SCORE_STRIDE)?;
    let landmarks = by_len(LANDMARK_STRIDE)?;

    tracing::info!(
        boxes,
        scores,
        landmarks,
        "detector: output names not recognized, matched tensors by length"
    );
    Some(RawDetections {
        boxes: outputs.get(boxes)?,
        scores: outputs.get(scores)?,
        landmarks: outputs.get(landmarks)?,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    #[serde(deserialize_with = "ModelSpec::deserialize_detector")]
    pub model: ModelSpec,
    pub outputs: DetectorOutputs,
    pub decoder: DecoderConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model: ModelSpec::detector(),
            outputs: DetectorOutputs::default(),
            decoder: DecoderConfig::default(),
        }
    }
}

/// Faces found in one image, with the raster their coordinates refer to.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Sorted by descending confidence.
    pub faces: Vec<BoundingBox>,
    /// Letterboxed detector input.
    pub input: Image,
    pub letterbox: Letterbox,
}

impl Detection {
    pub fn best(&self) -> Option<&BoundingBox> {
        self.faces.first()
    }

    /// Box and landmarks mapped back to source-image pixels.
    pub fn to_source(&self, face: &BoundingBox) -> BoundingBox {
        let lb = &self.letterbox;
        let origin = lb.to_source(Point::new(face.x, face.y));
        BoundingBox {
            x: origin.x,
            y: origin.y,
            width: face.width / lb.scale,
            height: face.height / lb.scale,
            confidence: face.confidence,
            landmarks: Landmarks(face.landmarks.0.map(|p| lb.to_source(p))),
            label: face.label.clone(),
        }
    }
}

/// RetinaFace-based face detector.
pub struct FaceDetector {
    handle: ModelHandle,
    config: DetectorConfig,
    anchors: Vec<Anchor>,
}

impl FaceDetector {
    pub fn new(handle: ModelHandle, mut config: DetectorConfig) -> Self {
        // Decoding scales by the size the model actually sees
        config.decoder.input_width = config.model.input_width;
        config.decoder.input_height = config.model.input_height;
        let anchors = prior_boxes(config.decoder.input_width, config.decoder.input_height);
        Self {
            handle,
            config,
            anchors,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ModelHandle {
        &mut self.handle
    }

    /// Detect faces in an RGB image.
    ///
    /// Missing or empty output tensors give an empty face list, not an error.
    pub fn detect(&mut self, view: &ImageView<'_>) -> Result<Detection, ModelError> {
        let spec = &self.config.model;
        let (input, letterbox) = sampler::letterbox(view, spec.input_width, spec.input_height);
        let input_view = input
            .view()
            .map_err(|e| ModelError::InvalidInput(e.to_string()))?;
        let tensor = model::to_planar_tensor(&input_view, spec)?;

        let outputs = self.handle.run(&tensor)?;

        let faces = match discover_outputs(&outputs, &self.config.outputs, self.anchors.len()) {
            Some(raw) => {
                let candidates = decode(raw, &self.anchors, &self.config.decoder);
                non_max_suppression(
                    candidates,
                    self.config.decoder.limit,
                    self.config.decoder.iou_threshold,
                )
            }
            None => {
                tracing::warn!(
                    available = ?outputs.names().collect::<Vec<_>>(),
                    "detector outputs missing, treating as no face"
                );
                Vec::new()
            }
        };

        tracing::debug!(faces = faces.len(), "face detection complete");
        Ok(Detection {
            faces,
            input,
            letterbox,
        })
    }
}
