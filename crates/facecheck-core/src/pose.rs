//! Head pose and mask classification from binned logits.

use crate::model::{self, ModelError, ModelHandle, ModelSpec};
use crate::sampler::ImageView;
use crate::types::PoseResult;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Angle bins per axis; bin `i` covers `i·3 − 93` degrees.
pub const POSE_BINS: usize = 62;
const DEGREES_PER_BIN: f32 = 3.0;
const ANGLE_OFFSET: f32 = 93.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoseError {
    #[error("{axis} logits have {len} bins, expected {expected}", expected = POSE_BINS)]
    BinCount { axis: &'static str, len: usize },
    #[error("mask logits have {0} values, expected 2")]
    MaskLogits(usize),
    #[error("temperature must be positive and finite, got {0}")]
    Temperature(f32),
}

/// `softmax(x / temperature)`, shifted by the maximum for stability.
pub fn softmax_temperature(logits: &[f32], temperature: f32) -> Vec<f32> {
    if logits.is_empty() {
        return Vec::new();
    }
    let scaled: Vec<f32> = logits.iter().map(|x| x / temperature).collect();
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scaled.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Expected bin index under the tempered softmax, mapped to degrees.
pub fn bins_to_degrees(logits: &[f32], temperature: f32) -> f32 {
    let expectation: f32 = softmax_temperature(logits, temperature)
        .iter()
        .enumerate()
        .map(|(i, p)| p * i as f32)
        .sum();
    expectation * DEGREES_PER_BIN - ANGLE_OFFSET
}

pub fn decode_pose(
    mask: &[f32],
    yaw: &[f32],
    pitch: &[f32],
    roll: &[f32],
    temperature: f32,
) -> Result<PoseResult, PoseError> {
    if !(temperature > 0.0 && temperature.is_finite()) {
        return Err(PoseError::Temperature(temperature));
    }
    if mask.len() != 2 {
        return Err(PoseError::MaskLogits(mask.len()));
    }
    for (axis, logits) in [("yaw", yaw), ("pitch", pitch), ("roll", roll)] {
        if logits.len() != POSE_BINS {
            return Err(PoseError::BinCount {
                axis,
                len: logits.len(),
            });
        }
    }

    Ok(PoseResult {
        mask: u8::from(mask[0] > mask[1]),
        yaw: bins_to_degrees(yaw, temperature),
        pitch: bins_to_degrees(pitch, temperature),
        roll: bins_to_degrees(roll, temperature),
    })
}

/// Angle windows for the capture directions. The windows overlap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseWindows {
    pub straight_max_yaw: f32,
    pub side_max_yaw: f32,
    pub max_pitch: f32,
}

impl Default for PoseWindows {
    fn default() -> Self {
        Self {
            straight_max_yaw: 10.0,
            side_max_yaw: 55.0,
            max_pitch: 30.0,
        }
    }
}

/// Every window a pose falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoseLabels {
    pub straight: bool,
    pub left: bool,
    pub right: bool,
}

/// Capture direction a pipeline run may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoseDirection {
    Straight,
    Left,
    Right,
}

impl PoseWindows {
    pub fn is_straight(&self, pose: &PoseResult) -> bool {
        pose.yaw.abs() <= self.straight_max_yaw && pose.pitch.abs() <= self.max_pitch
    }

    pub fn is_left(&self, pose: &PoseResult) -> bool {
        pose.yaw <= self.side_max_yaw && pose.pitch.abs() <= self.max_pitch
    }

    pub fn is_right(&self, pose: &PoseResult) -> bool {
        pose.yaw >= -self.side_max_yaw && pose.pitch.abs() <= self.max_pitch
    }

    pub fn classify(&self, pose: &PoseResult) -> PoseLabels {
        PoseLabels {
            straight: self.is_straight(pose),
            left: self.is_left(pose),
            right: self.is_right(pose),
        }
    }

    pub fn matches(&self, pose: &PoseResult, direction: PoseDirection) -> bool {
        match direction {
            PoseDirection::Straight => self.is_straight(pose),
            PoseDirection::Left => self.is_left(pose),
            PoseDirection::Right => self.is_right(pose),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseOutputs {
    pub mask: String,
    pub yaw: String,
    pub pitch: String,
    pub roll: String,
}

impl Default for PoseOutputs {
    fn default() -> Self {
        Self {
            mask: "output0".into(),
            yaw: "209".into(),
            pitch: "210".into(),
            roll: "211".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseConfig {
    #[serde(deserialize_with = "ModelSpec::deserialize_pose")]
    pub model: ModelSpec,
    pub outputs: PoseOutputs,
    pub temperature: f32,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            model: ModelSpec::pose(),
            outputs: PoseOutputs::default(),
            temperature: 1.0,
        }
    }
}

/// Mask + pose classifier model wrapper.
pub struct PoseEstimator {
    handle: ModelHandle,
    config: PoseConfig,
}

impl PoseEstimator {
    pub fn new(handle: ModelHandle, config: PoseConfig) -> Self {
        Self { handle, config }
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ModelHandle {
        &mut self.handle
    }

    /// Estimate pose on a crop of the model's input size.
    ///
    /// `Ok(None)` when the model does not return all four outputs or they
    /// have the wrong shape. A non-positive temperature is a configuration
    /// error and fails every call.
    pub fn estimate(&mut self, view: &ImageView<'_>) -> Result<Option<PoseResult>, ModelError> {
        let tensor = model::to_planar_tensor(view, &self.config.model)?;
        let outputs = self.handle.run(&tensor)?;
        let names = &self.config.outputs;

        let (Some(mask), Some(yaw), Some(pitch), Some(roll)) = (
            outputs.get(&names.mask),
            outputs.get(&names.yaw),
            outputs.get(&names.pitch),
            outputs.get(&names.roll),
        ) else {
            tracing::warn!(
                available = ?outputs.names().collect::<Vec<_>>(),
                "pose outputs missing"
            );
            return Ok(None);
        };

        let pose = match decode_pose(mask, yaw, pitch, roll, self.config.temperature) {
            Ok(pose) => pose,
            Err(PoseError::Temperature(t)) => {
                return Err(ModelError::InvalidInput(format!(
                    "pose temperature {t} must be positive"
                )));
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed pose outputs");
                return Ok(None);
            }
        };
        tracing::debug!(
            yaw = pose.yaw,
            pitch = pose.pitch,
            roll = pose.roll,
            mask = pose.mask,
            "estimated pose"
        );
        Ok(Some(pose))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NamedTensors;
    use crate::test_utils::{solid, CannedEngine};

    fn one_hot(bin: usize) -> Vec<f32> {
        let mut v = vec![-50.0; POSE_BINS];
        v[bin] = 50.0;
        v
    }

    fn pose(yaw: f32, pitch: f32) -> PoseResult {
        PoseResult {
            mask: 0,
            yaw,
            pitch,
            roll: 0.0,
        }
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax_temperature(&[1.0, 2.0, 3.0, 1000.0], 1.0);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p[3] > 0.999);
    }

    #[test]
    fn test_temperature_flattens_distribution() {
        let sharp = softmax_temperature(&[0.0, 2.0], 1.0);
        let soft = softmax_temperature(&[0.0, 2.0], 4.0);
        assert!(soft[1] < sharp[1]);
        assert!(soft[1] > 0.5);
    }

    #[test]
    fn test_midpoint_bin_is_zero_degrees() {
        assert!(bins_to_degrees(&one_hot(31), 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_extreme_bins() {
        assert!((bins_to_degrees(&one_hot(0), 1.0) + 93.0).abs() < 1e-3);
        assert!((bins_to_degrees(&one_hot(61), 1.0) - 90.0).abs() < 1e-3);
    }

    #[test]
    fn test_uniform_logits_average_bin() {
        // Mean bin 30.5 -> 91.5 - 93
        assert!((bins_to_degrees(&[0.0; POSE_BINS], 1.0) + 1.5).abs() < 1e-3);
    }

    #[test]
    fn test_decode_pose_mask_flag() {
        let p = decode_pose(&[2.0, 1.0], &one_hot(31), &one_hot(31), &one_hot(31), 1.0).unwrap();
        assert_eq!(p.mask, 1);
        let p = decode_pose(&[1.0, 1.0], &one_hot(31), &one_hot(31), &one_hot(31), 1.0).unwrap();
        assert_eq!(p.mask, 0);
    }

    #[test]
    fn test_decode_pose_rejects_bad_lengths() {
        let short = vec![0.0; 10];
        assert_eq!(
            decode_pose(&[0.0, 1.0], &one_hot(1), &short, &one_hot(1), 1.0),
            Err(PoseError::BinCount {
                axis: "pitch",
                len: 10
            })
        );
        assert_eq!(
            decode_pose(&[0.0], &one_hot(1), &one_hot(1), &one_hot(1), 1.0),
            Err(PoseError::MaskLogits(1))
        );
        assert_eq!(
            decode_pose(&[0.0, 1.0], &one_hot(1), &one_hot(1), &one_hot(1), 0.0),
            Err(PoseError::Temperature(0.0))
        );
    }

    #[test]
    fn test_windows_overlap() {
        let w = PoseWindows::default();
        let labels = w.classify(&pose(5.0, 10.0));
        assert_eq!(
            labels,
            PoseLabels {
                straight: true,
                left: true,
                right: true
            }
        );
    }

    #[test]
    fn test_windows_boundaries() {
        let w = PoseWindows::default();
        assert!(w.is_straight(&pose(10.0, 30.0)));
        assert!(!w.is_straight(&pose(10.5, 0.0)));
        assert!(w.is_left(&pose(55.0, 0.0)));
        assert!(!w.is_left(&pose(56.0, 0.0)));
        assert!(w.is_right(&pose(-55.0, 0.0)));
        assert!(!w.is_right(&pose(-60.0, 0.0)));
        assert_eq!(w.classify(&pose(0.0, 31.0)), PoseLabels::default());
        assert!(w.matches(&pose(-40.0, 0.0), PoseDirection::Right));
        assert!(!w.matches(&pose(-40.0, 0.0), PoseDirection::Straight));
    }

    #[test]
    fn test_estimator_reads_named_outputs() {
        let names = PoseOutputs::default();
        let outputs: NamedTensors = [
            (names.mask.clone(), vec![0.1, 0.9]),
            (names.yaw.clone(), one_hot(34)),
            (names.pitch.clone(), one_hot(31)),
            (names.roll.clone(), one_hot(28)),
        ]
        .into_iter()
        .collect();
        let mut est = PoseEstimator::new(
            ModelHandle::ready("pose", CannedEngine::new(outputs).boxed()),
            PoseConfig::default(),
        );
        let crop = solid(112, 112, [128, 128, 128]);
        let p = est.estimate(&crop.view().unwrap()).unwrap().unwrap();
        assert_eq!(p.mask, 0);
        assert!((p.yaw - 9.0).abs() < 1e-3);
        assert!((p.roll + 9.0).abs() < 1e-3);
    }

    #[test]
    fn test_estimator_missing_outputs_is_none() {
        let mut est = PoseEstimator::new(
            ModelHandle::ready("pose", CannedEngine::new(NamedTensors::new()).boxed()),
            PoseConfig::default(),
        );
        let crop = solid(112, 112, [0, 0, 0]);
        assert_eq!(est.estimate(&crop.view().unwrap()).unwrap(), None);
    }

    #[test]
    fn test_estimator_wrong_bin_count_is_none() {
        let names = PoseOutputs::default();
        let outputs: NamedTensors = [
            (names.mask.clone(), vec![0.1, 0.9]),
            (names.yaw.clone(), vec![0.0; 66]),
            (names.pitch.clone(), one_hot(31)),
            (names.roll.clone(), one_hot(31)),
        ]
        .into_iter()
        .collect();
        let mut est = PoseEstimator::new(
            ModelHandle::ready("pose", CannedEngine::new(outputs).boxed()),
            PoseConfig::default(),
        );
        let crop = solid(112, 112, [128, 128, 128]);
        assert_eq!(est.estimate(&crop.view().unwrap()).unwrap(), None);
    }

    #[test]
    fn test_estimator_bad_temperature_is_error() {
        let names = PoseOutputs::default();
        let outputs: NamedTensors = [
            (names.mask.clone(), vec![0.1, 0.9]),
            (names.yaw.clone(), one_hot(31)),
            (names.pitch.clone(), one_hot(31)),
            (names.roll.clone(), one_hot(31)),
        ]
        .into_iter()
        .collect();
        let config = PoseConfig {
            temperature: 0.0,
            ..PoseConfig::default()
        };
        let mut est = PoseEstimator::new(
            ModelHandle::ready("pose", CannedEngine::new(outputs).boxed()),
            config,
        );
        let crop = solid(112, 112, [128, 128, 128]);
        assert!(matches!(
            est.estimate(&crop.view().unwrap()),
            Err(ModelError::InvalidInput(_))
        ));
    }
}
