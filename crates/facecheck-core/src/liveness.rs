//! Presentation-attack (liveness) scoring on the 224×224 crop.

use crate::model::{self, ModelError, ModelHandle, ModelSpec};
use crate::pose::softmax_temperature;
use crate::sampler::ImageView;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    #[serde(deserialize_with = "ModelSpec::deserialize_liveness")]
    pub model: ModelSpec,
    pub output: String,
    /// Class index of a live face in the model's softmax.
    pub live_class: usize,
    /// `live_score` at or above this marks the capture as live.
    pub threshold: f32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            model: ModelSpec::liveness(),
            output: "output0".into(),
            live_class: 0,
            threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessScore {
    pub probabilities: Vec<f32>,
    pub live_score: f32,
    pub is_live: bool,
}

/// Anti-spoofing model wrapper.
pub struct LivenessChecker {
    handle: ModelHandle,
    config: LivenessConfig,
}

impl LivenessChecker {
    pub fn new(handle: ModelHandle, config: LivenessConfig) -> Self {
        Self { handle, config }
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ModelHandle {
        &mut self.handle
    }

    pub fn check(&mut self, view: &ImageView<'_>) -> Result<Option<LivenessScore>, ModelError> {
        let input = model::to_planar_tensor(view, &self.config.model)?;
        let outputs = self.handle.run(&input)?;

        let Some(logits) = outputs.get(&self.config.output) else {
            tracing::warn!(output = %self.config.output, "liveness output missing");
            return Ok(None);
        };

        let probabilities = softmax_temperature(logits, 1.0);
        let live_score = probabilities
            .get(self.config.live_class)
            .copied()
            .ok_or_else(|| {
                ModelError::InvalidOutput(format!(
                    "live class {} out of range for {} classes",
                    self.config.live_class,
                    probabilities.len()
                ))
            })?;

        tracing::debug!(live_score, "liveness scored");
        Ok(Some(LivenessScore {
            is_live: live_score >= self.config.threshold,
            probabilities,
            live_score,
        }))
    }
}
