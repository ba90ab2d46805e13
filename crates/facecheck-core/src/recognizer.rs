//! Face embedding extraction via ONNX Runtime.
//!
//! Runs the feature model on the 112×112 crop and L2-normalises its output.

use crate::model::{self, ModelError, ModelHandle, ModelSpec};
use crate::sampler::ImageView;
use crate::types::{Embedding, EmbeddingError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("embedding: {0}")]
    Embedding(#[from] EmbeddingError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    #[serde(deserialize_with = "ModelSpec::deserialize_embedding")]
    pub model: ModelSpec,
    pub output: String,
    /// Reject outputs of any other length when set.
    pub expected_dim: Option<usize>,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            model: ModelSpec::embedding(),
            output: "output0".into(),
            expected_dim: None,
        }
    }
}

/// Embedding model wrapper.
pub struct FaceRecognizer {
    handle: ModelHandle,
    config: RecognizerConfig,
}

impl FaceRecognizer {
    pub fn new(handle: ModelHandle, config: RecognizerConfig) -> Self {
        Self { handle, config }
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ModelHandle {
        &mut self.handle
    }

    /// Extract a normalised embedding from a crop of the model's input size.
    ///
    /// `Ok(None)` when the model returns no embedding output.
    pub fn extract(&mut self, view: &ImageView<'_>) -> Result<Option<Embedding>, RecognizerError> {
        let input = model::to_planar_tensor(view, &self.config.model)?;
        let outputs = self.handle.run(&input)?;

        let Some(raw) = outputs.get(&self.config.output) else {
            tracing::warn!(
                output = %self.config.output,
                available = ?outputs.names().collect::<Vec<_>>(),
                "embedding output missing"
            );
            return Ok(None);
        };

        if let Some(dim) = self.config.expected_dim {
            if raw.len() != dim {
                return Err(ModelError::InvalidOutput(format!(
                    "expected {dim}-dim embedding, got {}",
                    raw.len()
                ))
                .into());
            }
        }

        let embedding = Embedding::from_raw(raw, Some(self.config.model.version()))?;
        tracing::debug!(dim = embedding.len(), "extracted embedding");
        Ok(Some(embedding))
    }
}
