//! facecheck-core — Face verification pre/post-processing.
//!
//! RetinaFace decoding and NMS, Umeyama alignment onto the ArcFace template,
//! blur/brightness/pose checks and L2-normalised embeddings. Models run via
//! ONNX Runtime behind the [`model::InferenceEngine`] trait.

pub mod alignment;
pub mod detector;
pub mod linalg;
pub mod liveness;
pub mod model;
pub mod pipeline;
pub mod pose;
pub mod quality;
pub mod recognizer;
pub mod sampler;
pub mod submit;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use alignment::{norm_crop, AlignError, SimilarityTransform, FACE_TEMPLATE_224};
pub use model::{InferenceEngine, ModelError, ModelHandle, ModelSpec, NamedTensors};
pub use pipeline::{
    CancelToken, Pipeline, PipelineConfig, PipelineError, PipelineModels, PipelineOutcome,
};
pub use sampler::{Image, ImageError, ImageView};
pub use types::{
    BoundingBox, CosineMatcher, Embedding, GalleryEntry, Landmarks, MatchResult, Matcher, Point,
};
