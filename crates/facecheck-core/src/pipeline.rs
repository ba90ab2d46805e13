//! Single-image verification pipeline.
//!
//! detect → best face → align (224×224) → quality → downscale (112×112) →
//! pose → optional liveness → embed. Cancellation is checked between stages;
//! a stage that is already running completes.

use crate::alignment::{self, AlignError, SimilarityTransform};
use crate::detector::{DetectorConfig, FaceDetector};
use crate::liveness::{LivenessChecker, LivenessConfig, LivenessScore};
use crate::model::{ModelError, ModelHandle, ModelStatus};
use crate::pose::{PoseConfig, PoseDirection, PoseEstimator, PoseLabels, PoseWindows};
use crate::quality::{self, QualityConfig};
use crate::recognizer::{FaceRecognizer, RecognizerConfig, RecognizerError};
use crate::sampler::{self, Image, ImageError, ImageView, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding, PoseResult, QualityScore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Side of the crop fed to the pose and embedding models.
pub const EMBEDDING_CROP_SIZE: u32 = ALIGNED_SIZE / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Detect,
    Align,
    Quality,
    Pose,
    Liveness,
    Embed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Detect => "detect",
            Stage::Align => "align",
            Stage::Quality => "quality",
            Stage::Pose => "pose",
            Stage::Liveness => "liveness",
            Stage::Embed => "embed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("cancelled before {0}")]
    Cancelled(Stage),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("alignment: {0}")]
    Alignment(#[from] AlignError),
    #[error("image: {0}")]
    Image(#[from] ImageError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
}

/// Shared flag raised to stop a run at the next stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self, next: Stage) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            tracing::info!(stage = %next, "pipeline cancelled");
            return Err(PipelineError::Cancelled(next));
        }
        Ok(())
    }
}

/// Gating policy of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub quality: QualityConfig,
    pub pose_windows: PoseWindows,
    pub reject_blurred: bool,
    pub reject_bad_brightness: bool,
    pub reject_masked: bool,
    /// Capture direction the face must match, if any.
    pub required_pose: Option<PoseDirection>,
    pub require_live: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quality: QualityConfig::default(),
            pose_windows: PoseWindows::default(),
            reject_blurred: true,
            reject_bad_brightness: true,
            reject_masked: false,
            required_pose: None,
            require_live: false,
        }
    }
}

/// Model configuration of every stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineModels {
    pub detector: DetectorConfig,
    pub pose: PoseConfig,
    pub recognizer: RecognizerConfig,
    /// Liveness runs only when configured.
    pub liveness: Option<LivenessConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    Blurred { variance: f64 },
    PoorBrightness { mean: f64 },
    Masked,
    PoseOutOfRange { required: PoseDirection },
    PoseUnavailable,
    NotLive { score: f32 },
    LivenessUnavailable,
}

/// Everything measured on the chosen face.
#[derive(Debug, Clone, Serialize)]
pub struct FaceReport {
    /// Box and landmarks in source-image pixels.
    pub face: BoundingBox,
    /// Box and landmarks in detector-input pixels.
    pub detector_face: BoundingBox,
    pub transform: SimilarityTransform,
    pub quality: Option<QualityScore>,
    pub pose: Option<PoseResult>,
    pub pose_labels: Option<PoseLabels>,
    pub liveness: Option<LivenessScore>,
    pub embedding: Option<Embedding>,
    /// Aligned 224×224 crop.
    #[serde(skip)]
    pub crop: Image,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    NoFace,
    Rejected {
        reasons: Vec<RejectReason>,
        report: FaceReport,
    },
    Accepted(FaceReport),
}

impl PipelineOutcome {
    pub fn report(&self) -> Option<&FaceReport> {
        match self {
            PipelineOutcome::NoFace => None,
            PipelineOutcome::Rejected { report, .. } | PipelineOutcome::Accepted(report) => {
                Some(report)
            }
        }
    }

    pub fn embedding(&self) -> Option<&Embedding> {
        match self {
            PipelineOutcome::Accepted(report) => report.embedding.as_ref(),
            _ => None,
        }
    }
}

pub struct Pipeline {
    detector: FaceDetector,
    pose: PoseEstimator,
    recognizer: FaceRecognizer,
    liveness: Option<LivenessChecker>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        detector: FaceDetector,
        pose: PoseEstimator,
        recognizer: FaceRecognizer,
        config: PipelineConfig,
    ) -> Self {
        Self {
            detector,
            pose,
            recognizer,
            liveness: None,
            config,
        }
    }

    pub fn with_liveness(mut self, checker: LivenessChecker) -> Self {
        self.liveness = Some(checker);
        self
    }

    /// Pipeline over ONNX files in `model_dir`, each loaded on first use.
    pub fn from_model_dir(
        model_dir: &Path,
        models: PipelineModels,
        config: PipelineConfig,
    ) -> Self {
        let handle = |name: &str, file: &str| ModelHandle::from_file(name, model_dir.join(file));

        let detector = FaceDetector::new(
            handle("detector", &models.detector.model.file_name),
            models.detector,
        );
        let pose = PoseEstimator::new(handle("pose", &models.pose.model.file_name), models.pose);
        let recognizer = FaceRecognizer::new(
            handle("embedding", &models.recognizer.model.file_name),
            models.recognizer,
        );

        let pipeline = Self::new(detector, pose, recognizer, config);
        match models.liveness {
            Some(cfg) => {
                let checker = LivenessChecker::new(handle("liveness", &cfg.model.file_name), cfg);
                pipeline.with_liveness(checker)
            }
            None => pipeline,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn handles(&self) -> Vec<&ModelHandle> {
        let mut handles = vec![
            self.detector.handle(),
            self.pose.handle(),
            self.recognizer.handle(),
        ];
        if let Some(checker) = &self.liveness {
            handles.push(checker.handle());
        }
        handles
    }

    pub fn status(&self) -> Vec<ModelStatus> {
        self.handles().into_iter().map(ModelHandle::status).collect()
    }

    pub fn is_ready(&self) -> bool {
        self.handles().iter().all(|h| h.is_ready())
    }

    /// Load every model now instead of on first use.
    ///
    /// Every handle is attempted so [`Pipeline::status`] reports each
    /// failure; the first error is returned.
    pub fn warm_up(&mut self) -> Result<(), ModelError> {
        let mut handles = vec![
            self.detector.handle_mut(),
            self.pose.handle_mut(),
            self.recognizer.handle_mut(),
        ];
        if let Some(checker) = self.liveness.as_mut() {
            handles.push(checker.handle_mut());
        }
        let mut first_err = None;
        for handle in handles {
            if let Err(e) = handle.warm_up() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn run(
        &mut self,
        view: &ImageView<'_>,
        cancel: &CancelToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        cancel.check(Stage::Detect)?;
        // Unloadable models fail the run before any inference
        self.warm_up()?;
        let detection = self.detector.detect(view)?;
        let Some(face) = detection.best().cloned() else {
            tracing::info!("no face detected");
            return Ok(PipelineOutcome::NoFace);
        };
        tracing::debug!(confidence = face.confidence, "selected face");

        cancel.check(Stage::Align)?;
        let input_view = detection.input.view()?;
        let (crop, transform) = alignment::align_face(&input_view, &face.landmarks)?;
        let crop_view = crop.view()?;

        cancel.check(Stage::Quality)?;
        let quality = match quality::assess(&crop_view, &self.config.quality) {
            Ok(score) => Some(score),
            Err(e) => {
                tracing::warn!(error = %e, "quality assessment failed, continuing without it");
                None
            }
        };

        let small = sampler::resize_bilinear(&crop_view, EMBEDDING_CROP_SIZE, EMBEDDING_CROP_SIZE);
        let small_view = small.view()?;

        cancel.check(Stage::Pose)?;
        let pose = self.pose.estimate(&small_view)?;
        let pose_labels = pose.map(|p| self.config.pose_windows.classify(&p));

        let liveness = match self.liveness.as_mut() {
            Some(checker) => {
                cancel.check(Stage::Liveness)?;
                checker.check(&crop_view)?
            }
            None => None,
        };

        let mut report = FaceReport {
            face: detection.to_source(&face),
            detector_face: face,
            transform,
            quality,
            pose,
            pose_labels,
            liveness,
            embedding: None,
            crop: Image::new(0, 0),
        };

        let reasons = self.gate(&report);
        if !reasons.is_empty() {
            tracing::info!(?reasons, "face rejected");
            report.crop = crop;
            return Ok(PipelineOutcome::Rejected { reasons, report });
        }

        cancel.check(Stage::Embed)?;
        report.embedding = self.recognizer.extract(&small_view)?;
        report.crop = crop;
        tracing::info!(
            embedded = report.embedding.is_some(),
            "face accepted"
        );
        Ok(PipelineOutcome::Accepted(report))
    }

    fn gate(&self, report: &FaceReport) -> Vec<RejectReason> {
        let cfg = &self.config;
        let mut reasons = Vec::new();

        if let Some(q) = &report.quality {
            if cfg.reject_blurred && q.is_blurred {
                reasons.push(RejectReason::Blurred {
                    variance: q.blur_variance,
                });
            }
            if cfg.reject_bad_brightness && !q.is_acceptable_brightness {
                reasons.push(RejectReason::PoorBrightness {
                    mean: q.mean_brightness,
                });
            }
        }

        match (&report.pose, cfg.required_pose) {
            (Some(p), required) => {
                if cfg.reject_masked && p.mask == 1 {
                    reasons.push(RejectReason::Masked);
                }
                if let Some(dir) = required {
                    if !cfg.pose_windows.matches(p, dir) {
                        reasons.push(RejectReason::PoseOutOfRange { required: dir });
                    }
                }
            }
            (None, Some(_)) => reasons.push(RejectReason::PoseUnavailable),
            (None, None) => {}
        }

        if cfg.require_live {
            match &report.liveness {
                Some(l) if !l.is_live => reasons.push(RejectReason::NotLive {
                    score: l.live_score,
                }),
                Some(_) => {}
                None => reasons.push(RejectReason::LivenessUnavailable),
            }
        }

        reasons
    }
}
