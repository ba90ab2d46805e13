//! Embedding submission contract.
//!
//! A request carries an opaque identifier, the normalised embedding and two
//! flags; the response is opaque text. Transport is up to the implementor.

use crate::pipeline::{FaceReport, PipelineOutcome};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("outcome has no embedding to submit")]
    NoEmbedding,
    #[error("identifier is empty")]
    EmptyIdentifier,
    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("transport: {0}")]
    Transport(String),
}

/// Wire body of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    #[serde(rename = "staff_code")]
    pub identifier: String,
    pub embedding: Vec<f32>,
    /// Capture passed the liveness check.
    #[serde(rename = "fas_flag")]
    pub liveness_flag: bool,
    pub report_flag: bool,
}

impl SubmissionRequest {
    pub fn from_report(
        identifier: impl Into<String>,
        report: &FaceReport,
        report_flag: bool,
    ) -> Result<Self, SubmitError> {
        let identifier = identifier.into();
        if identifier.trim().is_empty() {
            return Err(SubmitError::EmptyIdentifier);
        }
        let embedding = report.embedding.as_ref().ok_or(SubmitError::NoEmbedding)?;
        Ok(Self {
            identifier,
            embedding: embedding.values.clone(),
            liveness_flag: report.liveness.as_ref().is_some_and(|l| l.is_live),
            report_flag,
        })
    }

    /// Request for an accepted outcome; anything else has nothing to submit.
    pub fn from_outcome(
        identifier: impl Into<String>,
        outcome: &PipelineOutcome,
        report_flag: bool,
    ) -> Result<Self, SubmitError> {
        match outcome {
            PipelineOutcome::Accepted(report) => Self::from_report(identifier, report, report_flag),
            _ => Err(SubmitError::NoEmbedding),
        }
    }

    pub fn to_json(&self) -> Result<String, SubmitError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Destination for submission requests.
pub trait Submitter {
    /// Send `request` and return the raw response text.
    fn submit(&mut self, request: &SubmissionRequest) -> Result<String, SubmitError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::SimilarityTransform;
    use crate::liveness::LivenessScore;
    use crate::sampler::Image;
    use crate::types::{BoundingBox, Embedding, Landmarks, Point};

    struct Recording(Vec<String>);

    impl Submitter for Recording {
        fn submit(&mut self, request: &SubmissionRequest) -> Result<String, SubmitError> {
            let body = request.to_json()?;
            self.0.push(body);
            Ok("matched".into())
        }
    }

    fn report(embedding: Option<Vec<f32>>, live: Option<bool>) -> FaceReport {
        let face = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 10.0,
            height: 10.0,
            confidence: 0.9,
            landmarks: Landmarks([Point::default(); 5]),
            label: "face".into(),
        };
        FaceReport {
            face: face.clone(),
            detector_face: face,
            transform: SimilarityTransform::identity(),
            quality: None,
            pose: None,
            pose_labels: None,
            liveness: live.map(|is_live| LivenessScore {
                probabilities: vec![0.5, 0.5],
                live_score: 0.5,
                is_live,
            }),
            embedding: embedding.map(|values| Embedding {
                values,
                model_version: None,
            }),
            crop: Image::new(0, 0),
        }
    }

    #[test]
    fn test_request_uses_wire_names() {
        let face = report(Some(vec![0.6, 0.8]), Some(true));
        let req = SubmissionRequest::from_report("S123", &face, false).unwrap();
        let json: serde_json::Value = serde_json::from_str(&req.to_json().unwrap()).unwrap();
        assert_eq!(json["staff_code"], "S123");
        assert_eq!(json["fas_flag"], true);
        assert_eq!(json["report_flag"], false);
        assert_eq!(json["embedding"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_liveness_flag_defaults_false() {
        let face = report(Some(vec![1.0]), None);
        let req = SubmissionRequest::from_report("S1", &face, true).unwrap();
        assert!(!req.liveness_flag);
        assert!(req.report_flag);
    }

    #[test]
    fn test_requires_embedding_and_identifier() {
        assert!(matches!(
            SubmissionRequest::from_report("S1", &report(None, None), false),
            Err(SubmitError::NoEmbedding)
        ));
        assert!(matches!(
            SubmissionRequest::from_report("  ", &report(Some(vec![1.0]), None), false),
            Err(SubmitError::EmptyIdentifier)
        ));
        assert!(matches!(
            SubmissionRequest::from_outcome("S1", &PipelineOutcome::NoFace, false),
            Err(SubmitError::NoEmbedding)
        ));
    }

    #[test]
    fn test_submitter_returns_response_text() {
        let mut sink = Recording(Vec::new());
        let face = report(Some(vec![1.0]), None);
        let req = SubmissionRequest::from_report("S9", &face, false).unwrap();
        assert_eq!(sink.submit(&req).unwrap(), "matched");
        assert_eq!(sink.0.len(), 1);
        let back: SubmissionRequest = serde_json::from_str(&sink.0[0]).unwrap();
        assert_eq!(back, req);
    }
}
