//! Inference boundary: tensor layout, named outputs and lazily loaded sessions.
//!
//! The numeric code never touches ONNX Runtime directly; it hands a
//! `[1, 3, H, W]` tensor to an [`InferenceEngine`] and reads flat `f32` outputs
//! back by name. [`OrtEngine`] is the production engine, tests substitute
//! canned ones.

use crate::sampler::ImageView;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}, place it in the configured model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid model input: {0}")]
    InvalidInput(String),
    #[error("invalid model output: {0}")]
    InvalidOutput(String),
    #[error("model {0} is unavailable")]
    Unavailable(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Order of the three colour planes in the input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Per-pixel normalisation applied while filling the input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Normalization {
    /// `p - mean[c]`, means given in R, G, B order.
    MeanSubtract { mean: [f32; 3] },
    /// `(p - mean) / std`.
    Affine { mean: f32, std: f32 },
    /// `(p / 255 - 0.5) / 0.5`.
    UnitSymmetric,
    /// Raw pixel values.
    Identity,
}

impl Normalization {
    fn apply(&self, value: f32, channel: usize) -> f32 {
        match *self {
            Normalization::MeanSubtract { mean } => value - mean[channel],
            Normalization::Affine { mean, std } => (value - mean) / std,
            Normalization::UnitSymmetric => (value / 255.0 - 0.5) / 0.5,
            Normalization::Identity => value,
        }
    }
}

/// Input contract of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub file_name: String,
    pub input_width: u32,
    pub input_height: u32,
    pub channel_order: ChannelOrder,
    pub normalization: Normalization,
}

impl ModelSpec {
    /// RetinaFace (MobileNet backbone), 320×320.
    pub fn detector() -> Self {
        Self {
            file_name: "FaceDetectorNewmobilenet320x320.onnx".into(),
            input_width: 320,
            input_height: 320,
            channel_order: ChannelOrder::Bgr,
            normalization: Normalization::MeanSubtract {
                mean: [123.0, 117.0, 104.0],
            },
        }
    }

    /// Mask + head pose classifier on the 112×112 crop.
    pub fn pose() -> Self {
        Self {
            file_name: "MaskPoseTest_opset13.quant.onnx".into(),
            input_width: 112,
            input_height: 112,
            channel_order: ChannelOrder::Bgr,
            normalization: Normalization::Affine {
                mean: 127.5,
                std: 128.0,
            },
        }
    }

    /// Face embedding model on the 112×112 crop.
    pub fn embedding() -> Self {
        Self {
            file_name: "FaceFeature_opset13.quant.onnx".into(),
            input_width: 112,
            input_height: 112,
            channel_order: ChannelOrder::Bgr,
            normalization: Normalization::UnitSymmetric,
        }
    }

    /// Anti-spoofing classifier on the 224×224 crop.
    pub fn liveness() -> Self {
        Self {
            file_name: "FAS_small_Final.onnx".into(),
            input_width: 224,
            input_height: 224,
            channel_order: ChannelOrder::Rgb,
            normalization: Normalization::Identity,
        }
    }

    pub(crate) fn deserialize_detector<'de, D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        ModelSpecOverrides::deserialize(d).map(|o| o.apply(Self::detector()))
    }

    pub(crate) fn deserialize_pose<'de, D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        ModelSpecOverrides::deserialize(d).map(|o| o.apply(Self::pose()))
    }

    pub(crate) fn deserialize_embedding<'de, D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        ModelSpecOverrides::deserialize(d).map(|o| o.apply(Self::embedding()))
    }

    pub(crate) fn deserialize_liveness<'de, D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        ModelSpecOverrides::deserialize(d).map(|o| o.apply(Self::liveness()))
    }

    /// Model name without the `.onnx` extension.
    pub fn version(&self) -> String {
        Path::new(&self.file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file_name.clone())
    }
}

/// A possibly partial `ModelSpec` from configuration. Absent fields keep
/// the values of the model it is applied to.
#[derive(Debug, Default, Deserialize)]
struct ModelSpecOverrides {
    file_name: Option<String>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    channel_order: Option<ChannelOrder>,
    normalization: Option<Normalization>,
}

impl ModelSpecOverrides {
    fn apply(self, base: ModelSpec) -> ModelSpec {
        ModelSpec {
            file_name: self.file_name.unwrap_or(base.file_name),
            input_width: self.input_width.unwrap_or(base.input_width),
            input_height: self.input_height.unwrap_or(base.input_height),
            channel_order: self.channel_order.unwrap_or(base.channel_order),
            normalization: self.normalization.unwrap_or(base.normalization),
        }
    }
}

/// Build the channel-planar `[1, 3, H, W]` input tensor for `spec`.
///
/// The view must already have the model's input size.
pub fn to_planar_tensor(view: &ImageView<'_>, spec: &ModelSpec) -> Result<Array4<f32>, ModelError> {
    if view.width() != spec.input_width || view.height() != spec.input_height {
        return Err(ModelError::InvalidInput(format!(
            "{} expects {}x{}, got {}x{}",
            spec.file_name,
            spec.input_width,
            spec.input_height,
            view.width(),
            view.height()
        )));
    }

    let (w, h) = (spec.input_width as usize, spec.input_height as usize);
    let planes: [usize; 3] = match spec.channel_order {
        ChannelOrder::Rgb => [0, 1, 2],
        ChannelOrder::Bgr => [2, 1, 0],
    };

    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for y in 0..h {
        for x in 0..w {
            let rgb = view.pixel(x as i64, y as i64);
            for (plane, &channel) in planes.iter().enumerate() {
                tensor[[0, plane, y, x]] = spec.normalization.apply(rgb[channel] as f32, channel);
            }
        }
    }
    Ok(tensor)
}

/// Model outputs keyed by tensor name, flattened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedTensors(HashMap<String, Vec<f32>>);

impl NamedTensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f32>) {
        self.0.insert(name.into(), values);
    }

    /// `None` when the output is absent or empty.
    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.0
            .get(name)
            .map(Vec::as_slice)
            .filter(|v| !v.is_empty())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Vec<f32>)> for NamedTensors {
    fn from_iter<I: IntoIterator<Item = (S, Vec<f32>)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Opaque function from one input tensor to named output tensors.
pub trait InferenceEngine: Send {
    fn run(&mut self, input: &Array4<f32>) -> Result<NamedTensors, ModelError>;
}

/// ONNX Runtime session.
pub struct OrtEngine {
    session: Session,
    output_names: Vec<String>,
}

impl OrtEngine {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded ONNX model"
        );

        Ok(Self {
            session,
            output_names,
        })
    }
}

impl InferenceEngine for OrtEngine {
    fn run(&mut self, input: &Array4<f32>) -> Result<NamedTensors, ModelError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut tensors = NamedTensors::new();
        for (idx, name) in self.output_names.iter().enumerate() {
            match outputs[idx].try_extract_tensor::<f32>() {
                Ok((_, data)) => tensors.insert(name.clone(), data.to_vec()),
                Err(e) => tracing::debug!(output = %name, error = %e, "skipping non-f32 output"),
            }
        }
        Ok(tensors)
    }
}

type Loader = Box<dyn FnMut() -> Result<Box<dyn InferenceEngine>, ModelError> + Send>;

/// Lazily constructed inference engine.
///
/// The loader runs on first use. A successful load is kept for the lifetime of
/// the handle; a failed one is recorded and retried on the next call.
pub struct ModelHandle {
    name: String,
    loader: Loader,
    engine: Option<Box<dyn InferenceEngine>>,
    last_error: Option<String>,
}

impl ModelHandle {
    pub fn new<F>(name: impl Into<String>, loader: F) -> Self
    where
        F: FnMut() -> Result<Box<dyn InferenceEngine>, ModelError> + Send + 'static,
    {
        Self {
            name: name.into(),
            loader: Box::new(loader),
            engine: None,
            last_error: None,
        }
    }

    /// Handle backed by an ONNX file, loaded on first use.
    pub fn from_file(name: impl Into<String>, path: PathBuf) -> Self {
        Self::new(name, move || {
            OrtEngine::load(&path).map(|e| Box::new(e) as Box<dyn InferenceEngine>)
        })
    }

    /// Handle around an engine that is already constructed.
    pub fn ready(name: impl Into<String>, engine: Box<dyn InferenceEngine>) -> Self {
        let name = name.into();
        let missing = name.clone();
        Self {
            name,
            loader: Box::new(move || Err(ModelError::Unavailable(missing.clone()))),
            engine: Some(engine),
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.engine.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Load the engine now if it is not loaded yet.
    pub fn warm_up(&mut self) -> Result<(), ModelError> {
        if self.engine.is_some() {
            return Ok(());
        }
        match (self.loader)() {
            Ok(engine) => {
                tracing::debug!(model = %self.name, "model ready");
                self.engine = Some(engine);
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(model = %self.name, error = %e, "model load failed");
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn run(&mut self, input: &Array4<f32>) -> Result<NamedTensors, ModelError> {
        self.warm_up()?;
        match self.engine.as_mut() {
            Some(engine) => engine.run(input),
            None => Err(ModelError::Unavailable(self.name.clone())),
        }
    }

    pub fn status(&self) -> ModelStatus {
        ModelStatus {
            name: self.name.clone(),
            ready: self.is_ready(),
            last_error: self.last_error.clone(),
        }
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Readiness snapshot of one model handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub ready: bool,
    pub last_error: Option<String>,
}
