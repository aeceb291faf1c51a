//! Acoustic model abstraction.
//!
//! The `AcousticModel` trait decouples the pipeline from any specific backend
//! (deterministic stub, ONNX onsets-and-frames, ...). Backend selection
//! (hardware delegate vs. CPU) belongs to whoever constructs the model; the
//! pipeline only ever sees the trait.
//!
//! `&mut self` on `infer` lets backends keep scratch buffers or session state.
//! All mutation is serialised through `ModelHandle`'s `parking_lot::Mutex`.

pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxAcousticModel, OnnxModelConfig};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffering::window::AnalysisWindow;
use crate::decode::matrix::{ProbabilityMatrix, MODEL_OUTPUT_SHAPE};
use crate::error::Result;

/// Contract for acoustic model backends.
pub trait AcousticModel: Send + 'static {
    /// One-time warm-up: load weights and run a dummy inference.
    /// Called once at engine startup.
    ///
    /// # Errors
    /// Returns an error if model files are missing or corrupt.
    fn warm_up(&mut self) -> Result<()>;

    /// Run the model on one analysis window.
    ///
    /// Returns the four `[32, 88]` evidence matrices. The window is shared
    /// and read-only; use [`AnalysisWindow::to_model_input`] for the
    /// normalised `[-1, 1]` f32 view.
    fn infer(&mut self, window: &AnalysisWindow) -> Result<ModelOutput>;

    /// Reset any internal state (e.g. between capture sessions).
    fn reset(&mut self);
}

/// Thread-safe reference-counted handle to any `AcousticModel` implementor.
#[derive(Clone)]
pub struct ModelHandle(pub Arc<Mutex<dyn AcousticModel>>);

impl ModelHandle {
    /// Wrap any `AcousticModel` in a `ModelHandle`.
    pub fn new<M: AcousticModel>(model: M) -> Self {
        Self(Arc::new(Mutex::new(model)))
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").finish_non_exhaustive()
    }
}

/// Per-window model evidence, each matrix `[frames, pitches]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    /// Probability that a note is sounding.
    pub frames: ProbabilityMatrix,
    /// Probability that a note starts.
    pub onsets: ProbabilityMatrix,
    /// Probability that a note ends.
    pub offsets: ProbabilityMatrix,
    /// Raw velocity prediction (model-native scale; clamped when used).
    pub velocities: ProbabilityMatrix,
}

impl ModelOutput {
    /// All-zero output of the standard model shape.
    pub fn silent() -> Self {
        let (rows, cols) = MODEL_OUTPUT_SHAPE;
        Self {
            frames: ProbabilityMatrix::filled(rows, cols, 0.0),
            onsets: ProbabilityMatrix::filled(rows, cols, 0.0),
            offsets: ProbabilityMatrix::filled(rows, cols, 0.0),
            velocities: ProbabilityMatrix::filled(rows, cols, 0.0),
        }
    }

    /// Build from four flat row-major tensors of the standard model shape.
    pub fn from_flat(
        frames: Vec<f32>,
        onsets: Vec<f32>,
        offsets: Vec<f32>,
        velocities: Vec<f32>,
    ) -> Result<Self> {
        let (rows, cols) = MODEL_OUTPUT_SHAPE;
        Ok(Self {
            frames: ProbabilityMatrix::from_vec("frames", rows, cols, frames)?,
            onsets: ProbabilityMatrix::from_vec("onsets", rows, cols, onsets)?,
            offsets: ProbabilityMatrix::from_vec("offsets", rows, cols, offsets)?,
            velocities: ProbabilityMatrix::from_vec("velocities", rows, cols, velocities)?,
        })
    }

    /// Shape of the frame matrix (the others must match it).
    pub fn shape(&self) -> (usize, usize) {
        self.frames.shape()
    }

    /// Matrices agree in shape, probabilities lie in `[0, 1]`, velocities are finite.
    pub fn validate_consistent(&self) -> Result<()> {
        let shape = self.frames.shape();
        self.onsets.ensure_shape("onsets", shape)?;
        self.offsets.ensure_shape("offsets", shape)?;
        self.velocities.ensure_shape("velocities", shape)?;
        self.frames.validate_unit_range("frames")?;
        self.onsets.validate_unit_range("onsets")?;
        self.offsets.validate_unit_range("offsets")?;
        self.velocities.validate_finite("velocities")
    }

    /// `validate_consistent` plus the fixed `[32, 88]` model shape.
    pub fn validate(&self) -> Result<()> {
        self.frames.ensure_shape("frames", MODEL_OUTPUT_SHAPE)?;
        self.validate_consistent()
    }
}
