//! Onsets-and-frames ONNX backend via the `ort` crate.
//!
//! Expects a single-graph export with waveform input:
//! - input 0: `[1, bufferSize]` f32 samples in `[-1, 1]` at 16 kHz
//! - outputs 0..=3: frame, onset, offset and velocity tensors, each
//!   `[1, 32, 88]` (a leading batch dimension is optional)
//!
//! The session is created lazily in `warm_up` (or on first inference) so that
//! constructing the engine never touches the filesystem.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use tracing::{debug, info, warn};

use crate::buffering::window::{AnalysisWindow, DEFAULT_PADDING_SAMPLES, DEFAULT_SAMPLE_RATE};
use crate::decode::matrix::MODEL_OUTPUT_SHAPE;
use crate::error::{KeyscribeError, Result};
use crate::inference::{AcousticModel, ModelOutput};

const OUTPUT_NAMES: [&str; 4] = ["frames", "onsets", "offsets", "velocities"];
const DEFAULT_MODEL_FILE: &str = "onsets_frames_wavinput.onnx";

/// Paths and session options for [`OnnxAcousticModel`].
#[derive(Debug, Clone)]
pub struct OnnxModelConfig {
    pub model_path: PathBuf,
    /// Samples per inference; must match the window buffer size.
    pub input_len: usize,
    /// ONNX Runtime intra-op threads.
    pub intra_threads: usize,
}

impl Default for OnnxModelConfig {
    fn default() -> Self {
        let intra_threads = std::env::var("KEYSCRIBE_ORT_INTRA_THREADS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(2)
            .clamp(1, 32);
        Self {
            model_path: default_models_dir().join(DEFAULT_MODEL_FILE),
            input_len: DEFAULT_SAMPLE_RATE as usize + DEFAULT_PADDING_SAMPLES,
            intra_threads,
        }
    }
}

/// Directory searched for model files: `KEYSCRIBE_MODEL_DIR`, else the
/// platform data directory.
pub fn default_models_dir() -> PathBuf {
    if let Ok(explicit) = std::env::var("KEYSCRIBE_MODEL_DIR") {
        if !explicit.trim().is_empty() {
            return PathBuf::from(explicit.trim());
        }
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(|p| PathBuf::from(p).join("Keyscribe").join("models"))
            .unwrap_or_else(|| PathBuf::from("models"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("keyscribe")
            .join("models")
    }
}

fn create_session(model_path: &Path, intra_threads: usize) -> Result<Session> {
    if !model_path.exists() {
        return Err(KeyscribeError::ModelNotFound {
            path: model_path.to_path_buf(),
        });
    }
    let session = SessionBuilder::new()
        .map_err(|e| KeyscribeError::OnnxSession(e.to_string()))?
        .with_intra_threads(intra_threads)
        .map_err(|e| KeyscribeError::OnnxSession(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| KeyscribeError::OnnxSession(e.to_string()))?
        .commit_from_file(model_path)
        .map_err(|e| KeyscribeError::OnnxSession(e.to_string()))?;
    info!(path = ?model_path, intra_threads, "ONNX session created");
    Ok(session)
}

pub struct OnnxAcousticModel {
    config: OnnxModelConfig,
    session: Option<Session>,
    input_name: String,
}

impl OnnxAcousticModel {
    pub fn new(config: OnnxModelConfig) -> Self {
        Self {
            config,
            session: None,
            input_name: String::new(),
        }
    }

    pub fn config(&self) -> &OnnxModelConfig {
        &self.config
    }

    fn ensure_session(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let session = create_session(&self.config.model_path, self.config.intra_threads)?;

        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        info!(inputs = ?input_names, outputs = ?output_names, "acoustic model io");

        if output_names.len() < OUTPUT_NAMES.len() {
            return Err(KeyscribeError::OnnxSession(format!(
                "acoustic model exposes {} outputs, expected at least {}",
                output_names.len(),
                OUTPUT_NAMES.len()
            )));
        }
        self.input_name = input_names
            .first()
            .cloned()
            .ok_or_else(|| KeyscribeError::OnnxSession("acoustic model has no inputs".into()))?;
        self.session = Some(session);
        Ok(())
    }

    fn run(&mut self, input: Vec<f32>) -> Result<ModelOutput> {
        self.ensure_session()?;
        let input_name = self.input_name.clone();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| KeyscribeError::OnnxSession("session not initialised".into()))?;

        let input_arr = Array2::<f32>::from_shape_vec((1, input.len()), input)
            .map_err(|e| KeyscribeError::OnnxSession(e.to_string()))?;
        let input_val = Value::from_array(input_arr)
            .map_err(|e: ort::Error| KeyscribeError::OnnxSession(e.to_string()))?;
        let input_values: Vec<(String, SessionInputValue<'_>)> =
            vec![(input_name, input_val.into())];

        let outputs = session
            .run(input_values)
            .map_err(|e| KeyscribeError::Inference(e.to_string()))?;

        let mut tensors: Vec<Vec<f32>> = Vec::with_capacity(OUTPUT_NAMES.len());
        for (i, name) in OUTPUT_NAMES.iter().enumerate() {
            let (shape, data) = outputs[i]
                .try_extract_tensor::<f32>()
                .map_err(|e| KeyscribeError::Inference(e.to_string()))?;
            let dims: Vec<i64> = shape.iter().copied().collect();
            let actual = trailing_2d(&dims);
            if actual != MODEL_OUTPUT_SHAPE || data.len() != actual.0 * actual.1 {
                return Err(KeyscribeError::ShapeMismatch {
                    matrix: *name,
                    expected: MODEL_OUTPUT_SHAPE,
                    actual,
                });
            }
            tensors.push(data.to_vec());
        }

        let mut it = tensors.into_iter();
        match (it.next(), it.next(), it.next(), it.next()) {
            (Some(frames), Some(onsets), Some(offsets), Some(velocities)) => {
                ModelOutput::from_flat(frames, onsets, offsets, velocities)
            }
            _ => Err(KeyscribeError::Inference("missing model outputs".into())),
        }
    }
}

/// Last two dimensions of a tensor shape, treating leading dims as batch.
fn trailing_2d(dims: &[i64]) -> (usize, usize) {
    let to_usize = |d: i64| usize::try_from(d).unwrap_or(0);
    match dims {
        [.., rows, cols] => (to_usize(*rows), to_usize(*cols)),
        [cols] => (1, to_usize(*cols)),
        [] => (0, 0),
    }
}

impl AcousticModel for OnnxAcousticModel {
    fn warm_up(&mut self) -> Result<()> {
        self.ensure_session()?;
        let dummy = vec![0.0f32; self.config.input_len];
        let output = self.run(dummy)?;
        debug!(shape = ?output.shape(), "OnnxAcousticModel warm-up inference done");
        Ok(())
    }

    fn infer(&mut self, window: &AnalysisWindow) -> Result<ModelOutput> {
        let mut input = window.to_model_input();
        if input.len() != self.config.input_len {
            warn!(
                got = input.len(),
                expected = self.config.input_len,
                "window length differs from model input; padding/truncating"
            );
            input.resize(self.config.input_len, 0.0);
        }
        self.run(input)
    }

    fn reset(&mut self) {
        debug!("OnnxAcousticModel::reset");
    }
}
