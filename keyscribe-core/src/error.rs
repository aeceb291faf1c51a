use thiserror::Error;

/// All errors produced by keyscribe-core.
#[derive(Debug, Error)]
pub enum KeyscribeError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("format conversion failed: {0}")]
    FormatConversion(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("{matrix} matrix has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        matrix: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("{matrix} buffer holds {len} values, expected {expected:?}")]
    LengthMismatch {
        matrix: &'static str,
        expected: (usize, usize),
        len: usize,
    },

    #[error("{matrix} matrix holds invalid value {value} at frame {frame}, pitch {pitch}")]
    InvalidProbability {
        matrix: &'static str,
        frame: usize,
        pitch: usize,
        value: f32,
    },

    #[error("viterbi alpha must lie in [0, 1], got {0}")]
    InvalidAlpha(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid note: {0}")]
    InvalidNote(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KeyscribeError {
    /// `true` for errors that indicate malformed matrices rather than a
    /// runtime failure. The pipeline logs these separately when a model
    /// produces them.
    pub fn is_data_integrity(&self) -> bool {
        matches!(
            self,
            KeyscribeError::ShapeMismatch { .. }
                | KeyscribeError::LengthMismatch { .. }
                | KeyscribeError::InvalidProbability { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, KeyscribeError>;
