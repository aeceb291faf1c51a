//! Fixed-shape 2-D containers for per-frame, per-pitch model evidence.
//!
//! Storage is row-major: row = time frame, column = pitch. Shapes are checked
//! on construction and whenever two matrices meet.

use crate::error::{KeyscribeError, Result};

/// Time frames per analysis window produced by the acoustic model.
pub const FRAMES_PER_WINDOW: usize = 32;
/// Pitch columns (piano range, A0..C8).
pub const PITCH_COUNT: usize = 88;
/// Shape every model output matrix must have.
pub const MODEL_OUTPUT_SHAPE: (usize, usize) = (FRAMES_PER_WINDOW, PITCH_COUNT);

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

/// Probabilities in `[0, 1]` (or raw model scale for velocities).
pub type ProbabilityMatrix = Matrix<f32>;
/// Binary activity matrix.
pub type PianoRoll = Matrix<bool>;

impl<T: Copy> Matrix<T> {
    /// Wrap a flat row-major buffer. `name` only labels the error.
    pub fn from_vec(name: &'static str, rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(KeyscribeError::LengthMismatch {
                matrix: name,
                expected: (rows, cols),
                len: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[T] {
        let start = row * self.cols;
        &self.data[start..start + self.cols]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> Matrix<U> {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Fail with `ShapeMismatch` unless this matrix is exactly `expected`.
    pub fn ensure_shape(&self, name: &'static str, expected: (usize, usize)) -> Result<()> {
        if self.shape() != expected {
            return Err(KeyscribeError::ShapeMismatch {
                matrix: name,
                expected,
                actual: self.shape(),
            });
        }
        Ok(())
    }
}

impl ProbabilityMatrix {
    /// Every value must be a finite probability in `[0, 1]`.
    pub fn validate_unit_range(&self, name: &'static str) -> Result<()> {
        self.validate_with(name, |v| (0.0..=1.0).contains(&v))
    }

    /// Every value must be finite; range is model-specific (velocities).
    pub fn validate_finite(&self, name: &'static str) -> Result<()> {
        self.validate_with(name, f32::is_finite)
    }

    fn validate_with(&self, name: &'static str, ok: impl Fn(f32) -> bool) -> Result<()> {
        match self.data.iter().position(|&v| !ok(v)) {
            None => Ok(()),
            Some(idx) => Err(KeyscribeError::InvalidProbability {
                matrix: name,
                frame: idx / self.cols,
                pitch: idx % self.cols,
                value: self.data[idx],
            }),
        }
    }
}

impl PianoRoll {
    pub fn to_probabilities(&self) -> ProbabilityMatrix {
        self.map(|active| if active { 1.0 } else { 0.0 })
    }

    pub fn count_active(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }
}
