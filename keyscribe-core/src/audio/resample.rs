//! Device-format → model-format conversion.
//!
//! `cpal` captures at the device's native rate (commonly 44.1 or 48 kHz) as
//! mono f32 after down-mixing. The acoustic model wants 16 kHz signed 16-bit.
//! `FormatConverter` resamples with a rubato `FastFixedIn` and then quantises,
//! on the capture loop thread where allocation is allowed.
//!
//! When the device rate already matches, no rubato session is created and
//! samples are only quantised.
//!
//! ```ignore
//! let mut conv = FormatConverter::new(48_000, 16_000, 960)?;
//! let pcm: Vec<i16> = conv.process(&raw_samples)?;
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::info;

use crate::error::{KeyscribeError, Result};

/// Quantise a normalised f32 sample to i16 with clipping.
pub fn quantize_sample(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

pub struct FormatConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Input not yet consumed by rubato.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// Pre-allocated `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    capture_rate: u32,
    target_rate: u32,
}

impl FormatConverter {
    /// # Parameters
    /// - `capture_rate`: device sample rate (Hz).
    /// - `target_rate`: model sample rate (Hz).
    /// - `chunk_size`: input frames per rubato call (e.g. `960`).
    ///
    /// # Errors
    /// `FormatConversion` for a zero rate or when rubato fails to initialise.
    pub fn new(capture_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if capture_rate == 0 || target_rate == 0 || chunk_size == 0 {
            return Err(KeyscribeError::FormatConversion(format!(
                "invalid converter parameters: {capture_rate} Hz -> {target_rate} Hz, chunk {chunk_size}"
            )));
        }

        if capture_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                capture_rate,
                target_rate,
            });
        }

        let ratio = target_rate as f64 / capture_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            1,
        )
        .map_err(|e| KeyscribeError::FormatConversion(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        info!(capture_rate, target_rate, chunk_size, max_out, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; 1],
            capture_rate,
            target_rate,
        })
    }

    /// Convert a block of device samples, returning whatever target-rate PCM
    /// is ready (possibly empty; partial rubato chunks are kept for the next call).
    ///
    /// # Errors
    /// `FormatConversion` when the block holds a non-finite sample or rubato
    /// fails. Either way the block and any buffered remainder are dropped, so
    /// the next call starts clean.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<i16>> {
        if let Some(pos) = samples.iter().position(|s| !s.is_finite()) {
            self.input_buf.clear();
            return Err(KeyscribeError::FormatConversion(format!(
                "non-finite sample {} at offset {pos}",
                samples[pos]
            )));
        }

        let Some(ref mut resampler) = self.resampler else {
            return Ok(samples.iter().copied().map(quantize_sample).collect());
        };

        self.input_buf.extend_from_slice(samples);
        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            let processed = resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None);
            match processed {
                Ok((_consumed, produced)) => {
                    result.extend(
                        self.output_buf[0][..produced]
                            .iter()
                            .copied()
                            .map(quantize_sample),
                    );
                }
                Err(e) => {
                    self.input_buf.clear();
                    resampler.reset();
                    return Err(KeyscribeError::FormatConversion(format!(
                        "resampler process: {e}"
                    )));
                }
            }
            self.input_buf.drain(..self.chunk_size);
        }

        Ok(result)
    }

    /// Drop buffered input and resampler state.
    pub fn reset(&mut self) {
        self.input_buf.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn capture_rate(&self) -> u32 {
        self.capture_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }
}
