//! Converted PCM block handed from the format converter to the window buffer.

/// Level reported for digital silence.
pub const SILENCE_DB: f32 = -120.0;

/// A contiguous block of mono 16-bit PCM at a known sample rate.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub samples: Vec<i16>,
    /// Sample rate in Hz (normally the model rate, 16000).
    pub sample_rate: u32,
}

impl PcmChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Returns true if the chunk contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Root-mean-square amplitude, normalised to `[0, 1]`.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = s as f64 / i16::MAX as f64;
                v * v
            })
            .sum();
        (sum_sq / self.samples.len() as f64).sqrt() as f32
    }

    /// RMS level in dBFS, floored at [`SILENCE_DB`].
    pub fn level_db(&self) -> f32 {
        crate::audio::pcm_level_db(&self.samples)
    }
}
