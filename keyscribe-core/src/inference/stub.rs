//! `StubModel`: deterministic monophonic backend without learned weights.
//!
//! Used for development and tests so the full capture → decode → event path
//! can run without a model file. Each window is cut into the standard 32
//! frames; frames above an RMS gate get a pitch estimate from interpolated
//! rising zero crossings, snapped to the nearest piano key.

use tracing::debug;

use crate::buffering::window::AnalysisWindow;
use crate::decode::matrix::{FRAMES_PER_WINDOW, PITCH_COUNT};
use crate::error::Result;
use crate::inference::{AcousticModel, ModelOutput};
use crate::note::PIANO_MIDI_OFFSET;

/// Evidence value written for detected cells.
const CONFIDENT: f32 = 0.9;

/// Zero-crossing pitch tracker posing as an acoustic model.
#[derive(Debug, Clone)]
pub struct StubModel {
    /// Frames with normalised RMS below this are treated as silence.
    rms_gate: f32,
    windows_seen: u64,
}

impl StubModel {
    pub fn new() -> Self {
        Self::with_gate(0.01)
    }

    pub fn with_gate(rms_gate: f32) -> Self {
        Self {
            rms_gate,
            windows_seen: 0,
        }
    }

    /// Number of windows passed through `infer` since the last reset.
    pub fn windows_seen(&self) -> u64 {
        self.windows_seen
    }
}

impl Default for StubModel {
    fn default() -> Self {
        Self::new()
    }
}

impl AcousticModel for StubModel {
    fn warm_up(&mut self) -> Result<()> {
        debug!("StubModel::warm_up: no-op");
        Ok(())
    }

    fn infer(&mut self, window: &AnalysisWindow) -> Result<ModelOutput> {
        self.windows_seen += 1;
        let mut output = ModelOutput::silent();

        let input = window.to_model_input();
        let frame_len = input.len() / FRAMES_PER_WINDOW;
        if frame_len == 0 {
            return Ok(output);
        }

        let mut previous: Option<usize> = None;
        for (t, frame) in input.chunks_exact(frame_len).take(FRAMES_PER_WINDOW).enumerate() {
            let rms = frame_rms(frame);
            let key = if rms >= self.rms_gate {
                zero_crossing_frequency(frame, window.sample_rate()).and_then(frequency_to_key)
            } else {
                None
            };

            if let Some(prev) = previous {
                if key != Some(prev) {
                    output.offsets.set(t, prev, CONFIDENT);
                }
            }
            if let Some(k) = key {
                output.frames.set(t, k, CONFIDENT);
                if previous != Some(k) {
                    output.onsets.set(t, k, CONFIDENT);
                }
                output.velocities.set(t, k, rms.clamp(0.0, 1.0));
            }
            previous = key;
        }

        Ok(output)
    }

    fn reset(&mut self) {
        debug!(windows = self.windows_seen, "StubModel::reset");
        self.windows_seen = 0;
    }
}

fn frame_rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = frame.iter().map(|s| s * s).sum();
    (sum_sq / frame.len() as f32).sqrt()
}

/// Frequency from the mean spacing of rising zero crossings, located with
/// linear interpolation between the straddling samples.
fn zero_crossing_frequency(frame: &[f32], sample_rate: u32) -> Option<f32> {
    let mut first: Option<f32> = None;
    let mut last = 0.0f32;
    let mut crossings = 0usize;

    for (i, pair) in frame.windows(2).enumerate() {
        let (a, b) = (pair[0], pair[1]);
        if a < 0.0 && b >= 0.0 {
            let pos = i as f32 + (-a) / (b - a);
            if first.is_none() {
                first = Some(pos);
            }
            last = pos;
            crossings += 1;
        }
    }

    let first = first?;
    if crossings < 2 {
        return None;
    }
    let period = (last - first) / (crossings - 1) as f32;
    (period > 0.0).then(|| sample_rate as f32 / period)
}

/// Nearest piano key index (0 = A0) for a frequency, if it lies on the keyboard.
fn frequency_to_key(freq: f32) -> Option<usize> {
    if !freq.is_finite() || freq <= 0.0 {
        return None;
    }
    let midi = (69.0 + 12.0 * (freq / 440.0).log2()).round() as i32;
    let key = midi - i32::from(PIANO_MIDI_OFFSET);
    (0..PITCH_COUNT as i32).contains(&key).then_some(key as usize)
}
