//! Fixed-size analysis windows with overlap carry-over.
//!
//! ## Layout
//!
//! A window holds `buffer_size = sample_rate + padding` samples. After a
//! window is emitted its last `padding` samples (`[sample_rate..buffer_size]`)
//! are kept as the overlap.
//!
//! ```text
//! Splice:   |--------- w0 ---------|
//!                          |--------- w1 ---------|      hop = sample_rate
//!                          ^ padding shared
//!
//! Discard:  |--------- w0 ---------|--------- w1 ---------|   hop = buffer_size
//! ```
//!
//! `Discard` still records the overlap (see [`SampleWindowBuffer::overlap`])
//! but never merges it; windows are disjoint.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{KeyscribeError, Result};

/// Model sample rate (Hz).
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
/// Samples appended to one second of audio per window (120 ms at 16 kHz).
pub const DEFAULT_PADDING_SAMPLES: usize = 1_920;

/// What happens to a window's trailing `padding` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Seed the next window with them: continuity at window boundaries,
    /// one extra `padding` of latency.
    #[default]
    Splice,
    /// Keep them for inspection only; the next window is all-new audio.
    Discard,
}

/// An immutable window of 16-bit PCM handed to the acoustic model.
///
/// Cloning is cheap; samples are shared.
#[derive(Debug, Clone)]
pub struct AnalysisWindow {
    index: u64,
    start_sample: u64,
    carried_samples: usize,
    sample_rate: u32,
    samples: Arc<[i16]>,
}

impl AnalysisWindow {
    /// Build a window directly (offline drivers and tests).
    pub fn new(index: u64, start_sample: u64, sample_rate: u32, samples: Vec<i16>) -> Self {
        Self {
            index,
            start_sample,
            carried_samples: 0,
            sample_rate,
            samples: samples.into(),
        }
    }

    /// Zero-based emission index.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Stream position (in samples delivered to the buffer) of the first sample.
    pub fn start_sample(&self) -> u64 {
        self.start_sample
    }

    pub fn start_secs(&self) -> f64 {
        self.start_sample as f64 / self.sample_rate as f64
    }

    /// Leading samples copied from the previous window.
    pub fn carried_samples(&self) -> usize {
        self.carried_samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Samples normalised to `[-1, 1]` f32 (divided by `i16::MAX`).
    pub fn to_model_input(&self) -> Vec<f32> {
        self.samples
            .iter()
            .map(|&s| (s as f32 / i16::MAX as f32).max(-1.0))
            .collect()
    }
}

/// Rolling capture buffer that emits complete [`AnalysisWindow`]s.
#[derive(Debug)]
pub struct SampleWindowBuffer {
    sample_rate: u32,
    padding: usize,
    policy: OverlapPolicy,
    pending: Vec<i16>,
    /// Stream position of `pending[0]`.
    pending_start: u64,
    /// Leading samples of `pending` that came from the previous window.
    pending_carried: usize,
    overlap: Vec<i16>,
    next_index: u64,
}

impl SampleWindowBuffer {
    /// # Errors
    /// `InvalidConfig` when `sample_rate` or `padding` is zero.
    pub fn new(sample_rate: u32, padding: usize, policy: OverlapPolicy) -> Result<Self> {
        if sample_rate == 0 {
            return Err(KeyscribeError::InvalidConfig(
                "sample rate must be non-zero".into(),
            ));
        }
        if padding == 0 {
            return Err(KeyscribeError::InvalidConfig(
                "padding samples must be non-zero".into(),
            ));
        }
        Ok(Self::with_validated(sample_rate, padding, policy))
    }

    /// 16 kHz, 1920 padding samples, splice overlap.
    pub fn with_defaults() -> Self {
        Self::with_validated(DEFAULT_SAMPLE_RATE, DEFAULT_PADDING_SAMPLES, OverlapPolicy::Splice)
    }

    /// Callers guarantee non-zero `sample_rate` and `padding`.
    fn with_validated(sample_rate: u32, padding: usize, policy: OverlapPolicy) -> Self {
        let buffer_size = sample_rate as usize + padding;
        Self {
            sample_rate,
            padding,
            policy,
            pending: Vec::with_capacity(buffer_size * 2),
            pending_start: 0,
            pending_carried: 0,
            overlap: Vec::with_capacity(padding),
            next_index: 0,
        }
    }

    /// Samples per emitted window.
    pub fn buffer_size(&self) -> usize {
        self.sample_rate as usize + self.padding
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    /// New samples consumed per emitted window.
    pub fn hop(&self) -> usize {
        match self.policy {
            OverlapPolicy::Splice => self.sample_rate as usize,
            OverlapPolicy::Discard => self.buffer_size(),
        }
    }

    /// Append `chunk` and return the next complete window, if any.
    ///
    /// A large chunk may complete more than one window; drain the rest with
    /// [`next_window`](Self::next_window).
    pub fn push_chunk(&mut self, chunk: &[i16]) -> Option<AnalysisWindow> {
        self.extend(chunk);
        self.next_window()
    }

    pub fn extend(&mut self, chunk: &[i16]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Emit one complete window if `buffer_size` samples are pending.
    pub fn next_window(&mut self) -> Option<AnalysisWindow> {
        let buffer_size = self.buffer_size();
        if self.pending.len() < buffer_size {
            return None;
        }

        let samples: Arc<[i16]> = Arc::from(&self.pending[..buffer_size]);
        self.overlap.clear();
        self.overlap
            .extend_from_slice(&samples[self.sample_rate as usize..]);

        let window = AnalysisWindow {
            index: self.next_index,
            start_sample: self.pending_start,
            carried_samples: self.pending_carried,
            sample_rate: self.sample_rate,
            samples,
        };

        let hop = self.hop();
        self.pending.drain(..hop);
        self.pending_start += hop as u64;
        self.pending_carried = match self.policy {
            OverlapPolicy::Splice => self.padding,
            OverlapPolicy::Discard => 0,
        };
        self.next_index += 1;

        Some(window)
    }

    /// Trailing `padding` samples of the most recently emitted window.
    pub fn overlap(&self) -> &[i16] {
        &self.overlap
    }

    /// Samples waiting for the next window (including carried overlap).
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop the partially assembled window (e.g. after a conversion failure
    /// left a gap). The next window starts fresh with no carried overlap.
    /// Returns the number of samples discarded.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending_start += dropped as u64;
        self.pending.clear();
        self.pending_carried = 0;
        dropped
    }

    /// Return to the freshly constructed state.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.overlap.clear();
        self.pending_start = 0;
        self.pending_carried = 0;
        self.next_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: usize, len: usize) -> Vec<i16> {
        (start..start + len).map(|i| (i % 30_000) as i16).collect()
    }

    fn sine(len: usize, freq: f32, sample_rate: u32) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                ((2.0 * std::f32::consts::PI * freq * t).sin() * 12_000.0) as i16
            })
            .collect()
    }

    #[test]
    fn default_buffer_size_is_one_second_plus_padding() {
        let buf = SampleWindowBuffer::with_defaults();
        assert_eq!(buf.buffer_size(), 17_920);
        assert_eq!(buf.hop(), 16_000);
    }

    #[test]
    fn with_defaults_matches_new() {
        let defaults = SampleWindowBuffer::with_defaults();
        let built = SampleWindowBuffer::new(
            DEFAULT_SAMPLE_RATE,
            DEFAULT_PADDING_SAMPLES,
            OverlapPolicy::Splice,
        )
        .unwrap();
        assert_eq!(defaults.sample_rate(), built.sample_rate());
        assert_eq!(defaults.padding(), built.padding());
        assert_eq!(defaults.policy(), built.policy());
        assert!(defaults.pending.capacity() >= 2 * defaults.buffer_size());
        assert!(defaults.overlap.capacity() >= DEFAULT_PADDING_SAMPLES);
    }

    #[test]
    fn no_window_until_buffer_full() {
        let mut buf = SampleWindowBuffer::new(100, 20, OverlapPolicy::Splice).unwrap();
        assert!(buf.push_chunk(&ramp(0, 60)).is_none());
        assert!(buf.push_chunk(&ramp(60, 59)).is_none());
        let window = buf.push_chunk(&ramp(119, 1)).expect("window after 120 samples");
        assert_eq!(window.len(), 120);
        assert_eq!(window.index(), 0);
        assert_eq!(window.carried_samples(), 0);
    }

    #[test]
    fn splice_carries_exactly_padding_samples() {
        let sample_rate = DEFAULT_SAMPLE_RATE;
        let mut buf = SampleWindowBuffer::with_defaults();
        let audio = sine(sample_rate as usize * 5, 440.0, sample_rate);

        let mut windows = Vec::new();
        for chunk in audio.chunks(1_024) {
            buf.extend(chunk);
            while let Some(w) = buf.next_window() {
                windows.push(w);
            }
        }

        assert!(windows.len() >= 4, "got {} windows", windows.len());
        for pair in windows.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            assert_eq!(next.carried_samples(), DEFAULT_PADDING_SAMPLES);
            assert_eq!(next.index(), prev.index() + 1);
            assert_eq!(
                &next.samples()[..DEFAULT_PADDING_SAMPLES],
                &prev.samples()[sample_rate as usize..]
            );
            assert_eq!(next.start_sample() - prev.start_sample(), sample_rate as u64);
        }
    }

    #[test]
    fn discard_records_overlap_but_keeps_windows_disjoint() {
        let mut buf = SampleWindowBuffer::new(100, 20, OverlapPolicy::Discard).unwrap();
        let audio = ramp(0, 240);

        let first = buf.push_chunk(&audio[..120]).expect("first window");
        assert_eq!(buf.overlap(), &audio[100..120]);
        let second = buf.push_chunk(&audio[120..]).expect("second window");

        assert_eq!(second.carried_samples(), 0);
        assert_eq!(second.samples(), &audio[120..240]);
        assert_eq!(second.start_sample(), first.start_sample() + 120);
    }

    #[test]
    fn large_chunk_yields_multiple_windows() {
        let mut buf = SampleWindowBuffer::new(100, 20, OverlapPolicy::Splice).unwrap();
        let first = buf.push_chunk(&ramp(0, 400)).expect("first window");
        assert_eq!(first.index(), 0);
        let mut rest = 0;
        while buf.next_window().is_some() {
            rest += 1;
        }
        // Windows start at 0, 100, 200; 300 lacks 20 samples.
        assert_eq!(rest, 2);
        assert_eq!(buf.pending_len(), 100);
    }

    #[test]
    fn discard_pending_drops_partial_window() {
        let mut buf = SampleWindowBuffer::new(100, 20, OverlapPolicy::Splice).unwrap();
        buf.push_chunk(&ramp(0, 120)).expect("first window");
        buf.extend(&ramp(120, 50));
        assert_eq!(buf.discard_pending(), 70);
        assert!(buf.push_chunk(&ramp(0, 119)).is_none());
        let next = buf.push_chunk(&ramp(119, 1)).expect("fresh window");
        assert_eq!(next.carried_samples(), 0);
        assert_eq!(next.index(), 1);
    }

    #[test]
    fn model_input_is_normalised() {
        let window = AnalysisWindow::new(0, 0, 16_000, vec![i16::MAX, 0, i16::MIN]);
        assert_eq!(window.to_model_input(), vec![1.0, 0.0, -1.0]);
    }

    #[test]
    fn rejects_zero_sizes() {
        assert!(SampleWindowBuffer::new(0, 20, OverlapPolicy::Splice).is_err());
        assert!(SampleWindowBuffer::new(100, 0, OverlapPolicy::Splice).is_err());
    }
}
