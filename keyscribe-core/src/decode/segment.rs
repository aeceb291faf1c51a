//! Single-pass piano-roll → note segmentation.
//!
//! ## Algorithm
//!
//! 1. Threshold frames/onsets/offsets (strict `>`) into binary rolls and
//!    append one all-zero frame so every open note is closed by the scan.
//! 2. A cell is *confirmed active* when `frame || onset`, unless
//!    `frame && offset` (offset evidence ends a held frame).
//! 3. Scan frames in time order, pitches in index order:
//!    - inactive cell → close the open note for that pitch, if any;
//!    - active cell, no open note → open one only when the onset bit is set;
//!    - active cell, open note, onset edge (`onset[t] && !onset[t-1]`) →
//!      close at `t` and reopen at `t` with a fresh velocity.
//!
//! Notes are emitted in closing order.

use std::collections::BTreeMap;

use tracing::trace;

use crate::decode::matrix::{PianoRoll, ProbabilityMatrix};
use crate::error::Result;
use crate::note::{Note, NoteSequence};

/// Size of the per-pitch onset velocity table (full MIDI range).
const VELOCITY_TABLE_LEN: usize = 128;

/// Tunables for segmentation. Defaults match the acoustic model's training setup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmenterConfig {
    /// Time frames per second. Default: 32.
    pub frames_per_second: u32,
    /// Multiplier applied to the clamped velocity prediction. Default: 80.
    pub velocity_scale: u8,
    /// Offset added after scaling. Default: 10.
    pub velocity_bias: u8,
    /// Velocity used when predictions are disabled. Default: 60.
    pub default_velocity: u8,
    /// Frame probability must exceed this to count as active. Default: 0.5.
    pub frame_threshold: f32,
    /// Onset probability must exceed this to count as an onset. Default: 0.5.
    pub onset_threshold: f32,
    /// Offset probability must exceed this to count as an offset. Default: 0.0.
    pub offset_threshold: f32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            frames_per_second: 32,
            velocity_scale: 80,
            velocity_bias: 10,
            default_velocity: 60,
            frame_threshold: 0.5,
            onset_threshold: 0.5,
            offset_threshold: 0.0,
        }
    }
}

impl SegmenterConfig {
    pub fn frame_length_seconds(&self) -> f64 {
        1.0 / self.frames_per_second.max(1) as f64
    }
}

/// Map a raw velocity prediction to a MIDI velocity:
/// `clamp(v, 0, 1) * scale + bias`, truncated.
pub fn scale_velocity(raw: f32, scale: u8, bias: u8) -> u8 {
    let unscaled = raw.clamp(0.0, 1.0) * scale as f32 + bias as f32;
    (unscaled as u32).min(127) as u8
}

/// Threshold `probs` and append one all-zero sentinel frame.
fn threshold_padded(probs: &ProbabilityMatrix, threshold: f32) -> PianoRoll {
    let (rows, cols) = probs.shape();
    let mut roll = PianoRoll::filled(rows + 1, cols, false);
    for t in 0..rows {
        for p in 0..cols {
            roll.set(t, p, probs.get(t, p) > threshold);
        }
    }
    roll
}

/// Open-note bookkeeping for one segmentation pass.
struct PitchTracker<'a> {
    /// pitch → frame index where the open note began.
    open: BTreeMap<usize, usize>,
    onset_velocities: [u8; VELOCITY_TABLE_LEN],
    velocities: &'a ProbabilityMatrix,
    predict_velocities: bool,
    config: &'a SegmenterConfig,
    frame_length: f64,
    sequence: NoteSequence,
}

impl<'a> PitchTracker<'a> {
    fn start(&mut self, pitch: usize, frame: usize) {
        self.open.insert(pitch, frame);
        self.onset_velocities[pitch] = if self.predict_velocities {
            scale_velocity(
                self.velocities.get(frame, pitch),
                self.config.velocity_scale,
                self.config.velocity_bias,
            )
        } else {
            self.config.default_velocity
        };
    }

    fn end(&mut self, pitch: usize, frame: usize) -> Result<()> {
        let Some(start_frame) = self.open.remove(&pitch) else {
            return Ok(());
        };
        let note = Note::new(
            pitch as u8,
            start_frame as f64 * self.frame_length,
            frame as f64 * self.frame_length,
            self.onset_velocities[pitch],
        )?;
        trace!(%note, "note closed");
        self.sequence.push(note);
        Ok(())
    }
}

/// Convert per-frame evidence (all `[T, P]`) into notes.
///
/// Inputs are thresholded here, so binary rolls may be passed as 0.0/1.0.
/// Velocities are only read at onset cells and only when `predict_velocities`.
/// Callers validate shapes and ranges (see [`crate::decode::decode`]).
pub fn pianoroll_to_note_sequence(
    frames: &ProbabilityMatrix,
    onsets: &ProbabilityMatrix,
    offsets: &ProbabilityMatrix,
    velocities: &ProbabilityMatrix,
    predict_velocities: bool,
    config: &SegmenterConfig,
) -> Result<NoteSequence> {
    let shape = frames.shape();
    onsets.ensure_shape("onsets", shape)?;
    offsets.ensure_shape("offsets", shape)?;
    velocities.ensure_shape("velocities", shape)?;

    let frame_bits = threshold_padded(frames, config.frame_threshold);
    let onset_bits = threshold_padded(onsets, config.onset_threshold);
    let offset_bits = threshold_padded(offsets, config.offset_threshold);

    let mut tracker = PitchTracker {
        open: BTreeMap::new(),
        onset_velocities: [0; VELOCITY_TABLE_LEN],
        velocities,
        predict_velocities,
        config,
        frame_length: config.frame_length_seconds(),
        sequence: NoteSequence::new(),
    };

    let (n_frames, n_pitches) = frame_bits.shape();
    for t in 0..n_frames {
        for p in 0..n_pitches.min(VELOCITY_TABLE_LEN) {
            let frame = frame_bits.get(t, p);
            let onset = onset_bits.get(t, p);
            let confirmed = (frame || onset) && !(frame && offset_bits.get(t, p));

            if !confirmed {
                tracker.end(p, t)?;
            } else if !tracker.open.contains_key(&p) {
                if onset {
                    tracker.start(p, t);
                }
            } else if onset && t > 0 && !onset_bits.get(t - 1, p) {
                tracker.end(p, t)?;
                tracker.start(p, t);
            }
        }
    }

    debug_assert!(tracker.open.is_empty(), "sentinel frame must close all notes");
    Ok(tracker.sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn column(values: &[f32]) -> ProbabilityMatrix {
        ProbabilityMatrix::from_vec("test", values.len(), 1, values.to_vec()).expect("column")
    }

    fn zeros(rows: usize, cols: usize) -> ProbabilityMatrix {
        ProbabilityMatrix::filled(rows, cols, 0.0)
    }

    #[test]
    fn all_zero_input_yields_no_notes() {
        let z = zeros(32, 88);
        let seq = pianoroll_to_note_sequence(&z, &z, &z, &z, true, &SegmenterConfig::default())
            .expect("segment");
        assert!(seq.is_empty());
    }

    #[test]
    fn note_open_at_last_frame_is_closed_by_sentinel() {
        let frames = column(&[0.0, 0.9, 0.9, 0.9]);
        let onsets = column(&[0.0, 0.9, 0.0, 0.0]);
        let z = zeros(4, 1);

        let seq =
            pianoroll_to_note_sequence(&frames, &onsets, &z, &z, false, &SegmenterConfig::default())
                .expect("segment");

        assert_eq!(seq.len(), 1);
        let note = seq.as_slice()[0];
        assert_relative_eq!(note.start_time(), 1.0 / 32.0);
        assert_relative_eq!(note.end_time(), 4.0 / 32.0);
        assert_eq!(note.velocity(), 60);
    }

    #[test]
    fn frame_without_onset_never_starts_a_note() {
        let frames = column(&[0.9, 0.9, 0.9]);
        let z = zeros(3, 1);
        let seq = pianoroll_to_note_sequence(&frames, &z, &z, &z, false, &SegmenterConfig::default())
            .expect("segment");
        assert!(seq.is_empty());
    }

    #[test]
    fn onset_edge_while_active_retriggers() {
        let frames = column(&[0.9, 0.9, 0.9, 0.9, 0.9]);
        let onsets = column(&[0.9, 0.0, 0.0, 0.9, 0.0]);
        let velocities = column(&[0.5, 0.0, 0.0, 1.0, 0.0]);
        let z = zeros(5, 1);

        let seq = pianoroll_to_note_sequence(
            &frames,
            &onsets,
            &z,
            &velocities,
            true,
            &SegmenterConfig::default(),
        )
        .expect("segment");

        assert_eq!(seq.len(), 2);
        let (first, second) = (seq.as_slice()[0], seq.as_slice()[1]);
        assert_relative_eq!(first.start_time(), 0.0);
        assert_relative_eq!(first.end_time(), 3.0 / 32.0);
        assert_eq!(first.velocity(), 50);
        assert_relative_eq!(second.start_time(), 3.0 / 32.0);
        assert_relative_eq!(second.end_time(), 5.0 / 32.0);
        assert_eq!(second.velocity(), 90);
        assert!(first.end_time() <= second.start_time());
    }

    #[test]
    fn held_onset_does_not_retrigger() {
        let frames = column(&[0.9, 0.9, 0.9]);
        let onsets = column(&[0.9, 0.9, 0.9]);
        let z = zeros(3, 1);
        let seq =
            pianoroll_to_note_sequence(&frames, &onsets, &z, &z, false, &SegmenterConfig::default())
                .expect("segment");
        assert_eq!(seq.len(), 1);
        assert_relative_eq!(seq.as_slice()[0].end_time(), 3.0 / 32.0);
    }

    #[test]
    fn offset_ends_held_frame() {
        let frames = column(&[0.9, 0.9, 0.9, 0.9]);
        let onsets = column(&[0.9, 0.0, 0.0, 0.0]);
        let offsets = column(&[0.0, 0.0, 0.3, 0.0]);
        let z = zeros(4, 1);

        let seq = pianoroll_to_note_sequence(
            &frames,
            &onsets,
            &offsets,
            &z,
            false,
            &SegmenterConfig::default(),
        )
        .expect("segment");

        // Closed at frame 2; frame 3 is active again but has no onset.
        assert_eq!(seq.len(), 1);
        assert_relative_eq!(seq.as_slice()[0].end_time(), 2.0 / 32.0);
    }

    #[test]
    fn onset_alone_confirms_activity() {
        let onsets = column(&[0.9, 0.0]);
        let z = zeros(2, 1);
        let seq = pianoroll_to_note_sequence(&z, &onsets, &z, &z, false, &SegmenterConfig::default())
            .expect("segment");
        assert_eq!(seq.len(), 1);
        assert_relative_eq!(seq.as_slice()[0].end_time(), 1.0 / 32.0);
    }

    #[test]
    fn notes_emitted_in_closing_order() {
        // pitch 1 closes at frame 2, pitch 0 at frame 3.
        let frames = ProbabilityMatrix::from_vec(
            "frames",
            3,
            2,
            vec![0.0, 0.9, 0.9, 0.9, 0.9, 0.0],
        )
        .unwrap();
        let onsets = ProbabilityMatrix::from_vec(
            "onsets",
            3,
            2,
            vec![0.0, 0.9, 0.9, 0.0, 0.0, 0.0],
        )
        .unwrap();
        let z = zeros(3, 2);

        let seq =
            pianoroll_to_note_sequence(&frames, &onsets, &z, &z, false, &SegmenterConfig::default())
                .expect("segment");

        let pitches: Vec<u8> = seq.iter().map(Note::pitch).collect();
        assert_eq!(pitches, vec![1, 0]);
    }

    #[test]
    fn velocity_scaling_stays_within_bias_and_scale() {
        for i in 0..=100 {
            let raw = i as f32 / 100.0;
            let v = scale_velocity(raw, 80, 10);
            assert!((10..=90).contains(&v), "raw={raw} v={v}");
        }
        assert_eq!(scale_velocity(-3.0, 80, 10), 10);
        assert_eq!(scale_velocity(7.0, 80, 10), 90);
        assert_eq!(scale_velocity(0.5, 80, 10), 50);
    }

    #[test]
    fn mismatched_shapes_fail_fast() {
        let frames = zeros(32, 88);
        let short = zeros(31, 88);
        assert!(pianoroll_to_note_sequence(
            &frames,
            &short,
            &frames,
            &frames,
            false,
            &SegmenterConfig::default()
        )
        .is_err());
    }
}
