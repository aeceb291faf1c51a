//! Post-processing: model evidence → discrete notes.
//!
//! Two routes share the segmenter:
//!
//! ```text
//! direct:  frames, onsets ─────────────────────────────► segment ─► NoteSequence
//! viterbi: frames, onsets ─► viterbi roll ─► rising edges ─► segment ─► NoteSequence
//! ```
//!
//! Offsets and velocities always come straight from the model. Every function
//! here is pure: per-call matrices and open-note tables only.

pub mod matrix;
pub mod segment;
pub mod viterbi;

use tracing::debug;

use crate::error::Result;
use crate::inference::ModelOutput;
use crate::note::NoteSequence;

pub use matrix::{PianoRoll, ProbabilityMatrix, FRAMES_PER_WINDOW, PITCH_COUNT};
pub use segment::{pianoroll_to_note_sequence, SegmenterConfig};
pub use viterbi::{onsets_from_pianoroll, probs_to_pianoroll_viterbi};

/// Decode-stage options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderConfig {
    /// Use velocity predictions instead of the fixed default velocity.
    pub predict_velocities: bool,
    /// Viterbi decoding instead of direct thresholding.
    pub use_viterbi: bool,
    /// Onset weight in the Viterbi loss, in `[0, 1]`.
    pub viterbi_alpha: f64,
    pub segmenter: SegmenterConfig,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            predict_velocities: false,
            use_viterbi: false,
            viterbi_alpha: 0.5,
            segmenter: SegmenterConfig::default(),
        }
    }
}

/// Decode one window of model output into notes.
///
/// # Errors
/// `ShapeMismatch` when the four matrices disagree in shape,
/// `InvalidProbability` for NaN/out-of-range frames, onsets or offsets, or
/// non-finite velocities; `InvalidAlpha` for a bad Viterbi weight.
pub fn decode(output: &ModelOutput, config: &DecoderConfig) -> Result<NoteSequence> {
    output.validate_consistent()?;

    let sequence = if config.use_viterbi {
        let roll =
            probs_to_pianoroll_viterbi(&output.frames, &output.onsets, config.viterbi_alpha)?;
        let onsets = onsets_from_pianoroll(&roll);
        debug!(
            active_cells = roll.count_active(),
            onset_cells = onsets.count_active(),
            alpha = config.viterbi_alpha,
            "viterbi decoding"
        );
        pianoroll_to_note_sequence(
            &roll.to_probabilities(),
            &onsets.to_probabilities(),
            &output.offsets,
            &output.velocities,
            config.predict_velocities,
            &config.segmenter,
        )?
    } else {
        pianoroll_to_note_sequence(
            &output.frames,
            &output.onsets,
            &output.offsets,
            &output.velocities,
            config.predict_velocities,
            &config.segmenter,
        )?
    };

    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyscribeError;

    fn single_note_output() -> ModelOutput {
        let mut output = ModelOutput::silent();
        // Pitch 40 sounds for frames 4..12 with an onset at 4.
        for t in 4..12 {
            output.frames.set(t, 40, 0.8);
        }
        output.onsets.set(4, 40, 0.9);
        output.velocities.set(4, 40, 0.25);
        output
    }

    #[test]
    fn direct_and_viterbi_agree_on_clean_note() {
        let output = single_note_output();

        let direct = decode(&output, &DecoderConfig::default()).expect("direct");
        let viterbi = decode(
            &output,
            &DecoderConfig {
                use_viterbi: true,
                ..DecoderConfig::default()
            },
        )
        .expect("viterbi");

        assert_eq!(direct.len(), 1);
        assert_eq!(direct, viterbi);
        let note = direct.as_slice()[0];
        assert_eq!(note.pitch(), 40);
        assert_eq!(note.start_time(), 4.0 / 32.0);
        assert_eq!(note.end_time(), 12.0 / 32.0);
    }

    #[test]
    fn predicted_velocity_is_scaled() {
        let output = single_note_output();
        let seq = decode(
            &output,
            &DecoderConfig {
                predict_velocities: true,
                ..DecoderConfig::default()
            },
        )
        .expect("decode");
        assert_eq!(seq.as_slice()[0].velocity(), 30);
    }

    #[test]
    fn silent_output_decodes_to_nothing() {
        let output = ModelOutput::silent();
        for use_viterbi in [false, true] {
            let cfg = DecoderConfig {
                use_viterbi,
                ..DecoderConfig::default()
            };
            assert!(decode(&output, &cfg).expect("decode").is_empty());
        }
    }

    #[test]
    fn out_of_range_frame_probability_is_surfaced() {
        let mut output = ModelOutput::silent();
        output.frames.set(0, 0, 1.2);
        assert!(matches!(
            decode(&output, &DecoderConfig::default()),
            Err(KeyscribeError::InvalidProbability { matrix: "frames", .. })
        ));
    }

    #[test]
    fn out_of_range_velocity_is_clamped_not_rejected() {
        let mut output = single_note_output();
        output.velocities.set(4, 40, 4.0);
        let seq = decode(
            &output,
            &DecoderConfig {
                predict_velocities: true,
                ..DecoderConfig::default()
            },
        )
        .expect("decode");
        assert_eq!(seq.as_slice()[0].velocity(), 90);
    }
}
