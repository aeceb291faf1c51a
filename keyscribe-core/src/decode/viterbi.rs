//! Exact two-state Viterbi decoding of onset/frame evidence into a piano-roll.
//!
//! ## Model
//!
//! Each pitch column is an independent chain over time with states
//! `0 = inactive` and `1 = active`. The per-state loss at `(t, p)` blends
//! frame and onset evidence:
//!
//! ```text
//! frame_loss[s] = (1 - alpha) * -ln(P_frame(s))
//! onset_loss[s] =      alpha  * -ln(P_onset(s))      P(1) = x, P(0) = 1 - x
//! ```
//!
//! Onset loss is charged on the transition, frame loss on the state:
//!
//! | prev → next | onset loss     |
//! |-------------|----------------|
//! | 0 → 0       | `onset_loss[0]` |
//! | 0 → 1       | `onset_loss[1]` |
//! | 1 → 0       | `onset_loss[0]` |
//! | 1 → 1       | `onset_loss[0]` |
//!
//! Only a fresh activation pays for an onset; a sustained note does not.
//! Ties pick the lower state index, both for the back-pointer and for the
//! final state.

use crate::decode::matrix::{PianoRoll, ProbabilityMatrix};
use crate::error::{KeyscribeError, Result};

const INACTIVE: usize = 0;
const ACTIVE: usize = 1;

/// Reject `alpha` outside `[0, 1]` (including NaN).
pub fn check_alpha(alpha: f64) -> Result<()> {
    if (0.0..=1.0).contains(&alpha) {
        Ok(())
    } else {
        Err(KeyscribeError::InvalidAlpha(alpha))
    }
}

/// Weighted negative log-likelihood of both states for probability `prob`.
///
/// A zero weight contributes nothing even when the probability is 0 or 1.
#[inline]
fn weighted_state_losses(prob: f32, weight: f64) -> [f64; 2] {
    if weight == 0.0 {
        return [0.0, 0.0];
    }
    let p = prob as f64;
    [weight * -(1.0 - p).ln(), weight * -p.ln()]
}

/// Lower index wins ties.
#[inline]
fn argmin2(costs: [f64; 2]) -> usize {
    if costs[ACTIVE] < costs[INACTIVE] {
        ACTIVE
    } else {
        INACTIVE
    }
}

/// Decode `frames`/`onsets` (shape `[T, P]`) into the minimum-loss binary roll.
///
/// # Errors
/// `InvalidAlpha` for `alpha ∉ [0, 1]`, `ShapeMismatch` when the two matrices
/// differ in shape, `InvalidProbability` for NaN or out-of-range inputs.
pub fn probs_to_pianoroll_viterbi(
    frames: &ProbabilityMatrix,
    onsets: &ProbabilityMatrix,
    alpha: f64,
) -> Result<PianoRoll> {
    check_alpha(alpha)?;
    onsets.ensure_shape("onsets", frames.shape())?;
    frames.validate_unit_range("frames")?;
    onsets.validate_unit_range("onsets")?;

    let (n_frames, n_pitches) = frames.shape();
    let mut roll = PianoRoll::filled(n_frames, n_pitches, false);
    if n_frames == 0 {
        return Ok(roll);
    }

    let frame_weight = 1.0 - alpha;
    let onset_weight = alpha;

    // Indexed [t * n_pitches + p][state]; both live only for this call.
    let mut loss = vec![[0.0f64; 2]; n_frames * n_pitches];
    let mut path = vec![[INACTIVE as u8; 2]; n_frames * n_pitches];

    for p in 0..n_pitches {
        let frame_loss = weighted_state_losses(frames.get(0, p), frame_weight);
        let onset_loss = weighted_state_losses(onsets.get(0, p), onset_weight);
        loss[p] = [
            frame_loss[INACTIVE] + onset_loss[INACTIVE],
            frame_loss[ACTIVE] + onset_loss[ACTIVE],
        ];

        for t in 1..n_frames {
            let prev = loss[(t - 1) * n_pitches + p];
            let frame_loss = weighted_state_losses(frames.get(t, p), frame_weight);
            let onset_loss = weighted_state_losses(onsets.get(t, p), onset_weight);

            // transition[next][prev]
            let transition = [
                [
                    prev[INACTIVE] + onset_loss[INACTIVE],
                    prev[ACTIVE] + onset_loss[INACTIVE],
                ],
                [
                    prev[INACTIVE] + onset_loss[ACTIVE],
                    prev[ACTIVE] + onset_loss[INACTIVE],
                ],
            ];

            let idx = t * n_pitches + p;
            for next in [INACTIVE, ACTIVE] {
                let best_prev = argmin2(transition[next]);
                path[idx][next] = best_prev as u8;
                loss[idx][next] = transition[next][best_prev] + frame_loss[next];
            }
        }

        let mut state = argmin2(loss[(n_frames - 1) * n_pitches + p]);
        roll.set(n_frames - 1, p, state == ACTIVE);
        for t in (0..n_frames - 1).rev() {
            state = path[(t + 1) * n_pitches + p][state] as usize;
            roll.set(t, p, state == ACTIVE);
        }
    }

    Ok(roll)
}

/// Rising edges of `roll`: active at `t` and inactive at `t - 1`.
/// Row 0 counts every active cell as an edge.
pub fn onsets_from_pianoroll(roll: &PianoRoll) -> PianoRoll {
    let (n_frames, n_pitches) = roll.shape();
    let mut onsets = PianoRoll::filled(n_frames, n_pitches, false);
    for t in 0..n_frames {
        for p in 0..n_pitches {
            let active = roll.get(t, p);
            let rising = if t == 0 {
                active
            } else {
                active && !roll.get(t - 1, p)
            };
            onsets.set(t, p, rising);
        }
    }
    onsets
}
