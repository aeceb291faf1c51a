//! Event types emitted over the engine's broadcast channels.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `NoteEvent` | `KeyscribeEngine::subscribe_notes` |
//! | `EngineStatusEvent` | `KeyscribeEngine::subscribe_status` |
//! | `AudioActivityEvent` | `KeyscribeEngine::subscribe_activity` |

use serde::{Deserialize, Serialize};

use crate::note::NoteSequence;

// ---------------------------------------------------------------------------
// Note events
// ---------------------------------------------------------------------------

/// Notes decoded from one analysis window.
///
/// Note times are relative to the window start; add `window_start_secs` for
/// the position in the capture stream. A window whose inference failed is
/// still reported, with an empty `notes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Index of the analysis window these notes came from.
    pub window_index: u64,
    /// Window start in seconds since capture began.
    pub window_start_secs: f64,
    pub notes: NoteSequence,
}

// ---------------------------------------------------------------------------
// Audio activity events
// ---------------------------------------------------------------------------

/// Input level of one converted audio chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Root-mean-square level of the chunk in [0.0, 1.0].
    pub rms: f32,
    /// RMS level in dBFS, floored at -120.
    pub level_db: f32,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

/// Emitted when the engine state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the transcription engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Warming up model (loading weights, dummy inference).
    WarmingUp,
    /// Capturing audio and decoding notes.
    Listening,
    /// Capture stopped; engine may be restarted.
    Stopped,
    /// Unrecoverable error (decode failure or device loss).
    Error,
}
