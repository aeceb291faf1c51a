//! # keyscribe-core
//!
//! Streaming audio-to-note engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → capture loop(spawn_blocking)
//!                                                    │
//!                                  FormatConverter (rate + i16) → SampleWindowBuffer
//!                                                    │
//!                                        WindowSlot (single slot, drop-newest)
//!                                                    │
//!                                 decode loop: AcousticModel::infer → decode
//!                                                    │
//!                                       broadcast::Sender<NoteEvent>
//! ```
//!
//! The audio callback is zero-alloc. All heap work happens on the pipeline threads.
//! The decode stage ([`decode`]) is pure and can be driven without any of the
//! capture machinery.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod decode;
pub mod engine;
pub mod error;
pub mod inference;
pub mod ipc;
pub mod note;

// Convenience re-exports for downstream crates
pub use buffering::window::{AnalysisWindow, OverlapPolicy, SampleWindowBuffer};
pub use decode::{decode, DecoderConfig};
pub use engine::{EngineConfig, KeyscribeEngine};
pub use error::KeyscribeError;
pub use inference::{AcousticModel, ModelHandle, ModelOutput};
pub use ipc::events::{AudioActivityEvent, EngineStatus, EngineStatusEvent, NoteEvent};
pub use note::{Note, NoteSequence};

#[cfg(feature = "onnx")]
pub use inference::{OnnxAcousticModel, OnnxModelConfig};
