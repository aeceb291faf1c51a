//! `KeyscribeEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! KeyscribeEngine::new()
//!     └─► warm_up()          → model loaded, status = WarmingUp → Idle
//!         └─► start()        → audio open, capture + decoder spawned, status = Listening
//!             └─► stop()     → running=false, stream dropped, status = Stopped
//! ```
//!
//! `start()`/`stop()` in the wrong state return an error rather than panicking.
//!
//! ## Threading
//!
//! Two blocking tasks run per session: the capture loop (owns the `!Send`
//! `cpal::Stream`, the format converter and the window buffer) and the
//! decoder loop (owns model access). They meet at a single-slot
//! [`WindowSender`](crate::buffering::slot::WindowSender). A sync oneshot
//! propagates open-device errors back to the `start()` caller.
//!
//! Every `start()` creates a fresh session flag. `stop()` clears only that
//! flag, so loops of a stopped session wind down on their own even when a
//! new session starts before they have noticed.

pub mod pipeline;

use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    audio::AudioCapture,
    buffering::{
        create_audio_ring,
        slot::{window_slot, BackpressurePolicy},
        window::{OverlapPolicy, SampleWindowBuffer, DEFAULT_PADDING_SAMPLES, DEFAULT_SAMPLE_RATE},
    },
    decode::{viterbi::check_alpha, DecoderConfig},
    error::{KeyscribeError, Result},
    inference::ModelHandle,
    ipc::events::{AudioActivityEvent, EngineStatus, EngineStatusEvent, NoteEvent},
};

/// Broadcast channel capacity: events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Configuration for `KeyscribeEngine`.
///
/// Deserialises from camelCase JSON; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Model sample rate (Hz). Captured audio is resampled to it. Default: 16000.
    pub sample_rate: u32,
    /// Samples added to one second of audio per window. Default: 1920.
    pub padding_samples: usize,
    /// Use predicted velocities instead of the fixed default. Default: false.
    pub predict_velocities: bool,
    /// Viterbi decoding instead of direct thresholding. Default: false.
    pub use_alternate_decoding: bool,
    /// Onset weight for Viterbi decoding, in `[0, 1]`. Default: 0.5.
    pub viterbi_alpha: f64,
    pub overlap_policy: OverlapPolicy,
    pub backpressure: BackpressurePolicy,
    /// Input device name; `None` selects the system default.
    pub preferred_input_device: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            padding_samples: DEFAULT_PADDING_SAMPLES,
            predict_velocities: false,
            use_alternate_decoding: false,
            viterbi_alpha: 0.5,
            overlap_policy: OverlapPolicy::Splice,
            backpressure: BackpressurePolicy::DropNewest,
            preferred_input_device: None,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// # Errors
    /// `InvalidAlpha` for an alpha outside `[0, 1]` (or NaN); `InvalidConfig`
    /// for a zero sample rate or padding, or padding not below the sample rate.
    pub fn validate(&self) -> Result<()> {
        check_alpha(self.viterbi_alpha)?;
        if self.sample_rate == 0 {
            return Err(KeyscribeError::InvalidConfig(
                "sampleRate must be non-zero".into(),
            ));
        }
        if self.padding_samples == 0 {
            return Err(KeyscribeError::InvalidConfig(
                "paddingSamples must be non-zero".into(),
            ));
        }
        if self.padding_samples >= self.sample_rate as usize {
            return Err(KeyscribeError::InvalidConfig(format!(
                "paddingSamples ({}) must be below sampleRate ({})",
                self.padding_samples, self.sample_rate
            )));
        }
        Ok(())
    }

    /// Decode-stage options derived from this config.
    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            predict_velocities: self.predict_velocities,
            use_viterbi: self.use_alternate_decoding,
            viterbi_alpha: self.viterbi_alpha,
            ..DecoderConfig::default()
        }
    }

    /// A fresh window buffer for this config.
    pub fn window_buffer(&self) -> Result<SampleWindowBuffer> {
        SampleWindowBuffer::new(self.sample_rate, self.padding_samples, self.overlap_policy)
    }
}

/// The top-level engine handle.
///
/// `KeyscribeEngine` is `Send + Sync`; all fields use interior mutability.
/// Wrap in `Arc<KeyscribeEngine>` to share with event-forwarding tasks.
pub struct KeyscribeEngine {
    config: EngineConfig,
    model: ModelHandle,
    /// Run flag of the current session; `true` while capture + decoder are active.
    running: Mutex<Arc<AtomicBool>>,
    status: Arc<Mutex<EngineStatus>>,
    note_tx: broadcast::Sender<NoteEvent>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    activity_tx: broadcast::Sender<AudioActivityEvent>,
    /// Note event sequence counter, monotonic across sessions.
    seq: Arc<AtomicU64>,
    diagnostics: Arc<pipeline::PipelineDiagnostics>,
}

impl KeyscribeEngine {
    /// Create a new engine. Does not start capturing; call `warm_up()` then `start()`.
    ///
    /// # Errors
    /// The config fails [`EngineConfig::validate`].
    pub fn new(config: EngineConfig, model: ModelHandle) -> Result<Self> {
        config.validate()?;
        let (note_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);

        Ok(Self {
            config,
            model,
            running: Mutex::new(Arc::new(AtomicBool::new(false))),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            note_tx,
            status_tx,
            activity_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(pipeline::PipelineDiagnostics::default()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load model weights and run a dummy inference. Call once before `start()`.
    pub fn warm_up(&self) -> Result<()> {
        self.set_status(EngineStatus::WarmingUp, None);
        info!("warming up acoustic model");
        if let Err(e) = self.model.0.lock().warm_up() {
            self.set_status(EngineStatus::Error, Some(e.to_string()));
            return Err(e);
        }
        self.set_status(EngineStatus::Idle, None);
        info!("acoustic model ready");
        Ok(())
    }

    /// Start capture on the configured (or default) input device.
    ///
    /// Blocks until the device is confirmed open (or fails). Must be called
    /// from within a Tokio runtime.
    ///
    /// # Errors
    /// - `AlreadyRunning` if already started.
    /// - `NoDefaultInputDevice` / `AudioDevice` / `AudioStream` on device error.
    pub fn start(&self) -> Result<()> {
        self.start_with_device(self.config.preferred_input_device.clone())
    }

    /// Start the engine using a preferred input device name.
    pub fn start_with_device(&self, preferred_input_device: Option<String>) -> Result<()> {
        let window_buffer = self.config.window_buffer()?;
        let running = self.begin_session()?;

        self.diagnostics.reset();
        self.set_status(EngineStatus::Listening, None);

        let (producer, consumer) = create_audio_ring();
        let (slot_tx, slot_rx) = window_slot(self.config.backpressure);

        let decoder_ctx = pipeline::DecoderContext {
            decoder: self.config.decoder_config(),
            model: self.model.clone(),
            slot: slot_rx,
            running: Arc::clone(&running),
            note_tx: self.note_tx.clone(),
            status_tx: self.status_tx.clone(),
            status: Arc::clone(&self.status),
            seq: Arc::clone(&self.seq),
            diagnostics: Arc::clone(&self.diagnostics),
        };
        tokio::task::spawn_blocking(move || pipeline::run_decoder(decoder_ctx));

        let session = Arc::clone(&running);
        let activity_tx = self.activity_tx.clone();
        let diagnostics = Arc::clone(&self.diagnostics);

        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        tokio::task::spawn_blocking(move || {
            // Opened on this thread: cpal::Stream is !Send.
            let capture = match AudioCapture::open_with_preference(
                producer,
                Arc::clone(&session),
                preferred_input_device.as_deref(),
            ) {
                Ok(c) => {
                    let _ = open_tx.send(Ok(c.sample_rate));
                    c
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    session.store(false, Ordering::SeqCst);
                    return;
                }
            };

            pipeline::run_capture(pipeline::CaptureContext {
                consumer,
                capture_sample_rate: capture.sample_rate,
                window_buffer,
                slot: slot_tx,
                running: session,
                activity_tx,
                diagnostics,
            });

            // Stream drops here, releasing the device on this thread.
            drop(capture);
        });

        match open_rx.recv() {
            Ok(Ok(rate)) => {
                info!(capture_rate = rate, "engine started: listening");
                Ok(())
            }
            Ok(Err(e)) => {
                running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some("capture failed to start".into()));
                Err(KeyscribeError::Other(anyhow::anyhow!(
                    "capture task died unexpectedly"
                )))
            }
        }
    }

    /// Stop capture and decoding.
    ///
    /// # Errors
    /// `NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        self.end_session()?;
        self.set_status(EngineStatus::Stopped, None);
        self.model.0.lock().reset();
        info!("engine stop requested");
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().load(Ordering::SeqCst)
    }

    /// Subscribe to decoded notes, one event per analysis window.
    pub fn subscribe_notes(&self) -> broadcast::Receiver<NoteEvent> {
        self.note_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to per-chunk input level events.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.activity_tx.subscribe()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn pipeline_diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Install a fresh run flag for a new session and return it.
    fn begin_session(&self) -> Result<Arc<AtomicBool>> {
        let mut current = self.running.lock();
        if current.load(Ordering::SeqCst) {
            return Err(KeyscribeError::AlreadyRunning);
        }
        let session = Arc::new(AtomicBool::new(true));
        *current = Arc::clone(&session);
        Ok(session)
    }

    /// Clear the current session's flag.
    fn end_session(&self) -> Result<()> {
        if self.running.lock().swap(false, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KeyscribeError::NotRunning)
        }
    }

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::StubModel;

    #[test]
    fn default_config_is_valid_and_maps_to_direct_decoding() {
        let cfg = EngineConfig::default();
        cfg.validate().expect("default config valid");
        let dec = cfg.decoder_config();
        assert!(!dec.use_viterbi);
        assert!(!dec.predict_velocities);
        assert_eq!(dec.viterbi_alpha, 0.5);
        assert_eq!(cfg.window_buffer().expect("buffer").buffer_size(), 17_920);
    }

    #[test]
    fn json_config_uses_camel_case_and_defaults() {
        let cfg = EngineConfig::from_json_str(
            r#"{
                "useAlternateDecoding": true,
                "viterbiAlpha": 0.25,
                "overlapPolicy": "discard",
                "backpressure": "block",
                "preferredInputDevice": "USB Piano Mic"
            }"#,
        )
        .expect("parse config");

        assert_eq!(cfg.sample_rate, 16_000);
        assert_eq!(cfg.padding_samples, 1_920);
        assert!(cfg.use_alternate_decoding);
        assert_eq!(cfg.viterbi_alpha, 0.25);
        assert_eq!(cfg.overlap_policy, OverlapPolicy::Discard);
        assert_eq!(cfg.backpressure, BackpressurePolicy::Block);
        assert_eq!(cfg.preferred_input_device.as_deref(), Some("USB Piano Mic"));
        assert!(cfg.decoder_config().use_viterbi);
    }

    #[test]
    fn invalid_alpha_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "viterbiAlpha": 1.5 }"#).unwrap_err();
        assert!(matches!(err, KeyscribeError::InvalidAlpha(a) if a == 1.5));
    }

    #[test]
    fn padding_must_be_below_sample_rate() {
        let cfg = EngineConfig {
            padding_samples: 16_000,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(KeyscribeError::InvalidConfig(_))));

        let cfg = EngineConfig {
            sample_rate: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(KeyscribeError::InvalidConfig(_))));
    }

    #[test]
    fn unknown_overlap_policy_is_a_json_error() {
        let err = EngineConfig::from_json_str(r#"{ "overlapPolicy": "merge" }"#).unwrap_err();
        assert!(matches!(err, KeyscribeError::Json(_)));
    }

    #[test]
    fn load_reads_config_file() {
        let path = std::env::temp_dir().join(format!(
            "keyscribe-config-test-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, r#"{ "predictVelocities": true }"#).expect("write config");
        let cfg = EngineConfig::load(&path).expect("load config");
        let _ = std::fs::remove_file(&path);
        assert!(cfg.predict_velocities);

        assert!(matches!(
            EngineConfig::load(std::env::temp_dir().join("keyscribe-missing-config.json")),
            Err(KeyscribeError::Io(_))
        ));
    }

    #[test]
    fn lifecycle_errors_without_running() {
        let engine = KeyscribeEngine::new(EngineConfig::default(), ModelHandle::new(StubModel::new()))
            .expect("engine");
        assert_eq!(engine.status(), EngineStatus::Idle);
        assert!(matches!(engine.stop(), Err(KeyscribeError::NotRunning)));

        let mut status_rx = engine.subscribe_status();
        engine.warm_up().expect("warm up");
        assert_eq!(status_rx.try_recv().expect("warming").status, EngineStatus::WarmingUp);
        assert_eq!(status_rx.try_recv().expect("idle").status, EngineStatus::Idle);
        assert_eq!(engine.status(), EngineStatus::Idle);
    }

    #[test]
    fn restart_gives_each_session_its_own_flag() {
        let engine = KeyscribeEngine::new(EngineConfig::default(), ModelHandle::new(StubModel::new()))
            .expect("engine");

        let first = engine.begin_session().expect("first session");
        assert!(engine.is_running());
        assert!(matches!(engine.begin_session(), Err(KeyscribeError::AlreadyRunning)));

        engine.stop().expect("stop");
        assert_eq!(engine.status(), EngineStatus::Stopped);
        let second = engine.begin_session().expect("second session");

        assert!(!first.load(Ordering::SeqCst), "stopped session stays stopped");
        assert!(second.load(Ordering::SeqCst));
        assert!(!Arc::ptr_eq(&first, &second));

        engine.stop().expect("stop again");
        assert!(!second.load(Ordering::SeqCst));
        assert!(!engine.is_running());
        assert!(matches!(engine.stop(), Err(KeyscribeError::NotRunning)));
    }

    #[test]
    fn new_rejects_invalid_config() {
        let cfg = EngineConfig {
            viterbi_alpha: f64::NAN,
            ..EngineConfig::default()
        };
        assert!(KeyscribeEngine::new(cfg, ModelHandle::new(StubModel::new())).is_err());
    }
}
