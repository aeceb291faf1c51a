//! Blocking capture and decoder loops.
//!
//! ## Capture loop (per iteration)
//!
//! ```text
//! 1. Drain ring buffer → Vec<f32> at the device rate
//! 2. FormatConverter → i16 at the model rate (failure: drop the partial window)
//! 3. Broadcast AudioActivityEvent (RMS + dBFS)
//! 4. SampleWindowBuffer → complete AnalysisWindows
//! 5. WindowSender::offer (drop or block per BackpressurePolicy)
//! ```
//!
//! ## Decoder loop (per window)
//!
//! ```text
//! 1. Receive AnalysisWindow from the slot
//! 2. AcousticModel::infer + [32, 88] validation
//!    (failure or malformed tensors: empty NoteSequence for this window)
//! 3. decode → NoteSequence (failure: status Error, engine stops)
//! 4. Broadcast NoteEvent unless the session was stopped meanwhile
//! ```
//!
//! Each session owns its `running` flag, so loops left over from a stopped
//! session never emit alongside the loops of the next one.
//!
//! Both loops run in `spawn_blocking`, keeping the Tokio executor free.

use std::sync::OnceLock;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    audio::resample::FormatConverter,
    buffering::{
        chunk::PcmChunk,
        slot::{OfferOutcome, WindowReceiver, WindowSender},
        window::{AnalysisWindow, SampleWindowBuffer},
        AudioConsumer, Consumer,
    },
    decode::{decode, DecoderConfig},
    error::Result,
    inference::ModelHandle,
    ipc::events::{AudioActivityEvent, EngineStatus, EngineStatusEvent, NoteEvent},
    note::NoteSequence,
};

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub samples_in: AtomicUsize,
    pub samples_converted: AtomicUsize,
    pub conversion_errors: AtomicUsize,
    pub windows_emitted: AtomicUsize,
    pub windows_dropped: AtomicUsize,
    pub inference_calls: AtomicUsize,
    pub inference_errors: AtomicUsize,
    pub notes_emitted: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.samples_in.store(0, Ordering::Relaxed);
        self.samples_converted.store(0, Ordering::Relaxed);
        self.conversion_errors.store(0, Ordering::Relaxed);
        self.windows_emitted.store(0, Ordering::Relaxed);
        self.windows_dropped.store(0, Ordering::Relaxed);
        self.inference_calls.store(0, Ordering::Relaxed);
        self.inference_errors.store(0, Ordering::Relaxed);
        self.notes_emitted.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            samples_converted: self.samples_converted.load(Ordering::Relaxed),
            conversion_errors: self.conversion_errors.load(Ordering::Relaxed),
            windows_emitted: self.windows_emitted.load(Ordering::Relaxed),
            windows_dropped: self.windows_dropped.load(Ordering::Relaxed),
            inference_calls: self.inference_calls.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            notes_emitted: self.notes_emitted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub samples_in: usize,
    pub samples_converted: usize,
    pub conversion_errors: usize,
    /// Windows handed to the decoder.
    pub windows_emitted: usize,
    /// Windows discarded because the decoder was still busy.
    pub windows_dropped: usize,
    pub inference_calls: usize,
    pub inference_errors: usize,
    pub notes_emitted: usize,
}

/// Everything the capture loop owns.
pub struct CaptureContext {
    pub consumer: AudioConsumer,
    /// Native device rate; the window buffer's rate is the target.
    pub capture_sample_rate: u32,
    pub window_buffer: SampleWindowBuffer,
    pub slot: WindowSender,
    pub running: Arc<AtomicBool>,
    pub activity_tx: broadcast::Sender<AudioActivityEvent>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Everything the decoder loop owns.
pub struct DecoderContext {
    pub decoder: DecoderConfig,
    pub model: ModelHandle,
    pub slot: WindowReceiver,
    pub running: Arc<AtomicBool>,
    pub note_tx: broadcast::Sender<NoteEvent>,
    pub status_tx: broadcast::Sender<EngineStatusEvent>,
    pub status: Arc<Mutex<EngineStatus>>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Samples drained from the ring per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty (avoids busy-wait burning a core).
const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

/// How often the decoder re-checks `running` while idle.
const DECODER_POLL_MS: u64 = 20;

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("KEYSCRIBE_PIPELINE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}

/// Run the capture loop until `ctx.running` becomes false or the decoder
/// side of the slot is gone.
pub fn run_capture(mut ctx: CaptureContext) {
    let target_rate = ctx.window_buffer.sample_rate();
    info!(
        capture_rate = ctx.capture_sample_rate,
        target_rate,
        buffer_size = ctx.window_buffer.buffer_size(),
        policy = ?ctx.window_buffer.policy(),
        "capture loop started"
    );

    let mut converter = match FormatConverter::new(ctx.capture_sample_rate, target_rate, DRAIN_CHUNK)
    {
        Ok(c) => c,
        Err(e) => {
            error!("failed to create format converter: {e}");
            ctx.running.store(false, Ordering::SeqCst);
            return;
        }
    };

    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut activity_seq = 0u64;

    'capture: loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(empty_sleep_ms()));
            continue;
        }
        ctx.diagnostics.samples_in.fetch_add(n, Ordering::Relaxed);

        let pcm = match converter.process(&raw[..n]) {
            Ok(pcm) => pcm,
            Err(e) => {
                ctx.diagnostics
                    .conversion_errors
                    .fetch_add(1, Ordering::Relaxed);
                let dropped = ctx.window_buffer.discard_pending();
                warn!(error = %e, dropped_samples = dropped, "format conversion failed: window in progress dropped");
                continue;
            }
        };
        if pcm.is_empty() {
            // Partial rubato chunk; wait for more input.
            continue;
        }
        ctx.diagnostics
            .samples_converted
            .fetch_add(pcm.len(), Ordering::Relaxed);

        let chunk = PcmChunk::new(pcm, target_rate);
        let _ = ctx.activity_tx.send(AudioActivityEvent {
            seq: activity_seq,
            rms: chunk.rms(),
            level_db: chunk.level_db(),
        });
        activity_seq = activity_seq.saturating_add(1);

        ctx.window_buffer.extend(&chunk.samples);
        while let Some(window) = ctx.window_buffer.next_window() {
            let index = window.index();
            match ctx.slot.offer(window) {
                OfferOutcome::Delivered => {
                    ctx.diagnostics
                        .windows_emitted
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(index, "window handed to decoder");
                }
                OfferOutcome::Dropped => {
                    ctx.diagnostics
                        .windows_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(index, "decoder busy: window dropped");
                }
                OfferOutcome::Closed => {
                    info!(index, "decoder gone: capture loop exiting");
                    break 'capture;
                }
            }
        }
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        samples_in = snap.samples_in,
        samples_converted = snap.samples_converted,
        conversion_errors = snap.conversion_errors,
        windows_emitted = snap.windows_emitted,
        windows_dropped = snap.windows_dropped,
        "capture loop stopped: diagnostics"
    );
}

/// Run the decoder loop until `ctx.running` becomes false, the capture side
/// of the slot is gone, or decoding fails.
pub fn run_decoder(ctx: DecoderContext) {
    info!(
        viterbi = ctx.decoder.use_viterbi,
        alpha = ctx.decoder.viterbi_alpha,
        predict_velocities = ctx.decoder.predict_velocities,
        "decoder loop started"
    );

    loop {
        let window = match ctx.slot.recv_timeout(Duration::from_millis(DECODER_POLL_MS)) {
            Ok(window) => window,
            Err(RecvTimeoutError::Timeout) => {
                if ctx.running.load(Ordering::Relaxed) {
                    continue;
                }
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if !ctx.running.load(Ordering::SeqCst) {
            debug!(index = window.index(), "session stopped: window discarded");
            break;
        }

        let span = info_span!(
            "window",
            index = window.index(),
            start_secs = window.start_secs(),
            carried = window.carried_samples(),
        );
        let _enter = span.enter();

        match transcribe_window(&ctx.model, &window, &ctx.decoder, &ctx.diagnostics) {
            Ok(_) if !ctx.running.load(Ordering::SeqCst) => {
                debug!("session stopped during inference: result discarded");
                break;
            }
            Ok(notes) => {
                let note_count = notes.len();
                let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
                let emitted = ctx
                    .note_tx
                    .send(NoteEvent {
                        seq,
                        window_index: window.index(),
                        window_start_secs: window.start_secs(),
                        notes,
                    })
                    .is_ok();
                debug!(seq, notes = note_count, emitted, "note event");
            }
            Err(e) => {
                error!(error = %e, "decode failed: stopping engine");
                *ctx.status.lock() = EngineStatus::Error;
                let _ = ctx.status_tx.send(EngineStatusEvent {
                    status: EngineStatus::Error,
                    detail: Some(e.to_string()),
                });
                ctx.running.store(false, Ordering::SeqCst);
                break;
            }
        }
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        inference_calls = snap.inference_calls,
        inference_errors = snap.inference_errors,
        notes_emitted = snap.notes_emitted,
        "decoder loop stopped: diagnostics"
    );
}

/// Run the model on one window and decode its output.
///
/// A model failure is absorbed: an `infer` error or output that is not four
/// valid `[32, 88]` matrices is logged and counted, and the window yields an
/// empty sequence so the stream keeps its cadence.
///
/// # Errors
/// A decode failure on validated output (e.g. `InvalidAlpha`). Callers
/// treat it as fatal.
pub fn transcribe_window(
    model: &ModelHandle,
    window: &AnalysisWindow,
    decoder: &DecoderConfig,
    diagnostics: &PipelineDiagnostics,
) -> Result<NoteSequence> {
    diagnostics.inference_calls.fetch_add(1, Ordering::Relaxed);

    let inferred = model.0.lock().infer(window);
    let output = match inferred.and_then(|output| output.validate().map(|()| output)) {
        Ok(output) => output,
        Err(e) => {
            diagnostics.inference_errors.fetch_add(1, Ordering::Relaxed);
            if e.is_data_integrity() {
                warn!(error = %e, "malformed model output: emitting empty note sequence");
            } else {
                warn!(error = %e, "inference failed: emitting empty note sequence");
            }
            return Ok(NoteSequence::new());
        }
    };

    let notes = decode(&output, decoder)?;
    diagnostics
        .notes_emitted
        .fetch_add(notes.len(), Ordering::Relaxed);
    Ok(notes)
}
