use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use keyscribe_core::buffering::slot::{window_slot, BackpressurePolicy};
use keyscribe_core::buffering::{create_audio_ring, Producer};
use keyscribe_core::engine::{pipeline, EngineConfig};
use keyscribe_core::inference::stub::StubModel;
use keyscribe_core::ipc::events::{AudioActivityEvent, EngineStatus, NoteEvent};
use keyscribe_core::ModelHandle;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

const DEVICE_RATE: u32 = 48_000;

fn sine_48k(freq: f32, amplitude: f32, seconds: f32) -> Vec<f32> {
    let len = (DEVICE_RATE as f32 * seconds) as usize;
    (0..len)
        .map(|i| {
            let t = i as f32 / DEVICE_RATE as f32;
            (2.0 * std::f32::consts::PI * freq * t).sin() * amplitude
        })
        .collect()
}

fn recv_event_with_timeout(rx: &mut broadcast::Receiver<NoteEvent>, timeout: Duration) -> NoteEvent {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for note event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("note channel closed unexpectedly"),
        }
    }
}

struct Pipeline {
    running: Arc<AtomicBool>,
    diagnostics: Arc<pipeline::PipelineDiagnostics>,
    note_rx: broadcast::Receiver<NoteEvent>,
    _activity_rx: broadcast::Receiver<AudioActivityEvent>,
    capture: thread::JoinHandle<()>,
    decoder: thread::JoinHandle<()>,
}

impl Pipeline {
    fn spawn(samples: &[f32], config: EngineConfig) -> Self {
        let (mut producer, consumer) = create_audio_ring();
        assert_eq!(producer.push_slice(samples), samples.len());

        let running = Arc::new(AtomicBool::new(true));
        let diagnostics = Arc::new(pipeline::PipelineDiagnostics::default());
        let (slot_tx, slot_rx) = window_slot(config.backpressure);
        let (note_tx, note_rx) = broadcast::channel(64);
        let (status_tx, _) = broadcast::channel(8);
        let (activity_tx, activity_rx) = broadcast::channel(1024);

        let decoder_ctx = pipeline::DecoderContext {
            decoder: config.decoder_config(),
            model: ModelHandle::new(StubModel::new()),
            slot: slot_rx,
            running: Arc::clone(&running),
            note_tx,
            status_tx,
            status: Arc::new(Mutex::new(EngineStatus::Listening)),
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::clone(&diagnostics),
        };
        let capture_ctx = pipeline::CaptureContext {
            consumer,
            capture_sample_rate: DEVICE_RATE,
            window_buffer: config.window_buffer().expect("window buffer"),
            slot: slot_tx,
            running: Arc::clone(&running),
            activity_tx,
            diagnostics: Arc::clone(&diagnostics),
        };

        let decoder = thread::spawn(move || pipeline::run_decoder(decoder_ctx));
        let capture = thread::spawn(move || pipeline::run_capture(capture_ctx));

        Self {
            running,
            diagnostics,
            note_rx,
            _activity_rx: activity_rx,
            capture,
            decoder,
        }
    }

    fn stop(self) -> pipeline::DiagnosticsSnapshot {
        self.running.store(false, Ordering::SeqCst);
        self.capture.join().expect("capture thread panicked");
        self.decoder.join().expect("decoder thread panicked");
        self.diagnostics.snapshot()
    }
}

#[test]
fn resampled_sine_decodes_to_a4() {
    let config = EngineConfig {
        backpressure: BackpressurePolicy::Block,
        ..EngineConfig::default()
    };
    let mut p = Pipeline::spawn(&sine_48k(440.0, 0.5, 2.5), config);

    let first = recv_event_with_timeout(&mut p.note_rx, Duration::from_secs(5));
    let second = recv_event_with_timeout(&mut p.note_rx, Duration::from_secs(5));
    let snap = p.stop();

    assert_eq!(first.window_index, 0);
    assert_eq!(first.window_start_secs, 0.0);
    assert!(
        first.notes.iter().any(|n| n.pitch() == 48 && n.start_time() < 0.1),
        "expected A4 (key 48) near the window start, got {:?}",
        first.notes
    );

    // Splice windows hop by one second.
    assert_eq!(second.window_index, 1);
    assert_eq!(second.window_start_secs, 1.0);
    assert!(second.notes.iter().any(|n| n.pitch() == 48));

    assert_eq!(snap.windows_dropped, 0);
    assert_eq!(snap.conversion_errors, 0);
    assert!(snap.inference_calls >= 2);
    assert_eq!(snap.inference_errors, 0);
}

#[test]
fn discard_overlap_windows_are_disjoint() {
    let config = EngineConfig {
        backpressure: BackpressurePolicy::Block,
        overlap_policy: keyscribe_core::OverlapPolicy::Discard,
        ..EngineConfig::default()
    };
    let mut p = Pipeline::spawn(&sine_48k(261.63, 0.4, 2.5), config);

    let first = recv_event_with_timeout(&mut p.note_rx, Duration::from_secs(5));
    let second = recv_event_with_timeout(&mut p.note_rx, Duration::from_secs(5));
    p.stop();

    assert_eq!(first.window_index, 0);
    assert_eq!(second.window_index, 1);
    assert!((second.window_start_secs - 17_920.0 / 16_000.0).abs() < 1e-9);
    // Middle C is key 39.
    assert!(first.notes.iter().any(|n| n.pitch() == 39));
}

#[test]
fn first_note_event_latency_under_one_second() {
    let mut p = Pipeline::spawn(&sine_48k(440.0, 0.5, 1.2), EngineConfig::default());

    let start = Instant::now();
    let first = recv_event_with_timeout(&mut p.note_rx, Duration::from_secs(5));
    let elapsed = start.elapsed();
    p.stop();

    assert_eq!(first.seq, 0);
    assert!(
        elapsed < Duration::from_secs(1),
        "first note event too slow: {elapsed:?} (target < 1s)"
    );
}
