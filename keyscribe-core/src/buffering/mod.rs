//! Buffering between the capture callback and the decode stage.
//!
//! - [`create_audio_ring`]: lock-free SPSC ring of raw device-rate f32 samples.
//!   `ringbuf::HeapRb<f32>` provides a wait-free `push_slice` safe to call
//!   from the real-time audio callback.
//! - [`window::SampleWindowBuffer`]: assembles converted i16 PCM into
//!   fixed-size, overlapping analysis windows.
//! - [`slot::window_slot`]: single-slot handoff of finished windows to the
//!   decode thread.

pub mod chunk;
pub mod slot;
pub mod window;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Type alias for the producer half: held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half: held by the capture loop.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^20 = 1 048 576 f32 samples ≈ 21.8 s at 48 kHz.
/// Covers several windows of decode stalls before the callback starts dropping.
pub const RING_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
