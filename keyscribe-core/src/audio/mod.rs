//! Microphone capture through cpal.
//!
//! The cpal input callback runs on a real-time OS audio thread. It never
//! blocks, never performs I/O and, after the first callback has sized its
//! mix buffer, never allocates: interleaved frames are averaged to mono and
//! pushed into the SPSC ring with the lock-free `push_slice`.
//!
//! `cpal::Stream` is `!Send` on Windows and macOS, so `AudioCapture` is
//! created and dropped on the same thread (the capture loop's
//! `spawn_blocking` task).

pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;
use crate::{
    buffering::{chunk::SILENCE_DB, AudioProducer},
    error::{KeyscribeError, Result},
};

/// RMS level in dBFS of a block of 16-bit PCM, floored at [`SILENCE_DB`].
pub fn pcm_level_db(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return SILENCE_DB;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    let rms = (sum_sq / samples.len() as f64).sqrt();
    if rms <= 0.0 {
        return SILENCE_DB;
    }
    ((20.0 * rms.log10()) as f32).max(SILENCE_DB)
}

/// Average interleaved frames into `mono`, converting each sample with `to_f32`.
/// `mono` is resized to the frame count; it only reallocates when it grows.
fn downmix_into<T: Copy>(data: &[T], channels: usize, mono: &mut Vec<f32>, to_f32: impl Fn(T) -> f32) {
    let channels = channels.max(1);
    let frames = data.len() / channels;
    mono.resize(frames, 0.0);
    for (out, frame) in mono.iter_mut().zip(data.chunks_exact(channels)) {
        let sum: f32 = frame.iter().map(|&s| to_f32(s)).sum();
        *out = sum / channels as f32;
    }
}

/// Handle to an active capture stream.
///
/// **Not `Send`**: create and drop on the same OS thread.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    running: Arc<AtomicBool>,
    /// Native device sample rate (Hz); the format converter resamples from it.
    pub sample_rate: u32,
    /// Human-readable device name, if the host reports one.
    pub device_name: Option<String>,
}

#[cfg(feature = "audio-cpal")]
fn build_mono_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
    to_f32: fn(T) -> f32,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + Send + 'static,
{
    let channels = config.channels as usize;
    let mut mono: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _info| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            downmix_into(data, channels, &mut mono, to_f32);
            let written = producer.push_slice(&mono);
            if written < mono.len() {
                warn!("ring buffer full: dropped {} frames", mono.len() - written);
            }
        },
        |err| error!("audio stream error: {err}"),
        None,
    )
}

#[cfg(feature = "audio-cpal")]
impl AudioCapture {
    /// Open the input device named `preferred_device_name`, falling back to the
    /// default input device and then to the first one available.
    ///
    /// # Errors
    /// `NoDefaultInputDevice` when there is no input at all, `AudioDevice`
    /// when the device cannot report a config, `AudioStream` when cpal fails
    /// to build or start the stream.
    pub fn open_with_preference(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut selected_device = None;

        if let Some(preferred_name) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected_device = devices.find(|device| {
                        device
                            .name()
                            .map(|name| name == preferred_name)
                            .unwrap_or(false)
                    });
                    if selected_device.is_none() {
                        warn!(
                            "preferred input device '{}' not found, falling back",
                            preferred_name
                        );
                    }
                }
                Err(e) => {
                    warn!("failed to list input devices while resolving preference: {e}");
                }
            }
        }

        let device = match selected_device.or_else(|| host.default_input_device()) {
            Some(device) => device,
            None => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| KeyscribeError::AudioDevice(e.to_string()))?;
                warn!("no default input device, falling back to first available input");
                devices.next().ok_or(KeyscribeError::NoDefaultInputDevice)?
            }
        };

        let device_name = device.name().ok();
        info!(
            device = device_name.as_deref().unwrap_or_default(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| KeyscribeError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "audio config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let flag = Arc::clone(&running);
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_mono_stream::<f32>(&device, &config, producer, flag, |s| s),
            SampleFormat::I16 => {
                build_mono_stream::<i16>(&device, &config, producer, flag, |s| s as f32 / 32768.0)
            }
            SampleFormat::U8 => build_mono_stream::<u8>(&device, &config, producer, flag, |s| {
                (s as f32 - 128.0) / 128.0
            }),
            fmt => {
                return Err(KeyscribeError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| KeyscribeError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| KeyscribeError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
            device_name,
        })
    }

}

impl AudioCapture {
    /// Stop: the callback no-ops from its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(KeyscribeError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_downmix_averages_channels() {
        let interleaved = [0.5f32, -0.5, 1.0, 0.0, 0.25, 0.25];
        let mut mono = Vec::new();
        downmix_into(&interleaved, 2, &mut mono, |s| s);
        assert_eq!(mono, vec![0.0, 0.5, 0.25]);
    }

    #[test]
    fn u8_downmix_centres_on_128() {
        let mut mono = Vec::new();
        downmix_into(&[128u8, 0, 255], 1, &mut mono, |s| (s as f32 - 128.0) / 128.0);
        assert_eq!(mono[0], 0.0);
        assert_eq!(mono[1], -1.0);
        assert!((mono[2] - 127.0 / 128.0).abs() < 1e-6);
    }

    #[test]
    fn trailing_partial_frame_is_ignored() {
        let mut mono = vec![9.0; 10];
        downmix_into(&[0.1f32, 0.3, 0.5], 2, &mut mono, |s| s);
        assert_eq!(mono.len(), 1);
        assert!((mono[0] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn level_db_of_silence_and_full_scale() {
        assert_eq!(pcm_level_db(&[]), SILENCE_DB);
        assert_eq!(pcm_level_db(&[0; 64]), SILENCE_DB);
        let square: Vec<i16> = (0..64)
            .map(|i| if i % 2 == 0 { i16::MAX } else { -i16::MAX })
            .collect();
        assert!(pcm_level_db(&square).abs() < 1e-3);
    }

    #[cfg(not(feature = "audio-cpal"))]
    #[test]
    fn open_without_cpal_reports_stream_error() {
        let (producer, _consumer) = crate::buffering::create_audio_ring();
        let running = Arc::new(AtomicBool::new(true));
        let err = AudioCapture::open_with_preference(producer, running, None)
            .err()
            .expect("no backend");
        assert!(matches!(err, KeyscribeError::AudioStream(_)));
    }

    #[cfg(not(feature = "audio-cpal"))]
    #[test]
    fn stop_clears_the_callback_flag() {
        let running = Arc::new(AtomicBool::new(true));
        let capture = AudioCapture {
            running: Arc::clone(&running),
            sample_rate: 48_000,
            device_name: None,
        };
        capture.stop();
        assert!(!running.load(Ordering::Acquire));
    }

    #[test]
    fn half_scale_is_about_minus_six_db() {
        let half = i16::MAX / 2;
        let square: Vec<i16> = (0..64).map(|i| if i % 2 == 0 { half } else { -half }).collect();
        assert!((pcm_level_db(&square) + 6.02).abs() < 0.05);
    }
}
