//! Offline driver: transcribe a WAV file to notes through the same
//! convert → window → model → decode path the live engine uses.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tracing::{debug, info};

use keyscribe_core::{
    audio::resample::FormatConverter,
    engine::pipeline::{transcribe_window, PipelineDiagnostics},
    inference::stub::StubModel,
    AnalysisWindow, EngineConfig, ModelHandle, NoteEvent, OverlapPolicy,
};

/// Device-rate samples fed to the converter per call.
const FEED_CHUNK: usize = 960;

#[derive(Debug)]
struct Args {
    input: PathBuf,
    model: Option<PathBuf>,
    config: EngineConfig,
    json: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keyscribe=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("keyscribe-file failed: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        "Usage: keyscribe-file <input.wav> [--config <file.json>] [--model <model.onnx>] \\
  [--viterbi] [--alpha <0..1>] [--velocities] [--overlap splice|discard] [--json]"
    );
}

fn parse_args() -> anyhow::Result<Args> {
    let mut input: Option<PathBuf> = None;
    let mut model: Option<PathBuf> = None;
    let mut config = EngineConfig::default();
    let mut json = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --config");
                };
                config = EngineConfig::load(&v).with_context(|| format!("loading {v}"))?;
            }
            "--model" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --model");
                };
                model = Some(PathBuf::from(v));
            }
            "--viterbi" => config.use_alternate_decoding = true,
            "--velocities" => config.predict_velocities = true,
            "--alpha" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --alpha");
                };
                config.viterbi_alpha = v
                    .parse::<f64>()
                    .with_context(|| format!("invalid value for --alpha: {v}"))?;
            }
            "--overlap" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --overlap");
                };
                config.overlap_policy = match v.as_str() {
                    "splice" => OverlapPolicy::Splice,
                    "discard" => OverlapPolicy::Discard,
                    other => bail!("invalid value for --overlap: {other}"),
                };
            }
            "--json" => json = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other if other.starts_with("--") => bail!("unknown argument: {other}"),
            other => {
                if input.is_some() {
                    bail!("more than one input file given");
                }
                input = Some(PathBuf::from(other));
            }
        }
    }

    let Some(input) = input else {
        print_usage();
        bail!("missing input file");
    };
    config.validate()?;
    Ok(Args {
        input,
        model,
        config,
        json,
    })
}

fn read_wav_mono_f32(path: &Path) -> anyhow::Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max = ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    if channels == 1 {
        return Ok((interleaved, spec.sample_rate));
    }
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

#[cfg(feature = "onnx")]
fn build_model(path: Option<&Path>, input_len: usize) -> anyhow::Result<ModelHandle> {
    use keyscribe_core::{AcousticModel, OnnxAcousticModel, OnnxModelConfig};

    match path {
        Some(p) => {
            let mut model = OnnxAcousticModel::new(OnnxModelConfig {
                model_path: p.to_path_buf(),
                input_len,
                ..OnnxModelConfig::default()
            });
            model.warm_up()?;
            Ok(ModelHandle::new(model))
        }
        None => Ok(ModelHandle::new(StubModel::new())),
    }
}

#[cfg(not(feature = "onnx"))]
fn build_model(path: Option<&Path>, _input_len: usize) -> anyhow::Result<ModelHandle> {
    if path.is_some() {
        bail!("--model requires the 'onnx' feature");
    }
    Ok(ModelHandle::new(StubModel::new()))
}

fn print_window(window: &AnalysisWindow, event: &NoteEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    for note in &event.notes {
        println!(
            "window {:>4} @ {:>8.3}s  {note}",
            window.index(),
            window.start_secs()
        );
    }
    Ok(())
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;
    let (samples, wav_rate) = read_wav_mono_f32(&args.input)?;
    info!(
        file = %args.input.display(),
        samples = samples.len(),
        wav_rate,
        "input loaded"
    );

    let mut buffer = args.config.window_buffer()?;
    let model = build_model(args.model.as_deref(), buffer.buffer_size())?;
    let decoder = args.config.decoder_config();
    let diagnostics = PipelineDiagnostics::default();
    let mut converter = FormatConverter::new(wav_rate, buffer.sample_rate(), FEED_CHUNK)?;

    let mut windows = Vec::new();
    for block in samples.chunks(FEED_CHUNK) {
        let pcm = converter.process(block)?;
        buffer.extend(&pcm);
        while let Some(window) = buffer.next_window() {
            windows.push(window);
        }
    }

    // Zero-pad the tail so trailing audio still reaches the model.
    let carried = match buffer.policy() {
        OverlapPolicy::Splice if !windows.is_empty() => buffer.padding(),
        _ => 0,
    };
    if buffer.pending_len() > carried {
        let missing = buffer.buffer_size() - buffer.pending_len();
        buffer.extend(&vec![0i16; missing]);
        windows.extend(buffer.next_window());
    }

    let mut total_notes = 0usize;
    for window in &windows {
        let notes = transcribe_window(&model, window, &decoder, &diagnostics)?;
        debug!(index = window.index(), notes = notes.len(), "window decoded");
        total_notes += notes.len();
        let event = NoteEvent {
            seq: window.index(),
            window_index: window.index(),
            window_start_secs: window.start_secs(),
            notes,
        };
        print_window(window, &event, args.json)?;
    }

    let snap = diagnostics.snapshot();
    info!(
        windows = windows.len(),
        notes = total_notes,
        inference_errors = snap.inference_errors,
        "done"
    );
    Ok(())
}
