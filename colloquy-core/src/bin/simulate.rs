//! Drive a complete synthetic session against the stub providers and print
//! every emitted message as JSON — the whole pipeline end-to-end with no
//! models and no network.
//!
//! ```text
//! cargo run -p colloquy-core --bin simulate -- \
//!   [--seconds <n>] [--wav <file>] [--diarization] [--translate <lang>] [--summary]
//! ```

use std::path::{Path, PathBuf};

use colloquy_core::inference::stub::stub_bundle;
use colloquy_core::{OutboundMessage, SessionConfig, SessionEngine, SAMPLE_RATE};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct Args {
    seconds: f64,
    wav: Option<PathBuf>,
    diarization: bool,
    translate: Option<String>,
    summary: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        seconds: 8.0,
        wav: None,
        diarization: false,
        translate: None,
        summary: false,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--seconds" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --seconds".into());
                };
                args.seconds = v
                    .parse::<f64>()
                    .map_err(|_| "invalid value for --seconds".to_string())?
                    .clamp(1.0, 120.0);
            }
            "--wav" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --wav".into());
                };
                args.wav = Some(PathBuf::from(v));
            }
            "--translate" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --translate".into());
                };
                args.translate = Some(v);
            }
            "--diarization" => args.diarization = true,
            "--summary" => args.summary = true,
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p colloquy-core --bin simulate -- \\
  [--seconds <n>] [--wav <file>] [--diarization] [--translate <lang>] [--summary]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

/// Alternating 3 s of 440 Hz tone and 2 s of silence, as s16le bytes.
fn synthetic_pcm(seconds: f64) -> Vec<u8> {
    let total = (seconds * SAMPLE_RATE as f64) as usize;
    let mut out = Vec::with_capacity(total * 2);
    for i in 0..total {
        let t = i as f64 / SAMPLE_RATE as f64;
        let in_speech = t % 5.0 < 3.0;
        let sample = if in_speech {
            (0.3 * (2.0 * std::f64::consts::PI * 440.0 * t).sin() * i16::MAX as f64) as i16
        } else {
            0
        };
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

fn read_wav_pcm(path: &Path) -> Result<Vec<u8>, String> {
    let mut reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != SAMPLE_RATE {
        return Err(format!(
            "expected mono {SAMPLE_RATE} Hz WAV, got {} ch @ {} Hz",
            spec.channels, spec.sample_rate
        ));
    }
    let mut out = Vec::new();
    match spec.sample_format {
        hound::SampleFormat::Int => {
            for sample in reader.samples::<i16>() {
                let s = sample.map_err(|e| e.to_string())?;
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
        hound::SampleFormat::Float => {
            for sample in reader.samples::<f32>() {
                let s = sample.map_err(|e| e.to_string())?;
                let q = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                out.extend_from_slice(&q.to_le_bytes());
            }
        }
    }
    Ok(out)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("simulate failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let args = parse_args()?;

    let pcm = match &args.wav {
        Some(path) => read_wav_pcm(path)?,
        None => synthetic_pcm(args.seconds),
    };

    let config = SessionConfig {
        pcm_input: true,
        diarization: args.diarization,
        target_language: args.translate.clone().unwrap_or_default(),
        enable_summary: args.summary,
        ..SessionConfig::default()
    };

    let bundle = stub_bundle();
    let mut engine = SessionEngine::new(config, &bundle).map_err(|e| e.to_string())?;
    let mut messages = engine.start().await.map_err(|e| e.to_string())?;

    let feeder = tokio::spawn(async move {
        // Half-second chunks, paced just enough to interleave with output.
        let chunk_bytes = SAMPLE_RATE as usize; // 0.5 s of s16le
        for chunk in pcm.chunks(chunk_bytes) {
            engine.process_audio(chunk).await;
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        engine.process_audio(&[]).await;
        engine
    });

    let mut frames = 0usize;
    while let Some(message) = messages.recv().await {
        let json = serde_json::to_string(&message).map_err(|e| e.to_string())?;
        println!("{json}");
        if matches!(message, OutboundMessage::Frame(_)) {
            frames += 1;
        }
        if matches!(
            message,
            OutboundMessage::Control(colloquy_core::ControlMessage::ReadyToStop)
        ) {
            break;
        }
    }

    let engine = feeder.await.map_err(|e| e.to_string())?;
    engine.shutdown().await;
    eprintln!("done: {frames} frame(s) emitted");
    Ok(())
}
