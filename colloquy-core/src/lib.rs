//! # colloquy-core
//!
//! Per-connection real-time conversation transcription engine.
//!
//! ## Architecture
//!
//! ```text
//! client bytes → Decoder (ffmpeg | pcm passthrough)
//!                    │ 16 kHz s16le PCM
//!              Ingress / VAD gate ──silence events──┐
//!                    │ active audio (by value)      │
//!          ┌─────────┴─────────┐                    │
//!   Transcription         Diarization               │
//!        │ committed tokens     │ segments          │
//!        ├──► Translation       │                   │
//!        ▼          ▼           ▼                   ▼
//!            Timeline (async lock, watermarks, silences)
//!                    │ pickup @ ~20 Hz
//!              Formatter — align speakers, group lines,
//!              emit change-only Frames → client channel
//! ```
//!
//! Each session owns its online processor instances; model weights are
//! shared read-only through [`inference::ModelBundle`]. Model calls run on
//! the blocking pool; everything else cooperates on one scheduler.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod align;
pub mod decode;
pub mod engine;
pub mod error;
pub mod inference;
pub mod ipc;
pub mod timed;
pub mod timeline;
pub mod vad;

/// Engine-wide PCM contract: mono signed-16-bit little-endian at 16 kHz.
pub const SAMPLE_RATE: u32 = 16_000;

// Convenience re-exports for downstream crates
pub use engine::{BackendPolicy, SessionConfig, SessionEngine, SessionPhase};
pub use error::{EngineError, Result};
pub use inference::{
    AsrHandle, Diarizer, DiarizerHandle, ModelBundle, StreamingAsr, Summarizer, Translator,
    TranslatorHandle,
};
pub use ipc::frames::{ControlMessage, Frame, FrameStatus, Line, OutboundMessage};
pub use timed::{SpeakerSegment, Token, TranscriptBuffer};
