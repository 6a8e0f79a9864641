//! Capability-provider seams and the shared model bundle.
//!
//! Concrete models (Whisper variants, diart-style clustering, NLLB, an LLM
//! summarizer) live outside this crate. The engine consumes them through the
//! traits below; the host loads weights once, wraps them in factories, and
//! hands every session the same read-only [`ModelBundle`].
//!
//! `&mut self` on the processing methods intentionally expresses that online
//! processors are stateful — decoder caches, rolling prompts, cluster
//! centroids. All mutation is serialised through the `*Handle` wrappers'
//! `parking_lot::Mutex`, locked only inside the owning worker task or the
//! blocking closure it dispatches.

pub mod stub;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::SessionConfig;
use crate::error::Result;
use crate::ipc::frames::{Line, SummaryReport};
use crate::timed::{SpeakerChange, SpeakerSegment, Token, TranscriptBuffer, TranslatedToken};
use crate::vad::VoiceActivityDetector;

/// New tokens plus the stream time transcription has processed up to.
pub type AsrOutput = (Vec<Token>, f64);
/// Committed translations plus the translator's unstable tail.
pub type TranslationOutput = (Vec<TranslatedToken>, TranscriptBuffer);

/// Per-session online transcription processor.
pub trait StreamingAsr: Send + 'static {
    /// Word separator used when joining token texts.
    fn separator(&self) -> &str {
        " "
    }

    /// Append active audio whose stream time ends at `stream_time_end`.
    fn insert_audio_chunk(&mut self, pcm: &[f32], stream_time_end: f64);

    /// Run one incremental decode over the inserted audio.
    fn process_iter(&mut self) -> Result<AsrOutput>;

    /// Flush the internal buffer to committed tokens when the stream goes
    /// silent.
    fn start_silence(&mut self) -> Result<AsrOutput>;

    /// Advance the internal clock across a finished silence.
    fn end_silence(&mut self, duration: f64, last_token_end: f64);

    /// Current unstable recognition tail.
    fn buffer(&self) -> TranscriptBuffer;

    /// Speaker-turn notification from the formatter. `flush_context` asks the
    /// backend to also drop committed decoding context, not just prompt state.
    fn new_speaker(&mut self, change: &SpeakerChange, flush_context: bool);
}

/// Per-session online diarization processor.
///
/// Speakers are assigned integer ids in first-seen order starting at 0;
/// assignments may be refined but never reshuffled arbitrarily.
pub trait Diarizer: Send + 'static {
    fn insert_audio_chunk(&mut self, pcm: &[f32]);

    /// Advance the internal clock across a silence without spending model time.
    fn insert_silence(&mut self, duration: f64);

    /// Speaker-labeled segments covering everything processed so far.
    fn diarize(&mut self) -> Result<Vec<SpeakerSegment>>;

    /// Release model resources. Called once at session cleanup.
    fn close(&mut self);
}

/// Per-session online translation processor with a sliding source context.
pub trait Translator: Send + 'static {
    fn insert_tokens(&mut self, token: &Token);

    fn insert_silence(&mut self, duration: f64);

    /// Commit whatever is buffered and reset the sliding context.
    fn validate_buffer_and_reset(&mut self) -> TranslationOutput;

    fn process(&mut self) -> Result<TranslationOutput>;
}

/// Post-session summarization collaborator. Invoked once, on the blocking
/// pool; failures are skipped without affecting transcript delivery.
pub trait Summarizer: Send + Sync + 'static {
    fn summarize(&self, lines: &[Line]) -> Result<SummaryReport>;
}

macro_rules! processor_handle {
    ($(#[$doc:meta])* $name:ident, $contract:ident) => {
        $(#[$doc])*
        pub struct $name(pub Arc<Mutex<dyn $contract>>);

        impl $name {
            pub fn new<P: $contract>(processor: P) -> Self {
                Self(Arc::new(Mutex::new(processor)))
            }
        }

        impl Clone for $name {
            fn clone(&self) -> Self {
                Self(Arc::clone(&self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name)).finish_non_exhaustive()
            }
        }
    };
}

processor_handle!(
    /// Shareable handle to a session's online ASR processor.
    AsrHandle,
    StreamingAsr
);
processor_handle!(
    /// Shareable handle to a session's online diarizer.
    DiarizerHandle,
    Diarizer
);
processor_handle!(
    /// Shareable handle to a session's online translator.
    TranslatorHandle,
    Translator
);

/// Builds a per-session online ASR processor over the shared model.
pub trait AsrFactory: Send + Sync + 'static {
    fn online(&self, config: &SessionConfig) -> Result<AsrHandle>;
}

pub trait DiarizerFactory: Send + Sync + 'static {
    fn online(&self, config: &SessionConfig) -> Result<DiarizerHandle>;
}

pub trait TranslatorFactory: Send + Sync + 'static {
    fn online(&self, config: &SessionConfig) -> Result<TranslatorHandle>;
}

pub trait VadFactory: Send + Sync + 'static {
    fn online(&self) -> Box<dyn VoiceActivityDetector>;
}

/// Shared, read-only collection of model factories.
///
/// Owned by the host for the lifetime of the longest session and handed to
/// each engine by `Arc`. Model weights may be shared internally; each session
/// gets its own online processor instances.
#[derive(Default)]
pub struct ModelBundle {
    pub asr: Option<Arc<dyn AsrFactory>>,
    pub diarization: Option<Arc<dyn DiarizerFactory>>,
    pub translation: Option<Arc<dyn TranslatorFactory>>,
    pub vad: Option<Arc<dyn VadFactory>>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
}

impl std::fmt::Debug for ModelBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBundle")
            .field("asr", &self.asr.is_some())
            .field("diarization", &self.diarization.is_some())
            .field("translation", &self.translation.is_some())
            .field("vad", &self.vad.is_some())
            .field("summarizer", &self.summarizer.is_some())
            .finish()
    }
}
