//! Stub providers — placeholder backends that echo structure without real
//! inference.
//!
//! Used by the simulation driver and anywhere the full pipeline should be
//! exercised end-to-end before real models are wired in. Deterministic: the
//! same audio timing always yields the same tokens, segments, and
//! translations.

use std::collections::VecDeque;

use tracing::debug;

use crate::engine::SessionConfig;
use crate::error::Result;
use crate::inference::{
    AsrFactory, AsrHandle, AsrOutput, Diarizer, DiarizerFactory, DiarizerHandle, ModelBundle,
    StreamingAsr, Summarizer, TranslationOutput, Translator, TranslatorFactory, TranslatorHandle,
};
use crate::ipc::frames::{Line, SpeakerSummary, SummaryReport};
use crate::timed::{
    SpeakerChange, SpeakerSegment, Token, TranscriptBuffer, TranslatedToken, SPEAKER_SILENCE,
};
use crate::SAMPLE_RATE;

/// Stream seconds per committed stub token.
const TOKEN_SECONDS: f64 = 1.0;
/// Shortest flushed tail worth a token.
const MIN_FLUSH_SECONDS: f64 = 0.2;

/// Echo-style ASR: commits one `segment-N` token per second of active audio.
pub struct StubAsr {
    stream_end: f64,
    committed_up_to: f64,
    utterance: u32,
    buffer: TranscriptBuffer,
}

impl StubAsr {
    pub fn new() -> Self {
        Self {
            stream_end: 0.0,
            committed_up_to: 0.0,
            utterance: 0,
            buffer: TranscriptBuffer::default(),
        }
    }

    fn next_token(&mut self, start: f64, end: f64) -> Token {
        self.utterance += 1;
        Token::new(format!("segment-{}", self.utterance), start, end)
    }
}

impl Default for StubAsr {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingAsr for StubAsr {
    fn insert_audio_chunk(&mut self, _pcm: &[f32], stream_time_end: f64) {
        self.stream_end = self.stream_end.max(stream_time_end);
    }

    fn process_iter(&mut self) -> Result<AsrOutput> {
        let mut tokens = Vec::new();
        while self.stream_end - self.committed_up_to >= TOKEN_SECONDS {
            let start = self.committed_up_to;
            let token = self.next_token(start, start + TOKEN_SECONDS);
            self.committed_up_to = token.end;
            tokens.push(token);
        }

        let tail = self.stream_end - self.committed_up_to;
        self.buffer = if tail > 0.05 {
            TranscriptBuffer {
                text: "\u{2026}".into(),
                start: Some(self.committed_up_to),
                end: Some(self.stream_end),
            }
        } else {
            TranscriptBuffer::default()
        };

        Ok((tokens, self.stream_end))
    }

    fn start_silence(&mut self) -> Result<AsrOutput> {
        let mut tokens = Vec::new();
        let tail = self.stream_end - self.committed_up_to;
        if tail >= MIN_FLUSH_SECONDS {
            let start = self.committed_up_to;
            let end = self.stream_end;
            tokens.push(self.next_token(start, end));
        }
        self.committed_up_to = self.stream_end;
        self.buffer = TranscriptBuffer::default();
        Ok((tokens, self.stream_end))
    }

    fn end_silence(&mut self, duration: f64, _last_token_end: f64) {
        self.stream_end += duration;
        self.committed_up_to = self.stream_end;
    }

    fn buffer(&self) -> TranscriptBuffer {
        self.buffer.clone()
    }

    fn new_speaker(&mut self, change: &SpeakerChange, flush_context: bool) {
        debug!(speaker = change.speaker, flush_context, "stub ASR speaker turn");
    }
}

/// Stub diarizer: attributes audio to alternating speakers, turning over
/// every `turn_seconds` of active audio.
pub struct StubDiarizer {
    turn_seconds: f64,
    clock: f64,
    segments: Vec<SpeakerSegment>,
}

impl StubDiarizer {
    pub fn new(turn_seconds: f64) -> Self {
        Self {
            turn_seconds,
            clock: 0.0,
            segments: Vec::new(),
        }
    }

    fn current_speaker(&self) -> i32 {
        (self.clock / self.turn_seconds) as i32 % 2
    }

    fn extend(&mut self, duration: f64, speaker: i32) {
        match self.segments.last_mut() {
            Some(last) if last.speaker == speaker && (last.end - self.clock).abs() < 1e-9 => {
                last.end += duration;
            }
            _ => self.segments.push(SpeakerSegment {
                speaker,
                start: self.clock,
                end: self.clock + duration,
            }),
        }
        self.clock += duration;
    }
}

impl Diarizer for StubDiarizer {
    fn insert_audio_chunk(&mut self, pcm: &[f32]) {
        let duration = pcm.len() as f64 / SAMPLE_RATE as f64;
        let speaker = self.current_speaker();
        self.extend(duration, speaker);
    }

    fn insert_silence(&mut self, duration: f64) {
        self.extend(duration, SPEAKER_SILENCE);
    }

    fn diarize(&mut self) -> Result<Vec<SpeakerSegment>> {
        Ok(self.segments.clone())
    }

    fn close(&mut self) {
        debug!("stub diarizer closed");
    }
}

/// Stub translator: brackets each token's text, keeping source timing.
pub struct StubTranslator {
    pending: VecDeque<Token>,
}

impl StubTranslator {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    fn drain(&mut self) -> Vec<TranslatedToken> {
        self.pending
            .drain(..)
            .map(|t| TranslatedToken {
                text: format!("\u{27e6}{}\u{27e7}", t.text),
                start: t.start,
                end: t.end,
            })
            .collect()
    }
}

impl Default for StubTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl Translator for StubTranslator {
    fn insert_tokens(&mut self, token: &Token) {
        self.pending.push_back(token.clone());
    }

    fn insert_silence(&mut self, _duration: f64) {}

    fn validate_buffer_and_reset(&mut self) -> TranslationOutput {
        (self.drain(), TranscriptBuffer::default())
    }

    fn process(&mut self) -> Result<TranslationOutput> {
        Ok((self.drain(), TranscriptBuffer::default()))
    }
}

/// Stub summarizer: counts lines per speaker.
pub struct StubSummarizer;

impl Summarizer for StubSummarizer {
    fn summarize(&self, lines: &[Line]) -> Result<SummaryReport> {
        let mut speakers: Vec<i32> = lines.iter().map(|l| l.speaker).collect();
        speakers.sort_unstable();
        speakers.dedup();

        let speaker_summaries = speakers
            .iter()
            .map(|&speaker| SpeakerSummary {
                speaker,
                summary: format!(
                    "{} line(s)",
                    lines.iter().filter(|l| l.speaker == speaker).count()
                ),
            })
            .collect();

        Ok(SummaryReport {
            summary: format!("{} line(s) across {} speaker(s)", lines.len(), speakers.len()),
            speaker_summaries,
        })
    }
}

struct StubAsrFactory;
struct StubDiarizerFactory;
struct StubTranslatorFactory;

impl AsrFactory for StubAsrFactory {
    fn online(&self, _config: &SessionConfig) -> Result<AsrHandle> {
        Ok(AsrHandle::new(StubAsr::new()))
    }
}

impl DiarizerFactory for StubDiarizerFactory {
    fn online(&self, _config: &SessionConfig) -> Result<DiarizerHandle> {
        Ok(DiarizerHandle::new(StubDiarizer::new(4.0)))
    }
}

impl TranslatorFactory for StubTranslatorFactory {
    fn online(&self, _config: &SessionConfig) -> Result<TranslatorHandle> {
        Ok(TranslatorHandle::new(StubTranslator::new()))
    }
}

/// A bundle wired entirely to stub providers. The VAD slot is left empty so
/// the engine falls back to [`crate::vad::energy::EnergyVad`].
pub fn stub_bundle() -> ModelBundle {
    ModelBundle {
        asr: Some(std::sync::Arc::new(StubAsrFactory)),
        diarization: Some(std::sync::Arc::new(StubDiarizerFactory)),
        translation: Some(std::sync::Arc::new(StubTranslatorFactory)),
        vad: None,
        summarizer: Some(std::sync::Arc::new(StubSummarizer)),
    }
}
