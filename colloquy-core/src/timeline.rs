//! Authoritative per-session state, guarded by an async lock.
//!
//! The timeline is the only shared-mutable resource between the stage tasks.
//! Workers mutate it under the lock; the formatter drains the `new_*` queues
//! with [`Timeline::pickup`] once per tick.

use std::sync::OnceLock;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::debug;

use crate::timed::{
    Silence, SpeakerSegment, TimelineEntry, Token, TranscriptBuffer, TranslatedToken,
};

/// Mutable session state. See the field docs for ownership: every field is
/// written by exactly one stage.
#[derive(Debug, Default)]
pub struct TimelineState {
    /// Committed tokens, append-only, non-decreasing end times.
    pub tokens: Vec<Token>,
    /// Committed entries (tokens and materialized silences) not yet picked up
    /// by the formatter.
    pub new_entries: Vec<TimelineEntry>,
    /// Unstable recognition tail; replaced wholesale by the transcription worker.
    pub buffer_transcription: TranscriptBuffer,
    /// Replaced wholesale on every diarization pass.
    pub diarization_segments: Vec<SpeakerSegment>,
    /// Committed translations not yet picked up by the formatter.
    pub new_translations: Vec<TranslatedToken>,
    /// Unstable translation tail.
    pub buffer_translation: TranscriptBuffer,
    /// Largest stream time transcription has produced something for.
    pub end_buffer: f64,
    /// Largest stream time covered by diarization.
    pub end_attributed_speaker: f64,
    /// Silence currently open at the ingress, if any.
    pub current_silence: Option<Silence>,
}

/// Formatter-side snapshot: drained queues plus cloned derived state.
#[derive(Debug, Default)]
pub struct TimelinePickup {
    pub entries: Vec<TimelineEntry>,
    pub segments: Vec<SpeakerSegment>,
    pub translations: Vec<TranslatedToken>,
    pub buffer_transcription: TranscriptBuffer,
    pub buffer_translation: TranscriptBuffer,
    pub end_attributed_speaker: f64,
    pub current_silence: Option<Silence>,
    /// Wall-clock seconds transcription is behind the stream, to one decimal.
    pub lag_transcription: f64,
    /// Stream seconds diarization is behind the last committed token, to one
    /// decimal.
    pub lag_diarization: f64,
}

pub struct Timeline {
    state: Mutex<TimelineState>,
    started: OnceLock<Instant>,
}

impl Timeline {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TimelineState::default()),
            started: OnceLock::new(),
        }
    }

    /// Record the session start instant. First call wins.
    pub fn mark_started(&self) {
        let _ = self.started.set(Instant::now());
    }

    /// Wall-clock seconds since the first audio arrived (0 before that).
    pub fn session_elapsed(&self) -> f64 {
        self.started
            .get()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Atomic watermark update for the transcription worker: append the new
    /// tokens, replace the unstable tail, and advance `end_buffer`.
    ///
    /// Duplicate tokens (same `(start, end, text)` as the previously committed
    /// one) are dropped so emission stays idempotent. Returns the tokens that
    /// were actually committed, for the translation handoff.
    pub async fn commit_transcription(
        &self,
        new_tokens: Vec<Token>,
        buffer: TranscriptBuffer,
        processed_up_to: f64,
    ) -> Vec<Token> {
        let mut state = self.state.lock().await;
        let mut committed = Vec::with_capacity(new_tokens.len());
        for token in new_tokens {
            if let Some(last) = state.tokens.last() {
                if last.start == token.start && last.end == token.end && last.text == token.text {
                    debug!(text = %token.text, "dropping duplicate token");
                    continue;
                }
            }
            state.tokens.push(token.clone());
            state.new_entries.push(TimelineEntry::Token(token.clone()));
            committed.push(token);
        }

        let mut end_buffer = state.end_buffer.max(processed_up_to);
        if let Some(last) = committed.last() {
            end_buffer = end_buffer.max(last.end);
        }
        if let Some(end) = buffer.end {
            end_buffer = end_buffer.max(end);
        }
        state.end_buffer = end_buffer;
        state.buffer_transcription = buffer;
        committed
    }

    /// Replace the diarization view and bump its watermark.
    pub async fn apply_diarization(&self, segments: Vec<SpeakerSegment>) {
        let mut state = self.state.lock().await;
        let max_end = segments.iter().fold(0.0f64, |acc, s| acc.max(s.end));
        state.end_attributed_speaker = state.end_attributed_speaker.max(max_end);
        state.diarization_segments = segments;
    }

    pub async fn apply_translation(
        &self,
        committed: Vec<TranslatedToken>,
        buffer: TranscriptBuffer,
    ) {
        let mut state = self.state.lock().await;
        state.new_translations.extend(committed);
        state.buffer_translation = buffer;
    }

    /// Materialize a long silence into the committed stream.
    pub async fn push_silence(&self, silence: Silence) {
        let mut state = self.state.lock().await;
        state.new_entries.push(TimelineEntry::Silence(silence));
    }

    pub async fn set_current_silence(&self, silence: Option<Silence>) {
        self.state.lock().await.current_silence = silence;
    }

    /// End time of the last committed token (0 when none).
    pub async fn last_token_end(&self) -> f64 {
        self.state
            .lock()
            .await
            .tokens
            .last()
            .map(|t| t.end)
            .unwrap_or(0.0)
    }

    /// Drain the formatter-facing queues and snapshot the derived watermarks.
    pub async fn pickup(&self) -> TimelinePickup {
        let mut state = self.state.lock().await;

        let lag_transcription = if state.end_buffer > 0.0 {
            round1((self.session_elapsed() - state.end_buffer).max(0.0))
        } else {
            0.0
        };
        let lag_diarization = if let Some(last) = state.tokens.last() {
            round1((last.end - state.end_attributed_speaker).max(0.0))
        } else {
            0.0
        };

        TimelinePickup {
            entries: std::mem::take(&mut state.new_entries),
            segments: state.diarization_segments.clone(),
            translations: std::mem::take(&mut state.new_translations),
            buffer_transcription: state.buffer_transcription.clone(),
            buffer_translation: state.buffer_translation.clone(),
            end_attributed_speaker: state.end_attributed_speaker,
            current_silence: state.current_silence.clone(),
            lag_transcription,
            lag_diarization,
        }
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
