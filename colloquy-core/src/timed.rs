//! Timed value types shared across the pipeline stages.
//!
//! All times are in seconds of *stream time* — audio consumed since session
//! start — never wall-clock.

/// Speaker id meaning "not yet attributed".
pub const SPEAKER_UNKNOWN: i32 = -1;
/// Speaker id attributed to silence.
pub const SPEAKER_SILENCE: i32 = -2;

/// A committed recognition unit.
///
/// Immutable once committed, except for the speaker label attached by the
/// formatter's alignment pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    pub start: f64,
    pub end: f64,
    pub probability: Option<f32>,
}

impl Token {
    pub fn new(text: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            text: text.into(),
            start,
            end,
            probability: None,
        }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// The current unstable tail of transcription. Freely replaced by the
/// transcription worker; never persisted until committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptBuffer {
    pub text: String,
    pub start: Option<f64>,
    pub end: Option<f64>,
}

/// Which side of a silence boundary an event marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilencePhase {
    Starting,
    Ended,
}

/// A silence boundary event. Carries its duration once the silence has ended.
#[derive(Debug, Clone, PartialEq)]
pub struct Silence {
    pub phase: SilencePhase,
    pub start: f64,
    pub end: Option<f64>,
    pub duration: Option<f64>,
}

impl Silence {
    pub fn starting(start: f64) -> Self {
        Self {
            phase: SilencePhase::Starting,
            start,
            end: None,
            duration: None,
        }
    }

    /// Close the silence at `end`, computing its duration.
    pub fn close(&mut self, end: f64) {
        self.phase = SilencePhase::Ended;
        self.end = Some(end);
        self.duration = Some((end - self.start).max(0.0));
    }
}

/// A time range attributing audio to one speaker. Segments for a given
/// speaker never overlap; [`SPEAKER_SILENCE`] marks quiet spans.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeakerSegment {
    pub speaker: i32,
    pub start: f64,
    pub end: f64,
}

/// Mirror of [`Token`] with translated text, keeping the source time range.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedToken {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// Control notification fed back from the formatter into the transcription
/// and translation queues when the attributed speaker turns over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeakerChange {
    pub speaker: i32,
    pub at: f64,
}

/// Entry in the committed stream: a token, or a long silence materialized as
/// a typed placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    Token(Token),
    Silence(Silence),
}
