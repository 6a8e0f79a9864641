//! Client-facing frames and control messages.
//!
//! A session's outbound stream is: one `config` control message, then Frames
//! whenever the formatter sees a change, then `ready_to_stop` (optionally
//! preceded by one `summary` frame).

use serde::{Deserialize, Serialize};

/// Frame status, mirroring the client protocol strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    ActiveTranscription,
    NoAudioDetected,
    Error,
    Summary,
}

/// A run of contiguous same-speaker tokens, or a silence placeholder
/// (`speaker == -2`, empty text).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub speaker: i32,
    pub start: f64,
    pub end: f64,
    pub text: String,
    /// Translated text covering this line's time range; empty when
    /// translation is off.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub translation: String,
}

/// Post-session summary produced by the summarization collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryReport {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub speaker_summaries: Vec<SpeakerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerSummary {
    pub speaker: i32,
    pub summary: String,
}

/// One view of the session, emitted only when it differs from the previous
/// one. An `error` frame replaces lines and buffers for that frame only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub status: FrameStatus,
    pub lines: Vec<Line>,
    pub buffer_transcription: String,
    pub buffer_diarization: String,
    pub buffer_translation: String,
    pub remaining_time_transcription: f64,
    pub remaining_time_diarization: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SummaryReport>,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            status: FrameStatus::NoAudioDetected,
            lines: Vec::new(),
            buffer_transcription: String::new(),
            buffer_diarization: String::new(),
            buffer_translation: String::new(),
            remaining_time_transcription: 0.0,
            remaining_time_diarization: 0.0,
            error: None,
            summary: None,
        }
    }
}

impl Frame {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: FrameStatus::Error,
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Session-level control messages, `type`-tagged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Config {
        #[serde(rename = "useAudioWorklet")]
        use_audio_worklet: bool,
    },
    ReadyToStop,
}

/// Everything the engine can emit on the client channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Control(ControlMessage),
    Frame(Frame),
}
