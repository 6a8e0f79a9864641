//! End-to-end session scenarios driven through the public engine surface
//! with scripted providers: a VAD with fixed transition points, an ASR with
//! a fixed token script, and a diarizer with a fixed segment map.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;

use colloquy_core::engine::SessionPhase;
use colloquy_core::error::Result;
use colloquy_core::inference::stub::StubTranslator;
use colloquy_core::inference::{
    AsrFactory, AsrHandle, AsrOutput, DiarizerFactory, DiarizerHandle, ModelBundle, StreamingAsr,
    TranslatorFactory, TranslatorHandle, VadFactory,
};
use colloquy_core::timed::{SpeakerChange, SPEAKER_SILENCE};
use colloquy_core::vad::{VadTransition, VoiceActivityDetector};
use colloquy_core::{
    ControlMessage, Diarizer, Frame, FrameStatus, OutboundMessage, SessionConfig, SessionEngine,
    SpeakerSegment, Token, TranscriptBuffer, SAMPLE_RATE,
};

// ---------------------------------------------------------------------------
// Scripted providers
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct ScriptedVad {
    transitions: Vec<(u64, bool)>, // (absolute sample, is_start)
    consumed: u64,
}

impl VoiceActivityDetector for ScriptedVad {
    fn process(&mut self, samples: &[f32]) -> Option<VadTransition> {
        let window = self.consumed..self.consumed + samples.len() as u64;
        self.consumed = window.end;
        let mut t = VadTransition::default();
        for &(at, is_start) in &self.transitions {
            if window.contains(&at) {
                if is_start {
                    t.start = Some(at);
                } else {
                    t.end = Some(at);
                }
            }
        }
        if t.start.is_none() && t.end.is_none() {
            None
        } else {
            Some(t)
        }
    }

    fn reset(&mut self) {}
}

struct ScriptedVadFactory {
    transitions: Vec<(u64, bool)>,
}

impl VadFactory for ScriptedVadFactory {
    fn online(&self) -> Box<dyn VoiceActivityDetector> {
        Box::new(ScriptedVad {
            transitions: self.transitions.clone(),
            consumed: 0,
        })
    }
}

/// Emits a fixed token script as soon as stream time covers each token.
#[derive(Clone)]
struct ScriptedAsr {
    tokens: Vec<Token>,
    emitted: usize,
    stream_end: f64,
}

impl ScriptedAsr {
    fn flush_covered(&mut self) -> Vec<Token> {
        let mut out = Vec::new();
        while self.emitted < self.tokens.len()
            && self.tokens[self.emitted].end <= self.stream_end + 1e-6
        {
            out.push(self.tokens[self.emitted].clone());
            self.emitted += 1;
        }
        out
    }
}

impl StreamingAsr for ScriptedAsr {
    fn insert_audio_chunk(&mut self, _pcm: &[f32], stream_time_end: f64) {
        self.stream_end = self.stream_end.max(stream_time_end);
    }

    fn process_iter(&mut self) -> Result<AsrOutput> {
        Ok((self.flush_covered(), self.stream_end))
    }

    fn start_silence(&mut self) -> Result<AsrOutput> {
        Ok((self.flush_covered(), self.stream_end))
    }

    fn end_silence(&mut self, duration: f64, _last_token_end: f64) {
        self.stream_end += duration;
    }

    fn buffer(&self) -> TranscriptBuffer {
        TranscriptBuffer::default()
    }

    fn new_speaker(&mut self, _change: &SpeakerChange, _flush_context: bool) {}
}

struct ScriptedAsrFactory {
    tokens: Vec<Token>,
}

impl AsrFactory for ScriptedAsrFactory {
    fn online(&self, _config: &SessionConfig) -> Result<AsrHandle> {
        Ok(AsrHandle::new(ScriptedAsr {
            tokens: self.tokens.clone(),
            emitted: 0,
            stream_end: 0.0,
        }))
    }
}

/// Always returns the same segment map.
struct FixedDiarizer {
    segments: Vec<SpeakerSegment>,
}

impl Diarizer for FixedDiarizer {
    fn insert_audio_chunk(&mut self, _pcm: &[f32]) {}
    fn insert_silence(&mut self, _duration: f64) {}
    fn diarize(&mut self) -> Result<Vec<SpeakerSegment>> {
        Ok(self.segments.clone())
    }
    fn close(&mut self) {}
}

struct FixedDiarizerFactory {
    segments: Vec<SpeakerSegment>,
}

impl DiarizerFactory for FixedDiarizerFactory {
    fn online(&self, _config: &SessionConfig) -> Result<DiarizerHandle> {
        Ok(DiarizerHandle::new(FixedDiarizer {
            segments: self.segments.clone(),
        }))
    }
}

struct StubTranslatorFactory;

impl TranslatorFactory for StubTranslatorFactory {
    fn online(&self, _config: &SessionConfig) -> Result<TranslatorHandle> {
        Ok(TranslatorHandle::new(StubTranslator::new()))
    }
}

fn bundle(
    tokens: Vec<Token>,
    transitions: Vec<(u64, bool)>,
    segments: Option<Vec<SpeakerSegment>>,
) -> ModelBundle {
    ModelBundle {
        asr: Some(Arc::new(ScriptedAsrFactory { tokens })),
        diarization: segments.map(|segments| {
            Arc::new(FixedDiarizerFactory { segments }) as Arc<dyn DiarizerFactory>
        }),
        translation: Some(Arc::new(StubTranslatorFactory)),
        vad: Some(Arc::new(ScriptedVadFactory { transitions })),
        summarizer: None,
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn pcm_silence(seconds: f64) -> Vec<u8> {
    vec![0u8; (seconds * SAMPLE_RATE as f64) as usize * 2]
}

async fn recv_message(
    rx: &mut mpsc::Receiver<OutboundMessage>,
    wait: Duration,
) -> OutboundMessage {
    timeout(wait, rx.recv())
        .await
        .expect("timed out waiting for outbound message")
        .expect("outbound channel closed unexpectedly")
}

/// Wait for a frame satisfying `predicate`, collecting everything seen.
async fn wait_for_frame(
    rx: &mut mpsc::Receiver<OutboundMessage>,
    wait: Duration,
    mut predicate: impl FnMut(&Frame) -> bool,
) -> (Frame, Vec<OutboundMessage>) {
    let deadline = Instant::now() + wait;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("timed out waiting for matching frame");
        let message = recv_message(rx, remaining).await;
        seen.push(message.clone());
        if let OutboundMessage::Frame(frame) = &message {
            if predicate(frame) {
                return (frame.clone(), seen);
            }
        }
    }
}

/// Collect every message until `ready_to_stop` (inclusive).
async fn collect_until_ready(
    rx: &mut mpsc::Receiver<OutboundMessage>,
    wait: Duration,
) -> Vec<OutboundMessage> {
    let deadline = Instant::now() + wait;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("timed out waiting for ready_to_stop");
        let message = recv_message(rx, remaining).await;
        seen.push(message.clone());
        if matches!(message, OutboundMessage::Control(ControlMessage::ReadyToStop)) {
            return seen;
        }
    }
}

fn frames_of(messages: &[OutboundMessage]) -> Vec<&Frame> {
    messages
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::Frame(f) => Some(f),
            _ => None,
        })
        .collect()
}

fn speech_lines(frame: &Frame) -> Vec<&colloquy_core::Line> {
    frame
        .lines
        .iter()
        .filter(|l| l.speaker != SPEAKER_SILENCE)
        .collect()
}

fn assert_frame_times_monotone(frame: &Frame) {
    let mut last = f64::NEG_INFINITY;
    for line in &frame.lines {
        assert!(
            line.start >= last - 1e-9,
            "line starts must be non-decreasing: {:?}",
            frame.lines
        );
        assert!(line.end >= line.start - 1e-9);
        last = line.start;
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Scenario 1: PCM passthrough with VAD transitions at samples 1600/40000.
#[tokio::test]
async fn pcm_passthrough_produces_bounded_lines_and_terminal() {
    let tokens = vec![Token::new("hello", 0.2, 1.2), Token::new("world", 1.3, 2.4)];
    let bundle = bundle(tokens, vec![(1600, true), (40_000, false)], None);
    let config = SessionConfig {
        pcm_input: true,
        ..SessionConfig::default()
    };
    let mut engine = SessionEngine::new(config, &bundle).unwrap();
    let mut rx = engine.start().await.unwrap();

    assert!(matches!(
        recv_message(&mut rx, Duration::from_secs(1)).await,
        OutboundMessage::Control(ControlMessage::Config {
            use_audio_worklet: true
        })
    ));

    engine.process_audio(&pcm_silence(3.0)).await;

    let (frame, _) = wait_for_frame(&mut rx, Duration::from_secs(5), |f| {
        !speech_lines(f).is_empty()
    })
    .await;
    let lines = speech_lines(&frame);
    assert!(lines.first().unwrap().start >= 0.1);
    assert!(lines.last().unwrap().end <= 2.5);
    assert_frame_times_monotone(&frame);

    engine.process_audio(&[]).await;
    let tail = collect_until_ready(&mut rx, Duration::from_secs(5)).await;
    assert!(matches!(
        tail.last(),
        Some(OutboundMessage::Control(ControlMessage::ReadyToStop))
    ));
    assert_eq!(engine.phase(), SessionPhase::Done);
    engine.shutdown().await;
}

/// Scenario 2: two speakers with a short silence in between yield two lines
/// with distinct speaker ids, separated by the silence gap.
#[tokio::test]
async fn two_speakers_form_two_lines_with_a_gap() {
    let tokens = vec![Token::new("alpha", 0.5, 3.5), Token::new("beta", 5.5, 9.5)];
    let transitions = vec![
        (8_000, true),    // 0.5 s
        (56_000, false),  // 3.5 s
        (88_000, true),   // 5.5 s
        (152_000, false), // 9.5 s
    ];
    let segments = vec![
        SpeakerSegment {
            speaker: 0,
            start: 0.0,
            end: 4.0,
        },
        SpeakerSegment {
            speaker: 1,
            start: 5.0,
            end: 10.0,
        },
    ];
    let bundle = bundle(tokens, transitions, Some(segments));
    let config = SessionConfig {
        pcm_input: true,
        diarization: true,
        ..SessionConfig::default()
    };
    let mut engine = SessionEngine::new(config, &bundle).unwrap();
    let mut rx = engine.start().await.unwrap();

    engine.process_audio(&pcm_silence(10.0)).await;
    engine.process_audio(&[]).await;

    let messages = collect_until_ready(&mut rx, Duration::from_secs(10)).await;
    let frames = frames_of(&messages);
    let last = frames.last().expect("at least one frame");

    let lines = speech_lines(last);
    assert_eq!(lines.len(), 2, "lines: {:?}", last.lines);
    assert_eq!(lines[0].speaker, 0);
    assert_eq!(lines[1].speaker, 1);
    assert!(
        lines[1].start - lines[0].end >= 1.0,
        "speaker turn should leave the silence gap visible"
    );

    // Monotone commit: earlier frames' speech text is a prefix of later ones'.
    let mut previous = String::new();
    for frame in &frames {
        if frame.status != FrameStatus::ActiveTranscription {
            continue;
        }
        assert_frame_times_monotone(frame);
        let joined = speech_lines(frame)
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert!(
            joined.starts_with(&previous),
            "client view must be append-only: {previous:?} → {joined:?}"
        );
        previous = joined;
    }
    engine.shutdown().await;
}

/// Scenario 3: client disconnect mid-stream — shutdown cancels everything
/// within a second and no frames follow.
#[tokio::test]
async fn client_disconnect_cancels_within_one_second() {
    let tokens = vec![Token::new("cut", 0.2, 1.0)];
    let bundle = bundle(tokens, vec![(1_600, true)], None);
    let config = SessionConfig {
        pcm_input: true,
        ..SessionConfig::default()
    };
    let mut engine = SessionEngine::new(config, &bundle).unwrap();
    let mut rx = engine.start().await.unwrap();

    engine.process_audio(&pcm_silence(2.0)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let begun = Instant::now();
    engine.shutdown().await;
    assert!(begun.elapsed() < Duration::from_secs(1));
    assert_eq!(engine.phase(), SessionPhase::Done);

    // Drain whatever was in flight; nothing new may arrive afterwards.
    while rx.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(200)).await;
    let trailing: Vec<OutboundMessage> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert!(
        !trailing
            .iter()
            .any(|m| matches!(m, OutboundMessage::Control(ControlMessage::ReadyToStop))),
        "no terminal after a hard disconnect"
    );
    assert!(trailing.is_empty(), "no frames after cancellation: {trailing:?}");
}

/// Scenario 4: container mode without the external decoder — a single error
/// frame and no terminal.
#[tokio::test]
async fn missing_decoder_yields_single_error_frame() {
    let bundle = bundle(vec![], vec![], None);
    let config = SessionConfig {
        pcm_input: false,
        decoder_command: "colloquy-missing-decoder-binary".into(),
        ..SessionConfig::default()
    };
    let mut engine = SessionEngine::new(config, &bundle).unwrap();
    let mut rx = engine.start().await.unwrap();

    let _config = recv_message(&mut rx, Duration::from_secs(1)).await;
    let OutboundMessage::Frame(frame) = recv_message(&mut rx, Duration::from_secs(1)).await else {
        panic!("error frame expected");
    };
    assert_eq!(frame.status, FrameStatus::Error);
    assert!(frame
        .error
        .as_deref()
        .unwrap_or_default()
        .starts_with("decoder error"));

    // No pipeline is running, so nothing else arrives — in particular no
    // ready_to_stop.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
    engine.shutdown().await;
}

/// Scenario 5: silence-only input — zero committed tokens, a materialized
/// silence placeholder, and a final `no_audio_detected` status.
#[tokio::test]
async fn silence_only_input_reports_no_audio_with_placeholder() {
    let bundle = bundle(vec![], vec![], None); // VAD never fires
    let config = SessionConfig {
        pcm_input: true,
        ..SessionConfig::default()
    };
    let mut engine = SessionEngine::new(config, &bundle).unwrap();
    let mut rx = engine.start().await.unwrap();

    engine.process_audio(&pcm_silence(10.0)).await;
    engine.process_audio(&[]).await;

    let messages = collect_until_ready(&mut rx, Duration::from_secs(10)).await;
    let frames = frames_of(&messages);
    let last = frames.last().expect("at least one frame");

    assert_eq!(last.status, FrameStatus::NoAudioDetected);
    assert!(speech_lines(last).is_empty(), "no committed tokens expected");
    let placeholder = last
        .lines
        .iter()
        .find(|l| l.speaker == SPEAKER_SILENCE)
        .expect("silence placeholder expected");
    assert!(placeholder.end - placeholder.start >= 5.0);
    engine.shutdown().await;
}

/// Scenario 6: translation enabled — every committed token has a translated
/// counterpart with an overlapping time range.
#[tokio::test]
async fn translation_covers_every_committed_token() {
    let tokens = vec![Token::new("uno", 0.3, 2.0), Token::new("dos", 2.1, 4.5)];
    let bundle = bundle(tokens.clone(), vec![(1_600, true), (76_800, false)], None);
    let config = SessionConfig {
        pcm_input: true,
        target_language: "en".into(),
        source_language: "es".into(),
        ..SessionConfig::default()
    };
    let mut engine = SessionEngine::new(config, &bundle).unwrap();
    let mut rx = engine.start().await.unwrap();

    engine.process_audio(&pcm_silence(5.0)).await;
    engine.process_audio(&[]).await;

    let messages = collect_until_ready(&mut rx, Duration::from_secs(10)).await;
    let frames = frames_of(&messages);
    let last = frames.last().expect("at least one frame");
    let lines = speech_lines(last);
    assert!(!lines.is_empty());
    for token in &tokens {
        let covered = lines.iter().any(|l| {
            l.start <= token.end && token.start <= l.end && l.translation.contains(&token.text)
        });
        assert!(covered, "token {token:?} lacks a translated counterpart in {lines:?}");
    }
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------------

/// EOF without any audio: one `no_audio_detected` frame, then the terminal.
#[tokio::test]
async fn drain_without_audio_emits_no_audio_then_ready() {
    let bundle = bundle(vec![], vec![], None);
    let config = SessionConfig {
        pcm_input: true,
        ..SessionConfig::default()
    };
    let mut engine = SessionEngine::new(config, &bundle).unwrap();
    let mut rx = engine.start().await.unwrap();

    engine.process_audio(&[]).await;
    let messages = collect_until_ready(&mut rx, Duration::from_secs(5)).await;

    let frames = frames_of(&messages);
    assert_eq!(frames.len(), 1, "a single status frame: {messages:?}");
    assert_eq!(frames[0].status, FrameStatus::NoAudioDetected);
    assert!(matches!(
        messages.last(),
        Some(OutboundMessage::Control(ControlMessage::ReadyToStop))
    ));
    engine.shutdown().await;
}

/// Idempotent emission: an unchanged timeline never re-emits a frame.
#[tokio::test]
async fn unchanged_timeline_emits_no_duplicate_frames() {
    let tokens = vec![Token::new("once", 0.2, 1.0)];
    let bundle = bundle(tokens, vec![(1_600, true), (24_000, false)], None);
    let config = SessionConfig {
        pcm_input: true,
        ..SessionConfig::default()
    };
    let mut engine = SessionEngine::new(config, &bundle).unwrap();
    let mut rx = engine.start().await.unwrap();

    engine.process_audio(&pcm_silence(2.0)).await;
    let (settled, _) = wait_for_frame(&mut rx, Duration::from_secs(5), |f| {
        !speech_lines(f).is_empty()
    })
    .await;

    // Several formatter ticks with nothing new: content must not change, and
    // identical frames must not be re-sent (only a lag-watermark move may
    // produce another frame at all).
    tokio::time::sleep(Duration::from_millis(400)).await;
    let mut extra = Vec::new();
    while let Ok(m) = rx.try_recv() {
        extra.push(m);
    }
    let mut last_seen = settled.clone();
    for frame in frames_of(&extra) {
        assert_ne!(*frame, last_seen, "identical frame re-emitted");
        assert_eq!(frame.lines, settled.lines, "idle timeline changed content");
        assert_eq!(frame.buffer_transcription, settled.buffer_transcription);
        last_seen = frame.clone();
    }

    engine.process_audio(&[]).await;
    let _ = collect_until_ready(&mut rx, Duration::from_secs(5)).await;
    engine.shutdown().await;
}
