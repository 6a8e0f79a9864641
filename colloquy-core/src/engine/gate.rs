//! Ingress buffering and the voice-activity gate.
//!
//! PCM bytes accumulate in a rolling buffer; once at least one chunk
//! (`min_chunk_size` seconds) is available, a sample-aligned window of up to
//! five seconds is normalized, run through the VAD, and either forwarded as
//! active audio or converted into silence boundary events. Events and chunks
//! are enqueued on every downstream queue in the exact order they are
//! produced.
//!
//! Timestamps come from sample accounting (`total_samples`), never from the
//! wall clock, so silence durations and stream time stay consistent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::decode::{Decoder, DecoderState};
use crate::engine::queue::{AudioEvent, TokenEvent};
use crate::timed::Silence;
use crate::timeline::Timeline;
use crate::vad::VoiceActivityDetector;
use crate::SAMPLE_RATE;

pub const BYTES_PER_SAMPLE: usize = 2;
/// Largest window handed downstream in one pass.
const MAX_WINDOW_SECONDS: usize = 5;
/// Silences at least this long materialize into the committed stream.
pub const MIN_REAL_SILENCE: f64 = 5.0;
/// Floor for one dynamic decoder read.
const MIN_READ_BYTES: usize = 4096;

/// Convert s16le bytes to normalized f32 samples in [-1, 1].
pub fn pcm_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

pub struct VadGate {
    vad: Option<Box<dyn VoiceActivityDetector>>,
    transcription_tx: Option<mpsc::Sender<AudioEvent>>,
    diarization_tx: Option<mpsc::Sender<AudioEvent>>,
    translation_tx: Option<mpsc::Sender<TokenEvent>>,
    timeline: Arc<Timeline>,
    pcm: Vec<u8>,
    total_samples: u64,
    current_silence: Option<Silence>,
    started: bool,
    chunk_bytes: usize,
    max_window_bytes: usize,
}

impl VadGate {
    pub fn new(
        vad: Option<Box<dyn VoiceActivityDetector>>,
        transcription_tx: Option<mpsc::Sender<AudioEvent>>,
        diarization_tx: Option<mpsc::Sender<AudioEvent>>,
        translation_tx: Option<mpsc::Sender<TokenEvent>>,
        timeline: Arc<Timeline>,
        min_chunk_size: f64,
    ) -> Self {
        let samples_per_chunk = ((SAMPLE_RATE as f64 * min_chunk_size) as usize).max(1);
        // With a VAD the stream starts in silence; without one there is no
        // gating and every chunk is active.
        let current_silence = vad.as_ref().map(|_| Silence::starting(0.0));
        Self {
            vad,
            transcription_tx,
            diarization_tx,
            translation_tx,
            timeline,
            pcm: Vec::new(),
            total_samples: 0,
            current_silence,
            started: false,
            chunk_bytes: samples_per_chunk * BYTES_PER_SAMPLE,
            max_window_bytes: SAMPLE_RATE as usize * BYTES_PER_SAMPLE * MAX_WINDOW_SECONDS,
        }
    }

    fn consuming(&self) -> bool {
        self.transcription_tx.is_some() || self.diarization_tx.is_some()
    }

    fn stream_secs(&self, sample: u64) -> f64 {
        sample as f64 / SAMPLE_RATE as f64
    }

    pub async fn push_bytes(&mut self, bytes: &[u8]) {
        if !self.started {
            self.started = true;
            self.timeline
                .set_current_silence(self.current_silence.clone())
                .await;
        }
        self.pcm.extend_from_slice(bytes);
        self.process_ready().await;
    }

    async fn process_ready(&mut self) {
        while self.pcm.len() >= self.chunk_bytes {
            if self.pcm.len() > self.max_window_bytes {
                warn!(
                    buffered_secs = self.pcm.len() as f64
                        / (SAMPLE_RATE as usize * BYTES_PER_SAMPLE) as f64,
                    "audio backlog exceeds the processing window; models are not keeping up"
                );
            }

            let take = self.pcm.len().min(self.max_window_bytes);
            let aligned = (take / BYTES_PER_SAMPLE) * BYTES_PER_SAMPLE;
            if aligned == 0 {
                return;
            }
            let chunk = pcm_to_f32(&self.pcm[..aligned]);
            self.pcm.drain(..aligned);
            let chunk_start = self.total_samples;

            let transition = self.vad.as_mut().and_then(|v| v.process(&chunk));
            if let Some(t) = transition {
                if let Some(start) = t.start {
                    if self.current_silence.is_some() {
                        let at = self.stream_secs(start);
                        self.end_silence(at).await;
                    }
                }
                if let Some(end) = t.end {
                    if self.current_silence.is_none() {
                        // Forward the active prefix, then open the silence.
                        let rel = end.saturating_sub(chunk_start) as usize;
                        if rel > 0 {
                            let cut = rel.min(chunk.len());
                            self.enqueue_active(&chunk[..cut]).await;
                        }
                        self.begin_silence(self.stream_secs(end)).await;
                    }
                }
            }

            if self.current_silence.is_none() {
                self.enqueue_active(&chunk).await;
            }
            self.total_samples += chunk.len() as u64;

            if !self.consuming() {
                // Nothing downstream wants audio; yield instead of spinning.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    async fn begin_silence(&mut self, at: f64) {
        if self.current_silence.is_some() {
            return;
        }
        let silence = Silence::starting(at);
        debug!(at, "silence starting");
        self.current_silence = Some(silence.clone());
        self.timeline.set_current_silence(Some(silence.clone())).await;
        self.push_silence_event(silence).await;
    }

    async fn end_silence(&mut self, at: f64) {
        let Some(mut silence) = self.current_silence.take() else {
            return;
        };
        silence.close(at);
        let duration = silence.duration.unwrap_or(0.0);
        debug!(at, duration, "silence ended");
        if duration > MIN_REAL_SILENCE {
            self.timeline.push_silence(silence.clone()).await;
        }
        self.timeline.set_current_silence(None).await;
        self.push_silence_event(silence).await;
    }

    async fn push_silence_event(&self, silence: Silence) {
        if let Some(tx) = &self.transcription_tx {
            let _ = tx.send(AudioEvent::Silence(silence.clone())).await;
        }
        if let Some(tx) = &self.diarization_tx {
            let _ = tx.send(AudioEvent::Silence(silence.clone())).await;
        }
        if let Some(tx) = &self.translation_tx {
            let _ = tx.send(TokenEvent::Silence(silence)).await;
        }
    }

    /// Enqueue by value on each consuming stage; no cross-stage sharing.
    async fn enqueue_active(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        if let Some(tx) = &self.transcription_tx {
            let _ = tx.send(AudioEvent::Chunk(samples.to_vec())).await;
        }
        if let Some(tx) = &self.diarization_tx {
            let _ = tx.send(AudioEvent::Chunk(samples.to_vec())).await;
        }
    }

    /// Close the ingress: any open silence is ended at the current stream
    /// time so a long trailing silence still materializes. A sub-window tail
    /// of buffered bytes is dropped, matching the window contract.
    pub async fn finish(&mut self) {
        if !self.pcm.is_empty() {
            debug!(bytes = self.pcm.len(), "dropping sub-window ingress tail");
        }
        let now = self.stream_secs(self.total_samples);
        self.end_silence(now).await;
    }

    pub async fn send_end_of_stream(&self) {
        if let Some(tx) = &self.transcription_tx {
            let _ = tx.send(AudioEvent::EndOfStream).await;
        }
        if let Some(tx) = &self.diarization_tx {
            let _ = tx.send(AudioEvent::EndOfStream).await;
        }
        // Translation consumes committed tokens, so its sentinel must follow
        // the transcription worker's final handoff; that worker forwards it.
        // Only with transcription off does the gate close the queue directly.
        if self.transcription_tx.is_none() {
            if let Some(tx) = &self.translation_tx {
                let _ = tx.send(TokenEvent::EndOfStream).await;
            }
        }
    }
}

/// Ingress reader: pull decoded PCM from the decoder into the gate until the
/// pipe stops or fails, then flush the gate and propagate sentinels in order.
pub async fn run_ingress(decoder: Arc<Decoder>, mut gate: VadGate) {
    let mut last_read = Instant::now();
    loop {
        match decoder.state().await {
            DecoderState::Failed => {
                error!("decoder failed; ingress stopping");
                break;
            }
            DecoderState::Stopped => {
                info!("decoder stopped; ingress draining");
                // Consume whatever the pipe still holds before winding down.
                while let Some(bytes) = decoder.read(MIN_READ_BYTES).await {
                    if bytes.is_empty() {
                        break;
                    }
                    gate.push_bytes(&bytes).await;
                }
                break;
            }
            DecoderState::Starting | DecoderState::Restarting => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            DecoderState::Running => {}
        }

        // Size reads to elapsed wall time so a backlogged decoder is drained
        // in few large reads rather than many small ones.
        let elapsed = last_read.elapsed().as_secs_f64();
        let size = (((SAMPLE_RATE as usize * BYTES_PER_SAMPLE) as f64 * elapsed) as usize)
            .max(MIN_READ_BYTES);
        last_read = Instant::now();

        match decoder.read(size).await {
            Some(bytes) if !bytes.is_empty() => gate.push_bytes(&bytes).await,
            _ => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }

    gate.finish().await;
    gate.send_end_of_stream().await;
    info!("ingress finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::VadTransition;

    /// VAD scripted with absolute-sample transition points.
    struct ScriptedVad {
        transitions: Vec<(u64, bool)>, // (sample, is_start)
        consumed: u64,
    }

    impl ScriptedVad {
        fn new(transitions: Vec<(u64, bool)>) -> Self {
            Self {
                transitions,
                consumed: 0,
            }
        }
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

    fn pcm_bytes(samples: usize, value: i16) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples * 2);
        for _ in 0..samples {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    fn gate_with(
        vad: Box<dyn VoiceActivityDetector>,
        timeline: Arc<Timeline>,
    ) -> (
        VadGate,
        mpsc::Receiver<AudioEvent>,
        mpsc::Receiver<AudioEvent>,
    ) {
        let (ttx, trx) = mpsc::channel(64);
        let (dtx, drx) = mpsc::channel(64);
        let gate = VadGate::new(
            Some(vad),
            Some(ttx),
            Some(dtx),
            None,
            timeline,
            1.0,
        );
        (gate, trx, drx)
    }

    #[tokio::test]
    async fn speech_onset_ends_initial_silence_before_audio() {
        let timeline = Arc::new(Timeline::new());
        let vad = Box::new(ScriptedVad::new(vec![(1600, true)]));
        let (mut gate, mut trx, _drx) = gate_with(vad, timeline);

        gate.push_bytes(&pcm_bytes(16_000, 1000)).await;

        let first = trx.try_recv().expect("silence-ended event expected");
        let AudioEvent::Silence(s) = first else {
            panic!("expected silence event first, got {first:?}");
        };
        assert_eq!(s.phase, crate::timed::SilencePhase::Ended);
        assert!((s.end.unwrap() - 0.1).abs() < 1e-9);

        let second = trx.try_recv().expect("active chunk expected");
        let AudioEvent::Chunk(samples) = second else {
            panic!("expected chunk after silence end");
        };
        assert_eq!(samples.len(), 16_000);
    }

    #[tokio::test]
    async fn speech_end_slices_chunk_and_opens_silence() {
        let timeline = Arc::new(Timeline::new());
        // Speech from the start of audio; ends at sample 8000 of the second
        // window.
        let vad = Box::new(ScriptedVad::new(vec![(0, true), (24_000, false)]));
        let (mut gate, mut trx, _drx) = gate_with(vad, timeline);

        gate.push_bytes(&pcm_bytes(16_000, 1000)).await;
        let _ = trx.try_recv().expect("silence end"); // initial silence ends at 0
        let AudioEvent::Chunk(full) = trx.try_recv().expect("first chunk") else {
            panic!("chunk expected");
        };
        assert_eq!(full.len(), 16_000);

        gate.push_bytes(&pcm_bytes(16_000, 1000)).await;
        let AudioEvent::Chunk(prefix) = trx.try_recv().expect("sliced prefix") else {
            panic!("prefix chunk expected");
        };
        assert_eq!(prefix.len(), 8_000);
        let AudioEvent::Silence(s) = trx.try_recv().expect("silence start") else {
            panic!("silence start expected");
        };
        assert_eq!(s.phase, crate::timed::SilencePhase::Starting);
        assert!((s.start - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn both_queues_observe_the_same_sequence() {
        let timeline = Arc::new(Timeline::new());
        let vad = Box::new(ScriptedVad::new(vec![(0, true), (24_000, false)]));
        let (mut gate, mut trx, mut drx) = gate_with(vad, timeline);

        gate.push_bytes(&pcm_bytes(32_000, 500)).await;
        gate.finish().await;
        gate.send_end_of_stream().await;
        drop(gate);

        let mut t_events = Vec::new();
        while let Some(e) = trx.recv().await {
            t_events.push(e);
        }
        let mut d_events = Vec::new();
        while let Some(e) = drx.recv().await {
            d_events.push(e);
        }
        assert_eq!(t_events, d_events);
        assert!(matches!(t_events.last(), Some(AudioEvent::EndOfStream)));
    }

    #[tokio::test]
    async fn long_trailing_silence_materializes_on_finish() {
        let timeline = Arc::new(Timeline::new());
        // VAD never fires: the whole stream stays inside the initial silence.
        let vad = Box::new(ScriptedVad::new(vec![]));
        let (mut gate, _trx, _drx) = gate_with(vad, Arc::clone(&timeline));

        gate.push_bytes(&pcm_bytes(16_000 * 10, 0)).await;
        gate.finish().await;

        let pickup = timeline.pickup().await;
        assert_eq!(pickup.entries.len(), 1);
        let crate::timed::TimelineEntry::Silence(s) = &pickup.entries[0] else {
            panic!("silence placeholder expected");
        };
        assert!(s.duration.unwrap() >= 10.0 - 1e-9);
        assert!(pickup.current_silence.is_none());
    }

    #[tokio::test]
    async fn silence_accounting_matches_total_audio() {
        let timeline = Arc::new(Timeline::new());
        let vad = Box::new(ScriptedVad::new(vec![
            (16_000, true),
            (48_000, false),
        ]));
        let (mut gate, mut trx, _drx) = gate_with(vad, Arc::clone(&timeline));

        for _ in 0..5 {
            gate.push_bytes(&pcm_bytes(16_000, 200)).await;
        }
        gate.finish().await;
        gate.send_end_of_stream().await;
        drop(gate);

        let mut active = 0.0f64;
        let mut silences = Vec::new();
        while let Some(e) = trx.recv().await {
            match e {
                AudioEvent::Chunk(c) => active += c.len() as f64 / SAMPLE_RATE as f64,
                AudioEvent::Silence(s) => {
                    if let Some(d) = s.duration {
                        silences.push(d);
                    }
                }
                _ => {}
            }
        }
        let silent: f64 = silences.iter().sum();
        // 1 s initial silence + 2 s speech + 2 s trailing silence = 5 s total.
        assert!(
            (active + silent - 5.0).abs() < 1e-6,
            "active={active} silent={silent}"
        );
    }
}
