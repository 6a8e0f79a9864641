//! Transcription worker.
//!
//! Consumes active audio and silence events, drives the online ASR
//! processor, and commits tokens plus the unstable tail to the timeline
//! under its lock. Committed tokens are handed to the translation queue
//! immediately, in order.
//!
//! Item failures are logged and dropped; the worker only exits on the
//! end-of-stream sentinel, forwarding sentinels downstream when the session
//! is draining.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::queue::{self, AudioEvent, TokenEvent};
use crate::error::{EngineError, Result};
use crate::inference::AsrHandle;
use crate::timed::{SilencePhase, Token};
use crate::timeline::Timeline;
use crate::SAMPLE_RATE;

pub struct TranscriptionWorker {
    pub rx: mpsc::Receiver<AudioEvent>,
    pub asr: AsrHandle,
    pub timeline: Arc<Timeline>,
    pub translation_tx: Option<mpsc::Sender<TokenEvent>>,
    pub diarization_tx: Option<mpsc::Sender<AudioEvent>>,
    pub stopping: Arc<AtomicBool>,
    pub separator: String,
    pub flush_on_speaker_change: bool,
}

impl TranscriptionWorker {
    pub async fn run(mut self) {
        let mut stream_time = 0.0f64;

        'outer: loop {
            let batch = queue::next_audio_batch(&mut self.rx).await;
            for event in batch {
                match event {
                    AudioEvent::EndOfStream => {
                        debug!("transcription worker received sentinel");
                        break 'outer;
                    }
                    AudioEvent::SpeakerChange(change) => {
                        self.asr
                            .0
                            .lock()
                            .new_speaker(&change, self.flush_on_speaker_change);
                    }
                    event => {
                        if let Err(e) = self.handle(event, &mut stream_time).await {
                            warn!(error = %e, "transcription item failed; dropping");
                        }
                    }
                }
            }
        }

        if self.stopping.load(Ordering::SeqCst) {
            if let Some(tx) = &self.diarization_tx {
                let _ = tx.send(AudioEvent::EndOfStream).await;
            }
            if let Some(tx) = &self.translation_tx {
                let _ = tx.send(TokenEvent::EndOfStream).await;
            }
        }
        info!("transcription worker finished");
    }

    async fn handle(&mut self, event: AudioEvent, stream_time: &mut f64) -> Result<()> {
        let mut new_tokens: Vec<Token> = Vec::new();
        let mut processed_up_to = 0.0f64;

        match event {
            AudioEvent::Chunk(samples) => {
                *stream_time += samples.len() as f64 / SAMPLE_RATE as f64;
                let chunk_end = *stream_time;
                let lag = (self.timeline.session_elapsed() - chunk_end).max(0.0);
                debug!(
                    chunk_secs = samples.len() as f64 / SAMPLE_RATE as f64,
                    stream_time = chunk_end,
                    lag,
                    "running incremental decode"
                );

                let asr = self.asr.clone();
                let (tokens, up_to) = tokio::task::spawn_blocking(move || {
                    let mut asr = asr.0.lock();
                    asr.insert_audio_chunk(&samples, chunk_end);
                    asr.process_iter()
                })
                .await
                .map_err(|e| EngineError::Transcription(e.to_string()))??;
                new_tokens = tokens;
                processed_up_to = up_to.max(chunk_end);
            }
            AudioEvent::Silence(silence) => match silence.phase {
                SilencePhase::Starting => {
                    debug!("silence starting; flushing ASR buffer");
                    let asr = self.asr.clone();
                    let (tokens, up_to) =
                        tokio::task::spawn_blocking(move || asr.0.lock().start_silence())
                            .await
                            .map_err(|e| EngineError::Transcription(e.to_string()))??;
                    new_tokens = tokens;
                    processed_up_to = up_to.max(*stream_time);
                }
                SilencePhase::Ended => {
                    let duration = silence.duration.unwrap_or(0.0);
                    *stream_time += duration;
                    processed_up_to = *stream_time;
                    let last_token_end = self.timeline.last_token_end().await;
                    self.asr.0.lock().end_silence(duration, last_token_end);
                    debug!(duration, "silence ended; ASR clock advanced");
                }
            },
            _ => unreachable!("sentinels and speaker changes are handled by the caller"),
        }

        let mut buffer = self.asr.0.lock().buffer();
        if !new_tokens.is_empty() {
            // Keep committed text out of the unstable tail.
            let validated = new_tokens
                .iter()
                .map(|t| t.text.as_str())
                .collect::<Vec<_>>()
                .join(&self.separator);
            if let Some(rest) = buffer.text.strip_prefix(validated.as_str()) {
                buffer.text = rest.trim_start().to_string();
            }
        }

        let committed = self
            .timeline
            .commit_transcription(new_tokens, buffer, processed_up_to)
            .await;

        if let Some(tx) = &self.translation_tx {
            for token in committed {
                let _ = tx.send(TokenEvent::Token(token)).await;
            }
        }
        Ok(())
    }
}
