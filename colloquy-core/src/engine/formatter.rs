//! Frame assembly and change-only emission.
//!
//! Roughly 20 times a second the formatter picks up the timeline, re-runs
//! speaker alignment, assembles a [`Frame`], and sends it to the client only
//! when it differs from the previous one. Speaker turns detected during
//! alignment are fed back into the transcription and translation queues as
//! [`crate::timed::SpeakerChange`] notifications.
//!
//! Once the session is draining and every processing task has exited, the
//! formatter performs one final pickup, optionally requests a summary, emits
//! `ready_to_stop`, and returns.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::align::{LinesOutput, TokensAlignment};
use crate::decode::{Decoder, DecoderFault, FaultSlot};
use crate::engine::queue::{AudioEvent, TokenEvent};
use crate::engine::SessionPhase;
use crate::inference::Summarizer;
use crate::ipc::frames::{ControlMessage, Frame, FrameStatus, Line, OutboundMessage};
use crate::timed::SPEAKER_SILENCE;
use crate::timeline::{Timeline, TimelinePickup};

const TICK: Duration = Duration::from_millis(50);
/// Back-off after surfacing a decoder fault.
const FAULT_PAUSE: Duration = Duration::from_secs(1);

pub struct Formatter {
    pub timeline: Arc<Timeline>,
    pub alignment: TokensAlignment,
    pub out_tx: mpsc::Sender<OutboundMessage>,
    pub faults: FaultSlot,
    pub decoder: Arc<Decoder>,
    pub stopping: Arc<AtomicBool>,
    pub live_workers: Arc<AtomicUsize>,
    pub transcription_tx: Option<mpsc::Sender<AudioEvent>>,
    pub translation_tx: Option<mpsc::Sender<TokenEvent>>,
    pub diarization_enabled: bool,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub enable_summary: bool,
    pub phase: Arc<parking_lot::Mutex<SessionPhase>>,
    pub last_frame: Option<Frame>,
    pub restart_attempted: bool,
}

impl Formatter {
    pub async fn run(mut self) {
        loop {
            if let Some(fault) = self.faults.take() {
                if !self.handle_fault(fault).await {
                    return;
                }
                tokio::time::sleep(FAULT_PAUSE).await;
                continue;
            }

            // Observing worker completion *before* the pickup guarantees the
            // final frame includes everything they committed.
            let done = self.stopping.load(Ordering::SeqCst)
                && self.live_workers.load(Ordering::SeqCst) == 0;

            let mut pickup = self.timeline.pickup().await;
            let changes = self.alignment.update(&mut pickup);
            for change in changes {
                if let Some(tx) = &self.transcription_tx {
                    if tx.try_send(AudioEvent::SpeakerChange(change)).is_err() {
                        debug!("speaker-change notification dropped (transcription queue full)");
                    }
                }
                if let Some(tx) = &self.translation_tx {
                    if tx.try_send(TokenEvent::SpeakerChange(change)).is_err() {
                        debug!("speaker-change notification dropped (translation queue full)");
                    }
                }
            }

            let output = self.alignment.lines();
            let frame = self.build_frame(output, &pickup);
            if self.last_frame.as_ref() != Some(&frame) {
                if self.out_tx.send(OutboundMessage::Frame(frame.clone())).await.is_err() {
                    info!("client channel closed; formatter terminating");
                    return;
                }
                self.last_frame = Some(frame);
            }

            if done {
                self.finish().await;
                return;
            }
            tokio::time::sleep(TICK).await;
        }
    }

    /// Returns `false` only when the client channel is gone.
    async fn handle_fault(&mut self, fault: DecoderFault) -> bool {
        match fault {
            DecoderFault::WriteError | DecoderFault::ReadError if !self.restart_attempted => {
                self.restart_attempted = true;
                warn!(fault = fault.as_str(), "decoder I/O fault; attempting one restart");
                let decoder = Arc::clone(&self.decoder);
                tokio::spawn(async move {
                    decoder.restart().await;
                });
                true
            }
            fault => {
                error!(fault = fault.as_str(), "decoder fault; surfacing to client");
                let frame = Frame::error(format!("decoder error: {}", fault.as_str()));
                let sent = self
                    .out_tx
                    .send(OutboundMessage::Frame(frame.clone()))
                    .await
                    .is_ok();
                self.last_frame = Some(frame);
                sent
            }
        }
    }

    fn build_frame(&self, output: LinesOutput, pickup: &TimelinePickup) -> Frame {
        let buffer_transcription = pickup.buffer_transcription.text.clone();
        let buffer_translation = pickup.buffer_translation.text.clone();
        let has_speech = output.lines.iter().any(|l| l.speaker != SPEAKER_SILENCE);
        let status = if !has_speech
            && buffer_transcription.is_empty()
            && output.buffer_diarization.is_empty()
        {
            FrameStatus::NoAudioDetected
        } else {
            FrameStatus::ActiveTranscription
        };

        Frame {
            status,
            lines: output.lines,
            buffer_transcription,
            buffer_diarization: output.buffer_diarization,
            buffer_translation,
            remaining_time_transcription: pickup.lag_transcription,
            remaining_time_diarization: if self.diarization_enabled {
                pickup.lag_diarization
            } else {
                0.0
            },
            error: None,
            summary: None,
        }
    }

    async fn finish(&mut self) {
        info!("all processors finished; formatter terminating");

        if self.enable_summary {
            if let Some(summarizer) = self.summarizer.clone() {
                let lines: Vec<Line> = self
                    .last_frame
                    .as_ref()
                    .map(|f| f.lines.clone())
                    .unwrap_or_default();
                let speech: Vec<Line> = lines
                    .iter()
                    .filter(|l| l.speaker != SPEAKER_SILENCE && !l.text.is_empty())
                    .cloned()
                    .collect();
                if !speech.is_empty() {
                    let result =
                        tokio::task::spawn_blocking(move || summarizer.summarize(&speech)).await;
                    match result {
                        Ok(Ok(report)) => {
                            let frame = Frame {
                                status: FrameStatus::Summary,
                                lines,
                                summary: Some(report),
                                ..Frame::default()
                            };
                            let _ = self.out_tx.send(OutboundMessage::Frame(frame)).await;
                        }
                        Ok(Err(e)) => warn!(error = %e, "summary generation failed; skipping"),
                        Err(e) => warn!(error = %e, "summary dispatch failed; skipping"),
                    }
                }
            }
        }

        *self.phase.lock() = SessionPhase::Done;
        let _ = self
            .out_tx
            .send(OutboundMessage::Control(ControlMessage::ReadyToStop))
            .await;
    }
}
