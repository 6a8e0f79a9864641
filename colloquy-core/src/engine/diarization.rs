//! Diarization worker.
//!
//! Consumes the same audio chunks as transcription (enqueued by value, once
//! per stage), keeps the diarizer's clock in step across silences, and
//! replaces the timeline's segment view wholesale after every pass.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::queue::{self, AudioEvent};
use crate::inference::DiarizerHandle;
use crate::timed::SilencePhase;
use crate::timeline::Timeline;

pub struct DiarizationWorker {
    pub rx: mpsc::Receiver<AudioEvent>,
    pub diarizer: DiarizerHandle,
    pub timeline: Arc<Timeline>,
}

impl DiarizationWorker {
    pub async fn run(mut self) {
        'outer: loop {
            let batch = queue::next_audio_batch(&mut self.rx).await;
            for event in batch {
                match event {
                    AudioEvent::EndOfStream => {
                        debug!("diarization worker received sentinel");
                        break 'outer;
                    }
                    AudioEvent::Silence(silence) => {
                        if silence.phase == SilencePhase::Ended {
                            let duration = silence.duration.unwrap_or(0.0);
                            self.diarizer.0.lock().insert_silence(duration);
                        }
                    }
                    AudioEvent::SpeakerChange(_) => {}
                    AudioEvent::Chunk(samples) => {
                        let diarizer = self.diarizer.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            let mut diarizer = diarizer.0.lock();
                            diarizer.insert_audio_chunk(&samples);
                            diarizer.diarize()
                        })
                        .await;
                        match result {
                            Ok(Ok(segments)) => {
                                self.timeline.apply_diarization(segments).await;
                            }
                            Ok(Err(e)) => {
                                warn!(error = %e, "diarization item failed; dropping");
                            }
                            Err(e) => {
                                warn!(error = %e, "diarization dispatch failed; dropping");
                            }
                        }
                    }
                }
            }
        }
        info!("diarization worker finished");
    }
}
