//! Translation worker.
//!
//! Consumes committed tokens in order, keeps the translator's sliding
//! context in step with silences and speaker turns, and publishes committed
//! translations plus the unstable tail under the timeline lock.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::queue::{self, TokenEvent};
use crate::inference::TranslatorHandle;
use crate::timed::SilencePhase;
use crate::timeline::Timeline;

pub struct TranslationWorker {
    pub rx: mpsc::Receiver<TokenEvent>,
    pub translator: TranslatorHandle,
    pub timeline: Arc<Timeline>,
}

impl TranslationWorker {
    pub async fn run(mut self) {
        'outer: loop {
            let batch = queue::next_token_batch(&mut self.rx).await;
            for event in batch {
                match event {
                    TokenEvent::EndOfStream => {
                        debug!("translation worker received sentinel");
                        break 'outer;
                    }
                    TokenEvent::Token(token) => {
                        let translator = self.translator.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            let mut translator = translator.0.lock();
                            translator.insert_tokens(&token);
                            translator.process()
                        })
                        .await;
                        match result {
                            Ok(Ok((committed, buffer))) => {
                                self.timeline.apply_translation(committed, buffer).await;
                            }
                            Ok(Err(e)) => {
                                warn!(error = %e, "translation item failed; dropping");
                            }
                            Err(e) => {
                                warn!(error = %e, "translation dispatch failed; dropping");
                            }
                        }
                    }
                    TokenEvent::Silence(silence) => match silence.phase {
                        SilencePhase::Starting => {
                            let (committed, buffer) =
                                self.translator.0.lock().validate_buffer_and_reset();
                            self.timeline.apply_translation(committed, buffer).await;
                        }
                        SilencePhase::Ended => {
                            let duration = silence.duration.unwrap_or(0.0);
                            self.translator.0.lock().insert_silence(duration);
                        }
                    },
                    TokenEvent::SpeakerChange(_) => {
                        let (committed, buffer) =
                            self.translator.0.lock().validate_buffer_and_reset();
                        self.timeline.apply_translation(committed, buffer).await;
                    }
                }
            }
        }
        info!("translation worker finished");
    }
}
