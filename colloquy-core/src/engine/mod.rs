//! `SessionEngine` — per-connection lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! SessionEngine::new(config, bundle)     → providers created, phase = Idle
//!     └─► start()                        → decoder up, tasks spawned, phase = Streaming
//!         └─► process_audio(bytes)       → decoder → gate → stage queues
//!         └─► process_audio(&[])         → phase = Draining, sentinels propagate
//!             └─► (formatter emits ready_to_stop, phase = Done)
//!     └─► shutdown()                     → tasks cancelled, decoder stopped,
//!                                          diarizer closed, phase = Done
//! ```
//!
//! ## Concurrency
//!
//! One cooperative scheduler: every component is a task on the session's
//! runtime. The three workers are never parallelized across threads; only
//! model calls hop to the blocking pool. The timeline is the only shared
//! mutable state, always behind its async lock.

pub mod diarization;
pub mod formatter;
pub mod gate;
pub mod queue;
pub mod transcription;
pub mod translation;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::align::TokensAlignment;
use crate::decode::{media::MediaDecoder, passthrough::PcmPassthrough, Decoder, FaultSlot};
use crate::engine::queue::{AudioEvent, TokenEvent, QUEUE_CAPACITY};
use crate::error::{EngineError, Result};
use crate::inference::{
    AsrHandle, DiarizerHandle, ModelBundle, Summarizer, TranslatorHandle,
};
use crate::ipc::frames::{ControlMessage, Frame, OutboundMessage};
use crate::timeline::Timeline;
use crate::vad::{energy::EnergyVad, VoiceActivityDetector};
use crate::SAMPLE_RATE;

/// Outbound channel capacity; a slow client suspends the formatter.
const OUT_CAPACITY: usize = 64;
/// Watchdog inspection period.
const WATCHDOG_PERIOD: Duration = Duration::from_secs(10);

/// Session lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Streaming,
    Draining,
    Done,
}

/// Which incremental transcription policy the ASR backend should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPolicy {
    SimulStreaming,
    LocalAgreement,
}

impl BackendPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "simulstreaming" => Some(Self::SimulStreaming),
            "localagreement" => Some(Self::LocalAgreement),
            _ => None,
        }
    }
}

/// Engine-scoped configuration.
///
/// [`SessionConfig::from_options`] accepts a JSON object and ignores
/// unrecognized keys, so surfaces can forward client option maps verbatim.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model_size: String,
    pub source_language: String,
    /// Target translation language; empty string disables translation.
    pub target_language: String,
    pub transcription: bool,
    pub vad: bool,
    pub diarization: bool,
    pub diarization_backend: String,
    /// Raw s16le/16 kHz/mono input instead of container audio.
    pub pcm_input: bool,
    /// Seconds of audio the ingress buffers before each processing window.
    pub min_chunk_size: f64,
    pub backend_policy: BackendPolicy,
    pub enable_summary: bool,
    /// Whether a speaker turn also drops the ASR's committed context
    /// (rather than only prompt state).
    pub speaker_change_flushes_context: bool,
    /// External decoder binary for container input.
    pub decoder_command: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model_size: "base".into(),
            source_language: "auto".into(),
            target_language: String::new(),
            transcription: true,
            vad: true,
            diarization: false,
            diarization_backend: "diart".into(),
            pcm_input: false,
            min_chunk_size: 1.0,
            backend_policy: BackendPolicy::SimulStreaming,
            enable_summary: false,
            speaker_change_flushes_context: false,
            decoder_command: "ffmpeg".into(),
        }
    }
}

impl SessionConfig {
    pub fn translation_enabled(&self) -> bool {
        !self.target_language.is_empty()
    }

    /// Build a config from a client-supplied option map. Unrecognized keys
    /// and ill-typed values are ignored.
    pub fn from_options(options: &serde_json::Map<String, serde_json::Value>) -> Self {
        let mut config = Self::default();
        for (key, value) in options {
            match key.as_str() {
                "model_size" => {
                    if let Some(v) = value.as_str() {
                        config.model_size = v.to_string();
                    }
                }
                "source_language" => {
                    if let Some(v) = value.as_str() {
                        config.source_language = v.to_string();
                    }
                }
                "target_language" => {
                    if let Some(v) = value.as_str() {
                        config.target_language = v.to_string();
                    }
                }
                "transcription" => {
                    if let Some(v) = value.as_bool() {
                        config.transcription = v;
                    }
                }
                "vad" => {
                    if let Some(v) = value.as_bool() {
                        config.vad = v;
                    }
                }
                "diarization" => {
                    if let Some(v) = value.as_bool() {
                        config.diarization = v;
                    }
                }
                "diarization_backend" => {
                    if let Some(v) = value.as_str() {
                        config.diarization_backend = v.to_string();
                    }
                }
                "pcm_input" => {
                    if let Some(v) = value.as_bool() {
                        config.pcm_input = v;
                    }
                }
                "min_chunk_size" => {
                    if let Some(v) = value.as_f64() {
                        if v > 0.0 {
                            config.min_chunk_size = v;
                        }
                    }
                }
                "backend_policy" => {
                    if let Some(policy) = value.as_str().and_then(BackendPolicy::parse) {
                        config.backend_policy = policy;
                    }
                }
                "enable_summary" => {
                    if let Some(v) = value.as_bool() {
                        config.enable_summary = v;
                    }
                }
                "speaker_change_flushes_context" => {
                    if let Some(v) = value.as_bool() {
                        config.speaker_change_flushes_context = v;
                    }
                }
                "decoder_command" => {
                    if let Some(v) = value.as_str() {
                        config.decoder_command = v.to_string();
                    }
                }
                other => debug!(option = other, "ignoring unrecognized option"),
            }
        }
        // English-only model variants pin the source language.
        if config.model_size.ends_with(".en") {
            config.source_language = "en".into();
        }
        config
    }
}

struct TaskEntry {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// The per-connection engine.
///
/// Construction loads nothing itself — it asks the shared [`ModelBundle`]
/// for per-session online processors and refuses the session if a required
/// factory is missing or fails.
pub struct SessionEngine {
    config: SessionConfig,
    timeline: Arc<Timeline>,
    decoder: Arc<Decoder>,
    faults: FaultSlot,
    phase: Arc<parking_lot::Mutex<SessionPhase>>,
    stopping: Arc<AtomicBool>,
    started: AtomicBool,

    asr: Option<AsrHandle>,
    diarizer: Option<DiarizerHandle>,
    translator: Option<TranslatorHandle>,
    vad: Option<Box<dyn VoiceActivityDetector>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    separator: String,

    transcription_tx: Option<mpsc::Sender<AudioEvent>>,
    transcription_rx: Option<mpsc::Receiver<AudioEvent>>,
    diarization_tx: Option<mpsc::Sender<AudioEvent>>,
    diarization_rx: Option<mpsc::Receiver<AudioEvent>>,
    translation_tx: Option<mpsc::Sender<TokenEvent>>,
    translation_rx: Option<mpsc::Receiver<TokenEvent>>,

    out_tx: mpsc::Sender<OutboundMessage>,
    out_rx: Option<mpsc::Receiver<OutboundMessage>>,

    tasks: Arc<parking_lot::Mutex<Vec<TaskEntry>>>,
    live_workers: Arc<AtomicUsize>,
    formatter_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    watchdog_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionEngine {
    /// Create an engine for one connection.
    ///
    /// # Errors
    /// [`EngineError::ModelLoad`] when a capability the config enables has no
    /// factory in the bundle, or a factory fails to build its processor.
    pub fn new(config: SessionConfig, bundle: &ModelBundle) -> Result<Self> {
        let mut separator = " ".to_string();

        let asr = if config.transcription {
            let factory = bundle.asr.as_ref().ok_or_else(|| {
                EngineError::ModelLoad("transcription enabled but no ASR model configured".into())
            })?;
            let handle = factory.online(&config)?;
            separator = handle.0.lock().separator().to_string();
            Some(handle)
        } else {
            None
        };

        let diarizer = if config.diarization {
            let factory = bundle.diarization.as_ref().ok_or_else(|| {
                EngineError::ModelLoad(format!(
                    "diarization enabled but no '{}' backend configured",
                    config.diarization_backend
                ))
            })?;
            Some(factory.online(&config)?)
        } else {
            None
        };

        let translator = if config.translation_enabled() {
            if config.source_language == "auto"
                && config.backend_policy == BackendPolicy::LocalAgreement
            {
                return Err(EngineError::ModelLoad(
                    "translation requires an explicit source language with the \
                     localagreement policy"
                        .into(),
                ));
            }
            let factory = bundle.translation.as_ref().ok_or_else(|| {
                EngineError::ModelLoad("translation enabled but no model configured".into())
            })?;
            Some(factory.online(&config)?)
        } else {
            None
        };

        let vad: Option<Box<dyn VoiceActivityDetector>> = if config.vad {
            Some(match &bundle.vad {
                Some(factory) => factory.online(),
                None => Box::new(EnergyVad::default()),
            })
        } else {
            None
        };

        let summarizer = if config.enable_summary {
            let s = bundle.summarizer.clone();
            if s.is_none() {
                warn!("summary requested but no summarizer configured; skipping");
            }
            s
        } else {
            None
        };

        let faults = FaultSlot::new();
        let decoder = if config.pcm_input {
            Decoder::Passthrough(PcmPassthrough::new())
        } else {
            Decoder::Media(MediaDecoder::new(
                config.decoder_command.clone(),
                SAMPLE_RATE,
                1,
                faults.clone(),
            ))
        };

        let (transcription_tx, transcription_rx) = if asr.is_some() {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (diarization_tx, diarization_rx) = if diarizer.is_some() {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (translation_tx, translation_rx) = if translator.is_some() {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let (out_tx, out_rx) = mpsc::channel(OUT_CAPACITY);

        Ok(Self {
            config,
            timeline: Arc::new(Timeline::new()),
            decoder: Arc::new(decoder),
            faults,
            phase: Arc::new(parking_lot::Mutex::new(SessionPhase::Idle)),
            stopping: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            asr,
            diarizer,
            translator,
            vad,
            summarizer,
            separator,
            transcription_tx,
            transcription_rx,
            diarization_tx,
            diarization_rx,
            translation_tx,
            translation_rx,
            out_tx,
            out_rx: Some(out_rx),
            tasks: Arc::new(parking_lot::Mutex::new(Vec::new())),
            live_workers: Arc::new(AtomicUsize::new(0)),
            formatter_task: parking_lot::Mutex::new(None),
            watchdog_task: parking_lot::Mutex::new(None),
        })
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Bring the decoder up and spawn the processing tasks. Returns the
    /// outbound message stream.
    ///
    /// When the external decoder cannot start, the stream carries a single
    /// `error` frame and no pipeline runs; the session then just waits for
    /// the client to close.
    pub async fn start(&mut self) -> Result<mpsc::Receiver<OutboundMessage>> {
        let Some(out_rx) = self.out_rx.take() else {
            return Err(EngineError::AlreadyRunning);
        };

        let _ = self
            .out_tx
            .send(OutboundMessage::Control(ControlMessage::Config {
                use_audio_worklet: self.config.pcm_input,
            }))
            .await;

        if !self.decoder.start().await {
            let reason = self
                .faults
                .take()
                .map(|f| f.as_str())
                .unwrap_or("start_failed");
            error!(reason, "decoder failed to start; session limited to error reporting");
            let _ = self
                .out_tx
                .send(OutboundMessage::Frame(Frame::error(format!(
                    "decoder error: {reason}"
                ))))
                .await;
            return Ok(out_rx);
        }

        *self.phase.lock() = SessionPhase::Streaming;

        let gate = gate::VadGate::new(
            self.vad.take(),
            self.transcription_tx.clone(),
            self.diarization_tx.clone(),
            self.translation_tx.clone(),
            Arc::clone(&self.timeline),
            self.config.min_chunk_size,
        );
        self.spawn_worker("ingress", gate::run_ingress(Arc::clone(&self.decoder), gate));

        if let (Some(asr), Some(rx)) = (self.asr.clone(), self.transcription_rx.take()) {
            let worker = transcription::TranscriptionWorker {
                rx,
                asr,
                timeline: Arc::clone(&self.timeline),
                translation_tx: self.translation_tx.clone(),
                diarization_tx: self.diarization_tx.clone(),
                stopping: Arc::clone(&self.stopping),
                separator: self.separator.clone(),
                flush_on_speaker_change: self.config.speaker_change_flushes_context,
            };
            self.spawn_worker("transcription", worker.run());
        }

        if let (Some(diarizer), Some(rx)) = (self.diarizer.clone(), self.diarization_rx.take()) {
            let worker = diarization::DiarizationWorker {
                rx,
                diarizer,
                timeline: Arc::clone(&self.timeline),
            };
            self.spawn_worker("diarization", worker.run());
        }

        if let (Some(translator), Some(rx)) = (self.translator.clone(), self.translation_rx.take())
        {
            let worker = translation::TranslationWorker {
                rx,
                translator,
                timeline: Arc::clone(&self.timeline),
            };
            self.spawn_worker("translation", worker.run());
        }

        let formatter = formatter::Formatter {
            timeline: Arc::clone(&self.timeline),
            alignment: TokensAlignment::new(
                self.separator.clone(),
                self.config.diarization,
                self.config.translation_enabled(),
            ),
            out_tx: self.out_tx.clone(),
            faults: self.faults.clone(),
            decoder: Arc::clone(&self.decoder),
            stopping: Arc::clone(&self.stopping),
            live_workers: Arc::clone(&self.live_workers),
            transcription_tx: self.transcription_tx.clone(),
            translation_tx: self.translation_tx.clone(),
            diarization_enabled: self.config.diarization,
            summarizer: self.summarizer.clone(),
            enable_summary: self.config.enable_summary,
            phase: Arc::clone(&self.phase),
            last_frame: None,
            restart_attempted: false,
        };
        *self.formatter_task.lock() = Some(tokio::spawn(formatter.run()));

        let watchdog = watchdog(Arc::clone(&self.tasks), Arc::clone(&self.stopping));
        *self.watchdog_task.lock() = Some(tokio::spawn(watchdog));

        info!(
            transcription = self.config.transcription,
            diarization = self.config.diarization,
            translation = self.config.translation_enabled(),
            pcm_input = self.config.pcm_input,
            "session started"
        );
        Ok(out_rx)
    }

    /// Handle one inbound client message. A zero-length payload means end of
    /// stream: the session enters `Draining` and sentinels propagate through
    /// the stages in dependency order.
    pub async fn process_audio(&self, payload: &[u8]) {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.timeline.mark_started();
        }

        if payload.is_empty() {
            info!("end of stream received; draining");
            self.stopping.store(true, Ordering::SeqCst);
            *self.phase.lock() = SessionPhase::Draining;
            self.decoder.stop().await;
            return;
        }

        if self.stopping.load(Ordering::SeqCst) {
            warn!("session draining; dropping incoming audio");
            return;
        }

        if !self.decoder.write(payload).await {
            warn!("decoder rejected audio write");
        }
    }

    /// Cancel every task, await them (cancellation swallowed), stop the
    /// decoder with a bounded wait, and close the diarizer. Idempotent.
    pub async fn shutdown(&self) {
        info!("starting session cleanup");
        self.stopping.store(true, Ordering::SeqCst);
        {
            let mut phase = self.phase.lock();
            if *phase != SessionPhase::Done {
                *phase = SessionPhase::Draining;
            }
        }

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for entry in self.tasks.lock().drain(..) {
            entry.handle.abort();
            handles.push(entry.handle);
        }
        for slot in [&self.formatter_task, &self.watchdog_task] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
                handles.push(handle);
            }
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.decoder.stop().await;
        if let Some(diarizer) = &self.diarizer {
            diarizer.0.lock().close();
        }
        *self.phase.lock() = SessionPhase::Done;
        info!("session cleanup complete");
    }

    fn spawn_worker(
        &self,
        name: &'static str,
        fut: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        let live = Arc::clone(&self.live_workers);
        live.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            fut.await;
            live.fetch_sub(1, Ordering::SeqCst);
        });
        self.tasks.lock().push(TaskEntry { name, handle });
    }
}

/// Observe each processing task every ten seconds. An exit before the
/// session drains is unexpected but not fatal: the session proceeds with the
/// reduced capability set.
async fn watchdog(tasks: Arc<parking_lot::Mutex<Vec<TaskEntry>>>, stopping: Arc<AtomicBool>) {
    let mut reported: HashSet<&'static str> = HashSet::new();
    loop {
        tokio::time::sleep(WATCHDOG_PERIOD).await;
        let mut all_done = true;
        {
            let tasks = tasks.lock();
            if tasks.is_empty() {
                return;
            }
            for entry in tasks.iter() {
                if entry.handle.is_finished() {
                    if reported.insert(entry.name) {
                        if stopping.load(Ordering::SeqCst) {
                            info!(task = entry.name, "monitored task completed");
                        } else {
                            warn!(
                                task = entry.name,
                                "monitored task exited before drain; continuing with reduced \
                                 capability"
                            );
                        }
                    }
                } else {
                    all_done = false;
                }
            }
        }
        if all_done {
            info!("watchdog finishing: all monitored tasks completed");
            return;
        }
    }
}
