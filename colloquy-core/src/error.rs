use thiserror::Error;

/// All errors produced by colloquy-core.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("decoder not found: {0}")]
    DecoderNotFound(String),

    #[error("decoder I/O error: {0}")]
    DecoderIo(String),

    #[error("model load failure: {0}")]
    ModelLoad(String),

    #[error("session is already running")]
    AlreadyRunning,

    #[error("session is not running")]
    NotRunning,

    #[error("transcription backend error: {0}")]
    Transcription(String),

    #[error("diarization backend error: {0}")]
    Diarization(String),

    #[error("translation backend error: {0}")]
    Translation(String),

    #[error("summary failure: {0}")]
    Summary(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
