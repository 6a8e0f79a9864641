//! Container-audio decoding behind an asynchronous byte pipe.
//!
//! The surface is uniform across both input modes:
//!
//! - [`media::MediaDecoder`] wraps an external decoder process (ffmpeg):
//!   container bytes in on stdin, mono 16 kHz s16le PCM out on stdout.
//! - [`passthrough::PcmPassthrough`] is the raw-PCM mode: bytes written are
//!   handed straight back to the reader, and start/stop are no-ops.
//!
//! The ingress reader task consumes either through the [`Decoder`] enum, so
//! the rest of the pipeline never knows which mode is active.

pub mod media;
pub mod passthrough;

use std::sync::Arc;

use parking_lot::Mutex;

/// Lifecycle of the decoding pipe.
///
/// ```text
/// Stopped → Starting → Running → {Restarting → Running | Failed | Stopped}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Failed,
}

/// Typed fault reasons surfaced through the [`FaultSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderFault {
    NotFound,
    StartFailed,
    WriteError,
    ReadError,
    RestartFailed,
}

impl DecoderFault {
    pub fn as_str(self) -> &'static str {
        match self {
            DecoderFault::NotFound => "decoder_not_found",
            DecoderFault::StartFailed => "start_failed",
            DecoderFault::WriteError => "write_error",
            DecoderFault::ReadError => "read_error",
            DecoderFault::RestartFailed => "restart_failed",
        }
    }
}

/// Shared single-value slot the decoder reports faults into; the formatter
/// drains it once per tick. A later fault overwrites an unread earlier one.
#[derive(Clone, Default)]
pub struct FaultSlot(Arc<Mutex<Option<DecoderFault>>>);

impl FaultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, fault: DecoderFault) {
        *self.0.lock() = Some(fault);
    }

    pub fn take(&self) -> Option<DecoderFault> {
        self.0.lock().take()
    }
}

/// Uniform decoder surface over container and raw-PCM modes.
pub enum Decoder {
    Media(media::MediaDecoder),
    Passthrough(passthrough::PcmPassthrough),
}

impl Decoder {
    /// Idempotent; returns `false` when the decoder could not be brought up.
    pub async fn start(&self) -> bool {
        match self {
            Decoder::Media(m) => m.start().await,
            Decoder::Passthrough(p) => p.start(),
        }
    }

    /// Idempotent; closes the input side and waits for the pipe to wind down.
    pub async fn stop(&self) {
        match self {
            Decoder::Media(m) => m.stop().await,
            Decoder::Passthrough(p) => p.stop(),
        }
    }

    pub async fn restart(&self) -> bool {
        match self {
            Decoder::Media(m) => m.restart().await,
            Decoder::Passthrough(p) => {
                p.stop();
                p.start()
            }
        }
    }

    /// Write input bytes; rejects unless `Running`. Applies backpressure by
    /// awaiting the pipe.
    pub async fn write(&self, data: &[u8]) -> bool {
        match self {
            Decoder::Media(m) => m.write(data).await,
            Decoder::Passthrough(p) => p.write(data).await,
        }
    }

    /// Read up to `size` decoded PCM bytes, waiting at most
    /// [`media::READ_TIMEOUT`]. `None` on timeout, rejection, or I/O error;
    /// an empty buffer at end of stream.
    pub async fn read(&self, size: usize) -> Option<Vec<u8>> {
        match self {
            Decoder::Media(m) => m.read(size).await,
            Decoder::Passthrough(p) => p.read(size).await,
        }
    }

    pub async fn state(&self) -> DecoderState {
        match self {
            Decoder::Media(m) => m.state().await,
            Decoder::Passthrough(p) => p.state(),
        }
    }
}
