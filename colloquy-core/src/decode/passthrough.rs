//! Raw-PCM input mode: the decoder surface with no process behind it.
//!
//! Bytes written by the session are queued verbatim for the ingress reader,
//! so the reader path is identical in both input modes. Start/stop only flip
//! the state machine; stop additionally closes the internal channel so a
//! reader blocked in `read` wakes up immediately.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use super::DecoderState;
use crate::decode::media::READ_TIMEOUT;

/// Backpressure bound on undrained PCM chunks.
const CHANNEL_CAPACITY: usize = 64;

pub struct PcmPassthrough {
    state: Mutex<DecoderState>,
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    /// Receiver rebuilt by a restart while a reader still held the old one.
    fresh_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl PcmPassthrough {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(DecoderState::Stopped),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(Some(rx)),
            fresh_rx: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DecoderState {
        *self.state.lock()
    }

    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if *state == DecoderState::Running {
            return false;
        }
        if self.tx.lock().is_none() {
            // Channel was torn down by a previous stop; rebuild it.
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            *self.tx.lock() = Some(tx);
            match self.rx.try_lock() {
                Ok(mut slot) => *slot = Some(rx),
                // A reader still holds the old receiver; it will swap in the
                // fresh one on its next read.
                Err(_) => *self.fresh_rx.lock() = Some(rx),
            }
        }
        *state = DecoderState::Running;
        debug!("pcm passthrough started");
        true
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        if *state == DecoderState::Stopped {
            return;
        }
        *state = DecoderState::Stopped;
        // Dropping the sender closes the channel and wakes a pending read.
        self.tx.lock().take();
        debug!("pcm passthrough stopped");
    }

    pub async fn write(&self, data: &[u8]) -> bool {
        if self.state() != DecoderState::Running {
            debug!("cannot write: passthrough not running");
            return false;
        }
        let tx = match self.tx.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return false,
        };
        tx.send(data.to_vec()).await.is_ok()
    }

    /// The chunk size is whatever was written; `_size` is accepted for
    /// surface uniformity with the media decoder.
    ///
    /// After a stop, queued chunks remain readable so the ingress can drain
    /// them; an empty buffer then signals the end.
    pub async fn read(&self, _size: usize) -> Option<Vec<u8>> {
        let stopped = self.tx.lock().is_none();
        if self.state() != DecoderState::Running && !stopped {
            return None;
        }
        let mut guard = self.rx.lock().await;
        if let Some(fresh) = self.fresh_rx.lock().take() {
            *guard = Some(fresh);
        }
        let rx = guard.as_mut()?;
        if stopped {
            return match rx.try_recv() {
                Ok(bytes) => Some(bytes),
                Err(_) => Some(Vec::new()),
            };
        }
        match timeout(READ_TIMEOUT, rx.recv()).await {
            Ok(Some(bytes)) => Some(bytes),
            Ok(None) => Some(Vec::new()),
            Err(_) => None,
        }
    }
}

impl Default for PcmPassthrough {
    fn default() -> Self {
        Self::new()
    }
}
