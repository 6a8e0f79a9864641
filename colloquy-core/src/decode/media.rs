//! External decoder process management.
//!
//! Wraps a decoder CLI (ffmpeg by default) as an async child process:
//! container bytes go in on stdin, mono 16 kHz s16le PCM comes out on stdout,
//! and stderr is drained by a dedicated task so the child never blocks on a
//! full pipe. Each of the three pipes is owned by exactly one task at a time:
//! the session's writer, the ingress reader, and the stderr drainer.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{DecoderFault, DecoderState, FaultSlot};

/// Bounded wait for one stdout read.
pub const READ_TIMEOUT: Duration = Duration::from_secs(20);
/// Settle time between stop and start during a restart.
const RESTART_DELAY: Duration = Duration::from_secs(1);
/// Bounded wait for the child to exit after its stdin is closed.
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

const INSTALL_INSTRUCTIONS: &str = "\
The external audio decoder was not found on PATH.
Sessions can run without it by enabling raw PCM input (pcm_input), at the
cost of uncompressed audio between client and server.
To install ffmpeg: `apt install ffmpeg` (Debian/Ubuntu), `brew install ffmpeg`
(macOS), or download a static build from https://ffmpeg.org/download.html.";

pub struct MediaDecoder {
    command: String,
    sample_rate: u32,
    channels: u16,
    state: Mutex<DecoderState>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    faults: FaultSlot,
}

impl MediaDecoder {
    pub fn new(command: impl Into<String>, sample_rate: u32, channels: u16, faults: FaultSlot) -> Self {
        Self {
            command: command.into(),
            sample_rate,
            channels,
            state: Mutex::new(DecoderState::Stopped),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            stderr_task: Mutex::new(None),
            faults,
        }
    }

    pub async fn state(&self) -> DecoderState {
        *self.state.lock().await
    }

    /// Spawn the child process. Returns `false` (and raises a fault) when the
    /// binary is missing or the spawn fails; `false` without a fault when the
    /// decoder is already running.
    pub async fn start(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            if *state != DecoderState::Stopped {
                warn!(state = ?*state, "decoder already running");
                return false;
            }
            *state = DecoderState::Starting;
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(["-hide_banner", "-loglevel", "error", "-i", "pipe:0"])
            .args(["-f", "s16le", "-acodec", "pcm_s16le"])
            .arg("-ac")
            .arg(self.channels.to_string())
            .arg("-ar")
            .arg(self.sample_rate.to_string())
            .arg("pipe:1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match cmd.spawn() {
            Ok(mut child) => {
                *self.stdin.lock().await = child.stdin.take();
                *self.stdout.lock().await = child.stdout.take();
                if let Some(stderr) = child.stderr.take() {
                    let task = tokio::spawn(drain_stderr(stderr));
                    *self.stderr_task.lock().await = Some(task);
                }
                *self.child.lock().await = Some(child);
                *self.state.lock().await = DecoderState::Running;
                info!(command = %self.command, "decoder started");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!(command = %self.command, "{INSTALL_INSTRUCTIONS}");
                *self.state.lock().await = DecoderState::Failed;
                self.faults.raise(DecoderFault::NotFound);
                false
            }
            Err(e) => {
                error!(error = %e, "failed to start external decoder");
                *self.state.lock().await = DecoderState::Failed;
                self.faults.raise(DecoderFault::StartFailed);
                false
            }
        }
    }

    /// Idempotent stop: close stdin (EOF to the child), wait for exit with a
    /// bounded timeout, cancel the stderr drainer.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().await;
            if *state == DecoderState::Stopped {
                return;
            }
            *state = DecoderState::Stopped;
        }

        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        self.stdout.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            match timeout(EXIT_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => debug!(?status, "decoder exited"),
                Ok(Err(e)) => warn!(error = %e, "error waiting for decoder exit"),
                Err(_) => {
                    warn!("decoder did not exit in time; killing");
                    let _ = child.kill().await;
                }
            }
        }
        if let Some(task) = self.stderr_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        info!("decoder stopped");
    }

    /// Stop, wait a moment, start again. Used once for transient I/O faults.
    pub async fn restart(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            if *state == DecoderState::Restarting {
                warn!("decoder restart already in progress");
                return false;
            }
            *state = DecoderState::Restarting;
        }
        info!("restarting decoder");
        self.stop().await;
        tokio::time::sleep(RESTART_DELAY).await;
        let ok = self.start().await;
        if !ok {
            self.faults.raise(DecoderFault::RestartFailed);
        }
        ok
    }

    pub async fn write(&self, data: &[u8]) -> bool {
        if self.state().await != DecoderState::Running {
            warn!("cannot write: decoder not running");
            return false;
        }
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return false;
        };
        match stdin.write_all(data).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "error writing to decoder");
                self.faults.raise(DecoderFault::WriteError);
                false
            }
        }
    }

    pub async fn read(&self, size: usize) -> Option<Vec<u8>> {
        if self.state().await != DecoderState::Running {
            debug!("cannot read: decoder not running");
            return None;
        }
        let mut guard = self.stdout.lock().await;
        let stdout = guard.as_mut()?;
        let mut buf = vec![0u8; size.max(1)];
        match timeout(READ_TIMEOUT, stdout.read(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Some(buf)
            }
            Ok(Err(e)) => {
                error!(error = %e, "error reading from decoder");
                self.faults.raise(DecoderFault::ReadError);
                None
            }
            Err(_) => {
                warn!("decoder read timeout");
                None
            }
        }
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "colloquy::decoder", "stderr: {line}"),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "error draining decoder stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_fails_with_typed_reason() {
        let faults = FaultSlot::new();
        let decoder = MediaDecoder::new("definitely-not-a-decoder", 16_000, 1, faults.clone());
        assert!(!decoder.start().await);
        assert_eq!(decoder.state().await, DecoderState::Failed);
        assert_eq!(faults.take(), Some(DecoderFault::NotFound));
    }

    #[tokio::test]
    async fn write_rejected_unless_running() {
        let decoder = MediaDecoder::new("definitely-not-a-decoder", 16_000, 1, FaultSlot::new());
        assert!(!decoder.write(b"abc").await);
        assert_eq!(decoder.read(16).await, None);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let decoder = MediaDecoder::new("definitely-not-a-decoder", 16_000, 1, FaultSlot::new());
        decoder.stop().await;
        decoder.stop().await;
        assert_eq!(decoder.state().await, DecoderState::Stopped);
    }
}
