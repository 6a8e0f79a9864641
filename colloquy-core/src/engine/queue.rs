//! Stage-queue plumbing: tagged items and batched draining.
//!
//! The end of stream is a distinguishable sentinel variant, never a data
//! value; it is always the last item a stage consumes from its queue.

use tokio::sync::mpsc;

use crate::timed::{Silence, SpeakerChange, Token};

/// Capacity of each bounded stage queue. Producers suspend when full.
pub const QUEUE_CAPACITY: usize = 512;

/// Item on the transcription / diarization input queues.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// Normalized mono samples the gate classified as active.
    Chunk(Vec<f32>),
    Silence(Silence),
    SpeakerChange(SpeakerChange),
    EndOfStream,
}

/// Item on the translation input queue.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    Token(Token),
    Silence(Silence),
    SpeakerChange(SpeakerChange),
    EndOfStream,
}

/// Await one item, then drain whatever else is already buffered, coalescing
/// consecutive audio chunks so a backlog costs one model call instead of
/// many. Draining stops at silences and sentinels: such an item closes the
/// batch (as its last element) and everything behind it waits for the next
/// one. Order within a batch is preserved exactly.
///
/// A closed channel is treated as end of stream.
pub async fn next_audio_batch(rx: &mut mpsc::Receiver<AudioEvent>) -> Vec<AudioEvent> {
    let Some(first) = rx.recv().await else {
        return vec![AudioEvent::EndOfStream];
    };
    if matches!(first, AudioEvent::Silence(_) | AudioEvent::EndOfStream) {
        return vec![first];
    }
    let mut batch = vec![first];
    while let Ok(item) = rx.try_recv() {
        let closes_batch = matches!(item, AudioEvent::Silence(_) | AudioEvent::EndOfStream);
        match item {
            AudioEvent::Chunk(more) => match batch.last_mut() {
                Some(AudioEvent::Chunk(acc)) => acc.extend_from_slice(&more),
                _ => batch.push(AudioEvent::Chunk(more)),
            },
            other => batch.push(other),
        }
        if closes_batch {
            break;
        }
    }
    batch
}

pub async fn next_token_batch(rx: &mut mpsc::Receiver<TokenEvent>) -> Vec<TokenEvent> {
    let Some(first) = rx.recv().await else {
        return vec![TokenEvent::EndOfStream];
    };
    if matches!(first, TokenEvent::Silence(_) | TokenEvent::EndOfStream) {
        return vec![first];
    }
    let mut batch = vec![first];
    while let Ok(item) = rx.try_recv() {
        let closes_batch = matches!(item, TokenEvent::Silence(_) | TokenEvent::EndOfStream);
        batch.push(item);
        if closes_batch {
            break;
        }
    }
    batch
}
