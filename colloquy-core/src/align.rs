//! Token ↔ speaker alignment and line assembly.
//!
//! The formatter owns one [`TokensAlignment`] per session and folds each
//! timeline pickup into it. Diarization segments are replaced wholesale on
//! every tick, so speaker assignment runs anew each pass; tokens refer to
//! speakers by value, never by reference to a segment.

use crate::ipc::frames::Line;
use crate::timeline::TimelinePickup;
use crate::timed::{
    SpeakerChange, SpeakerSegment, TimelineEntry, Token, TranslatedToken, SPEAKER_SILENCE,
    SPEAKER_UNKNOWN,
};

#[derive(Debug)]
struct AlignedToken {
    token: Token,
    speaker: i32,
    /// A concrete speaker may be replaced by another concrete one at most
    /// once; this latches after that refinement.
    refined: bool,
}

#[derive(Debug)]
enum AlignedEntry {
    Token(AlignedToken),
    Silence { start: f64, end: f64 },
}

/// Lines plus the unattributed tail shown as the diarization buffer.
#[derive(Debug, Default)]
pub struct LinesOutput {
    pub lines: Vec<Line>,
    pub buffer_diarization: String,
}

pub struct TokensAlignment {
    entries: Vec<AlignedEntry>,
    segments: Vec<SpeakerSegment>,
    translations: Vec<TranslatedToken>,
    end_attributed_speaker: f64,
    sep: String,
    diarization: bool,
    translation: bool,
    /// Highest entry index a ChangeSpeaker was emitted for.
    notified_up_to: usize,
}

impl TokensAlignment {
    pub fn new(sep: String, diarization: bool, translation: bool) -> Self {
        Self {
            entries: Vec::new(),
            segments: Vec::new(),
            translations: Vec::new(),
            end_attributed_speaker: 0.0,
            sep,
            diarization,
            translation,
            notified_up_to: 0,
        }
    }

    /// Fold a pickup into the working view and re-run speaker assignment.
    /// Returns speaker-turn notifications for boundaries that became visible
    /// in this pass.
    pub fn update(&mut self, pickup: &mut TimelinePickup) -> Vec<SpeakerChange> {
        for entry in pickup.entries.drain(..) {
            match entry {
                TimelineEntry::Token(token) => self.entries.push(AlignedEntry::Token(AlignedToken {
                    token,
                    speaker: SPEAKER_UNKNOWN,
                    refined: false,
                })),
                TimelineEntry::Silence(s) => {
                    let start = s.start;
                    let end = s.end.unwrap_or(start);
                    self.entries.push(AlignedEntry::Silence { start, end });
                }
            }
        }
        self.translations.append(&mut pickup.translations);
        self.end_attributed_speaker = pickup.end_attributed_speaker;

        if !self.diarization {
            return Vec::new();
        }
        self.segments = std::mem::take(&mut pickup.segments);
        self.assign_speakers();
        self.detect_turns()
    }

    /// Assign each token the speaker whose segment overlaps it the most,
    /// requiring a strict majority of the token's span; otherwise the token
    /// stays unknown.
    fn assign_speakers(&mut self) {
        for entry in &mut self.entries {
            let AlignedEntry::Token(aligned) = entry else {
                continue;
            };
            let Some((speaker, overlap)) = best_overlap(&self.segments, &aligned.token) else {
                continue;
            };
            if overlap <= 0.5 * aligned.token.duration() {
                continue;
            }
            if aligned.speaker == SPEAKER_UNKNOWN {
                aligned.speaker = speaker;
            } else if aligned.speaker != speaker && !aligned.refined {
                aligned.speaker = speaker;
                aligned.refined = true;
            }
        }
    }

    fn detect_turns(&mut self) -> Vec<SpeakerChange> {
        let mut changes = Vec::new();
        let mut prev: Option<i32> = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            let AlignedEntry::Token(aligned) = entry else {
                continue;
            };
            if aligned.speaker == SPEAKER_UNKNOWN {
                continue;
            }
            if let Some(prev_speaker) = prev {
                if prev_speaker != aligned.speaker && idx > self.notified_up_to {
                    changes.push(SpeakerChange {
                        speaker: aligned.speaker,
                        at: aligned.token.start,
                    });
                    self.notified_up_to = idx;
                }
            }
            prev = Some(aligned.speaker);
        }
        changes
    }

    /// Group contiguous same-speaker tokens into lines. A silence placeholder
    /// breaks a line and is surfaced as a `speaker == -2` entry. With
    /// diarization on, committed tokens past the attribution watermark are
    /// withheld as the diarization buffer instead.
    pub fn lines(&self) -> LinesOutput {
        let mut lines: Vec<Line> = Vec::new();
        let mut pending: Vec<&str> = Vec::new();

        for entry in &self.entries {
            match entry {
                AlignedEntry::Silence { start, end } => {
                    lines.push(Line {
                        speaker: SPEAKER_SILENCE,
                        start: *start,
                        end: *end,
                        text: String::new(),
                        translation: String::new(),
                    });
                }
                AlignedEntry::Token(aligned) => {
                    if self.diarization
                        && aligned.speaker == SPEAKER_UNKNOWN
                        && aligned.token.end > self.end_attributed_speaker
                    {
                        pending.push(&aligned.token.text);
                        continue;
                    }
                    let speaker = if self.diarization { aligned.speaker } else { 0 };
                    match lines.last_mut() {
                        Some(line) if line.speaker == speaker => {
                            if !line.text.is_empty() {
                                line.text.push_str(&self.sep);
                            }
                            line.text.push_str(&aligned.token.text);
                            line.end = aligned.token.end;
                        }
                        _ => lines.push(Line {
                            speaker,
                            start: aligned.token.start,
                            end: aligned.token.end,
                            text: aligned.token.text.clone(),
                            translation: String::new(),
                        }),
                    }
                }
            }
        }

        if self.translation {
            for line in &mut lines {
                if line.speaker == SPEAKER_SILENCE {
                    continue;
                }
                let parts: Vec<&str> = self
                    .translations
                    .iter()
                    .filter(|t| {
                        let mid = 0.5 * (t.start + t.end);
                        mid >= line.start && mid <= line.end
                    })
                    .map(|t| t.text.as_str())
                    .collect();
                line.translation = parts.join(&self.sep);
            }
        }

        LinesOutput {
            lines,
            buffer_diarization: pending.join(&self.sep),
        }
    }
}

/// The segment maximizing overlap with `token`, among speech segments.
fn best_overlap(segments: &[SpeakerSegment], token: &Token) -> Option<(i32, f64)> {
    let mut best: Option<(i32, f64)> = None;
    for segment in segments.iter().filter(|s| s.speaker >= 0) {
        let overlap = (token.end.min(segment.end) - token.start.max(segment.start)).max(0.0);
        if overlap <= 0.0 {
            continue;
        }
        match best {
            Some((_, current)) if current >= overlap => {}
            _ => best = Some((segment.speaker, overlap)),
        }
    }
    best
}
