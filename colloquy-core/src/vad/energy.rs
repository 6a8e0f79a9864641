//! Energy-based VAD using RMS threshold + hangover counter.
//!
//! ## Algorithm
//!
//! 1. Split the window into fixed frames and compute each frame's RMS.
//! 2. RMS ≥ `threshold` → the frame is speech; reset the hangover counter.
//! 3. RMS < `threshold` during speech → count down the hangover before
//!    declaring the region closed (prevents clipping syllable endings).
//! 4. Report the absolute sample index of each region boundary crossed.

use super::{VadTransition, VoiceActivityDetector};

/// Frame stride used for boundary resolution (32 ms at 16 kHz).
const FRAME_LEN: usize = 512;

/// A simple energy-based voice activity detector.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// RMS amplitude threshold. Frames above this are considered speech.
    threshold: f32,
    /// How many consecutive below-threshold frames to still count as speech
    /// after real speech ends.
    hangover_frames: u32,
    hangover_counter: u32,
    in_speech: bool,
    /// Total samples consumed so far; boundary offsets are derived from it.
    consumed: u64,
}

impl EnergyVad {
    /// # Parameters
    /// - `threshold`: RMS level above which a frame is considered speech.
    ///   Typical range: 0.01–0.05 for a quiet microphone.
    /// - `hangover_frames`: silent frames to extend speech detection by.
    pub fn new(threshold: f32, hangover_frames: u32) -> Self {
        Self {
            threshold,
            hangover_frames,
            hangover_counter: 0,
            in_speech: false,
            consumed: 0,
        }
    }

    fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(0.02, 4)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn process(&mut self, samples: &[f32]) -> Option<VadTransition> {
        let mut transition = VadTransition::default();

        for (i, frame) in samples.chunks(FRAME_LEN).enumerate() {
            let offset = self.consumed + (i * FRAME_LEN) as u64;
            if Self::rms(frame) >= self.threshold {
                self.hangover_counter = self.hangover_frames;
                if !self.in_speech {
                    self.in_speech = true;
                    transition.start = Some(offset);
                }
            } else if self.in_speech {
                if self.hangover_counter > 0 {
                    self.hangover_counter -= 1;
                } else {
                    self.in_speech = false;
                    transition.end = Some(offset);
                }
            }
        }

        self.consumed += samples.len() as u64;
        if transition.start.is_none() && transition.end.is_none() {
            None
        } else {
            Some(transition)
        }
    }

    fn reset(&mut self) {
        self.hangover_counter = 0;
        self.in_speech = false;
    }
}
