//! Voice Activity Detection (VAD) abstraction.
//!
//! The `VoiceActivityDetector` trait is the gate's extensibility point: the
//! default [`energy::EnergyVad`] can be swapped for a neural detector via
//! [`crate::inference::VadFactory`] without touching the gate.

pub mod energy;

/// Speech-boundary transitions detected in one processed window.
///
/// Offsets are *absolute* sample indices since session start; the detector is
/// expected to keep its own running sample counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VadTransition {
    /// Sample index where speech began, when this window opened a speech region.
    pub start: Option<u64>,
    /// Sample index where speech ended, when this window closed one.
    pub end: Option<u64>,
}

/// Trait for all VAD implementations.
///
/// Implementors may be stateful (hangover counters, RNN hidden states, etc.).
pub trait VoiceActivityDetector: Send + Sync + 'static {
    /// Analyse one window of normalized mono samples.
    ///
    /// Returns `None` when no speech boundary was crossed inside the window.
    fn process(&mut self, samples: &[f32]) -> Option<VadTransition>;

    /// Reset boundary-tracking state (hangover counters, hidden states).
    /// The running sample counter is not affected.
    fn reset(&mut self);
}
