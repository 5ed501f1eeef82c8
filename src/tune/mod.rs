//! # Tuning Engine
//!
//! ## Responsibility
//! Find and apply a (frequency, voltage) operating point that raises
//! hashrate without breaching the thermal ceiling or destabilising the
//! device.
//!
//! ```text
//! scheduler ──► session ──► candidates (safe grid, ordered)
//!                  │
//!                  └──────► tester ──► telemetry window ──► stability
//! ```
//!
//! ## Guarantees
//! - Only settings accepted by [`candidates::SafetyPolicy::is_safe`] are
//!   ever commanded
//! - At most one session runs per controller
//! - A session that does not apply a better point leaves the device at its
//!   baseline settings
//!
//! ## NOT Responsible For
//! - Transport to the device (that belongs to `device`)
//! - Storing or delivering results (that belongs to `store` and `notify`)

pub mod candidates;
pub mod scheduler;
pub mod session;
pub mod signal;
pub mod stability;
pub mod tester;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A (frequency, voltage) operating point under consideration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Clock frequency (MHz).
    pub frequency: u32,
    /// Core voltage (V).
    pub voltage: f64,
}

impl Candidate {
    /// Build a candidate.
    pub fn new(frequency: u32, voltage: f64) -> Self {
        Self { frequency, voltage }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MHz @ {:.3} V", self.frequency, self.voltage)
    }
}

/// Performance of the device at its pre-session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// Mean hashrate over the window (GH/s).
    pub hashrate: f64,
    /// Mean temperature over the window (°C).
    pub temperature: f64,
    /// Frequency in effect, from the last sample (MHz).
    pub frequency: u32,
    /// Voltage in effect, from the last sample (V).
    pub voltage: f64,
    /// Number of samples averaged.
    pub samples: usize,
    /// Stability score of the window's hashrate series.
    pub stability: f64,
}

impl Baseline {
    /// The baseline's own operating point.
    pub fn settings(&self) -> Candidate {
        Candidate::new(self.frequency, self.voltage)
    }
}

/// Result of testing one candidate, or of a whole session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Settings the outcome describes.
    pub candidate: Candidate,
    /// Baseline mean hashrate (GH/s).
    pub hashrate_before: f64,
    /// Mean hashrate under `candidate` (GH/s).
    pub hashrate_after: f64,
    /// Baseline mean temperature (°C).
    pub temperature_before: f64,
    /// Mean temperature under `candidate` (°C).
    pub temperature_after: f64,
    /// `(after - before) / before * 100`.
    pub improvement_percent: f64,
    /// Stability score of the test window.
    pub stability_score: f64,
    /// Whether the improvement met the configured minimum.
    pub success: bool,
    /// Wall time the test took.
    pub duration: Duration,
}

impl TestOutcome {
    /// Non-success outcome that echoes the baseline unchanged.
    pub fn unchanged(baseline: &Baseline, duration: Duration) -> Self {
        Self {
            candidate: baseline.settings(),
            hashrate_before: baseline.hashrate,
            hashrate_after: baseline.hashrate,
            temperature_before: baseline.temperature,
            temperature_after: baseline.temperature,
            improvement_percent: 0.0,
            stability_score: baseline.stability,
            success: false,
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_display() {
        assert_eq!(Candidate::new(550, 1.25).to_string(), "550 MHz @ 1.250 V");
    }

    #[test]
    fn test_unchanged_outcome_echoes_baseline() {
        let baseline = Baseline {
            hashrate: 1100.0,
            temperature: 58.0,
            frequency: 500,
            voltage: 1.15,
            samples: 12,
            stability: 0.99,
        };
        let outcome = TestOutcome::unchanged(&baseline, Duration::from_secs(60));
        assert!(!outcome.success);
        assert_eq!(outcome.improvement_percent, 0.0);
        assert_eq!(outcome.candidate, Candidate::new(500, 1.15));
        assert_eq!(outcome.hashrate_after, outcome.hashrate_before);
        assert_eq!(outcome.stability_score, 0.99);
    }
}
