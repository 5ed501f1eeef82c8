//! # Settings Tester
//!
//! ## Responsibility
//! Drive one candidate through
//! `Idle → Configuring → Settling → Sampling → Evaluating` and end in
//! exactly one of `Accepted`, `Rejected` or `Aborted`.
//!
//! ## Guarantees
//! - Frequency is always commanded before voltage, separated by the gap
//! - A sample above the interlock temperature aborts immediately; no further
//!   samples are taken
//! - A raised stop signal aborts at the next wait or sample boundary
//! - Every state transition is reported to the caller and logged at debug
//!
//! ## NOT Responsible For
//! - Restoring settings after a rejection (the session rolls back once, at
//!   the end)
//! - Choosing between accepted outcomes

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::OptimizationConfig;
use crate::device::{DeviceClient, DeviceError};
use crate::telemetry::{min_required, SampleSummary, SampleTick, TelemetrySampler};

use super::signal::{sleep_or_stop, StopSignal};
use super::stability::{improvement_percent, stability};
use super::{Baseline, Candidate, TestOutcome};

/// Where a test currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TesterState {
    /// Not testing.
    Idle,
    /// Sending frequency and voltage commands.
    Configuring,
    /// Waiting for the hardware to settle.
    Settling,
    /// Collecting the test window.
    Sampling,
    /// Reducing the window to a verdict.
    Evaluating,
    /// Ended with an outcome.
    Accepted,
    /// Ended without an outcome (soft skip).
    Rejected,
    /// Ended early (hard stop).
    Aborted,
}

/// Why a completed test produced no outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// Fewer than half of the requested samples arrived.
    InsufficientSamples {
        /// Samples collected.
        got: usize,
        /// Samples required.
        needed: usize,
    },
    /// Stability score below the threshold.
    Unstable {
        /// Measured score.
        score: f64,
    },
    /// Average temperature above the thermal ceiling.
    TooHot {
        /// Measured average (°C).
        average: f64,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientSamples { got, needed } => {
                write!(f, "insufficient samples ({got}/{needed})")
            }
            Self::Unstable { score } => write!(f, "unstable (score {score:.3})"),
            Self::TooHot { average } => write!(f, "too hot (avg {average:.1}°C)"),
        }
    }
}

/// Why a test ended early.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// The device refused a frequency or voltage command.
    CommandRejected(DeviceError),
    /// A single sample exceeded the interlock temperature.
    ThermalInterlock {
        /// Offending reading (°C).
        temperature: f64,
    },
    /// The stop signal was raised.
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandRejected(e) => write!(f, "command rejected: {e}"),
            Self::ThermalInterlock { temperature } => {
                write!(f, "thermal interlock at {temperature:.1}°C")
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal result of one test.
#[derive(Debug, Clone, PartialEq)]
pub enum TestVerdict {
    /// The candidate ran cleanly; `success` on the outcome says whether it
    /// beat the baseline by enough.
    Accepted(TestOutcome),
    /// The candidate ran but failed an acceptance rule.
    Rejected(RejectReason),
    /// The test was cut short.
    Aborted(AbortReason),
}

impl TestVerdict {
    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accepted(o) if o.success => "success",
            Self::Accepted(_) => "accepted",
            Self::Rejected(_) => "rejected",
            Self::Aborted(_) => "aborted",
        }
    }

    /// The tester state this verdict ends in.
    pub fn state(&self) -> TesterState {
        match self {
            Self::Accepted(_) => TesterState::Accepted,
            Self::Rejected(_) => TesterState::Rejected,
            Self::Aborted(_) => TesterState::Aborted,
        }
    }
}

/// Runs the per-candidate state machine against a device.
#[derive(Clone)]
pub struct SettingsTester {
    device: Arc<dyn DeviceClient>,
    sampler: TelemetrySampler,
    cfg: OptimizationConfig,
}

impl SettingsTester {
    /// Create a tester for `device` with the given thresholds and timing.
    pub fn new(device: Arc<dyn DeviceClient>, cfg: OptimizationConfig) -> Self {
        let sampler = TelemetrySampler::new(Arc::clone(&device));
        Self {
            device,
            sampler,
            cfg,
        }
    }

    /// Test `candidate` against `baseline`.
    ///
    /// `on_state` is called on every transition, including the terminal one.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn test<F>(
        &self,
        candidate: Candidate,
        baseline: &Baseline,
        stop: &StopSignal,
        mut on_state: F,
    ) -> TestVerdict
    where
        F: FnMut(TesterState) + Send,
    {
        let started = Instant::now();
        let verdict = self
            .drive(candidate, baseline, stop, started, &mut on_state)
            .await;
        let terminal = verdict.state();
        debug!(%candidate, state = ?terminal, "tester transition");
        on_state(terminal);
        verdict
    }

    async fn drive<F>(
        &self,
        candidate: Candidate,
        baseline: &Baseline,
        stop: &StopSignal,
        started: Instant,
        on_state: &mut F,
    ) -> TestVerdict
    where
        F: FnMut(TesterState) + Send,
    {
        let mut enter = |state: TesterState| {
            debug!(%candidate, ?state, "tester transition");
            on_state(state);
        };

        if stop.is_requested() {
            return TestVerdict::Aborted(AbortReason::Cancelled);
        }

        // ── Configuring ──────────────────────────────────────────────
        enter(TesterState::Configuring);
        if let Err(e) = self.device.set_frequency(candidate.frequency).await {
            warn!(%candidate, error = %e, "frequency command failed");
            return TestVerdict::Aborted(AbortReason::CommandRejected(e));
        }
        if !sleep_or_stop(self.cfg.command_gap(), stop).await {
            return TestVerdict::Aborted(AbortReason::Cancelled);
        }
        if let Err(e) = self.device.set_voltage(candidate.voltage).await {
            warn!(%candidate, error = %e, "voltage command failed");
            return TestVerdict::Aborted(AbortReason::CommandRejected(e));
        }

        // ── Settling ─────────────────────────────────────────────────
        enter(TesterState::Settling);
        if !sleep_or_stop(self.cfg.settle(), stop).await {
            return TestVerdict::Aborted(AbortReason::Cancelled);
        }

        // ── Sampling ─────────────────────────────────────────────────
        enter(TesterState::Sampling);
        let target = self.cfg.test_sample_count();
        let interlock = self.cfg.interlock_temperature();
        let mut window = self
            .sampler
            .window(target, self.cfg.sample_interval(), stop);
        let mut samples = Vec::with_capacity(target);
        while let Some(tick) = window.next().await {
            let SampleTick::Sample(sample) = tick else {
                continue;
            };
            if sample.temperature > interlock {
                warn!(
                    %candidate,
                    temperature = sample.temperature,
                    limit = interlock,
                    "thermal interlock tripped, aborting test"
                );
                return TestVerdict::Aborted(AbortReason::ThermalInterlock {
                    temperature: sample.temperature,
                });
            }
            samples.push(sample);
        }
        if window.was_interrupted() || stop.is_requested() {
            return TestVerdict::Aborted(AbortReason::Cancelled);
        }

        // ── Evaluating ───────────────────────────────────────────────
        enter(TesterState::Evaluating);
        let needed = min_required(target);
        let summary = match SampleSummary::from_samples(&samples) {
            Some(s) if s.count >= needed => s,
            _ => {
                return TestVerdict::Rejected(RejectReason::InsufficientSamples {
                    got: samples.len(),
                    needed,
                })
            }
        };

        let hashrates: Vec<f64> = samples.iter().map(|s| s.hashrate).collect();
        let score = stability(&hashrates);
        if score < self.cfg.stability_threshold {
            return TestVerdict::Rejected(RejectReason::Unstable { score });
        }
        if summary.avg_temperature > self.cfg.target_temperature {
            return TestVerdict::Rejected(RejectReason::TooHot {
                average: summary.avg_temperature,
            });
        }

        let improvement = improvement_percent(baseline.hashrate, summary.avg_hashrate);
        TestVerdict::Accepted(TestOutcome {
            candidate,
            hashrate_before: baseline.hashrate,
            hashrate_after: summary.avg_hashrate,
            temperature_before: baseline.temperature,
            temperature_after: summary.avg_temperature,
            improvement_percent: improvement,
            stability_score: score,
            success: improvement >= self.cfg.min_hashrate_improvement,
            duration: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCommand, SimReading, SimulatedDevice};

    fn baseline() -> Baseline {
        Baseline {
            hashrate: 500.0,
            temperature: 60.0,
            frequency: 500,
            voltage: 1.15,
            samples: 12,
            stability: 1.0,
        }
    }

    fn flat(hashrate: f64, temperature: f64) -> impl Fn(crate::device::SimContext) -> SimReading {
        move |_| SimReading {
            hashrate,
            temperature,
            power: 15.0,
        }
    }

    fn tester(dev: Arc<SimulatedDevice>) -> SettingsTester {
        SettingsTester::new(dev, OptimizationConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_improved_candidate_is_accepted_with_success() {
        let dev = Arc::new(SimulatedDevice::new(500, 1.15, flat(540.0, 65.0)));
        let mut states = Vec::new();
        let verdict = tester(dev.clone())
            .test(Candidate::new(550, 1.25), &baseline(), &StopSignal::new(), |s| {
                states.push(s)
            })
            .await;

        let outcome = match verdict {
            TestVerdict::Accepted(o) => o,
            other => panic!("expected accepted, got {other:?}"),
        };
        assert!(outcome.success);
        assert!((outcome.improvement_percent - 8.0).abs() < 1e-9);
        assert_eq!(outcome.stability_score, 1.0);
        assert_eq!(
            states,
            vec![
                TesterState::Configuring,
                TesterState::Settling,
                TesterState::Sampling,
                TesterState::Evaluating,
                TesterState::Accepted,
            ]
        );
        assert_eq!(
            dev.commands(),
            vec![DeviceCommand::SetFrequency(550), DeviceCommand::SetVoltage(1.25)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_gain_is_accepted_without_success() {
        let dev = Arc::new(SimulatedDevice::new(500, 1.15, flat(510.0, 65.0)));
        let verdict = tester(dev)
            .test(Candidate::new(525, 1.2), &baseline(), &StopSignal::new(), |_| {})
            .await;
        assert!(matches!(verdict, TestVerdict::Accepted(ref o) if !o.success));
        assert_eq!(verdict.label(), "accepted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hot_sample_trips_interlock_immediately() {
        let dev = Arc::new(SimulatedDevice::new(500, 1.15, |ctx| SimReading {
            hashrate: 560.0,
            temperature: if ctx.poll >= 2 { 86.0 } else { 70.0 },
            power: 15.0,
        }));
        let verdict = tester(dev.clone())
            .test(Candidate::new(550, 1.25), &baseline(), &StopSignal::new(), |_| {})
            .await;
        assert_eq!(
            verdict,
            TestVerdict::Aborted(AbortReason::ThermalInterlock { temperature: 86.0 })
        );
        assert_eq!(dev.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_average_above_ceiling_is_rejected() {
        let dev = Arc::new(SimulatedDevice::new(500, 1.15, flat(560.0, 78.0)));
        let verdict = tester(dev)
            .test(Candidate::new(550, 1.25), &baseline(), &StopSignal::new(), |_| {})
            .await;
        assert_eq!(verdict, TestVerdict::Rejected(RejectReason::TooHot { average: 78.0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_erratic_hashrate_is_rejected_as_unstable() {
        let dev = Arc::new(SimulatedDevice::new(500, 1.15, |ctx| SimReading {
            hashrate: if ctx.poll % 2 == 0 { 450.0 } else { 650.0 },
            temperature: 65.0,
            power: 15.0,
        }));
        let verdict = tester(dev)
            .test(Candidate::new(600, 1.2), &baseline(), &StopSignal::new(), |_| {})
            .await;
        assert!(matches!(verdict, TestVerdict::Rejected(RejectReason::Unstable { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mostly_missed_samples_are_insufficient() {
        let dev = Arc::new(SimulatedDevice::new(500, 1.15, flat(540.0, 65.0)).with_failing_polls(1));
        let verdict = tester(dev)
            .test(Candidate::new(550, 1.25), &baseline(), &StopSignal::new(), |_| {})
            .await;
        assert_eq!(
            verdict,
            TestVerdict::Rejected(RejectReason::InsufficientSamples { got: 0, needed: 15 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_frequency_aborts_before_voltage() {
        let dev = Arc::new(SimulatedDevice::new(500, 1.15, flat(540.0, 65.0)).with_rejected_frequency(550));
        let verdict = tester(dev.clone())
            .test(Candidate::new(550, 1.25), &baseline(), &StopSignal::new(), |_| {})
            .await;
        assert!(matches!(
            verdict,
            TestVerdict::Aborted(AbortReason::CommandRejected(DeviceError::Rejected(_)))
        ));
        assert_eq!(dev.commands(), vec![DeviceCommand::SetFrequency(550)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_settle_aborts_as_cancelled() {
        let dev = Arc::new(SimulatedDevice::new(500, 1.15, flat(540.0, 65.0)));
        let stop = StopSignal::new();
        let remote = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            remote.request();
        });
        let verdict = tester(dev.clone())
            .test(Candidate::new(550, 1.25), &baseline(), &stop, |_| {})
            .await;
        assert_eq!(verdict, TestVerdict::Aborted(AbortReason::Cancelled));
        assert_eq!(dev.polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_last_sample_aborts_as_cancelled() {
        let stop = StopSignal::new();
        let remote = stop.clone();
        // 300 s / 10 s gives 30 polls; index 29 is the last one.
        let dev = Arc::new(SimulatedDevice::new(500, 1.15, move |ctx| {
            if ctx.poll == 29 {
                remote.request();
            }
            SimReading {
                hashrate: 540.0,
                temperature: 65.0,
                power: 15.0,
            }
        }));
        let verdict = tester(dev.clone())
            .test(Candidate::new(550, 1.25), &baseline(), &stop, |_| {})
            .await;
        assert_eq!(verdict, TestVerdict::Aborted(AbortReason::Cancelled));
        assert_eq!(dev.polls(), 30);
    }
}
