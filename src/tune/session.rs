//! # Optimization Session Controller
//!
//! ## Responsibility
//! Run one tuning session end to end: capture a baseline, walk the ordered
//! candidates through the tester, keep the best, then either apply it or
//! put the device back the way it was found.
//!
//! ## Guarantees
//! - Single-flight: a second `run_session`/`run_quick_tune` while one is in
//!   progress returns `None` without touching the device
//! - The gate is released on every exit path, including a panic
//! - A session that does not apply a better point restores the baseline
//!   frequency and voltage before returning
//! - A stop request never applies a partial best
//! - A panic inside a session is caught here, logged, and reported as `None`
//! - Persistence and notification failures are logged, never propagated
//!
//! ## NOT Responsible For
//! - Deciding when to run (that belongs to `scheduler`)
//! - Per-candidate mechanics (that belongs to `tester`)

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{OptimizationConfig, TunerConfig};
use crate::device::{DeviceClient, DeviceError};
use crate::metrics;
use crate::notify::Notifier;
use crate::store::TelemetryStore;
use crate::telemetry::{min_required, SampleSummary, TelemetrySampler};

use super::candidates::SafetyPolicy;
use super::signal::StopSignal;
use super::stability::stability;
use super::tester::{AbortReason, SettingsTester, TestVerdict, TesterState};
use super::{Baseline, Candidate, TestOutcome};

/// Phase of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No session has run yet.
    Idle,
    /// Measuring the pre-session baseline.
    CollectingBaseline,
    /// Testing candidates.
    Searching,
    /// Applying the winning candidate.
    Applying,
    /// Restoring baseline settings.
    RollingBack,
    /// The last session has finished.
    Done,
}

/// Read-only snapshot of the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    /// Whether a session holds the gate.
    pub running: bool,
    /// Phase of the current (or last) session.
    pub state: SessionState,
    /// Phase of the candidate under test, if any.
    pub tester_state: Option<TesterState>,
    /// Candidate under test, if any.
    pub current_candidate: Option<Candidate>,
    /// Candidates finished so far in this session.
    pub candidates_tested: usize,
    /// Candidates planned for this session.
    pub candidates_total: usize,
    /// Time since the session started (zero when idle).
    pub elapsed: std::time::Duration,
    /// Identifier of the current (or last) session.
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct Progress {
    running: bool,
    state: SessionState,
    tester_state: Option<TesterState>,
    current_candidate: Option<Candidate>,
    candidates_tested: usize,
    candidates_total: usize,
    started: Option<Instant>,
    session_id: Option<Uuid>,
}

impl Progress {
    fn idle() -> Self {
        Self {
            running: false,
            state: SessionState::Idle,
            tester_state: None,
            current_candidate: None,
            candidates_tested: 0,
            candidates_total: 0,
            started: None,
            session_id: None,
        }
    }
}

/// Internal failure modes, logged at the session boundary.
#[derive(Debug, Error)]
enum SessionError {
    #[error("baseline collection failed: {got}/{needed} samples")]
    BaselineIncomplete { got: usize, needed: usize },

    #[error("baseline hashrate is zero")]
    BaselineZero,

    #[error("session cancelled")]
    Cancelled,

    #[error("applying {candidate} failed: {source}")]
    Apply {
        candidate: Candidate,
        #[source]
        source: DeviceError,
    },
}

impl SessionError {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            _ => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Full,
    Quick { target: Option<f64> },
}

impl Mode {
    fn name(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Quick { .. } => "quick",
        }
    }
}

struct Inner {
    device: Arc<dyn DeviceClient>,
    store: Arc<dyn TelemetryStore>,
    notifier: Arc<dyn Notifier>,
    opt: OptimizationConfig,
    policy: SafetyPolicy,
    sampler: TelemetrySampler,
    tester: SettingsTester,
    running: AtomicBool,
    stop: StopSignal,
    progress: watch::Sender<Progress>,
}

/// Releases the single-flight gate when dropped.
struct FlightGuard<'a> {
    inner: &'a Inner,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.progress.send_modify(|p| {
            p.running = false;
            p.state = SessionState::Done;
            p.tester_state = None;
            p.current_candidate = None;
        });
        self.inner.running.store(false, Ordering::Release);
        metrics::set_session_running(false);
    }
}

/// Owns the single-flight gate and runs tuning sessions.
///
/// Cheap to clone; clones share the gate, stop signal and status.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Create a controller.
    pub fn new(
        device: Arc<dyn DeviceClient>,
        store: Arc<dyn TelemetryStore>,
        notifier: Arc<dyn Notifier>,
        cfg: &TunerConfig,
    ) -> Self {
        let (progress, _rx) = watch::channel(Progress::idle());
        Self {
            inner: Arc::new(Inner {
                sampler: TelemetrySampler::new(Arc::clone(&device)),
                tester: SettingsTester::new(Arc::clone(&device), cfg.optimization.clone()),
                device,
                store,
                notifier,
                opt: cfg.optimization.clone(),
                policy: SafetyPolicy::new(cfg.safety.clone()),
                running: AtomicBool::new(false),
                stop: StopSignal::new(),
                progress,
            }),
        }
    }

    /// Run a full session over the safe grid.
    ///
    /// Returns the applied outcome, a non-success outcome echoing the
    /// baseline when nothing beat it, or `None` if a session was already in
    /// progress, the baseline could not be measured, the session was
    /// stopped, or it panicked.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn run_session(&self) -> Option<TestOutcome> {
        self.run(Mode::Full).await
    }

    /// Run a short session over the quick list, keeping the successful
    /// outcome closest to `target_hashrate` (default: baseline + 10%).
    ///
    /// Returns `None` when nothing succeeded; the baseline is restored in
    /// that case.
    pub async fn run_quick_tune(&self, target_hashrate: Option<f64>) -> Option<TestOutcome> {
        self.run(Mode::Quick {
            target: target_hashrate,
        })
        .await
    }

    /// Ask the running session to stop at its next wait or sample boundary.
    ///
    /// No-op when idle.
    pub fn stop_session(&self) {
        if self.is_running() {
            info!("stop requested for running session");
            self.inner.stop.request();
        }
    }

    /// Whether a session currently holds the gate.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Snapshot of the controller's state.
    pub fn status(&self) -> SessionStatus {
        let p = self.inner.progress.borrow();
        SessionStatus {
            running: p.running,
            state: p.state,
            tester_state: p.tester_state,
            current_candidate: p.current_candidate,
            candidates_tested: p.candidates_tested,
            candidates_total: p.candidates_total,
            elapsed: match (p.running, p.started) {
                (true, Some(started)) => started.elapsed(),
                _ => std::time::Duration::ZERO,
            },
            session_id: p.session_id,
        }
    }

    fn try_acquire(&self) -> Option<FlightGuard<'_>> {
        self.inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(FlightGuard { inner: &self.inner })
    }

    async fn run(&self, mode: Mode) -> Option<TestOutcome> {
        let Some(_guard) = self.try_acquire() else {
            warn!(mode = mode.name(), "optimization already in progress");
            return None;
        };
        self.inner.stop.reset();
        metrics::set_session_running(true);

        let session_id = Uuid::new_v4();
        self.inner.progress.send_replace(Progress {
            running: true,
            started: Some(Instant::now()),
            session_id: Some(session_id),
            ..Progress::idle()
        });

        let span = info_span!("session", %session_id, mode = mode.name());
        async move {
            info!("starting optimization session");
            let result = AssertUnwindSafe(self.execute(mode)).catch_unwind().await;
            let result = match result {
                Ok(result) => result,
                Err(payload) => {
                    metrics::record_session("failed");
                    error!(panic = panic_message(&*payload), "session panicked");
                    return None;
                }
            };
            match result {
                Ok(Some(outcome)) => {
                    let label = if outcome.success { "improved" } else { "unchanged" };
                    metrics::record_session(label);
                    info!(
                        success = outcome.success,
                        improvement_percent = outcome.improvement_percent,
                        settings = %outcome.candidate,
                        "session finished"
                    );
                    Some(outcome)
                }
                Ok(None) => {
                    metrics::record_session("unchanged");
                    info!("session finished without applying settings");
                    None
                }
                Err(e) => {
                    metrics::record_session(e.metric_label());
                    match e {
                        SessionError::Cancelled => info!("session cancelled"),
                        other => error!(error = %other, "session failed"),
                    }
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    fn publish(&self, f: impl FnOnce(&mut Progress)) {
        self.inner.progress.send_modify(f);
    }

    async fn execute(&self, mode: Mode) -> Result<Option<TestOutcome>, SessionError> {
        let started = Instant::now();

        self.publish(|p| p.state = SessionState::CollectingBaseline);
        let baseline = self.capture_baseline().await?;
        info!(
            hashrate = baseline.hashrate,
            temperature = baseline.temperature,
            settings = %baseline.settings(),
            "baseline captured"
        );

        let candidates = match mode {
            Mode::Full => self.inner.policy.generate(),
            Mode::Quick { .. } => self.inner.policy.quick_candidates(),
        };
        let total = candidates.len();
        self.publish(|p| {
            p.state = SessionState::Searching;
            p.candidates_total = total;
        });
        info!(candidates = total, "testing candidates");

        let quick_target = match mode {
            Mode::Full => None,
            Mode::Quick { target } => Some(target.unwrap_or(baseline.hashrate * 1.1)),
        };

        let mut best: Option<TestOutcome> = None;
        let mut best_score = 0.0_f64;
        let mut best_distance = f64::INFINITY;
        let mut cancelled = false;

        for (i, candidate) in candidates.into_iter().enumerate() {
            if self.inner.stop.is_requested() {
                cancelled = true;
                break;
            }
            self.publish(|p| {
                p.current_candidate = Some(candidate);
                p.tester_state = Some(TesterState::Idle);
            });
            info!(index = i + 1, total, %candidate, "testing candidate");

            let verdict = self
                .inner
                .tester
                .test(candidate, &baseline, &self.inner.stop, |state| {
                    self.publish(|p| p.tester_state = Some(state));
                })
                .await;
            metrics::record_candidate(verdict.label());
            self.publish(|p| p.candidates_tested = i + 1);

            match verdict {
                TestVerdict::Accepted(outcome) if outcome.success => match quick_target {
                    None => {
                        let score = self.score(&outcome);
                        if score > best_score && score >= self.inner.opt.min_hashrate_improvement {
                            info!(%candidate, score, improvement_percent = outcome.improvement_percent, "new best");
                            best_score = score;
                            best = Some(outcome);
                        }
                    }
                    Some(target) => {
                        let distance = (outcome.hashrate_after - target).abs();
                        if distance < best_distance {
                            info!(%candidate, distance, "new closest to target");
                            best_distance = distance;
                            best = Some(outcome);
                        }
                    }
                },
                TestVerdict::Accepted(outcome) => {
                    debug!(%candidate, improvement_percent = outcome.improvement_percent, "below minimum improvement");
                }
                TestVerdict::Rejected(reason) => {
                    info!(%candidate, %reason, "candidate rejected");
                }
                TestVerdict::Aborted(AbortReason::Cancelled) => {
                    cancelled = true;
                    break;
                }
                TestVerdict::Aborted(reason) => {
                    warn!(%candidate, %reason, "candidate aborted");
                }
            }
        }

        self.publish(|p| {
            p.current_candidate = None;
            p.tester_state = None;
        });

        // A stop that lands after the last candidate's final sample.
        cancelled |= self.inner.stop.is_requested();
        if cancelled {
            self.restore(&baseline).await;
            return Err(SessionError::Cancelled);
        }

        match (best, mode) {
            (Some(outcome), _) => {
                if let Err(e) = self.apply(&outcome).await {
                    self.restore(&baseline).await;
                    return Err(e);
                }
                metrics::set_last_improvement(outcome.improvement_percent);
                self.record(&outcome).await;
                Ok(Some(outcome))
            }
            (None, Mode::Full) => {
                info!("no better settings found");
                self.restore(&baseline).await;
                Ok(Some(TestOutcome::unchanged(&baseline, started.elapsed())))
            }
            (None, Mode::Quick { .. }) => {
                info!("quick tune found no successful candidate");
                self.restore(&baseline).await;
                Ok(None)
            }
        }
    }

    fn score(&self, outcome: &TestOutcome) -> f64 {
        let overshoot = (outcome.temperature_after - self.inner.opt.target_temperature).max(0.0);
        outcome.improvement_percent - overshoot * self.inner.opt.overshoot_penalty
    }

    async fn capture_baseline(&self) -> Result<Baseline, SessionError> {
        let count = self.inner.opt.baseline_samples;
        let samples = self
            .inner
            .sampler
            .sample(count, self.inner.opt.baseline_interval(), &self.inner.stop)
            .await;
        if self.inner.stop.is_requested() {
            return Err(SessionError::Cancelled);
        }

        let needed = min_required(count);
        let summary = match SampleSummary::from_samples(&samples) {
            Some(s) if s.count >= needed => s,
            _ => {
                return Err(SessionError::BaselineIncomplete {
                    got: samples.len(),
                    needed,
                })
            }
        };
        if summary.avg_hashrate <= 0.0 {
            return Err(SessionError::BaselineZero);
        }

        let hashrates: Vec<f64> = samples.iter().map(|s| s.hashrate).collect();
        Ok(Baseline {
            hashrate: summary.avg_hashrate,
            temperature: summary.avg_temperature,
            frequency: summary.frequency,
            voltage: summary.voltage,
            samples: summary.count,
            stability: stability(&hashrates),
        })
    }

    /// Command `candidate`, let it settle and verify the device reports it.
    async fn apply(&self, outcome: &TestOutcome) -> Result<(), SessionError> {
        let candidate = outcome.candidate;
        self.publish(|p| p.state = SessionState::Applying);
        info!(%candidate, "applying optimal settings");

        self.inner
            .device
            .set_frequency(candidate.frequency)
            .await
            .map_err(|source| SessionError::Apply { candidate, source })?;
        tokio::time::sleep(self.inner.opt.command_gap()).await;
        self.inner
            .device
            .set_voltage(candidate.voltage)
            .await
            .map_err(|source| SessionError::Apply { candidate, source })?;
        tokio::time::sleep(self.inner.opt.settle()).await;

        match self.inner.device.get_status().await {
            Ok(status) => {
                let freq_off = status.frequency.abs_diff(candidate.frequency);
                let volt_off = (status.voltage - candidate.voltage).abs();
                if freq_off > self.inner.opt.frequency_tolerance_mhz
                    || volt_off > self.inner.opt.voltage_tolerance
                {
                    warn!(
                        requested = %candidate,
                        reported_frequency = status.frequency,
                        reported_voltage = status.voltage,
                        "device does not report the applied settings"
                    );
                } else {
                    info!(%candidate, "applied settings verified");
                }
            }
            Err(e) => warn!(error = %e, "could not verify applied settings"),
        }
        Ok(())
    }

    /// Put the baseline settings back. Idempotent; errors are logged.
    async fn restore(&self, baseline: &Baseline) {
        self.publish(|p| p.state = SessionState::RollingBack);
        let settings = baseline.settings();
        info!(%settings, "restoring baseline settings");

        if let Err(e) = self.inner.device.set_frequency(settings.frequency).await {
            error!(error = %e, %settings, "failed to restore baseline frequency");
        }
        tokio::time::sleep(self.inner.opt.command_gap()).await;
        if let Err(e) = self.inner.device.set_voltage(settings.voltage).await {
            error!(error = %e, %settings, "failed to restore baseline voltage");
        }
        tokio::time::sleep(self.inner.opt.restore_settle()).await;
    }

    async fn record(&self, outcome: &TestOutcome) {
        if let Err(e) = self.inner.store.insert_optimization_result(outcome).await {
            warn!(error = %e, "failed to persist optimization result");
        }
        if let Err(e) = self.inner.notifier.notify_optimization_result(outcome).await {
            warn!(error = %e, "failed to deliver optimization notification");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
