//! # Auto-Optimize Scheduler
//!
//! ## Responsibility
//! Wake periodically, compare recent telemetry against the longer history
//! and start a tuning session when performance has degraded or the device
//! runs hot.
//!
//! ## Guarantees
//! - The first check runs as soon as the loop starts
//! - Sessions are at least `min_runtime_hours` apart
//! - A failed or panicking session is logged; the loop keeps running
//! - `stop()` returns promptly; an in-flight session is asked to stop and
//!   awaited
//!
//! ## NOT Responsible For
//! - Running the session itself (that belongs to `session`)
//! - Collecting telemetry (that belongs to `recorder`)

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{SchedulerConfig, TunerConfig};
use crate::store::{StoreError, TelemetryStore};
use crate::telemetry::mean;

use super::session::SessionController;

/// How often a pending stop is re-sent to a session that has not yet
/// observed it.
const STOP_RESEND: Duration = Duration::from_millis(100);

/// Why the scheduler decided to tune.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Trigger {
    /// Recent mean hashrate fell too far below the historical mean.
    PerformanceDrop {
        /// Recent mean (GH/s).
        recent: f64,
        /// Historical mean (GH/s).
        historical: f64,
        /// `(historical - recent) / historical * 100`.
        drop_percent: f64,
    },
    /// Recent mean temperature above the target plus margin.
    Overheating {
        /// Recent mean (°C).
        temperature: f64,
    },
}

/// Read-only snapshot of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStatus {
    /// Whether the loop is running.
    pub running: bool,
    /// When a scheduler-triggered session last ran.
    pub last_run: Option<DateTime<Utc>>,
    /// Wake-ups so far.
    pub checks: u64,
    /// Sessions started so far.
    pub triggers: u64,
}

#[derive(Debug, Default)]
struct SchedulerState {
    last_run: Option<Instant>,
    last_run_at: Option<DateTime<Utc>>,
    checks: u64,
    triggers: u64,
}

struct Inner {
    controller: SessionController,
    store: Arc<dyn TelemetryStore>,
    cfg: SchedulerConfig,
    target_temperature: f64,
    enabled: bool,
    state: Mutex<SchedulerState>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Background loop that decides when to re-tune.
#[derive(Clone)]
pub struct AutoScheduler {
    inner: Arc<Inner>,
    task: Arc<Mutex<Option<Running>>>,
}

impl AutoScheduler {
    /// Create a scheduler driving `controller` from `store`'s history.
    pub fn new(
        controller: SessionController,
        store: Arc<dyn TelemetryStore>,
        cfg: &TunerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                controller,
                store,
                cfg: cfg.scheduler.clone(),
                target_temperature: cfg.optimization.target_temperature,
                enabled: cfg.optimization.auto_optimize,
                state: Mutex::new(SchedulerState::default()),
            }),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the loop. Must be called within a Tokio runtime.
    ///
    /// Returns `false` without spawning when auto-optimize is disabled or
    /// the loop is already running.
    pub fn start(&self) -> bool {
        if !self.inner.enabled {
            info!("auto-optimize disabled, scheduler not started");
            return false;
        }
        let Ok(mut task) = self.task.lock() else {
            error!("scheduler task lock poisoned");
            return false;
        };
        if task.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("scheduler already running");
            return false;
        }

        let (shutdown, rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(rx).await });
        *task = Some(Running { shutdown, handle });
        info!(
            check_interval_secs = self.inner.cfg.check_interval_secs,
            min_runtime_hours = self.inner.cfg.min_runtime_hours,
            "auto-optimize scheduler started"
        );
        true
    }

    /// Stop the loop and wait for it to exit. No-op when not running.
    pub async fn stop(&self) {
        let running = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        let Some(Running { shutdown, handle }) = running else {
            return;
        };
        let _ = shutdown.send(true);
        if let Err(e) = handle.await {
            error!(error = %e, "scheduler task ended abnormally");
        }
        info!("auto-optimize scheduler stopped");
    }

    /// Snapshot of the scheduler.
    pub fn status(&self) -> SchedulerStatus {
        let running = self
            .task
            .lock()
            .map(|t| t.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false);
        let mut status = self
            .inner
            .state
            .lock()
            .map(|s| SchedulerStatus {
                running: false,
                last_run: s.last_run_at,
                checks: s.checks,
                triggers: s.triggers,
            })
            .unwrap_or_default();
        status.running = running;
        status
    }

    /// Evaluate the trigger rules against the store right now.
    ///
    /// Store failures are logged and read as "no trigger".
    pub async fn should_optimize(&self) -> Option<Trigger> {
        self.inner.should_optimize().await
    }
}

impl Inner {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.check(&mut shutdown).await;
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.check_interval()) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("scheduler loop exited");
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SchedulerState) -> T) -> Option<T> {
        match self.state.lock() {
            Ok(mut s) => Some(f(&mut s)),
            Err(_) => {
                error!("scheduler state lock poisoned");
                None
            }
        }
    }

    async fn check(&self, shutdown: &mut watch::Receiver<bool>) {
        let last_run = self
            .with_state(|s| {
                s.checks += 1;
                s.last_run
            })
            .flatten();

        if let Some(last) = last_run {
            let since = last.elapsed();
            if since < self.cfg.min_runtime() {
                debug!(since_secs = since.as_secs(), "last session too recent, skipping");
                return;
            }
        }

        let Some(trigger) = self.should_optimize().await else {
            return;
        };
        info!(?trigger, "auto-optimize triggered");
        self.with_state(|s| s.triggers += 1);

        let controller = self.controller.clone();
        let mut handle = tokio::spawn(async move { controller.run_session().await });

        let joined = tokio::select! {
            r = &mut handle => r,
            _ = shutdown.changed() => {
                info!("shutdown during session, stopping it");
                loop {
                    self.controller.stop_session();
                    tokio::select! {
                        r = &mut handle => break r,
                        _ = tokio::time::sleep(STOP_RESEND) => {}
                    }
                }
            }
        };

        match joined {
            Ok(Some(outcome)) => info!(
                success = outcome.success,
                improvement_percent = outcome.improvement_percent,
                "scheduled session finished"
            ),
            Ok(None) => info!("scheduled session produced no outcome"),
            Err(e) => error!(error = %e, "scheduled session panicked"),
        }

        self.with_state(|s| {
            s.last_run = Some(Instant::now());
            s.last_run_at = Some(Utc::now());
        });
    }

    async fn should_optimize(&self) -> Option<Trigger> {
        match self.evaluate().await {
            Ok(trigger) => trigger,
            Err(e) => {
                warn!(error = %e, "telemetry history unavailable, skipping check");
                None
            }
        }
    }

    async fn evaluate(&self) -> Result<Option<Trigger>, StoreError> {
        let recent = self
            .store
            .get_recent_samples(self.cfg.recent_window_hours)
            .await?;
        if recent.len() < self.cfg.min_recent_points {
            debug!(points = recent.len(), "not enough recent telemetry");
            return Ok(None);
        }
        let recent_hashrate = mean(recent.iter().map(|s| s.hashrate)).unwrap_or(0.0);
        let recent_temperature = mean(recent.iter().map(|s| s.temperature)).unwrap_or(0.0);

        let historical = self
            .store
            .get_recent_samples(self.cfg.historical_window_hours)
            .await?;
        if historical.len() >= self.cfg.min_historical_points {
            let historical_hashrate = mean(historical.iter().map(|s| s.hashrate)).unwrap_or(0.0);
            if historical_hashrate > 0.0 {
                let drop_percent =
                    (historical_hashrate - recent_hashrate) / historical_hashrate * 100.0;
                if drop_percent > self.cfg.performance_threshold {
                    return Ok(Some(Trigger::PerformanceDrop {
                        recent: recent_hashrate,
                        historical: historical_hashrate,
                        drop_percent,
                    }));
                }
            }
        }

        if recent_temperature > self.target_temperature + self.cfg.temperature_margin {
            return Ok(Some(Trigger::Overheating {
                temperature: recent_temperature,
            }));
        }
        Ok(None)
    }
}
