//! # Telemetry Recorder
//!
//! ## Responsibility
//! Poll the device on a fixed interval and append every snapshot to the
//! store, so the scheduler has history to reason about.
//!
//! ## Guarantees
//! - **Non-panicking**: poll and store failures are soft-logged and the loop
//!   carries on.
//! - **Escalating**: after `error_threshold` consecutive poll failures the
//!   log level rises from WARN to ERROR.
//! - **Stoppable**: exits promptly when the shutdown channel flips to `true`.
//!
//! ## NOT Responsible For
//! - Interpreting the history (that belongs to `tune::scheduler`)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::device::{DeviceClient, DeviceError};
use crate::metrics;
use crate::store::TelemetryStore;
use crate::telemetry::TelemetrySample;

/// Consecutive failures before the recorder logs at ERROR.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 5;

/// Polls a device into a [`TelemetryStore`].
pub struct Recorder {
    device: Arc<dyn DeviceClient>,
    store: Arc<dyn TelemetryStore>,
    interval: Duration,
    error_threshold: u32,
}

impl Recorder {
    /// Create a recorder polling every `interval`.
    pub fn new(
        device: Arc<dyn DeviceClient>,
        store: Arc<dyn TelemetryStore>,
        interval: Duration,
    ) -> Self {
        Self {
            device,
            store,
            interval,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
        }
    }

    /// Override the WARN→ERROR escalation threshold.
    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold.max(1);
        self
    }

    /// Poll once and store the result.
    ///
    /// # Errors
    ///
    /// Returns the device error if the poll failed. Store failures are
    /// logged and do not make the poll fail.
    pub async fn poll_once(&self) -> Result<TelemetrySample, DeviceError> {
        let sample = self.device.get_status().await?;
        if let Err(e) = self.store.insert_sample(&sample).await {
            warn!(error = %e, "failed to store telemetry sample");
        }
        Ok(sample)
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Poll until `shutdown` becomes `true` or its sender is dropped.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(sample) => {
                    failures = 0;
                    metrics::record_poll("ok");
                    trace!(
                        hashrate = sample.hashrate,
                        temperature = sample.temperature,
                        frequency = sample.frequency,
                        "recorder: tick"
                    );
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    metrics::record_poll("error");
                    if failures >= self.error_threshold {
                        error!(
                            error = %e,
                            consecutive_failures = failures,
                            "recorder: repeated poll failures"
                        );
                    } else {
                        warn!(error = %e, "recorder: poll failed, will retry");
                    }
                }
            }
        }
        debug!("recorder stopped");
    }
}
