//! # Telemetry
//!
//! ## Responsibility
//! Capture bounded windows of device status snapshots and reduce them to
//! averages.
//!
//! ## Guarantees
//! - A window issues at most `count` requests and never retries
//! - A failed request is logged and skipped; it does not extend the window
//! - The window stops early once the stop signal is raised
//! - No sleep follows the last request
//!
//! ## NOT Responsible For
//! - Deciding whether a window is large enough (callers check
//!   [`min_required`])
//! - Persisting samples (that belongs to `recorder` and `store`)

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::device::{DeviceClient, DeviceError};
use crate::tune::signal::{sleep_or_stop, StopSignal};

/// One device status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Hashrate in GH/s.
    pub hashrate: f64,
    /// ASIC temperature in °C.
    pub temperature: f64,
    /// Power draw in W.
    pub power: f64,
    /// Core voltage in effect (V).
    pub voltage: f64,
    /// Clock frequency in effect (MHz).
    pub frequency: u32,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    /// Build a sample stamped with the current time.
    pub fn new(hashrate: f64, temperature: f64, power: f64, voltage: f64, frequency: u32) -> Self {
        Self {
            hashrate,
            temperature,
            power,
            voltage,
            frequency,
            timestamp: Utc::now(),
        }
    }

    /// Replace the capture time.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Minimum number of samples a window of `target` must yield before its
/// aggregate is trusted.
pub fn min_required(target: usize) -> usize {
    target / 2
}

/// Arithmetic mean, or `None` for an empty input.
pub fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Averages over a window of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSummary {
    /// Number of samples aggregated.
    pub count: usize,
    /// Mean hashrate (GH/s).
    pub avg_hashrate: f64,
    /// Mean temperature (°C).
    pub avg_temperature: f64,
    /// Mean power (W).
    pub avg_power: f64,
    /// Frequency reported by the last sample (MHz).
    pub frequency: u32,
    /// Voltage reported by the last sample (V).
    pub voltage: f64,
}

impl SampleSummary {
    /// Summarise `samples`, or `None` if there are none.
    pub fn from_samples(samples: &[TelemetrySample]) -> Option<Self> {
        let last = samples.last()?;
        Some(Self {
            count: samples.len(),
            avg_hashrate: mean(samples.iter().map(|s| s.hashrate))?,
            avg_temperature: mean(samples.iter().map(|s| s.temperature))?,
            avg_power: mean(samples.iter().map(|s| s.power))?,
            frequency: last.frequency,
            voltage: last.voltage,
        })
    }
}

/// One step of a [`SampleWindow`].
#[derive(Debug, Clone)]
pub enum SampleTick {
    /// The device answered.
    Sample(TelemetrySample),
    /// The request failed; the slot is consumed.
    Missed(DeviceError),
}

/// Issues sampling windows against a device.
#[derive(Clone)]
pub struct TelemetrySampler {
    device: Arc<dyn DeviceClient>,
}

impl TelemetrySampler {
    /// Create a sampler for `device`.
    pub fn new(device: Arc<dyn DeviceClient>) -> Self {
        Self { device }
    }

    /// Open a lazy window of `count` requests spaced `interval` apart.
    pub fn window(&self, count: usize, interval: Duration, stop: &StopSignal) -> SampleWindow {
        SampleWindow {
            device: Arc::clone(&self.device),
            remaining: count,
            issued: 0,
            interval,
            stop: stop.clone(),
            interrupted: false,
        }
    }

    /// Drain a whole window, keeping successful samples in order.
    ///
    /// The result has at most `count` entries.
    pub async fn sample(
        &self,
        count: usize,
        interval: Duration,
        stop: &StopSignal,
    ) -> Vec<TelemetrySample> {
        let mut window = self.window(count, interval, stop);
        let mut samples = Vec::with_capacity(count);
        while let Some(tick) = window.next().await {
            if let SampleTick::Sample(s) = tick {
                samples.push(s);
            }
        }
        samples
    }
}

/// Finite, non-restartable sequence of status requests.
///
/// Each call to [`next`](Self::next) waits out the interval (except before
/// the first request) and issues exactly one request.
pub struct SampleWindow {
    device: Arc<dyn DeviceClient>,
    remaining: usize,
    issued: usize,
    interval: Duration,
    stop: StopSignal,
    interrupted: bool,
}

impl SampleWindow {
    /// Advance the window. Returns `None` when exhausted or stopped.
    pub async fn next(&mut self) -> Option<SampleTick> {
        if self.remaining == 0 {
            return None;
        }
        if self.stop.is_requested() {
            self.halt();
            return None;
        }
        if self.issued > 0 && !sleep_or_stop(self.interval, &self.stop).await {
            self.halt();
            return None;
        }

        self.remaining -= 1;
        self.issued += 1;

        match self.device.get_status().await {
            Ok(sample) => Some(SampleTick::Sample(sample)),
            Err(e) => {
                warn!(error = %e, request = self.issued, "status request failed, skipping sample");
                Some(SampleTick::Missed(e))
            }
        }
    }

    /// Whether the window ended because the stop signal was raised.
    pub fn was_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Requests issued so far.
    pub fn issued(&self) -> usize {
        self.issued
    }

    fn halt(&mut self) {
        self.remaining = 0;
        self.interrupted = true;
    }
}
