//! Device control-plane abstraction and implementations
//!
//! Provides the [`DeviceClient`] trait and two implementations:
//! - [`BitaxeClient`]: the device's REST API over HTTP/JSON
//! - [`SimulatedDevice`]: deterministic in-process model for demos and tests
//!
//! Every call is a single request. A successful `set_*` means the device
//! accepted the command, not that it has taken effect; callers must let the
//! hardware settle before trusting the next status.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::DeviceConfig;
use crate::telemetry::TelemetrySample;

/// Errors returned by a [`DeviceClient`].
///
/// Timeouts, connection failures and protocol errors are kept apart so that
/// callers can log them differently; the tuning engine treats all of them as
/// a missed sample (status) or a rejected command (set).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    /// The request did not complete within the configured timeout.
    #[error("device request timed out")]
    Timeout,

    /// The device could not be reached.
    #[error("device connection failed: {0}")]
    Connection(String),

    /// The device answered with a non-success HTTP status.
    #[error("device returned HTTP {status}")]
    Http {
        /// HTTP status code.
        status: u16,
    },

    /// The response could not be decoded.
    #[error("device protocol error: {0}")]
    Protocol(String),

    /// The device refused the command.
    #[error("device rejected command: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for DeviceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeviceError::Timeout
        } else if e.is_connect() {
            DeviceError::Connection(e.to_string())
        } else if let Some(status) = e.status() {
            DeviceError::Http {
                status: status.as_u16(),
            }
        } else if e.is_decode() {
            DeviceError::Protocol(e.to_string())
        } else {
            DeviceError::Connection(e.to_string())
        }
    }
}

/// Control-plane operations the tuning engine needs from a device.
///
/// Implementations must be thread-safe (Send + Sync); the same client is
/// shared by the recorder, the scheduler and the session worker.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Fetch one telemetry snapshot.
    async fn get_status(&self) -> Result<TelemetrySample, DeviceError>;

    /// Command a new ASIC clock frequency in MHz.
    async fn set_frequency(&self, mhz: u32) -> Result<(), DeviceError>;

    /// Command a new ASIC core voltage in volts.
    async fn set_voltage(&self, volts: f64) -> Result<(), DeviceError>;
}

// ============================================================================
// Bitaxe REST client
// ============================================================================

/// Subset of `GET /api/system/status` the tuner consumes.
///
/// `hashRate` is reported in H/s and converted to GH/s.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    #[serde(default)]
    hash_rate: f64,
    #[serde(default)]
    temp: f64,
    #[serde(default)]
    power: f64,
    #[serde(default)]
    voltage: f64,
    #[serde(default)]
    frequency: f64,
}

impl StatusPayload {
    fn into_sample(self) -> TelemetrySample {
        TelemetrySample::new(
            (self.hash_rate / 1_000_000_000.0).max(0.0),
            self.temp,
            self.power,
            self.voltage,
            self.frequency.max(0.0).round() as u32,
        )
    }
}

/// HTTP client for a Bitaxe device.
///
/// ## Example
///
/// ```no_run
/// use bitaxe_autotune::{BitaxeClient, DeviceClient};
/// use std::time::Duration;
///
/// # async fn demo() -> Result<(), bitaxe_autotune::DeviceError> {
/// let client = BitaxeClient::new("http://192.168.1.100", Duration::from_secs(10));
/// let sample = client.get_status().await?;
/// println!("{:.1} GH/s at {:.1}°C", sample.hashrate, sample.temperature);
/// # Ok(()) }
/// ```
pub struct BitaxeClient {
    client: reqwest::Client,
    base_url: String,
}

impl BitaxeClient {
    /// Create a client for `base_url` with a bounded per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create a client from the `[device]` config section.
    pub fn from_config(cfg: &DeviceConfig) -> Self {
        Self::new(cfg.base_url(), cfg.timeout())
    }

    /// Base URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check that the device answers `GET /api/system/info`.
    pub async fn ping(&self) -> Result<(), DeviceError> {
        let url = format!("{}/api/system/info", self.base_url);
        self.client.get(&url).send().await?.error_for_status()?;
        Ok(())
    }

    async fn post_setting(&self, endpoint: &str, body: serde_json::Value) -> Result<(), DeviceError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(DeviceError::Http {
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceClient for BitaxeClient {
    async fn get_status(&self) -> Result<TelemetrySample, DeviceError> {
        let url = format!("{}/api/system/status", self.base_url);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(DeviceError::Http {
                status: resp.status().as_u16(),
            });
        }

        let payload: StatusPayload = resp
            .json()
            .await
            .map_err(|e| DeviceError::Protocol(format!("status JSON: {e}")))?;

        Ok(payload.into_sample())
    }

    async fn set_frequency(&self, mhz: u32) -> Result<(), DeviceError> {
        self.post_setting("/api/system/frequency", serde_json::json!({ "frequency": mhz }))
            .await?;
        info!(frequency_mhz = mhz, "frequency command accepted");
        Ok(())
    }

    async fn set_voltage(&self, volts: f64) -> Result<(), DeviceError> {
        self.post_setting("/api/system/voltage", serde_json::json!({ "voltage": volts }))
            .await?;
        info!(voltage = volts, "voltage command accepted");
        Ok(())
    }
}

// ============================================================================
// Simulated device
// ============================================================================

/// A command received by a [`SimulatedDevice`], in arrival order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    /// `set_frequency(mhz)`.
    SetFrequency(u32),
    /// `set_voltage(volts)`.
    SetVoltage(f64),
}

/// Inputs handed to a simulation profile for one status poll.
#[derive(Debug, Clone, Copy)]
pub struct SimContext {
    /// Frequency currently in effect (MHz).
    pub frequency: u32,
    /// Voltage currently in effect (V).
    pub voltage: f64,
    /// Zero-based index of this status poll since the device was created.
    pub poll: u64,
}

/// What a simulation profile reports for one poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimReading {
    /// Hashrate in GH/s.
    pub hashrate: f64,
    /// Temperature in °C.
    pub temperature: f64,
    /// Power draw in W.
    pub power: f64,
}

type Profile = Arc<dyn Fn(SimContext) -> SimReading + Send + Sync>;

#[derive(Debug, Default)]
struct SimState {
    frequency: u32,
    voltage: f64,
    polls: u64,
    commands: Vec<DeviceCommand>,
}

/// Deterministic in-process device model.
///
/// Reports whatever its profile computes from the current settings. Records
/// every command so tests can assert on what was sent, and can inject faults
/// (failed polls, rejected commands).
pub struct SimulatedDevice {
    state: Mutex<SimState>,
    profile: Profile,
    fail_every_nth_poll: Option<u64>,
    rejected_frequencies: HashSet<u32>,
}

impl SimulatedDevice {
    /// Create a device at `frequency`/`voltage` driven by `profile`.
    pub fn new<F>(frequency: u32, voltage: f64, profile: F) -> Self
    where
        F: Fn(SimContext) -> SimReading + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(SimState {
                frequency,
                voltage,
                ..SimState::default()
            }),
            profile: Arc::new(profile),
            fail_every_nth_poll: None,
            rejected_frequencies: HashSet::new(),
        }
    }

    /// A Gamma-601-like model: throughput scales with clock, heat with clock
    /// and voltage, and an undervolted clock becomes erratic.
    pub fn bitaxe_like(frequency: u32, voltage: f64) -> Self {
        Self::new(frequency, voltage, bitaxe_profile)
    }

    /// Make every `n`th status poll fail with a connection error.
    pub fn with_failing_polls(mut self, n: u64) -> Self {
        self.fail_every_nth_poll = (n > 0).then_some(n);
        self
    }

    /// Make `set_frequency(mhz)` fail with [`DeviceError::Rejected`].
    pub fn with_rejected_frequency(mut self, mhz: u32) -> Self {
        self.rejected_frequencies.insert(mhz);
        self
    }

    /// Settings currently in effect.
    pub fn settings(&self) -> (u32, f64) {
        self.state
            .lock()
            .map(|s| (s.frequency, s.voltage))
            .unwrap_or((0, 0.0))
    }

    /// Every command received so far, oldest first.
    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.state
            .lock()
            .map(|s| s.commands.clone())
            .unwrap_or_default()
    }

    /// Number of status polls answered or failed so far.
    pub fn polls(&self) -> u64 {
        self.state.lock().map(|s| s.polls).unwrap_or(0)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> Result<T, DeviceError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| DeviceError::Protocol("simulator state poisoned".into()))?;
        Ok(f(&mut guard))
    }
}

/// Required core voltage for a clock, below which output becomes erratic.
fn required_voltage(frequency: u32) -> f64 {
    1.0 + f64::from(frequency.saturating_sub(400)) * 0.001
}

fn bitaxe_profile(ctx: SimContext) -> SimReading {
    let nominal = f64::from(ctx.frequency) * 2.2;
    let swing = if ctx.voltage + 1e-9 < required_voltage(ctx.frequency) {
        0.15
    } else {
        0.002
    };
    let sign = if ctx.poll % 2 == 0 { 1.0 } else { -1.0 };
    SimReading {
        hashrate: nominal * (1.0 + sign * swing),
        temperature: 35.0 + f64::from(ctx.frequency) * 0.05 + (ctx.voltage - 1.0) * 60.0,
        power: f64::from(ctx.frequency) * ctx.voltage * 0.03,
    }
}

#[async_trait]
impl DeviceClient for SimulatedDevice {
    async fn get_status(&self) -> Result<TelemetrySample, DeviceError> {
        let fail_every = self.fail_every_nth_poll;
        let ctx = self.with_state(|s| {
            let poll = s.polls;
            s.polls += 1;
            SimContext {
                frequency: s.frequency,
                voltage: s.voltage,
                poll,
            }
        })?;

        if let Some(n) = fail_every {
            if (ctx.poll + 1) % n == 0 {
                return Err(DeviceError::Connection("simulated poll failure".into()));
            }
        }

        let reading = (self.profile)(ctx);
        Ok(TelemetrySample::new(
            reading.hashrate,
            reading.temperature,
            reading.power,
            ctx.voltage,
            ctx.frequency,
        ))
    }

    async fn set_frequency(&self, mhz: u32) -> Result<(), DeviceError> {
        let rejected = self.rejected_frequencies.contains(&mhz);
        self.with_state(|s| {
            s.commands.push(DeviceCommand::SetFrequency(mhz));
            if !rejected {
                s.frequency = mhz;
            }
        })?;
        if rejected {
            return Err(DeviceError::Rejected(format!("frequency {mhz} MHz")));
        }
        debug!(frequency_mhz = mhz, "simulated frequency set");
        Ok(())
    }

    async fn set_voltage(&self, volts: f64) -> Result<(), DeviceError> {
        self.with_state(|s| {
            s.commands.push(DeviceCommand::SetVoltage(volts));
            s.voltage = volts;
        })?;
        debug!(voltage = volts, "simulated voltage set");
        Ok(())
    }
}
