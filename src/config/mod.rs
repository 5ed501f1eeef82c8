//! # Autotuner Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML configuration that drives the device client,
//! the tuning engine, the scheduler and the ambient collaborators.
//! ```text
//! bitaxe-autotune --config autotune.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `TunerConfig`
//! - Total: every field has a documented default, an empty file is valid
//! - Validated: semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Talking to the device (that belongs to `device`)
//! - Deciding when to tune (that belongs to `tune::scheduler`)

pub mod loader;
pub mod validation;

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ──────────────────────────────────────────────

fn default_host() -> String {
    "192.168.1.100".to_string()
}

fn default_port() -> u16 {
    80
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_target_temperature() -> f64 {
    75.0
}

fn default_min_improvement() -> f64 {
    5.0
}

fn default_stability_threshold() -> f64 {
    0.95
}

fn default_thermal_margin() -> f64 {
    10.0
}

fn default_test_duration_secs() -> u64 {
    300
}

fn default_sample_interval_secs() -> u64 {
    10
}

fn default_settle_secs() -> u64 {
    30
}

fn default_command_gap_secs() -> u64 {
    2
}

fn default_restore_settle_secs() -> u64 {
    10
}

fn default_baseline_samples() -> usize {
    12
}

fn default_baseline_interval_secs() -> u64 {
    5
}

fn default_frequency_tolerance_mhz() -> u32 {
    5
}

fn default_voltage_tolerance() -> f64 {
    0.05
}

fn default_overshoot_penalty() -> f64 {
    0.1
}

fn default_min_frequency() -> u32 {
    400
}

fn default_max_frequency() -> u32 {
    600
}

fn default_min_voltage() -> f64 {
    1.0
}

fn default_max_voltage() -> f64 {
    1.4
}

fn default_frequency_steps() -> Vec<u32> {
    vec![400, 450, 500, 525, 550, 575, 600]
}

fn default_voltage_steps() -> Vec<f64> {
    vec![1.0, 1.1, 1.15, 1.2, 1.25, 1.3, 1.35, 1.4]
}

/// Stepped voltage de-rating: the higher the clock, the lower the ceiling.
fn default_derating() -> Vec<DeratingRule> {
    vec![
        DeratingRule {
            min_frequency: 575,
            max_voltage: 1.30,
        },
        DeratingRule {
            min_frequency: 550,
            max_voltage: 1.35,
        },
    ]
}

fn default_check_interval_secs() -> u64 {
    3600
}

fn default_min_runtime_hours() -> u64 {
    24
}

fn default_performance_threshold() -> f64 {
    5.0
}

fn default_recent_window_hours() -> u64 {
    6
}

fn default_historical_window_hours() -> u64 {
    168
}

fn default_min_recent_points() -> usize {
    10
}

fn default_min_historical_points() -> usize {
    100
}

fn default_temperature_margin() -> f64 {
    5.0
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_samples() -> usize {
    200_000
}

fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an autotuner instance.
///
/// Every section is optional in the TOML file and falls back to its
/// defaults, so an empty file deserializes to [`TunerConfig::default`].
///
/// # Example
///
/// ```toml
/// [device]
/// host = "10.0.0.42"
///
/// [optimization]
/// auto_optimize = true
/// target_temperature = 70.0
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TunerConfig {
    /// Device control-plane connection.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Tuning thresholds and timing.
    #[serde(default)]
    pub optimization: OptimizationConfig,
    /// Absolute bounds, search grid and voltage de-rating.
    #[serde(default)]
    pub safety: SafetyConfig,
    /// Auto-optimize scheduler policy.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Telemetry history retention.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Outbound notification of tuning results.
    #[serde(default)]
    pub notifications: NotificationConfig,
}

// ── Device ───────────────────────────────────────────────────────────────

/// How to reach the device's REST API.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DeviceConfig {
    /// Host name or IP address of the device.
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP port of the device API.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Seconds between telemetry polls made by the recorder.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl DeviceConfig {
    /// Base URL of the device API, e.g. `http://192.168.1.100:80`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Per-request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Recorder polling interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

// ── Optimization ─────────────────────────────────────────────────────────

/// Acceptance thresholds and timing of a tuning session.
///
/// Defaults: 12 baseline samples 5 s apart, 30 s settle after each
/// reconfiguration, 300 s of testing sampled every 10 s.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OptimizationConfig {
    /// Whether the background scheduler may start sessions on its own.
    #[serde(default)]
    pub auto_optimize: bool,
    /// Thermal ceiling (°C) for the average temperature of an accepted test.
    #[serde(default = "default_target_temperature")]
    pub target_temperature: f64,
    /// Minimum hashrate improvement (%) for a candidate to count as success.
    #[serde(default = "default_min_improvement")]
    pub min_hashrate_improvement: f64,
    /// Minimum stability score in `[0, 1]` for a candidate to be accepted.
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold: f64,
    /// A single sample hotter than `target_temperature + thermal_margin`
    /// aborts the test in progress.
    #[serde(default = "default_thermal_margin")]
    pub thermal_margin: f64,
    /// Seconds of sampling per candidate.
    #[serde(default = "default_test_duration_secs")]
    pub test_duration_secs: u64,
    /// Seconds between samples while testing a candidate.
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    /// Seconds to wait after both commands before trusting telemetry.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// Seconds between the frequency and the voltage command.
    #[serde(default = "default_command_gap_secs")]
    pub command_gap_secs: u64,
    /// Seconds to wait after restoring baseline settings.
    #[serde(default = "default_restore_settle_secs")]
    pub restore_settle_secs: u64,
    /// Number of status polls in the baseline window.
    #[serde(default = "default_baseline_samples")]
    pub baseline_samples: usize,
    /// Seconds between baseline polls.
    #[serde(default = "default_baseline_interval_secs")]
    pub baseline_interval_secs: u64,
    /// Allowed frequency deviation (MHz) when verifying applied settings.
    #[serde(default = "default_frequency_tolerance_mhz")]
    pub frequency_tolerance_mhz: u32,
    /// Allowed voltage deviation (V) when verifying applied settings.
    #[serde(default = "default_voltage_tolerance")]
    pub voltage_tolerance: f64,
    /// Score penalty per °C the test average ran above `target_temperature`.
    #[serde(default = "default_overshoot_penalty")]
    pub overshoot_penalty: f64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            auto_optimize: false,
            target_temperature: default_target_temperature(),
            min_hashrate_improvement: default_min_improvement(),
            stability_threshold: default_stability_threshold(),
            thermal_margin: default_thermal_margin(),
            test_duration_secs: default_test_duration_secs(),
            sample_interval_secs: default_sample_interval_secs(),
            settle_secs: default_settle_secs(),
            command_gap_secs: default_command_gap_secs(),
            restore_settle_secs: default_restore_settle_secs(),
            baseline_samples: default_baseline_samples(),
            baseline_interval_secs: default_baseline_interval_secs(),
            frequency_tolerance_mhz: default_frequency_tolerance_mhz(),
            voltage_tolerance: default_voltage_tolerance(),
            overshoot_penalty: default_overshoot_penalty(),
        }
    }
}

impl OptimizationConfig {
    /// Number of samples drawn while testing one candidate.
    ///
    /// `test_duration_secs / sample_interval_secs`, or `0` when the interval
    /// is zero (rejected by validation).
    pub fn test_sample_count(&self) -> usize {
        if self.sample_interval_secs == 0 {
            return 0;
        }
        (self.test_duration_secs / self.sample_interval_secs) as usize
    }

    /// Temperature above which a single sample trips the thermal interlock.
    pub fn interlock_temperature(&self) -> f64 {
        self.target_temperature + self.thermal_margin
    }

    /// Interval between test samples.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    /// Settling pause after reconfiguration.
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    /// Pause between the frequency and voltage commands.
    pub fn command_gap(&self) -> Duration {
        Duration::from_secs(self.command_gap_secs)
    }

    /// Settling pause after restoring baseline settings.
    pub fn restore_settle(&self) -> Duration {
        Duration::from_secs(self.restore_settle_secs)
    }

    /// Interval between baseline samples.
    pub fn baseline_interval(&self) -> Duration {
        Duration::from_secs(self.baseline_interval_secs)
    }
}

// ── Safety ───────────────────────────────────────────────────────────────

/// One step of the voltage de-rating table.
///
/// At or above `min_frequency` MHz, voltages above `max_voltage` are unsafe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DeratingRule {
    /// Frequency (MHz) from which this cap applies.
    pub min_frequency: u32,
    /// Highest voltage (V) allowed at or above `min_frequency`.
    pub max_voltage: f64,
}

/// Absolute operating bounds and the search grid.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SafetyConfig {
    /// Lowest frequency (MHz) ever commanded.
    #[serde(default = "default_min_frequency")]
    pub min_frequency: u32,
    /// Highest frequency (MHz) ever commanded.
    #[serde(default = "default_max_frequency")]
    pub max_frequency: u32,
    /// Lowest voltage (V) ever commanded.
    #[serde(default = "default_min_voltage")]
    pub min_voltage: f64,
    /// Highest voltage (V) ever commanded.
    #[serde(default = "default_max_voltage")]
    pub max_voltage: f64,
    /// Frequency axis of the search grid (MHz).
    #[serde(default = "default_frequency_steps")]
    pub frequency_steps: Vec<u32>,
    /// Voltage axis of the search grid (V).
    #[serde(default = "default_voltage_steps")]
    pub voltage_steps: Vec<f64>,
    /// Voltage caps that tighten as frequency rises.
    #[serde(default = "default_derating")]
    pub derating: Vec<DeratingRule>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_frequency: default_min_frequency(),
            max_frequency: default_max_frequency(),
            min_voltage: default_min_voltage(),
            max_voltage: default_max_voltage(),
            frequency_steps: default_frequency_steps(),
            voltage_steps: default_voltage_steps(),
            derating: default_derating(),
        }
    }
}

// ── Scheduler ────────────────────────────────────────────────────────────

/// When the background scheduler considers re-tuning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SchedulerConfig {
    /// Seconds between scheduler wake-ups.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Minimum hours between two scheduler-triggered sessions.
    #[serde(default = "default_min_runtime_hours")]
    pub min_runtime_hours: u64,
    /// Hashrate drop (%) of recent vs historical mean that triggers a session.
    #[serde(default = "default_performance_threshold")]
    pub performance_threshold: f64,
    /// Size of the "recent" telemetry window in hours.
    #[serde(default = "default_recent_window_hours")]
    pub recent_window_hours: u64,
    /// Size of the "historical" telemetry window in hours.
    #[serde(default = "default_historical_window_hours")]
    pub historical_window_hours: u64,
    /// Recent points required before any decision is made.
    #[serde(default = "default_min_recent_points")]
    pub min_recent_points: usize,
    /// Historical points required before the drop comparison is made.
    #[serde(default = "default_min_historical_points")]
    pub min_historical_points: usize,
    /// Recent mean temperature above `target_temperature + margin` triggers.
    #[serde(default = "default_temperature_margin")]
    pub temperature_margin: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            min_runtime_hours: default_min_runtime_hours(),
            performance_threshold: default_performance_threshold(),
            recent_window_hours: default_recent_window_hours(),
            historical_window_hours: default_historical_window_hours(),
            min_recent_points: default_min_recent_points(),
            min_historical_points: default_min_historical_points(),
            temperature_margin: default_temperature_margin(),
        }
    }
}

impl SchedulerConfig {
    /// Interval between scheduler checks.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Minimum time between two scheduler-triggered sessions.
    pub fn min_runtime(&self) -> Duration {
        Duration::from_secs(self.min_runtime_hours.saturating_mul(3600))
    }
}

// ── Storage ──────────────────────────────────────────────────────────────

/// Retention of recorded telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StorageConfig {
    /// Samples older than this many days are discarded.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Hard cap on retained samples regardless of age.
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            max_samples: default_max_samples(),
        }
    }
}

// ── Notifications ────────────────────────────────────────────────────────

/// Outbound delivery of tuning results.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct NotificationConfig {
    /// Master switch. When off, results are only logged.
    #[serde(default)]
    pub enabled: bool,
    /// Whether to send a message when a session finishes.
    #[serde(default = "default_true")]
    pub notify_on_optimal: bool,
    /// Webhook receiving a JSON `{subject, body, outcome}` POST.
    pub webhook_url: Option<String>,
    /// Webhook request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            notify_on_optimal: true,
            webhook_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Render the JSON Schema of [`TunerConfig`] as pretty-printed JSON.
///
/// # Errors
///
/// Returns the serializer error if the schema cannot be encoded.
pub fn json_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(TunerConfig);
    serde_json::to_string_pretty(&schema)
}
