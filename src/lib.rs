//! # bitaxe-autotune
//!
//! Frequency/voltage autotuner for Bitaxe-class ASIC miners over Tokio.
//!
//! ## Architecture
//!
//! ```text
//! AutoScheduler ──trigger──► SessionController ──candidates──► SettingsTester
//!       ▲                          │                                │
//!       │                          ├──► TelemetryStore              ▼
//!  TelemetryStore ◄── Recorder     └──► Notifier            TelemetrySampler
//!                        │                                          │
//!                        └──────────────► DeviceClient ◄────────────┘
//! ```
//!
//! The tuning engine lives in [`tune`]; everything it talks to sits behind a
//! trait ([`device::DeviceClient`], [`store::TelemetryStore`],
//! [`notify::Notifier`]) so the engine can be driven against real hardware or
//! a [`device::SimulatedDevice`].

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod device;
pub mod metrics;
pub mod notify;
pub mod recorder;
pub mod store;
pub mod telemetry;
pub mod tune;

// Re-exports for convenience
pub use config::TunerConfig;
pub use device::{BitaxeClient, DeviceClient, DeviceError, SimulatedDevice};
pub use telemetry::TelemetrySample;
pub use tune::{
    scheduler::AutoScheduler,
    session::{SessionController, SessionState, SessionStatus},
    Baseline, Candidate, TestOutcome,
};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` : structured JSON output for log aggregators
/// - anything else (including unset) : human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`TunerError::Other`] if the global subscriber has already been
/// set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), TunerError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| TunerError::Other(format!("tracing init failed: {e}")))
}

/// Top-level autotuner errors.
///
/// Surfaces that cross the binary boundary are mapped to a variant here.
/// The tuning engine itself never returns these to its callers; sessions
/// report `Option<TestOutcome>` instead.
#[derive(Error, Debug)]
pub enum TunerError {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] config::validation::ConfigError),

    /// The device control plane could not be reached or rejected a request.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}
