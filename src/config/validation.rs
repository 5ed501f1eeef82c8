//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`TunerConfig`] that cannot be
//! expressed through the type system alone (ranges, ordering between bounds,
//! grid points outside the absolute envelope).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::TunerConfig;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "safety.max_voltage").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on a [`TunerConfig`].
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &TunerConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Device ───────────────────────────────────────────────────────
    if config.device.host.trim().is_empty() {
        errors.push(invalid("device.host", "", "host must not be empty"));
    }
    if config.device.timeout_secs == 0 {
        errors.push(invalid("device.timeout_secs", 0, "must be at least 1 second"));
    }
    if config.device.poll_interval_secs == 0 {
        errors.push(invalid(
            "device.poll_interval_secs",
            0,
            "must be at least 1 second",
        ));
    }

    // ── Optimization ─────────────────────────────────────────────────
    let opt = &config.optimization;
    if !(0.0..=1.0).contains(&opt.stability_threshold) {
        errors.push(invalid(
            "optimization.stability_threshold",
            opt.stability_threshold,
            "must be between 0.0 and 1.0",
        ));
    }
    if opt.min_hashrate_improvement < 0.0 {
        errors.push(invalid(
            "optimization.min_hashrate_improvement",
            opt.min_hashrate_improvement,
            "must not be negative",
        ));
    }
    if opt.thermal_margin < 0.0 {
        errors.push(invalid(
            "optimization.thermal_margin",
            opt.thermal_margin,
            "must not be negative",
        ));
    }
    if opt.sample_interval_secs == 0 {
        errors.push(invalid(
            "optimization.sample_interval_secs",
            0,
            "must be at least 1 second",
        ));
    } else if opt.test_sample_count() < 2 {
        errors.push(invalid(
            "optimization.test_duration_secs",
            opt.test_duration_secs,
            "must allow at least 2 samples at sample_interval_secs",
        ));
    }
    if opt.baseline_samples < 2 {
        errors.push(invalid(
            "optimization.baseline_samples",
            opt.baseline_samples,
            "must be at least 2",
        ));
    }
    if opt.voltage_tolerance < 0.0 {
        errors.push(invalid(
            "optimization.voltage_tolerance",
            opt.voltage_tolerance,
            "must not be negative",
        ));
    }

    // ── Safety envelope ──────────────────────────────────────────────
    let safety = &config.safety;
    if safety.min_frequency > safety.max_frequency {
        errors.push(invalid(
            "safety.min_frequency",
            safety.min_frequency,
            "must be \u{2264} max_frequency",
        ));
    }
    if safety.min_voltage > safety.max_voltage {
        errors.push(invalid(
            "safety.min_voltage",
            safety.min_voltage,
            "must be \u{2264} max_voltage",
        ));
    }
    if safety.min_voltage <= 0.0 {
        errors.push(invalid(
            "safety.min_voltage",
            safety.min_voltage,
            "must be positive",
        ));
    }
    if safety.frequency_steps.is_empty() {
        errors.push(invalid(
            "safety.frequency_steps",
            "[]",
            "search grid needs at least one frequency",
        ));
    }
    if safety.voltage_steps.is_empty() {
        errors.push(invalid(
            "safety.voltage_steps",
            "[]",
            "search grid needs at least one voltage",
        ));
    }
    for rule in &safety.derating {
        if rule.max_voltage <= 0.0 {
            errors.push(invalid(
                "safety.derating.max_voltage",
                rule.max_voltage,
                "must be positive",
            ));
        }
    }

    // ── Scheduler ────────────────────────────────────────────────────
    let sched = &config.scheduler;
    if sched.check_interval_secs == 0 {
        errors.push(invalid(
            "scheduler.check_interval_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if sched.recent_window_hours == 0 {
        errors.push(invalid(
            "scheduler.recent_window_hours",
            0,
            "must be at least 1 hour",
        ));
    }
    if sched.historical_window_hours < sched.recent_window_hours {
        errors.push(invalid(
            "scheduler.historical_window_hours",
            sched.historical_window_hours,
            "must be \u{2265} recent_window_hours",
        ));
    }
    if sched.performance_threshold < 0.0 {
        errors.push(invalid(
            "scheduler.performance_threshold",
            sched.performance_threshold,
            "must not be negative",
        ));
    }

    // ── Notifications ────────────────────────────────────────────────
    if let Some(url) = &config.notifications.webhook_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(invalid(
                "notifications.webhook_url",
                url,
                "must be an http(s) URL",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
