//! Prometheus metrics for the tuning engine.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`record_session`, `record_candidate`, …) are no-ops if `init_metrics`
//! was never called, so the engine always runs; observability simply
//! degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `autotune_sessions_total` | Counter | `result` |
//! | `autotune_candidates_total` | Counter | `verdict` |
//! | `autotune_session_running` | Gauge | |
//! | `autotune_last_improvement_percent` | Gauge | |
//! | `autotune_telemetry_polls_total` | Counter | `outcome` |

use std::collections::HashMap;
use std::sync::OnceLock;

use prometheus::{
    core::Collector, CounterVec, Encoder, Gauge, IntGauge, Opts, Registry, TextEncoder,
};

use crate::TunerError;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All autotuner metrics, bundled so they can be stored in a single
/// [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Finished sessions by result.
    pub sessions_total: CounterVec,
    /// Tested candidates by verdict.
    pub candidates_total: CounterVec,
    /// 1 while a session holds the single-flight gate.
    pub session_running: IntGauge,
    /// Improvement of the most recently applied settings.
    pub last_improvement: Gauge,
    /// Recorder polls by outcome.
    pub polls_total: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn init_err(e: prometheus::Error) -> TunerError {
    TunerError::Other(format!("metrics init failed: {e}"))
}

fn build(prefix: &str) -> Result<Metrics, prometheus::Error> {
    let registry = Registry::new();

    let sessions_total = CounterVec::new(
        Opts::new(
            format!("{prefix}_sessions_total"),
            "Finished tuning sessions by result",
        ),
        &["result"],
    )?;
    registry.register(Box::new(sessions_total.clone()))?;

    let candidates_total = CounterVec::new(
        Opts::new(
            format!("{prefix}_candidates_total"),
            "Tested candidates by verdict",
        ),
        &["verdict"],
    )?;
    registry.register(Box::new(candidates_total.clone()))?;

    let session_running = IntGauge::new(
        format!("{prefix}_session_running"),
        "Whether a tuning session is in progress",
    )?;
    registry.register(Box::new(session_running.clone()))?;

    let last_improvement = Gauge::new(
        format!("{prefix}_last_improvement_percent"),
        "Hashrate improvement of the last applied settings",
    )?;
    registry.register(Box::new(last_improvement.clone()))?;

    let polls_total = CounterVec::new(
        Opts::new(
            format!("{prefix}_telemetry_polls_total"),
            "Recorder status polls by outcome",
        ),
        &["outcome"],
    )?;
    registry.register(Box::new(polls_total.clone()))?;

    Ok(Metrics {
        registry,
        sessions_total,
        candidates_total,
        session_running,
        last_improvement,
        polls_total,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`TunerError::Other`] if metric construction or registration
/// fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), TunerError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = build("autotune").map_err(init_err)?;
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a finished session under `result`
/// (`improved`, `unchanged`, `failed`, `cancelled`).
///
/// No-op if metrics have not been initialised.
pub fn record_session(result: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.sessions_total.get_metric_with_label_values(&[result]) {
            c.inc();
        }
    }
}

/// Count a tested candidate under `verdict`.
///
/// No-op if metrics have not been initialised.
pub fn record_candidate(verdict: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.candidates_total.get_metric_with_label_values(&[verdict]) {
            c.inc();
        }
    }
}

/// Count a recorder poll under `outcome` (`ok`, `error`).
///
/// No-op if metrics have not been initialised.
pub fn record_poll(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.polls_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Set the session-running gauge.
///
/// No-op if metrics have not been initialised.
pub fn set_session_running(running: bool) {
    if let Some(m) = metrics() {
        m.session_running.set(i64::from(running));
    }
}

/// Record the improvement of newly applied settings.
///
/// No-op if metrics have not been initialised.
pub fn set_last_improvement(percent: f64) {
    if let Some(m) = metrics() {
        m.last_improvement.set(percent);
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Counter values keyed by label, for the end-of-run summary.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Sessions keyed by result.
    pub sessions: HashMap<String, u64>,
    /// Candidates keyed by verdict.
    pub candidates: HashMap<String, u64>,
}

fn by_label(vec: &CounterVec, label: &str) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let key = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == label)
                .map_or("unknown", |l| l.get_value());
            out.insert(key.to_string(), metric.get_counter().get_value() as u64);
        }
    }
    out
}

/// Return a structured summary of current counter values.
///
/// Returns an empty [`MetricsSummary`] if metrics have not been initialised.
pub fn get_metrics_summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };
    MetricsSummary {
        sessions: by_label(&m.sessions_total, "result"),
        candidates: by_label(&m.candidates_total, "verdict"),
    }
}
