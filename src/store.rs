//! # Telemetry Store
//!
//! ## Responsibility
//! Keep recorded telemetry and the history of optimization results, and
//! answer time-window queries for the scheduler.
//!
//! ## Guarantees
//! - Samples older than the retention period are discarded on insert
//! - The number of retained samples never exceeds `max_samples`
//! - Queries return samples oldest first
//!
//! ## NOT Responsible For
//! - Durable persistence (the in-memory store forgets on restart)
//! - Deciding what the history means (that belongs to `tune::scheduler`)

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::StorageConfig;
use crate::telemetry::TelemetrySample;
use crate::tune::TestOutcome;

/// Upper bound on retention and query windows (100 years).
const MAX_WINDOW_DAYS: u64 = 36_500;

/// Errors returned by a [`TelemetryStore`].
///
/// Callers log these and carry on; the tuning engine never fails because
/// history could not be written or read.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An internal lock was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    LockPoisoned,
}

/// A stored optimization result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationRecord {
    /// When the result was stored.
    pub recorded_at: DateTime<Utc>,
    /// The result itself.
    pub outcome: TestOutcome,
}

/// History consumed by the scheduler and written by the recorder and the
/// session controller.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Append one telemetry sample.
    async fn insert_sample(&self, sample: &TelemetrySample) -> Result<(), StoreError>;

    /// Append one optimization result.
    async fn insert_optimization_result(&self, outcome: &TestOutcome) -> Result<(), StoreError>;

    /// Samples captured within the last `hours`, oldest first.
    async fn get_recent_samples(&self, hours: u64) -> Result<Vec<TelemetrySample>, StoreError>;

    /// Every stored optimization result, oldest first.
    async fn optimization_history(&self) -> Result<Vec<OptimizationRecord>, StoreError>;
}

/// Bounded in-process store.
pub struct MemoryStore {
    samples: Mutex<VecDeque<TelemetrySample>>,
    results: Mutex<Vec<OptimizationRecord>>,
    retention: chrono::Duration,
    max_samples: usize,
}

impl MemoryStore {
    /// Create a store with the given retention policy.
    pub fn new(cfg: &StorageConfig) -> Self {
        let days = u64::from(cfg.retention_days).min(MAX_WINDOW_DAYS) as i64;
        Self {
            samples: Mutex::new(VecDeque::new()),
            results: Mutex::new(Vec::new()),
            retention: chrono::Duration::days(days),
            max_samples: cfg.max_samples.max(1),
        }
    }

    /// Number of samples currently retained.
    pub fn sample_count(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&StorageConfig::default())
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn insert_sample(&self, sample: &TelemetrySample) -> Result<(), StoreError> {
        let cutoff = Utc::now() - self.retention;
        let mut samples = self.samples.lock().map_err(|_| StoreError::LockPoisoned)?;
        samples.push_back(sample.clone());
        while samples.front().is_some_and(|s| s.timestamp < cutoff) {
            samples.pop_front();
        }
        while samples.len() > self.max_samples {
            samples.pop_front();
        }
        Ok(())
    }

    async fn insert_optimization_result(&self, outcome: &TestOutcome) -> Result<(), StoreError> {
        let mut results = self.results.lock().map_err(|_| StoreError::LockPoisoned)?;
        results.push(OptimizationRecord {
            recorded_at: Utc::now(),
            outcome: outcome.clone(),
        });
        Ok(())
    }

    async fn get_recent_samples(&self, hours: u64) -> Result<Vec<TelemetrySample>, StoreError> {
        let hours = hours.min(MAX_WINDOW_DAYS * 24) as i64;
        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        let samples = self.samples.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut recent: Vec<TelemetrySample> = samples
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect();
        recent.sort_by_key(|s| s.timestamp);
        Ok(recent)
    }

    async fn optimization_history(&self) -> Result<Vec<OptimizationRecord>, StoreError> {
        let results = self.results.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(results.clone())
    }
}
