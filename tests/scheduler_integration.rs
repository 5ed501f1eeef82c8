//! Auto-optimize scheduler driven by a pre-filled [`MemoryStore`] and a
//! [`SimulatedDevice`], on a paused Tokio clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use bitaxe_autotune::config::SafetyConfig;
use bitaxe_autotune::device::SimReading;
use bitaxe_autotune::notify::LogNotifier;
use bitaxe_autotune::store::{MemoryStore, TelemetryStore};
use bitaxe_autotune::tune::scheduler::Trigger;
use bitaxe_autotune::{
    AutoScheduler, SessionController, SimulatedDevice, TelemetrySample, TunerConfig,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config() -> TunerConfig {
    let mut cfg = TunerConfig {
        safety: SafetyConfig {
            frequency_steps: vec![500, 550],
            voltage_steps: vec![1.15],
            ..SafetyConfig::default()
        },
        ..TunerConfig::default()
    };
    cfg.optimization.auto_optimize = true;
    cfg
}

fn flat_device() -> Arc<SimulatedDevice> {
    Arc::new(SimulatedDevice::new(500, 1.15, |_| SimReading {
        hashrate: 460.0,
        temperature: 60.0,
        power: 15.0,
    }))
}

/// One sample every 20 minutes for each hour in `hours_ago`.
async fn fill(store: &MemoryStore, hours_ago: std::ops::Range<i64>, hashrate: f64) {
    for h in hours_ago {
        for m in [0, 20, 40] {
            let at = Utc::now() - chrono::Duration::hours(h) - chrono::Duration::minutes(m);
            let sample = TelemetrySample::new(hashrate, 60.0, 14.0, 1.15, 500).at(at);
            store.insert_sample(&sample).await.unwrap();
        }
    }
}

/// History that averaged 500 GH/s for a week and 460 GH/s over the last
/// six hours.
async fn degraded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::default());
    fill(&store, 7..160, 500.0).await;
    fill(&store, 0..5, 460.0).await;
    store
}

fn build(dev: Arc<SimulatedDevice>, store: Arc<MemoryStore>) -> (AutoScheduler, SessionController) {
    let cfg = config();
    let controller = SessionController::new(dev, store.clone(), Arc::new(LogNotifier), &cfg);
    let scheduler = AutoScheduler::new(controller.clone(), store, &cfg);
    (scheduler, controller)
}

// ---------------------------------------------------------------------------
// Trigger rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hashrate_drop_beyond_threshold_triggers() {
    let (scheduler, _) = build(flat_device(), degraded_store().await);

    match scheduler.should_optimize().await {
        Some(Trigger::PerformanceDrop {
            recent,
            historical,
            drop_percent,
        }) => {
            assert_eq!(recent, 460.0);
            assert!(historical > 490.0 && historical < 500.0);
            assert!(drop_percent > 5.0);
        }
        other => panic!("expected performance drop, got {other:?}"),
    }
}

#[tokio::test]
async fn sparse_history_only_checks_temperature() {
    let store = Arc::new(MemoryStore::default());
    fill(&store, 0..5, 460.0).await;
    let (scheduler, _) = build(flat_device(), store);
    assert_eq!(scheduler.should_optimize().await, None);
}

// ---------------------------------------------------------------------------
// Loop behaviour
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn first_check_runs_a_session_immediately() {
    let dev = flat_device();
    let (scheduler, controller) = build(dev.clone(), degraded_store().await);

    assert!(scheduler.start());
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
        let status = scheduler.status();
        if status.last_run.is_some() {
            break;
        }
    }

    let status = scheduler.status();
    assert_eq!(status.triggers, 1);
    assert!(!controller.is_running());
    assert!(!dev.commands().is_empty());
    assert_eq!(dev.settings(), (500, 1.15));

    scheduler.stop().await;
    assert!(!scheduler.status().running);
}

#[tokio::test(start_paused = true)]
async fn min_runtime_blocks_a_second_session() {
    let (scheduler, _) = build(flat_device(), degraded_store().await);

    scheduler.start();
    // Several check intervals, well inside the 24 h minimum runtime.
    tokio::time::sleep(Duration::from_secs(5 * 3600)).await;

    let status = scheduler.status();
    assert_eq!(status.triggers, 1);
    assert!(status.checks >= 4, "checks: {}", status.checks);
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_the_sleep_promptly() {
    let (scheduler, _) = build(flat_device(), Arc::new(MemoryStore::default()));

    scheduler.start();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(scheduler.status().checks, 1);

    let started = tokio::time::Instant::now();
    scheduler.stop().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!scheduler.status().running);
}

#[tokio::test(start_paused = true)]
async fn stop_during_session_cancels_it_and_restores_baseline() {
    let dev = flat_device();
    let (scheduler, controller) = build(dev.clone(), degraded_store().await);

    scheduler.start();
    while !controller.is_running() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    // Into the first candidate's sampling phase.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(controller.is_running());

    scheduler.stop().await;
    assert!(!controller.is_running());
    assert_eq!(dev.settings(), (500, 1.15));
    assert_eq!(scheduler.status().triggers, 1);
}

#[tokio::test]
async fn disabled_scheduler_never_starts() {
    let store = Arc::new(MemoryStore::default());
    let mut cfg = config();
    cfg.optimization.auto_optimize = false;
    let controller = SessionController::new(
        flat_device(),
        store.clone(),
        Arc::new(LogNotifier),
        &cfg,
    );
    let scheduler = AutoScheduler::new(controller, store, &cfg);
    assert!(!scheduler.start());
    assert!(!scheduler.status().running);
}
