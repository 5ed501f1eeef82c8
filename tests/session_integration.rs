//! End-to-end tuning sessions against [`SimulatedDevice`].
//!
//! All tests run on a paused Tokio clock, so multi-hour sessions complete
//! instantly while every settle and sample interval is still honoured.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;

use bitaxe_autotune::config::SafetyConfig;
use bitaxe_autotune::device::{DeviceCommand, SimContext, SimReading};
use bitaxe_autotune::notify::LogNotifier;
use bitaxe_autotune::store::{MemoryStore, OptimizationRecord, StoreError, TelemetryStore};
use bitaxe_autotune::{
    Candidate, DeviceClient, DeviceError, SessionController, SessionState, SimulatedDevice,
    TelemetrySample, TestOutcome, TunerConfig,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn at(ctx: &SimContext, frequency: u32, voltage: f64) -> bool {
    ctx.frequency == frequency && (ctx.voltage - voltage).abs() < 1e-9
}

fn reading(hashrate: f64, temperature: f64) -> SimReading {
    SimReading {
        hashrate,
        temperature,
        power: 15.0,
    }
}

/// Device that runs at 500 GH/s / 60 °C everywhere except where `special`
/// says otherwise.
fn device<F>(special: F) -> Arc<SimulatedDevice>
where
    F: Fn(&SimContext) -> Option<SimReading> + Send + Sync + 'static,
{
    Arc::new(SimulatedDevice::new(500, 1.15, move |ctx| {
        special(&ctx).unwrap_or_else(|| reading(500.0, 60.0))
    }))
}

fn small_grid_config() -> TunerConfig {
    TunerConfig {
        safety: SafetyConfig {
            frequency_steps: vec![500, 550, 600],
            voltage_steps: vec![1.15, 1.25],
            ..SafetyConfig::default()
        },
        ..TunerConfig::default()
    }
}

fn controller_with(
    dev: Arc<SimulatedDevice>,
    store: Arc<dyn TelemetryStore>,
    cfg: &TunerConfig,
) -> SessionController {
    SessionController::new(dev, store, Arc::new(LogNotifier), cfg)
}

fn restore_commands() -> [DeviceCommand; 2] {
    [
        DeviceCommand::SetFrequency(500),
        DeviceCommand::SetVoltage(1.15),
    ]
}

struct FailingStore;

#[async_trait]
impl TelemetryStore for FailingStore {
    async fn insert_sample(&self, _: &TelemetrySample) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
    async fn insert_optimization_result(&self, _: &TestOutcome) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
    async fn get_recent_samples(&self, _: u64) -> Result<Vec<TelemetrySample>, StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
    async fn optimization_history(&self) -> Result<Vec<OptimizationRecord>, StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
}

struct PanickingDevice;

#[async_trait]
impl DeviceClient for PanickingDevice {
    async fn get_status(&self) -> Result<TelemetrySample, DeviceError> {
        panic!("firmware exploded");
    }
    async fn set_frequency(&self, _: u32) -> Result<(), DeviceError> {
        Ok(())
    }
    async fn set_voltage(&self, _: f64) -> Result<(), DeviceError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Full sessions
// ---------------------------------------------------------------------------

/// Baseline 500 GH/s; only 550 MHz @ 1.25 V reaches 540 GH/s at 66 °C.
#[tokio::test(start_paused = true)]
async fn improved_candidate_is_applied_and_persisted() {
    let dev = device(|ctx| at(ctx, 550, 1.25).then(|| reading(540.0, 66.0)));
    let store = Arc::new(MemoryStore::default());
    let ctl = controller_with(dev.clone(), store.clone(), &TunerConfig::default());

    let outcome = ctl.run_session().await.expect("session should apply settings");

    assert!(outcome.success);
    assert_eq!(outcome.candidate, Candidate::new(550, 1.25));
    assert!((outcome.improvement_percent - 8.0).abs() < 1e-9);
    assert_eq!(outcome.hashrate_before, 500.0);
    assert_eq!(outcome.hashrate_after, 540.0);
    assert_eq!(dev.settings(), (550, 1.25));

    let commands = dev.commands();
    assert_eq!(
        &commands[commands.len() - 2..],
        &[
            DeviceCommand::SetFrequency(550),
            DeviceCommand::SetVoltage(1.25)
        ]
    );

    let history = store.optimization_history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, outcome);
    assert!(!ctl.is_running());
    assert_eq!(ctl.status().state, SessionState::Done);
}

#[tokio::test(start_paused = true)]
async fn largest_improvement_wins() {
    let dev = device(|ctx| {
        if at(ctx, 600, 1.25) {
            Some(reading(560.0, 74.0))
        } else if at(ctx, 550, 1.25) {
            Some(reading(530.0, 62.0))
        } else {
            None
        }
    });
    let ctl = controller_with(
        dev.clone(),
        Arc::new(MemoryStore::default()),
        &small_grid_config(),
    );

    let outcome = ctl.run_session().await.unwrap();
    assert_eq!(outcome.candidate, Candidate::new(600, 1.25));
    assert_eq!(dev.settings(), (600, 1.25));
}

#[tokio::test(start_paused = true)]
async fn no_improvement_restores_baseline() {
    let dev = device(|_| None);
    let store = Arc::new(MemoryStore::default());
    let ctl = controller_with(dev.clone(), store.clone(), &small_grid_config());

    let outcome = ctl.run_session().await.expect("unchanged outcome");

    assert!(!outcome.success);
    assert_eq!(outcome.improvement_percent, 0.0);
    assert_eq!(outcome.candidate, Candidate::new(500, 1.15));
    assert_eq!(outcome.hashrate_after, outcome.hashrate_before);
    assert_eq!(dev.settings(), (500, 1.15));
    assert!(dev.commands().ends_with(&restore_commands()));
    assert!(store.optimization_history().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rollback_is_idempotent_across_sessions() {
    let dev = device(|_| None);
    let ctl = controller_with(
        dev.clone(),
        Arc::new(MemoryStore::default()),
        &small_grid_config(),
    );

    let first = ctl.run_session().await.unwrap();
    let second = ctl.run_session().await.unwrap();

    assert_eq!(first.candidate, second.candidate);
    assert_eq!(dev.settings(), (500, 1.15));
    assert!(dev.commands().ends_with(&restore_commands()));
}

/// The first candidate reads 86 °C on its first sample: the test aborts
/// there and the search moves on.
#[tokio::test(start_paused = true)]
async fn thermal_interlock_aborts_candidate_and_search_continues() {
    let dev = device(|ctx| at(ctx, 600, 1.25).then(|| reading(600.0, 86.0)));
    let cfg = small_grid_config();
    let ctl = controller_with(dev.clone(), Arc::new(MemoryStore::default()), &cfg);

    let outcome = ctl.run_session().await.unwrap();
    assert!(!outcome.success);

    // 12 baseline polls, 1 poll for the aborted candidate, 30 for each of
    // the remaining five.
    let baseline = cfg.optimization.baseline_samples as u64;
    let per_test = cfg.optimization.test_sample_count() as u64;
    assert_eq!(dev.polls(), baseline + 1 + 5 * per_test);

    let commands = dev.commands();
    assert_eq!(
        &commands[..4],
        &[
            DeviceCommand::SetFrequency(600),
            DeviceCommand::SetVoltage(1.25),
            DeviceCommand::SetFrequency(600),
            DeviceCommand::SetVoltage(1.15),
        ]
    );
    assert_eq!(dev.settings(), (500, 1.15));
}

#[tokio::test(start_paused = true)]
async fn rejected_command_skips_candidate() {
    let dev = Arc::new(
        SimulatedDevice::new(500, 1.15, |ctx| {
            if ctx.frequency == 550 && (ctx.voltage - 1.25).abs() < 1e-9 {
                reading(540.0, 66.0)
            } else {
                reading(500.0, 60.0)
            }
        })
        .with_rejected_frequency(600),
    );
    let ctl = controller_with(
        dev.clone(),
        Arc::new(MemoryStore::default()),
        &small_grid_config(),
    );

    let outcome = ctl.run_session().await.unwrap();
    assert_eq!(outcome.candidate, Candidate::new(550, 1.25));
    assert_eq!(
        &dev.commands()[..4],
        &[
            DeviceCommand::SetFrequency(600),
            DeviceCommand::SetFrequency(600),
            DeviceCommand::SetFrequency(550),
            DeviceCommand::SetVoltage(1.25),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn store_failure_does_not_fail_session() {
    let dev = device(|ctx| at(ctx, 550, 1.25).then(|| reading(540.0, 66.0)));
    let ctl = controller_with(dev.clone(), Arc::new(FailingStore), &small_grid_config());

    let outcome = ctl.run_session().await.unwrap();
    assert!(outcome.success);
    assert_eq!(dev.settings(), (550, 1.25));
}

// ---------------------------------------------------------------------------
// Concurrency and cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn second_session_is_refused_while_one_runs() {
    let dev = device(|_| None);
    let ctl = controller_with(
        dev.clone(),
        Arc::new(MemoryStore::default()),
        &small_grid_config(),
    );

    let worker = ctl.clone();
    let first = tokio::spawn(async move { worker.run_session().await });
    while !ctl.is_running() {
        tokio::task::yield_now().await;
    }

    let commands_before = dev.commands().len();
    assert!(ctl.run_session().await.is_none());
    assert!(ctl.run_quick_tune(None).await.is_none());
    assert_eq!(dev.commands().len(), commands_before);

    assert!(first.await.unwrap().is_some());
    assert!(!ctl.is_running());
}

#[tokio::test(start_paused = true)]
async fn status_reports_progress_while_searching() {
    let dev = device(|_| None);
    let ctl = controller_with(
        dev.clone(),
        Arc::new(MemoryStore::default()),
        &small_grid_config(),
    );

    let worker = ctl.clone();
    let handle = tokio::spawn(async move { worker.run_session().await });

    // Baseline takes 55 s; land inside the first candidate's sampling.
    tokio::time::sleep(Duration::from_secs(150)).await;
    let status = ctl.status();
    assert!(status.running);
    assert_eq!(status.state, SessionState::Searching);
    assert_eq!(status.current_candidate, Some(Candidate::new(600, 1.25)));
    assert_eq!(status.candidates_total, 6);
    assert_eq!(status.candidates_tested, 0);
    assert!(status.session_id.is_some());
    assert!(status.elapsed >= Duration::from_secs(150));

    ctl.stop_session();
    assert!(handle.await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn stop_mid_candidate_restores_baseline_and_returns_none() {
    let dev = device(|ctx| at(ctx, 600, 1.25).then(|| reading(700.0, 65.0)));
    let store = Arc::new(MemoryStore::default());
    let ctl = controller_with(dev.clone(), store.clone(), &small_grid_config());

    let worker = ctl.clone();
    let handle = tokio::spawn(async move { worker.run_session().await });
    tokio::time::sleep(Duration::from_secs(200)).await;
    ctl.stop_session();

    assert!(handle.await.unwrap().is_none());
    assert_eq!(dev.settings(), (500, 1.15));
    assert!(dev.commands().ends_with(&restore_commands()));
    assert!(store.optimization_history().await.unwrap().is_empty());
    assert!(!ctl.is_running());
}

/// One candidate, and the stop arrives while its final sample is being
/// read: nothing is applied and the baseline comes back.
#[tokio::test(start_paused = true)]
async fn stop_during_final_sample_restores_baseline() {
    let slot: Arc<OnceLock<SessionController>> = Arc::new(OnceLock::new());
    let remote = Arc::clone(&slot);
    // 12 baseline polls then 30 test polls; index 41 is the last.
    let dev = device(move |ctx| {
        if ctx.poll == 41 {
            if let Some(ctl) = remote.get() {
                ctl.stop_session();
            }
        }
        at(ctx, 550, 1.25).then(|| reading(540.0, 66.0))
    });
    let cfg = TunerConfig {
        safety: SafetyConfig {
            frequency_steps: vec![550],
            voltage_steps: vec![1.25],
            ..SafetyConfig::default()
        },
        ..TunerConfig::default()
    };
    let store = Arc::new(MemoryStore::default());
    let ctl = controller_with(dev.clone(), store.clone(), &cfg);
    assert!(slot.set(ctl.clone()).is_ok());

    assert!(ctl.run_session().await.is_none());
    assert_eq!(dev.polls(), 42);
    assert_eq!(dev.settings(), (500, 1.15));
    assert!(dev.commands().ends_with(&restore_commands()));
    assert!(store.optimization_history().await.unwrap().is_empty());
    assert!(!ctl.is_running());
}

#[tokio::test(start_paused = true)]
async fn panicking_device_ends_session_without_result() {
    let ctl = SessionController::new(
        Arc::new(PanickingDevice),
        Arc::new(MemoryStore::default()),
        Arc::new(LogNotifier),
        &TunerConfig::default(),
    );

    let worker = ctl.clone();
    let joined = tokio::spawn(async move { worker.run_session().await }).await;
    assert!(matches!(joined, Ok(None)), "got {joined:?}");
    assert!(!ctl.is_running());
    assert_eq!(ctl.status().state, SessionState::Done);
}

// ---------------------------------------------------------------------------
// Quick tune
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn quick_tune_picks_outcome_closest_to_default_target() {
    let dev = device(|ctx| {
        if at(ctx, 525, 1.20) {
            Some(reading(520.0, 62.0))
        } else if at(ctx, 550, 1.25) {
            Some(reading(560.0, 66.0))
        } else if at(ctx, 575, 1.30) {
            Some(reading(600.0, 70.0))
        } else {
            None
        }
    });
    let ctl = controller_with(
        dev.clone(),
        Arc::new(MemoryStore::default()),
        &TunerConfig::default(),
    );

    // Target 550 GH/s: 560 is closer than 600; 520 is below the 5 % floor.
    let outcome = ctl.run_quick_tune(None).await.unwrap();
    assert_eq!(outcome.candidate, Candidate::new(550, 1.25));
    assert_eq!(dev.settings(), (550, 1.25));
}

#[tokio::test(start_paused = true)]
async fn quick_tune_honours_explicit_target() {
    let dev = device(|ctx| {
        if at(ctx, 550, 1.25) {
            Some(reading(560.0, 66.0))
        } else if at(ctx, 575, 1.30) {
            Some(reading(600.0, 70.0))
        } else {
            None
        }
    });
    let ctl = controller_with(
        dev.clone(),
        Arc::new(MemoryStore::default()),
        &TunerConfig::default(),
    );

    let outcome = ctl.run_quick_tune(Some(610.0)).await.unwrap();
    assert_eq!(outcome.candidate, Candidate::new(575, 1.30));
}

#[tokio::test(start_paused = true)]
async fn quick_tune_without_success_restores_and_returns_none() {
    let dev = device(|_| None);
    let ctl = controller_with(
        dev.clone(),
        Arc::new(MemoryStore::default()),
        &TunerConfig::default(),
    );

    assert!(ctl.run_quick_tune(None).await.is_none());
    assert_eq!(dev.settings(), (500, 1.15));
    assert!(dev.commands().ends_with(&restore_commands()));
}
