//! # bitaxe-autotune daemon
//!
//! Records telemetry from a Bitaxe device and re-tunes its frequency and
//! voltage when performance degrades.
//!
//! ## Usage
//!
//! ```bash
//! # Run the recorder and the auto-optimize scheduler until Ctrl-C
//! bitaxe-autotune --config autotune.toml
//!
//! # Run one full session now and exit
//! bitaxe-autotune --config autotune.toml --once
//!
//! # Quick tune towards 1200 GH/s against the built-in simulator
//! bitaxe-autotune --simulate --quick 1200
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use bitaxe_autotune::config::{self, loader};
use bitaxe_autotune::notify;
use bitaxe_autotune::recorder::Recorder;
use bitaxe_autotune::store::{MemoryStore, TelemetryStore};
use bitaxe_autotune::{
    metrics, AutoScheduler, BitaxeClient, DeviceClient, SessionController, SimulatedDevice,
    TestOutcome, TunerConfig,
};

/// What the process should do after start-up.
enum Command {
    /// Recorder + scheduler until Ctrl-C.
    Daemon,
    /// One full session.
    Once,
    /// One quick tune with an optional target (GH/s).
    Quick(Option<f64>),
    /// Print the config JSON Schema.
    PrintSchema,
}

/// Parsed CLI arguments.
struct Args {
    /// Path to the TOML config file.
    config: PathBuf,
    /// Drive the simulator instead of a real device.
    simulate: bool,
    /// Selected action.
    command: Command,
}

/// Parse command-line arguments manually (no external arg parser dependency).
///
/// # Returns
///
/// - `Ok(Args)` on success
/// - `Err(String)` with a usage message on failure
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = PathBuf::from("autotune.toml");
    let mut simulate = false;
    let mut command = Command::Daemon;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a value".to_string());
                }
                config = PathBuf::from(&args[i]);
            }
            "--simulate" => {
                simulate = true;
            }
            "--once" => {
                command = Command::Once;
            }
            "--quick" => {
                let target = match args.get(i + 1) {
                    Some(v) if !v.starts_with('-') => {
                        i += 1;
                        Some(
                            v.parse::<f64>()
                                .map_err(|_| format!("invalid target hashrate: {v}"))?,
                        )
                    }
                    _ => None,
                };
                command = Command::Quick(target);
            }
            "--print-schema" => {
                command = Command::PrintSchema;
            }
            "--help" | "-h" => {
                return Err(usage());
            }
            other => {
                return Err(format!("unknown argument: {other}\n{}", usage()));
            }
        }
        i += 1;
    }

    Ok(Args {
        config,
        simulate,
        command,
    })
}

/// Print usage information.
fn usage() -> String {
    [
        "Usage: bitaxe-autotune [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>   Path to config TOML (default: autotune.toml)",
        "  --simulate            Use the built-in device simulator",
        "  --once                Run one full tuning session and exit",
        "  --quick [GH/s]        Run one quick tune (default target: baseline +10%)",
        "  --print-schema        Print the config JSON Schema and exit",
        "  --help, -h            Show this help message",
    ]
    .join("\n")
}

fn print_outcome(outcome: Option<&TestOutcome>) {
    match outcome {
        Some(o) => match serde_json::to_string_pretty(o) {
            Ok(json) => println!("{json}"),
            Err(e) => error!(error = %e, "failed to encode outcome"),
        },
        None => println!("no settings applied"),
    }
}

/// Run one session, stopping it cleanly on Ctrl-C.
async fn run_single(controller: SessionController, quick: Option<Option<f64>>) {
    let worker = controller.clone();
    let mut handle = tokio::spawn(async move {
        match quick {
            Some(target) => worker.run_quick_tune(target).await,
            None => worker.run_session().await,
        }
    });

    let joined = tokio::select! {
        r = &mut handle => r,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping session");
            controller.stop_session();
            handle.await
        }
    };

    match joined {
        Ok(outcome) => print_outcome(outcome.as_ref()),
        Err(e) => error!(error = %e, "session task failed"),
    }
}

#[tokio::main]
async fn main() {
    let _ = bitaxe_autotune::init_tracing();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    if matches!(args.command, Command::PrintSchema) {
        match config::json_schema() {
            Ok(schema) => println!("{schema}"),
            Err(e) => {
                eprintln!("failed to render schema: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let cfg: TunerConfig = match loader::load_or_default(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = metrics::init_metrics() {
        warn!(error = %e, "metrics disabled");
    }

    let device: Arc<dyn DeviceClient> = if args.simulate {
        info!("using simulated device");
        Arc::new(SimulatedDevice::bitaxe_like(500, 1.15))
    } else {
        let client = BitaxeClient::from_config(&cfg.device);
        match client.ping().await {
            Ok(()) => info!(url = client.base_url(), "device reachable"),
            Err(e) => warn!(url = client.base_url(), error = %e, "device not reachable yet"),
        }
        Arc::new(client)
    };

    let store: Arc<dyn TelemetryStore> = Arc::new(MemoryStore::new(&cfg.storage));
    let notifier = notify::from_config(&cfg.notifications);
    let controller =
        SessionController::new(Arc::clone(&device), Arc::clone(&store), notifier, &cfg);

    match args.command {
        Command::Once => run_single(controller, None).await,
        Command::Quick(target) => run_single(controller, Some(target)).await,
        Command::PrintSchema => {}
        Command::Daemon => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let recorder = Recorder::new(
                Arc::clone(&device),
                Arc::clone(&store),
                cfg.device.poll_interval(),
            )
            .spawn(shutdown_rx);

            let scheduler = AutoScheduler::new(controller, store, &cfg);
            scheduler.start();

            info!("running, press Ctrl-C to stop");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
            }

            info!("shutting down");
            scheduler.stop().await;
            let _ = shutdown_tx.send(true);
            if let Err(e) = recorder.await {
                error!(error = %e, "recorder task failed");
            }

            let summary = metrics::get_metrics_summary();
            info!(sessions = ?summary.sessions, candidates = ?summary.candidates, "final counters");
        }
    }
}
