//! proscenic-cloud - monitoring daemon
//!
//! Connects to the configured account, keeps the telemetry sessions alive
//! and logs a status line per device every few seconds. Consumers that
//! want the full API (commands, map rendering, change events) use the
//! library crate instead.

use proscenic_cloud::config::AppConfig;
use proscenic_cloud::{ProscenicHome, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Parse config path from command line arguments.
///
/// Supports:
/// - `proscenic-cloud <path>` (positional)
/// - `proscenic-cloud --config <path>` (flag-based)
/// - `proscenic-cloud -c <path>` (short flag)
///
/// Defaults to `/etc/proscenic-cloud.toml` if not specified.
fn parse_config_path() -> String {
    let args: Vec<String> = env::args().collect();

    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }

    if args.len() > 1 && !args[1].starts_with('-') {
        return args[1].clone();
    }

    "/etc/proscenic-cloud.toml".to_string()
}

fn main() -> Result<()> {
    let config_path = parse_config_path();
    let config = if Path::new(&config_path).exists() {
        AppConfig::from_file(&config_path)?
    } else {
        AppConfig::default()
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    log::info!("proscenic-cloud v0.2.0 starting...");
    log::info!("Using config: {config_path}");
    log::info!(
        "Account {} on the {} backend",
        config.account.username,
        config.account.region
    );

    let mut home = ProscenicHome::connect(&config)?;
    for vacuum in home.vacuums() {
        log::info!("✓ {} ({}) online", vacuum.name(), vacuum.serial());
    }

    // Graceful shutdown on SIGINT/SIGTERM
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                let mut signals =
                    Signals::new([SIGINT, SIGTERM]).expect("Failed to register signal handlers");
                if let Some(sig) = signals.forever().next() {
                    log::info!("Received signal {sig:?}, initiating shutdown...");
                    shutdown.store(true, Ordering::Relaxed);
                }
            })
            .expect("Failed to spawn signal handler thread");
    }

    log::info!("Press Ctrl+C to stop");

    let mut last_stats = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));

        if last_stats.elapsed().as_secs() >= 10 {
            for vacuum in home.vacuums() {
                let status = vacuum.status();
                log::info!(
                    "{}: mode={} battery={}% errors={}",
                    vacuum.name(),
                    status.mode,
                    status.battery,
                    status.error_state.len()
                );
            }
            last_stats = Instant::now();
        }
    }

    log::info!("Shutdown signal received, disconnecting...");
    home.disconnect();
    log::info!("✓ All connections closed");
    Ok(())
}
