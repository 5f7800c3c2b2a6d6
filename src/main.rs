use tokio::sync::watch;
use tracing::{error, info};

use zipstage::{Config, GarbageCollector, SandboxResolver};

#[tokio::main]
async fn main() {
    // Load configuration
    let mut config = match Config::load("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };
    config.apply_env_overrides();

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    // Initialize logging
    if let Err(e) = zipstage::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        zipstage::logging::init_console_only(&config.logging.level);
    }

    info!("zipstage - sandboxed file staging");

    let resolver = match SandboxResolver::from_config(&config.sandbox) {
        Ok(resolver) => resolver,
        Err(e) => {
            error!(error = %e, "Cannot determine sandbox location");
            std::process::exit(1);
        }
    };
    info!(base_dir = %resolver.base_dir().display(), "Sandbox base directory");

    let gc = GarbageCollector::from_config(&resolver, &config.sandbox);
    gc.initialize_cleanup().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = std::time::Duration::from_secs(config.sandbox.cleanup_interval_secs);
    let sweeper = gc.spawn_periodic(interval, shutdown_rx);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        error!(error = %e, "Cleanup task ended abnormally");
    }
}
