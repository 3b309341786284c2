use std::path::{Path, PathBuf};
use std::sync::Arc;

use skyfeed::classifier::Classifier;
use skyfeed::config::ConfigManager;
use skyfeed::geoip::GeoIp;
use skyfeed::logger::Logger;
use skyfeed::registry::FeederRegistry;
use skyfeed::server::IngestServer;
use skyfeed::session::SessionContext;
use skyfeed::vpn::VpnStatusClient;

const DEFAULT_CONFIG_PATH: &str = "skyfeed.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config_path = if args.len() > 1 {
        PathBuf::from(&args[1])
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let config_manager = ConfigManager::new(config_path.clone());
    let config = config_manager.load_or_default().await?;

    let logger = Logger::from_config(&config.logging)?;
    logger.info(&format!("{} {} starting...", skyfeed::NAME, skyfeed::VERSION));
    logger.info(&format!("Configuration loaded from: {}", config_path.display()));

    // The registry is the one component the feeder cannot run without.
    let registry = FeederRegistry::open(Path::new(&config.database.path), config.database.busy_timeout_ms)?;
    logger.info(&format!("Registry opened: {}", config.database.path));

    // Connections left open by a previous run are unknowable; close their
    // rows and let live feeders re-register on reconnect.
    match registry.reconcile_open_connections().await {
        Ok(0) => {}
        Ok(n) => logger.info(&format!("Reconciled {} orphaned connection(s)", n)),
        Err(e) => logger.warn(&format!("Startup reconciliation failed: {}", e)),
    }

    let vpn = Arc::new(VpnStatusClient::new()?);

    let geoip = if config.geoip.enabled {
        match GeoIp::open(Path::new(&config.geoip.db_path)) {
            Ok(g) => {
                logger.info(&format!("GeoIP database loaded: {}", config.geoip.db_path));
                Some(g)
            }
            Err(e) => {
                logger.warn(&format!(
                    "GeoIP database unavailable ({}), public feeders will be unlocated: {}",
                    config.geoip.db_path, e
                ));
                None
            }
        }
    } else {
        None
    };

    let enabled_meshes: Vec<&str> = config
        .meshes
        .iter()
        .filter(|m| m.enabled)
        .map(|m| m.name.as_str())
        .collect();
    if enabled_meshes.is_empty() {
        logger.info("No VPN meshes enabled, all feeders classified as public");
    } else {
        logger.info(&format!("VPN meshes enabled: {}", enabled_meshes.join(", ")));
    }

    let classifier = Arc::new(Classifier::new(&config.meshes, vpn.clone(), geoip));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let sweeper_handle = tokio::spawn(skyfeed::sweeper::run(
        config.sweeper.clone(),
        registry.clone(),
        vpn.clone(),
        shutdown_rx.clone(),
    ));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("[skyfeed] shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let ctx = Arc::new(SessionContext {
        registry,
        classifier,
        downstream: config.downstream.clone(),
        session: config.session.clone(),
    });

    logger.info(&format!(
        "Forwarding to downstream engine at {}:{}",
        config.downstream.host, config.downstream.port
    ));

    let server = IngestServer::new(config.listener.clone(), ctx);
    server.run(shutdown_rx).await?;

    sweeper_handle.abort();
    logger.info("Shutdown complete");

    Ok(())
}
