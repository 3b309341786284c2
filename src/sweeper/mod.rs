use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::SweeperConfig;
use crate::registry::FeederRegistry;
use crate::vpn::VpnStatusClient;

/// How many sweeps pass between activity-log pruning runs. Pruning is cheap
/// but there is no reason to run it every 30 seconds.
const PRUNE_EVERY_SWEEPS: u64 = 120;

/// How many sweeps pass between fleet status log lines.
const STATUS_EVERY_SWEEPS: u64 = 10;

/// Background task that demotes quiet feeders to stale, drops the VPN peer
/// caches so the next classification refetches, and periodically prunes old
/// activity rows.
pub async fn run(
    config: SweeperConfig,
    registry: FeederRegistry,
    vpn: Arc<VpnStatusClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs.max(1)));
    tick.tick().await; // first tick fires immediately, skip it

    let mut sweeps: u64 = 0;
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    println!("[sweeper] stopped");
                    return;
                }
                continue;
            }
        }

        match registry.mark_stale(config.stale_threshold_secs).await {
            Ok(0) => {}
            Ok(n) => println!("[sweeper] marked {} feeder(s) stale", n),
            Err(e) => println!("[sweeper] stale sweep failed: {}", e),
        }

        vpn.invalidate();

        sweeps += 1;
        if sweeps % STATUS_EVERY_SWEEPS == 0 {
            if let Ok((total, active, stale, offline)) = registry.status_counts().await {
                println!(
                    "[sweeper] feeders: {} total, {} active, {} stale, {} offline",
                    total, active, stale, offline
                );
            }
        }

        if sweeps % PRUNE_EVERY_SWEEPS == 0 {
            match registry.prune_activity(config.activity_retention_days).await {
                Ok(0) => {}
                Ok(n) => println!("[sweeper] pruned {} old activity row(s)", n),
                Err(e) => println!("[sweeper] activity prune failed: {}", e),
            }
        }
    }
}
