use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};

use crate::config::ListenerConfig;
use crate::session::{self, SessionContext};

/// How long shutdown waits for in-flight sessions to finish their close
/// bookkeeping before the process exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The TCP front door. Accepts feeder connections, enforces the concurrent
/// session cap, and hands each accepted socket to its own session task.
pub struct IngestServer {
    config: ListenerConfig,
    ctx: Arc<SessionContext>,
}

impl IngestServer {
    pub fn new(config: ListenerConfig, ctx: Arc<SessionContext>) -> Self {
        Self { config, ctx }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("{}:{}", self.config.listen_address, self.config.listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;

        println!("[server] listening on {}", addr);

        let max_conn = self.config.max_connections as usize;
        let semaphore = Arc::new(Semaphore::new(
            if max_conn == 0 { Semaphore::MAX_PERMITS } else { max_conn },
        ));
        let total_permits = if max_conn == 0 { Semaphore::MAX_PERMITS } else { max_conn };

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer_addr)) => {
                            // At the cap the socket is dropped immediately;
                            // feeder software reconnects on its own.
                            let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => {
                                    println!(
                                        "[server] connection limit ({}) reached, dropping {}",
                                        max_conn, peer_addr
                                    );
                                    drop(socket);
                                    continue;
                                }
                            };

                            let ctx = self.ctx.clone();
                            let session_shutdown = shutdown.clone();

                            tokio::spawn(async move {
                                let _permit = permit;
                                if let Err(e) =
                                    session::handle_connection(socket, peer_addr, ctx, session_shutdown)
                                        .await
                                {
                                    println!("[server] session error for {}: {:#}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            println!("[server] accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        println!("[server] shutting down, waiting for active sessions");

        // Sessions observe the same shutdown signal; give them a bounded
        // window to flush counters and close their connection rows.
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            loop {
                if semaphore.available_permits() == total_permits {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        if drained.is_err() {
            println!(
                "[server] grace period expired with {} sessions still open",
                total_permits - semaphore.available_permits()
            );
        }

        Ok(())
    }
}
