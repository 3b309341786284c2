use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::classifier::{Classified, Classifier, Origin};
use crate::config::{DownstreamConfig, SessionConfig};
use crate::registry::{FeederObservation, FeederRegistry};
use crate::utils::{format_bytes, format_duration};

const RELAY_BUF_SIZE: usize = 8192;
const RETRY_DELAY_CAP: Duration = Duration::from_secs(5);

// Frame layout of the feeder stream: an escape byte introduces each message,
// the following type byte says which kind. Long frames are the
// position-capable ones. Only frame *starts* are counted here; payload bytes
// are forwarded untouched.
const FRAME_ESCAPE: u8 = 0x1a;

fn is_frame_type(b: u8) -> bool {
    (0x31..=0x35).contains(&b)
}

fn is_long_frame(b: u8) -> bool {
    b == 0x33 || b == 0x35
}

/// Count message starts and position-capable message starts in a chunk.
pub fn count_frames(data: &[u8]) -> (u64, u64) {
    let mut messages = 0;
    let mut positions = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        if data[i] == FRAME_ESCAPE {
            let next = data[i + 1];
            if next == FRAME_ESCAPE {
                // Escaped literal escape byte.
                i += 2;
                continue;
            }
            if is_frame_type(next) {
                messages += 1;
                if is_long_frame(next) {
                    positions += 1;
                }
                i += 2;
                continue;
            }
        }
        i += 1;
    }
    (messages, positions)
}

/// Everything one session needs, shared across all sessions.
pub struct SessionContext {
    pub registry: FeederRegistry,
    pub classifier: Arc<Classifier>,
    pub downstream: DownstreamConfig,
    pub session: SessionConfig,
}

#[derive(Default)]
struct SessionCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages: AtomicU64,
    positions: AtomicU64,
}

#[derive(Default)]
struct Flushed {
    bytes: u64,
    messages: u64,
    positions: u64,
}

/// One accepted feeder connection, from classification to teardown.
///
/// Ordering per session is strict: classify (bounded) → register → connect
/// downstream (bounded retry) → relay with periodic counter flushes → close
/// bookkeeping. A reconnect is a brand-new session and a brand-new
/// connection row.
pub async fn handle_connection(
    feeder_stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: Arc<SessionContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let ip = peer_addr.ip();
    let started = std::time::Instant::now();
    println!("[session] new connection from {}", ip);

    // Classification is deadline-bounded so a hung status API cannot pile up
    // half-open sessions. On deadline, fall back to the CIDR-only answer.
    let classify_deadline = Duration::from_secs(ctx.session.classify_timeout_secs);
    let classified = match timeout(classify_deadline, ctx.classifier.classify(ip)).await {
        Ok(classified) => classified,
        Err(_) => {
            println!("[session] classification deadline for {}, using CIDR-only result", ip);
            ctx.classifier.classify_cidr_only(ip)
        }
    };

    match &classified.origin {
        Origin::Vpn { mesh, peer } => println!(
            "[session] {} classified as {} (hostname: {})",
            ip,
            mesh,
            peer.as_ref()
                .and_then(|p| p.hostname.as_deref())
                .unwrap_or("unresolved")
        ),
        Origin::Public { geo } => println!(
            "[session] {} classified as public (location: {})",
            ip,
            geo.as_ref()
                .and_then(|g| g.location.as_deref())
                .unwrap_or("unknown")
        ),
    }

    // Registry failures degrade observability but never drop the feeder.
    let feeder_id = match ctx.registry.upsert_feeder(observation(&classified, ip)).await {
        Ok(id) => Some(id),
        Err(e) => {
            println!("[session] feeder upsert failed for {}: {}", ip, e);
            None
        }
    };

    let connection_id = match feeder_id {
        Some(fid) => match ctx.registry.record_connection_open(fid, ip.to_string()).await {
            Ok(id) => Some(id),
            Err(e) => {
                println!("[session] connection record failed for {}: {}", ip, e);
                None
            }
        },
        None => None,
    };

    let display = classified
        .origin
        .hostname()
        .map(str::to_string)
        .unwrap_or_else(|| classified.name.clone());

    // Downstream engine, with a bounded retry budget for the lifetime of
    // this accepted connection.
    let downstream_stream = match connect_downstream(&ctx.downstream).await {
        Ok(stream) => stream,
        Err(e) => {
            println!("[session] cannot reach downstream engine for {}: {}", display, e);
            finalize(&ctx, feeder_id, connection_id, 0).await;
            return Ok(());
        }
    };

    println!(
        "[session] forwarding {} -> {}:{}",
        display, ctx.downstream.host, ctx.downstream.port
    );

    // Relay. Each direction runs as its own task; either side ending (EOF or
    // error) ends the session.
    let counters = Arc::new(SessionCounters::default());
    let (feeder_read, feeder_write) = feeder_stream.into_split();
    let (downstream_read, downstream_write) = downstream_stream.into_split();

    let mut inbound = tokio::spawn(relay_inbound(feeder_read, downstream_write, counters.clone()));
    let mut outbound = tokio::spawn(relay_outbound(downstream_read, feeder_write, counters.clone()));

    let mut flushed = Flushed::default();
    let mut flush_tick =
        tokio::time::interval(Duration::from_secs(ctx.session.flush_interval_secs.max(1)));
    flush_tick.tick().await; // immediate first tick carries nothing

    loop {
        tokio::select! {
            _ = flush_tick.tick() => {
                flush_counters(&ctx, feeder_id, &counters, &mut flushed).await;
            }
            _ = &mut inbound => break,
            _ = &mut outbound => break,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    inbound.abort();
    outbound.abort();

    // Closing: flush the remainder, finalize the connection row, log.
    flush_counters(&ctx, feeder_id, &counters, &mut flushed).await;
    let total_in = counters.bytes_in.load(Ordering::Relaxed);
    finalize(&ctx, feeder_id, connection_id, total_in).await;

    println!(
        "[session] disconnected: {} ({}) after {}, {} in / {} out",
        display,
        classified.origin.conn_type(),
        format_duration(started.elapsed()),
        format_bytes(total_in),
        format_bytes(counters.bytes_out.load(Ordering::Relaxed)),
    );

    Ok(())
}

fn observation(classified: &Classified, ip: IpAddr) -> FeederObservation {
    let (location, latitude, longitude) = match &classified.origin {
        Origin::Public { geo: Some(geo) } => {
            (geo.location.clone(), geo.latitude, geo.longitude)
        }
        _ => (None, None, None),
    };

    FeederObservation {
        identity: classified.identity.clone(),
        conn_type: classified.origin.conn_type().to_string(),
        ip_address: ip.to_string(),
        hostname: classified.origin.hostname().map(str::to_string),
        location,
        latitude,
        longitude,
        name: classified.name.clone(),
    }
}

async fn connect_downstream(config: &DownstreamConfig) -> Result<TcpStream> {
    let target = format!("{}:{}", config.host, config.port);
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    let attempts = config.retry_attempts.max(1);
    let mut delay = Duration::from_millis(config.retry_base_delay_ms);

    let mut last_err = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RETRY_DELAY_CAP);
        }

        match timeout(connect_timeout, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(anyhow::Error::from(e)),
            Err(_) => last_err = Some(anyhow::anyhow!("connect timed out")),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no connect attempts made")))
        .context(format!("downstream {} unavailable after {} attempts", target, attempts))
}

/// Feeder → downstream. Byte-exact pass-through; the only inspection is
/// counting frame starts for the traffic counters.
async fn relay_inbound(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    counters: Arc<SessionCounters>,
) {
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        counters.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
        let (messages, positions) = count_frames(&buf[..n]);
        counters.messages.fetch_add(messages, Ordering::Relaxed);
        counters.positions.fetch_add(positions, Ordering::Relaxed);
    }
}

/// Downstream → feeder. Byte-exact pass-through.
async fn relay_outbound(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    counters: Arc<SessionCounters>,
) {
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        counters.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Push unflushed counter deltas to the registry, or just refresh
/// `last_seen` when the interval was quiet.
async fn flush_counters(
    ctx: &SessionContext,
    feeder_id: Option<i64>,
    counters: &SessionCounters,
    flushed: &mut Flushed,
) {
    let Some(fid) = feeder_id else { return };

    let bytes = counters.bytes_in.load(Ordering::Relaxed);
    let messages = counters.messages.load(Ordering::Relaxed);
    let positions = counters.positions.load(Ordering::Relaxed);

    let delta_bytes = bytes - flushed.bytes;
    let delta_messages = messages - flushed.messages;
    let delta_positions = positions - flushed.positions;

    if delta_bytes > 0 || delta_messages > 0 {
        match ctx
            .registry
            .increment_counters(fid, delta_bytes, delta_messages, delta_positions)
            .await
        {
            Ok(()) => {
                flushed.bytes = bytes;
                flushed.messages = messages;
                flushed.positions = positions;
            }
            Err(e) => println!("[session] counter flush failed: {}", e),
        }
    } else if let Err(e) = ctx.registry.touch_feeder(fid).await {
        println!("[session] feeder touch failed: {}", e);
    }
}

async fn finalize(
    ctx: &SessionContext,
    feeder_id: Option<i64>,
    connection_id: Option<i64>,
    bytes_transferred: u64,
) {
    if let (Some(fid), Some(cid)) = (feeder_id, connection_id) {
        if let Err(e) = ctx
            .registry
            .record_connection_close(cid, fid, bytes_transferred)
            .await
        {
            println!("[session] connection close record failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_frames_empty() {
        assert_eq!(count_frames(&[]), (0, 0));
    }

    #[test]
    fn test_count_frames_short_and_long() {
        // One short frame (0x32), one long frame (0x33).
        let data = [0x1a, 0x32, 0xaa, 0xbb, 0x1a, 0x33, 0xcc];
        assert_eq!(count_frames(&data), (2, 1));
    }

    #[test]
    fn test_count_frames_escaped_literal() {
        // 0x1a 0x1a is an escaped payload byte, not a frame start.
        let data = [0x1a, 0x1a, 0x33, 0x1a, 0x31];
        assert_eq!(count_frames(&data), (1, 0));
    }

    #[test]
    fn test_count_frames_mode_ac_and_long_variants() {
        let data = [0x1a, 0x31, 0x00, 0x00, 0x1a, 0x35, 0x00, 0x1a, 0x34];
        assert_eq!(count_frames(&data), (3, 1));
    }

    #[test]
    fn test_count_frames_non_frame_bytes() {
        let data = [0x00, 0x01, 0x02, 0x1a, 0x99, 0x1a];
        assert_eq!(count_frames(&data), (0, 0));
    }
}
