use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use slotmatch::compactor::run_compactor;
use slotmatch::engine::{ConflictPolicy, Engine, EngineConfig};
use slotmatch::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use slotmatch::recurrence::SlotGrid;
use slotmatch::wire;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn engine_config() -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let policy: ConflictPolicy = env_or("SLOTMATCH_CONFLICT_POLICY", "dedup_only").parse()?;
    let grid_start = NaiveTime::parse_from_str(&env_or("SLOTMATCH_GRID_START", "08:00"), "%H:%M")?;
    let grid_end = NaiveTime::parse_from_str(&env_or("SLOTMATCH_GRID_END", "21:00"), "%H:%M")?;
    let step: u32 = env_parsed("SLOTMATCH_GRID_STEP_MINUTES", 30);
    let grid = SlotGrid::new(grid_start, grid_end, step)?;
    Ok(EngineConfig { policy, grid })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("SLOTMATCH_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    slotmatch::observability::init(metrics_port);

    let port = env_or("SLOTMATCH_PORT", "5433");
    let bind = env_or("SLOTMATCH_BIND", "0.0.0.0");
    let data_dir = PathBuf::from(env_or("SLOTMATCH_DATA_DIR", "./data"));
    let password = env_or("SLOTMATCH_PASSWORD", "slotmatch");
    let max_connections: usize = env_parsed("SLOTMATCH_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_parsed("SLOTMATCH_COMPACT_THRESHOLD", 1000);
    let config = engine_config()?;

    let tls_cert = std::env::var("SLOTMATCH_TLS_CERT").ok();
    let tls_key = std::env::var("SLOTMATCH_TLS_KEY").ok();
    let tls_acceptor =
        slotmatch::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    std::fs::create_dir_all(&data_dir)?;
    let engine = Arc::new(Engine::new(data_dir.join("slotmatch.wal"), config)?);
    let compactor = tokio::spawn(run_compactor(
        engine.clone(),
        compact_threshold,
        engine.cancellation_token(),
    ));
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("slotmatch listening on {addr}");
    info!("  data_dir: {}", data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  conflict_policy: {}", config.policy);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    tracing::warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                    continue;
                };

                tracing::debug!("connection from {peer}");
                metrics::counter!(CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let password = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, engine, password, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Writes still waiting for a resource lock fail with Cancelled from here on.
    engine.shutdown();
    if let Err(e) = compactor.await {
        tracing::warn!("compactor task failed: {e}");
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);
    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("slotmatch stopped");
    Ok(())
}
