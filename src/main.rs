use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use slotcap::limits::DEFAULT_COMPACT_THRESHOLD;
use slotcap::service::LimitService;
use slotcap::store::{LimitStore, WalStore};
use slotcap::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("SLOTCAP_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    slotcap::observability::init(metrics_port)?;

    let port = std::env::var("SLOTCAP_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("SLOTCAP_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("SLOTCAP_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let max_connections: usize = std::env::var("SLOTCAP_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(256);
    let compact_threshold: u64 = std::env::var("SLOTCAP_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_COMPACT_THRESHOLD);
    let autostart = std::env::var("SLOTCAP_SCHEDULER_AUTOSTART")
        .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    // A store that can't be opened is fatal; everything after this reports
    // failures to the client instead.
    let wal_path = PathBuf::from(&data_dir).join("limits.wal");
    let store = Arc::new(WalStore::open(wal_path, compact_threshold)?);
    store.maintain().await?;

    let service = Arc::new(LimitService::new(store));
    if autostart {
        service.scheduler_start()?;
    }

    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("slotcap listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  scheduler: {}", if autostart { "running" } else { "stopped" });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
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

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(slotcap::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(slotcap::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(slotcap::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let svc = service.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, svc).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(slotcap::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    if service.scheduler_status() {
        service.scheduler_stop()?;
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
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
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("slotcap stopped");
    Ok(())
}
