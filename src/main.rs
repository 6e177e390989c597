use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use parkd::api::{self, AppState};
use parkd::engine::Engine;
use parkd::identity::{SessionStore, StubIdentityProvider};
use parkd::payment::MockGateway;
use parkd::reaper;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("PARKD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    parkd::observability::init(metrics_port);

    let port = std::env::var("PARKD_PORT").unwrap_or_else(|_| "8080".into());
    let bind = std::env::var("PARKD_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("PARKD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let hold_ttl_secs: i64 = env_parse("PARKD_HOLD_TTL_SECS", parkd::limits::DEFAULT_HOLD_TTL_MS / 1000);
    let sweep_secs: u64 = env_parse("PARKD_SWEEP_SECS", 5);
    let compact_threshold: u64 = env_parse("PARKD_COMPACT_THRESHOLD", 1000);

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("parkd.wal");
    let engine = Arc::new(Engine::new(wal_path, hold_ttl_secs * 1000)?);

    tokio::spawn(reaper::run_sweep(engine.clone(), Duration::from_secs(sweep_secs)));
    tokio::spawn(reaper::run_compactor(engine.clone(), compact_threshold));

    let state = AppState {
        engine,
        sessions: Arc::new(SessionStore::new()),
        identity: Arc::new(StubIdentityProvider),
        gateway: Arc::new(MockGateway),
    };
    let app = api::router(state);

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("parkd listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  hold_ttl: {hold_ttl_secs}s, sweep every {sweep_secs}s");
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight requests.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
        info!("shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("parkd stopped");
    Ok(())
}
