use crate::api::{run_api_server, AppState};
use crate::config::Config;
use crate::error::{ReservationError, Result};
use crate::persistence::{Database, InMemoryStore, ReservationStore};
use crate::service::ReservationService;
use crate::settlement;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber, honouring `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub struct Server {
    pub config: Config,
    pub service: ReservationService,
    /// `sqlite` or `memory`
    pub storage: &'static str,
}

impl Server {
    pub fn init(config: Config) -> Result<Self> {
        info!(
            port = config.server.api_port,
            settlement = ?config.settlement.mode,
            "Starting ReserveL"
        );

        ensure_data_dir(&config.database.path)?;
        let (store, storage) = open_store(&config.database.path);
        let settlement = settlement::from_config(&config.settlement)?;
        let service =
            ReservationService::new(store, settlement, config.server.public_url.clone());

        Ok(Self {
            config,
            service,
            storage,
        })
    }

    pub async fn start(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.server.api_port));
        info!(
            %addr,
            storage = self.storage,
            settlement = self.service.settlement_backend().unwrap_or("disabled"),
            "Serving reservations"
        );
        let state = Arc::new(AppState::new(self.service));
        run_api_server(state, addr, shutdown_signal()).await
    }
}

/// Open the SQLite store, falling back to memory when it cannot be opened.
pub fn open_store(path: &str) -> (Arc<dyn ReservationStore>, &'static str) {
    match Database::open(path) {
        Ok(db) => (Arc::new(db), "sqlite"),
        Err(e) => {
            warn!(
                "Failed to open DB at {}: {}. Falling back to in-memory store.",
                path, e
            );
            (Arc::new(InMemoryStore::new()), "memory")
        }
    }
}

fn ensure_data_dir(db_path: &str) -> Result<()> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                ReservationError::Io(format!("Failed to create data dir {:?}: {}", parent, e))
            })?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
    }
}
