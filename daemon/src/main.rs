mod error;
mod ipc;
mod reload;
mod state;
mod supervisor;

use std::{collections::HashMap, sync::Arc};

use engine::{
    config::{Config, ConfigHandle},
    dht::NodeId,
    security::identity::KeyStore,
    session::SessionManager,
};
use tokio::sync::{broadcast, Mutex};
use tracing_subscriber::EnvFilter;

use crate::{error::Result, ipc::AppState, state::StateManager, supervisor::Supervisor};

// Startup sequencing follows `original_source/ccbt/daemon/main.py`'s
// `DaemonMain.start`: lock acquisition first, then signal handlers, then
// security material, then the session manager, then the IPC server, with
// the PID file written only once the IPC server is confirmed listening.
#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::default().validated()?;
    let config = ConfigHandle::new(config);
    let daemon_config = config.load().daemon.clone();

    let supervisor = Arc::new(Supervisor::acquire(
        &daemon_config.state_dir,
        &daemon_config.pid_file,
        &daemon_config.lock_file,
    )?);

    let supervisor_for_signals = supervisor.clone();
    tokio::spawn(async move { supervisor_for_signals.watch_signals().await });

    let key_store = KeyStore::new(&daemon_config.keys_dir);
    let identity = key_store.get_or_create()?;
    let api_key = ipc::load_or_create_api_key(&daemon_config.api_key_file)?;
    tracing::info!(public_key = %identity.public_key_hex(), "daemon identity ready");

    let state_manager = StateManager::new(&daemon_config.state_dir)?;
    let restored = state_manager.load().await?;
    if let Some(restored) = &restored {
        tracing::info!(torrents = restored.torrents.len(), "restored daemon state from disk");
    }

    let network = config.load().network;
    let session = SessionManager::start(
        format!("0.0.0.0:{}", network.listen_port).parse().expect("valid socket address"),
        NodeId::random(),
    )
    .await
    .map_err(engine::EngineError::from)?;

    let (events_tx, _) = broadcast::channel(256);
    let app_state = AppState {
        torrents: Arc::new(Mutex::new(HashMap::new())),
        session: Arc::new(session),
        config: config.clone(),
        api_key,
        authorized_key: identity.public_key(),
        events: events_tx,
        supervisor: supervisor.clone(),
        client_id: client_id(),
    };

    let bind_addr = format!("{}:{}", daemon_config.ipc_host, daemon_config.ipc_port)
        .parse()
        .expect("valid ipc bind address");

    supervisor.write_pid_file()?;
    tracing::info!("daemon started, ipc listening on {bind_addr}");

    ipc::serve(bind_addr, app_state, supervisor.shutdown_signal()).await?;

    supervisor.release();
    tracing::info!("daemon stopped cleanly");
    Ok(())
}

fn client_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[0..8].copy_from_slice(b"-BT0001-");
    use rand::RngCore;
    rand::rngs::OsRng.fill_bytes(&mut id[8..]);
    id
}

// Mirrors the teacher's `tracing_subscriber` setup, reading the level
// from `RUST_LOG` with an `info` default rather than `engine::config`'s
// `observability.log_level`, since the latter isn't available until after
// `Config::validated()` has run.
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
