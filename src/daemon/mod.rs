use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use checkpoint::{Checkpointer, SELECTION_CHECKPOINT_FILE, TIMER_CHECKPOINT_FILE};
use hub::{Hub, SurfaceRegistry};
use instance::InstanceLock;
use ipc::{server::IpcServer, transport::Endpoint};
use selection::SelectionStore;
use storage::store::JsonStore;
use timer::service::TimerService;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::utils::clock::{Clock, DefaultClock};

pub mod args;
pub mod checkpoint;
pub mod hub;
pub mod instance;
pub mod ipc;
pub mod selection;
pub mod shutdown;
pub mod storage;
pub mod timer;

const DATA_DIR: &str = "data";

/// Represents the starting point for the daemon
pub async fn start_daemon(dir: PathBuf) -> Result<()> {
    std::env::set_current_dir(&dir).with_context(|| format!("Invalid directory {dir:?}"))?;
    run_daemon(dir, Arc::new(DefaultClock), CancellationToken::new()).await
}

/// Runs every daemon service for `dir` until `shutdown` is cancelled, by a signal or by a surface.
pub async fn run_daemon(
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) -> Result<()> {
    let _instance = InstanceLock::acquire(&dir)?;
    let store = Arc::new(JsonStore::open(dir.join(DATA_DIR), clock.clone()).await?);

    let timer_states = SurfaceRegistry::new();
    let (timer, timer_handle) = TimerService::restore(
        Checkpointer::new(dir.join(TIMER_CHECKPOINT_FILE)),
        timer_states.clone(),
        store.clone(),
        clock,
        shutdown.clone(),
    )
    .await;
    let selection = SelectionStore::restore(
        Checkpointer::new(dir.join(SELECTION_CHECKPOINT_FILE)),
        store.clone(),
    )
    .await;

    let hub = Hub {
        timer: timer_handle,
        timer_states,
        selection: selection.clone(),
        remote_commands: SurfaceRegistry::new(),
        store,
        shutdown: shutdown.clone(),
    };
    let server = match IpcServer::bind(Endpoint::for_dir(&dir), hub) {
        Ok(server) => server,
        Err(e) => {
            // Let the timer write its last checkpoint before giving up.
            shutdown.cancel();
            timer.run().await?;
            selection.finish().await;
            return Err(e);
        }
    };

    info!("Daemon started for {dir:?}");
    let (_, timer_result, server_result) = tokio::join!(
        shutdown::detect_shutdown(shutdown.clone()),
        timer.run(),
        server.run(),
    );
    selection.finish().await;

    if let Err(timer_result) = timer_result {
        error!("Timer service got an error {:?}", timer_result);
    }

    if let Err(server_result) = server_result {
        error!("IPC server got an error {:?}", server_result);
    }

    info!("Daemon stopped");
    Ok(())
}
