use std::{sync::Arc, time::Duration};

use {
    anyhow::Result,
    tgrelay_common::EXIT_SESSION_LOCKED,
    tgrelay_config::load_config,
    tgrelay_engine::{Error as EngineError, FileStateStore, RelayEngine, SessionLock},
    tgrelay_platform::HttpBridgeClient,
    tokio_util::sync::CancellationToken,
    tracing::{error, info},
};

use crate::{Globals, shutdown_signal};

/// Run one worker until signalled. Returns the process exit code.
pub async fn run_worker(globals: &Globals, worker_id: &str) -> Result<i32> {
    let config_path = globals.config_path()?;
    let config = load_config(&config_path)?;
    let descriptor = config
        .materialize(worker_id)
        .ok_or_else(|| EngineError::worker_not_configured(worker_id))?;
    let paths = config.storage_paths(globals.data_dir());
    let credentials = descriptor.credentials.clone();

    let mut lock = SessionLock::open(paths.session_lock_file(&credentials.session_name))?;
    let wait = Duration::from_secs(config.supervisor.session_lock_wait_secs);
    let _session = match lock.acquire(wait).await {
        Ok(guard) => guard,
        Err(e @ EngineError::SessionLocked { .. }) => {
            error!(worker_id, error = %e, "cannot start worker");
            return Ok(EXIT_SESSION_LOCKED);
        },
        Err(e) => return Err(e.into()),
    };

    let client = HttpBridgeClient::new(
        credentials.bridge_url.clone(),
        credentials.session_name.clone(),
        credentials.bridge_token.clone(),
    )?;
    let store = FileStateStore::new(paths.worker_state_dir(worker_id));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        on_signal.cancel();
    });

    info!(
        worker_id,
        session = %credentials.session_name,
        pairs = descriptor.channel_pairs.len(),
        "worker starting"
    );
    RelayEngine::new(
        descriptor,
        Arc::new(client),
        Arc::new(store),
        paths.worker_scratch_dir(worker_id),
    )
    .with_reload(config_path, paths.reload_marker.clone())
    .with_cancel(cancel)
    .run()
    .await?;
    Ok(0)
}
