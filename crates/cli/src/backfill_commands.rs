use {
    anyhow::{Result, bail},
    clap::Subcommand,
    tgrelay_common::{ChatId, PairKey},
    tgrelay_config::load_config,
    tgrelay_engine::{FileStateStore, is_locked, reset_backfill},
};

use crate::Globals;

#[derive(Subcommand)]
pub enum BackfillAction {
    /// Forget that a pair was backfilled so its history is replayed on the
    /// worker's next start. The worker must be stopped.
    Reset {
        #[arg(long)]
        worker_id: String,
        #[arg(long, allow_hyphen_values = true)]
        source: ChatId,
        #[arg(long, allow_hyphen_values = true)]
        target: ChatId,
    },
}

pub async fn handle_backfill(globals: &Globals, action: BackfillAction) -> Result<()> {
    match action {
        BackfillAction::Reset {
            worker_id,
            source,
            target,
        } => reset(globals, &worker_id, PairKey::new(source, target)).await,
    }
}

async fn reset(globals: &Globals, worker_id: &str, key: PairKey) -> Result<()> {
    let config = load_config(&globals.config_path()?)?;
    let paths = config.storage_paths(globals.data_dir());

    if let Some(worker) = config.worker(worker_id) {
        let lock = paths.session_lock_file(&worker.credentials.session_name);
        if is_locked(&lock)? {
            bail!("worker '{worker_id}' is running; stop it before resetting backfill");
        }
    }

    let store = FileStateStore::new(paths.worker_state_dir(worker_id));
    if reset_backfill(&store, &key).await? {
        eprintln!("Backfill for {key} reset; it runs again on the next worker start.");
    } else {
        eprintln!("Pair {key} has no backfill record for worker '{worker_id}'.");
    }
    Ok(())
}
