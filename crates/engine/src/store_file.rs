//! JSON file-backed state store with atomic writes.
//!
//! Layout under the worker's state directory: `cursors.json`,
//! `backfill.json` and `id_map.json`, each replaced atomically with the
//! previous version kept as `.bak`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::{Serialize, de::DeserializeOwned},
    tgrelay_common::{ChatId, MessageId, PairKey},
    tokio::fs,
    tracing::warn,
};

use crate::{
    Result,
    error::Context,
    state::{IdMap, RelayState},
    store::StateStore,
};

const CURSORS_FILE: &str = "cursors.json";
const BACKFILL_FILE: &str = "backfill.json";
const ID_MAP_FILE: &str = "id_map.json";

pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Atomic write: write to temp, rename over target, keep `.bak`.
    async fn atomic_write<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(name);
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, json.as_bytes()).await?;

        if fs::try_exists(&path).await.unwrap_or(false) {
            let bak = path.with_extension("json.bak");
            let _ = fs::copy(&path, &bak).await;
        }

        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Read `name`, falling back to its `.bak` copy when the primary file
    /// is unreadable. Absent files yield `T::default()`.
    async fn read_or_default<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(name);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(T::default());
        }
        let data = fs::read_to_string(&path).await?;
        match serde_json::from_str(&data) {
            Ok(value) => Ok(value),
            Err(e) => {
                let bak = path.with_extension("json.bak");
                warn!(path = %path.display(), error = %e, "state file corrupt, trying backup");
                let data = fs::read_to_string(&bak)
                    .await
                    .with_context(|| format!("failed to parse {name} and no backup exists"))?;
                serde_json::from_str(&data)
                    .with_context(|| format!("failed to parse {name} and its backup"))
            },
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<RelayState> {
        Ok(RelayState {
            cursors: self.read_or_default(CURSORS_FILE).await?,
            backfill: self.read_or_default(BACKFILL_FILE).await?,
            id_map: self.read_or_default(ID_MAP_FILE).await?,
        })
    }

    async fn save_cursors(&self, cursors: &BTreeMap<ChatId, MessageId>) -> Result<()> {
        self.atomic_write(CURSORS_FILE, cursors).await
    }

    async fn save_backfill(&self, backfill: &BTreeMap<PairKey, DateTime<Utc>>) -> Result<()> {
        self.atomic_write(BACKFILL_FILE, backfill).await
    }

    async fn save_id_map(&self, id_map: &IdMap) -> Result<()> {
        self.atomic_write(ID_MAP_FILE, id_map).await
    }
}
