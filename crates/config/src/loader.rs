use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{env_subst::substitute_env, migrate::migrate_legacy, schema::RelayConfig};

/// Standard config file names, checked in order. `config.json` is the name
/// older single-account installs used.
const CONFIG_FILENAMES: &[&str] = &[
    "tgrelay.toml",
    "tgrelay.yaml",
    "tgrelay.yml",
    "tgrelay.json",
    "config.json",
];

/// Load config from the given path (any supported format), with env
/// substitution and legacy migration applied.
pub fn load_config(path: &Path) -> anyhow::Result<RelayConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    let mut config = parse_config(&raw, path)?;
    migrate_legacy(&mut config);
    Ok(config)
}

/// Load the config file as an untyped JSON value (used by validation to
/// detect unknown keys).
pub fn load_config_value(path: &Path) -> anyhow::Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config_value(&raw, path)
}

/// Resolve the config path: an explicit path wins, otherwise the standard
/// locations are searched.
///
/// Search order:
/// 1. `./tgrelay.{toml,yaml,yml,json}`, then `./config.json`
/// 2. `~/.config/tgrelay/` with the same names
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    find_config_file()
}

/// Find the first config file in standard locations.
pub(crate) fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(dir) = config_dir() {
        for name in CONFIG_FILENAMES {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Returns the user-global config directory (`~/.config/tgrelay/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "tgrelay").map(|d| d.config_dir().to_path_buf())
}

/// Returns the user-global data directory, falling back to `./data`.
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "tgrelay")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("data"))
}

/// Serialize `config` in the format implied by `path` and write it
/// atomically (temp file + rename).
pub fn save_config(path: &Path, config: &RelayConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    let body = match ext {
        "toml" => toml::to_string_pretty(config)
            .map_err(|e| anyhow::anyhow!("serialize config: {e}"))?,
        "yaml" | "yml" => serde_yaml::to_string(config)?,
        "json" => serde_json::to_string_pretty(config)?,
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    };
    let tmp = path.with_extension(format!("{ext}.tmp"));
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "saved config");
    Ok(())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<RelayConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

fn parse_config_value(raw: &str, path: &Path) -> anyhow::Result<serde_json::Value> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => {
            let v: toml::Value = toml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "yaml" | "yml" => {
            let v: serde_yaml::Value = serde_yaml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

/// Concrete filesystem locations derived from [`crate::schema::StorageConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub reload_marker: PathBuf,
}

impl StoragePaths {
    /// Durable state directory of one worker.
    #[must_use]
    pub fn worker_state_dir(&self, worker_id: &str) -> PathBuf {
        self.data_dir.join("workers").join(worker_id)
    }

    /// Scratch directory for media downloads of one worker.
    #[must_use]
    pub fn worker_scratch_dir(&self, worker_id: &str) -> PathBuf {
        self.data_dir.join("temp_media").join(worker_id)
    }

    /// Log file the supervisor redirects a worker's output to.
    #[must_use]
    pub fn worker_log_file(&self, worker_id: &str) -> PathBuf {
        self.data_dir
            .join("logs")
            .join(format!("worker_{worker_id}.log"))
    }

    /// Lock file guarding exclusive use of a session.
    #[must_use]
    pub fn session_lock_file(&self, session_name: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_name}.session.lock"))
    }

    #[must_use]
    pub fn status_file(&self) -> PathBuf {
        self.data_dir.join("supervisor_status.json")
    }
}

impl RelayConfig {
    /// Resolve storage locations. A CLI override beats the config value,
    /// which beats the platform data directory.
    #[must_use]
    pub fn storage_paths(&self, data_dir_override: Option<&Path>) -> StoragePaths {
        let data_dir = data_dir_override
            .map(Path::to_path_buf)
            .or_else(|| self.storage.data_dir.clone())
            .unwrap_or_else(default_data_dir);
        let sessions_dir = self
            .storage
            .sessions_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("sessions"));
        let reload_marker = self
            .storage
            .reload_marker
            .clone()
            .unwrap_or_else(|| data_dir.join("trigger_reload.flag"));
        StoragePaths {
            data_dir,
            sessions_dir,
            reload_marker,
        }
    }
}
