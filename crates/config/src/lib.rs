//! Configuration loading, validation, env substitution, and legacy migration.
//!
//! Config files: `tgrelay.toml`, `tgrelay.yaml`, `tgrelay.json`, or the
//! legacy `config.json`. Searched in `./` then `~/.config/tgrelay/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod descriptor;
pub mod env_subst;
pub mod loader;
pub mod migrate;
pub mod schema;
pub mod validate;
pub mod watch;

pub use {
    descriptor::WorkerDescriptor,
    loader::{
        StoragePaths, config_dir, default_data_dir, load_config, resolve_config_path, save_config,
    },
    migrate::{LEGACY_WORKER_ID, migrate_legacy},
    schema::{
        ChannelPair, Credentials, FilterConfig, FilterMode, RelayConfig, RelaySettings,
        ReplacementRule, StorageConfig, SupervisorConfig, WorkerConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate, validate_value},
    watch::ChangeWatcher,
};
