//! Config schema types (workers, channel pairs, rules, filters, settings).

use std::path::PathBuf;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tgrelay_common::{ChatId, PairKey},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub supervisor: SupervisorConfig,
    pub storage: StorageConfig,
    /// Default rules for workers that do not define their own.
    pub replacement_rules: Vec<ReplacementRule>,
    /// Default filters for workers that do not define their own.
    pub filters: FilterConfig,
    /// Default settings for workers that do not define their own.
    pub settings: RelaySettings,
    pub workers: Vec<WorkerConfig>,

    /// Legacy single-account layout; folded into `workers` on load.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_credentials: Option<Credentials>,
    /// Legacy single-account pairs; folded into `workers` on load.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub channel_pairs: Vec<ChannelPair>,
}

impl RelayConfig {
    /// Look up a worker entry by id (enabled or not).
    #[must_use]
    pub fn worker(&self, worker_id: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.worker_id == worker_id)
    }
}

/// Process supervision tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Seconds between health checks.
    pub health_interval_secs: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_timeout_secs: u64,
    /// Delay before restarting a worker that ran for a while.
    pub restart_delay_secs: u64,
    /// A worker dying sooner than this after start is treated as a
    /// session-lock collision.
    pub quick_exit_window_secs: u64,
    /// Cool-down unit for quick exits, multiplied by the restart count.
    pub quick_exit_cooldown_secs: u64,
    /// Restart ceiling; reaching it marks the worker failed.
    pub max_restarts: u32,
    /// Bound on waiting for a held session lock.
    pub session_lock_wait_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 10,
            stop_timeout_secs: 10,
            restart_delay_secs: 2,
            quick_exit_window_secs: 10,
            quick_exit_cooldown_secs: 30,
            max_restarts: 5,
            session_lock_wait_secs: 30,
        }
    }
}

/// Where durable state, session locks and the reload marker live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for per-worker state, logs and the supervisor status file.
    pub data_dir: Option<PathBuf>,
    /// Directory holding `<session_name>.session.lock` files.
    /// Defaults to `<data_dir>/sessions`.
    pub sessions_dir: Option<PathBuf>,
    /// File admin tooling touches to force a reload.
    /// Defaults to `<data_dir>/trigger_reload.flag`.
    pub reload_marker: Option<PathBuf>,
}

/// Account credentials for one worker.
///
/// The platform gateway owns the authenticated session; the worker only
/// identifies itself and the session it needs.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub api_id: i64,

    #[serde(serialize_with = "serialize_secret")]
    pub api_hash: Secret<String>,

    pub session_name: String,

    /// Base URL of the platform gateway.
    pub bridge_url: String,

    #[serde(
        serialize_with = "serialize_optional_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub bridge_token: Option<Secret<String>>,
}

impl Credentials {
    /// `true` when both api id and hash are set.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.api_id != 0 && !self.api_hash.expose_secret().is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_id", &self.api_id)
            .field("api_hash", &"[REDACTED]")
            .field("session_name", &self.session_name)
            .field("bridge_url", &self.bridge_url)
            .finish_non_exhaustive()
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            api_id: 0,
            api_hash: Secret::new(String::new()),
            session_name: "forwarder_session".into(),
            bridge_url: "http://127.0.0.1:8089".into(),
            bridge_token: None,
        }
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn serialize_optional_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

/// One worker entry as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub credentials: Credentials,

    #[serde(default)]
    pub channel_pairs: Vec<ChannelPair>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_rules: Option<Vec<ReplacementRule>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<RelaySettings>,
}

/// A configured (source, target) forwarding edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelPair {
    pub source: ChatId,
    pub target: ChatId,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of historical messages to relay once when the pair is new.
    #[serde(default)]
    pub backfill_count: u32,
}

impl ChannelPair {
    #[must_use]
    pub fn key(&self) -> PairKey {
        PairKey::new(self.source, self.target)
    }
}

/// Ordered text substitution rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReplacementRule {
    pub find: String,
    pub replace: String,
    pub case_sensitive: bool,
    pub is_regex: bool,
}

/// Keyword filter mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Forward only messages containing a keyword.
    #[default]
    Whitelist,
    /// Forward only messages containing none of the keywords.
    Blacklist,
}

/// Keyword filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilterConfig {
    pub enabled: bool,
    pub mode: FilterMode,
    pub keywords: Vec<String>,
}

/// Per-worker relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelaySettings {
    /// Delivery attempts per message, including rate-limit waits.
    pub retry_attempts: u32,
    /// Base of the exponential backoff for generic failures.
    #[serde(alias = "retry_delay")]
    pub retry_delay_secs: u64,
    /// Added on top of every rate-limit or slow-mode wait.
    #[serde(alias = "flood_wait_extra_delay")]
    pub flood_wait_extra_delay_secs: u64,
    /// Text messages longer than this are split.
    pub max_message_length: usize,
    pub poll_interval_secs: u64,
    pub poll_batch_size: usize,
    pub reload_interval_secs: u64,
    /// Append a link back to the source message.
    pub add_source_link: bool,
    /// Template for the link suffix; `{link}` is replaced.
    pub source_link_text: String,
    pub id_map_max_entries: usize,
    pub id_map_retain_entries: usize,
    /// Ticks a message may be deferred before it is skipped.
    pub max_deferrals: u32,
    pub log_level: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_delay_secs: 5,
            flood_wait_extra_delay_secs: 10,
            max_message_length: 4096,
            poll_interval_secs: 5,
            poll_batch_size: 100,
            reload_interval_secs: 120,
            add_source_link: false,
            source_link_text: "\n\n🔗 Source: {link}".into(),
            id_map_max_entries: 5000,
            id_map_retain_entries: 4000,
            max_deferrals: 3,
            log_level: "info".into(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_accept_legacy_names() {
        let json = r#"{"retry_delay": 3, "flood_wait_extra_delay": 7}"#;
        let settings: RelaySettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.retry_delay_secs, 3);
        assert_eq!(settings.flood_wait_extra_delay_secs, 7);
        assert_eq!(settings.retry_attempts, 5);
    }

    #[test]
    fn worker_credentials_are_flattened() {
        let json = r#"{
            "worker_id": "alpha",
            "api_id": 42,
            "api_hash": "abc",
            "session_name": "alpha_session",
            "channel_pairs": [{"source": -1001, "target": -1002}]
        }"#;
        let worker: WorkerConfig = serde_json::from_str(json).unwrap();
        assert!(worker.enabled);
        assert_eq!(worker.credentials.api_id, 42);
        assert_eq!(worker.credentials.api_hash.expose_secret(), "abc");
        assert_eq!(worker.channel_pairs[0].key().to_string(), "-1001:-1002");
        assert!(worker.channel_pairs[0].enabled);
        assert_eq!(worker.channel_pairs[0].backfill_count, 0);
        assert!(worker.replacement_rules.is_none());
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials {
            api_hash: Secret::new("super-secret".into()),
            ..Default::default()
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn filter_mode_lowercase() {
        let f: FilterConfig =
            serde_json::from_str(r#"{"enabled": true, "mode": "blacklist", "keywords": ["x"]}"#)
                .unwrap();
        assert_eq!(f.mode, FilterMode::Blacklist);
    }
}
