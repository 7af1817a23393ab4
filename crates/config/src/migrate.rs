//! Legacy single-account layout migration.
//!
//! Older config files carry `api_credentials` and `channel_pairs` at the top
//! level. They are folded into a single worker named `default` so the rest
//! of the system only ever sees the multi-worker layout.

use tracing::info;

use crate::schema::{RelayConfig, WorkerConfig};

/// Id given to the worker synthesized from a legacy config.
pub const LEGACY_WORKER_ID: &str = "default";

/// Returns `true` if anything was migrated.
pub fn migrate_legacy(config: &mut RelayConfig) -> bool {
    let Some(credentials) = config.api_credentials.take() else {
        return false;
    };
    let pairs = std::mem::take(&mut config.channel_pairs);

    if config.workers.iter().any(|w| w.worker_id == LEGACY_WORKER_ID) {
        // Already has an explicit default worker; the legacy block is stale.
        info!("ignoring legacy api_credentials: a 'default' worker already exists");
        return true;
    }

    info!(
        pairs = pairs.len(),
        "migrating legacy single-account config to worker '{LEGACY_WORKER_ID}'"
    );
    config.workers.insert(0, WorkerConfig {
        worker_id: LEGACY_WORKER_ID.into(),
        enabled: true,
        credentials,
        channel_pairs: pairs,
        replacement_rules: None,
        filters: None,
        settings: None,
    });
    true
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_layout_becomes_default_worker() {
        let json = r#"{
            "api_credentials": {"api_id": 7, "api_hash": "h", "session_name": "fwd"},
            "channel_pairs": [{"source": 1, "target": 2, "backfill_count": 10}],
            "replacement_rules": [{"find": "x", "replace": "y"}]
        }"#;
        let mut cfg: RelayConfig = serde_json::from_str(json).unwrap();
        assert!(migrate_legacy(&mut cfg));
        assert!(cfg.api_credentials.is_none());
        assert!(cfg.channel_pairs.is_empty());
        assert_eq!(cfg.workers.len(), 1);

        let desc = cfg.materialize(LEGACY_WORKER_ID).unwrap();
        assert_eq!(desc.credentials.session_name, "fwd");
        assert_eq!(desc.channel_pairs[0].backfill_count, 10);
        // Top-level rules become the worker's rules through inheritance.
        assert_eq!(desc.replacement_rules[0].find, "x");
    }

    #[test]
    fn multi_worker_layout_untouched() {
        let mut cfg = RelayConfig::default();
        assert!(!migrate_legacy(&mut cfg));
        assert!(cfg.workers.is_empty());
    }
}
