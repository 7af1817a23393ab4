//! Materialized per-worker configuration.
//!
//! A [`WorkerDescriptor`] is what one relay process actually runs with:
//! worker-level overrides merged over the top-level defaults. The supervisor
//! compares descriptor fingerprints to decide whether a running worker must
//! be restarted.

use {
    serde::Serialize,
    sha2::{Digest, Sha256},
};

use crate::schema::{
    ChannelPair, Credentials, FilterConfig, RelayConfig, RelaySettings, ReplacementRule,
};

#[derive(Debug, Clone, Serialize)]
pub struct WorkerDescriptor {
    pub worker_id: String,
    pub credentials: Credentials,
    pub channel_pairs: Vec<ChannelPair>,
    pub replacement_rules: Vec<ReplacementRule>,
    pub filters: FilterConfig,
    pub settings: RelaySettings,
}

impl WorkerDescriptor {
    /// Hex SHA-256 over the serialized descriptor, secrets included, so a
    /// credential rotation also counts as a change.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Pairs the poll loop should look at.
    pub fn enabled_pairs(&self) -> impl Iterator<Item = &ChannelPair> {
        self.channel_pairs.iter().filter(|p| p.enabled)
    }
}

impl RelayConfig {
    /// Materialize the descriptor for `worker_id`. Disabled or unknown
    /// workers yield `None`.
    #[must_use]
    pub fn materialize(&self, worker_id: &str) -> Option<WorkerDescriptor> {
        let worker = self.worker(worker_id).filter(|w| w.enabled)?;
        Some(WorkerDescriptor {
            worker_id: worker.worker_id.clone(),
            credentials: worker.credentials.clone(),
            channel_pairs: worker.channel_pairs.clone(),
            replacement_rules: worker
                .replacement_rules
                .clone()
                .unwrap_or_else(|| self.replacement_rules.clone()),
            filters: worker
                .filters
                .clone()
                .unwrap_or_else(|| self.filters.clone()),
            settings: worker
                .settings
                .clone()
                .unwrap_or_else(|| self.settings.clone()),
        })
    }

    /// Descriptors for every enabled worker, in config order.
    #[must_use]
    pub fn materialize_all(&self) -> Vec<WorkerDescriptor> {
        self.workers
            .iter()
            .filter(|w| w.enabled)
            .filter_map(|w| self.materialize(&w.worker_id))
            .collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::schema::WorkerConfig, secrecy::Secret};

    fn worker(id: &str) -> WorkerConfig {
        WorkerConfig {
            worker_id: id.into(),
            enabled: true,
            credentials: Credentials {
                api_id: 1,
                api_hash: Secret::new("hash".into()),
                session_name: format!("{id}_session"),
                ..Default::default()
            },
            channel_pairs: vec![ChannelPair {
                source: -1001,
                target: -1002,
                enabled: true,
                backfill_count: 0,
            }],
            replacement_rules: None,
            filters: None,
            settings: None,
        }
    }

    #[test]
    fn worker_inherits_top_level_defaults() {
        let cfg = RelayConfig {
            replacement_rules: vec![ReplacementRule {
                find: "a".into(),
                replace: "b".into(),
                ..Default::default()
            }],
            workers: vec![worker("alpha")],
            ..Default::default()
        };
        let desc = cfg.materialize("alpha").unwrap();
        assert_eq!(desc.replacement_rules.len(), 1);
        assert_eq!(desc.settings, RelaySettings::default());
    }

    #[test]
    fn worker_override_wins() {
        let mut w = worker("alpha");
        w.replacement_rules = Some(Vec::new());
        let cfg = RelayConfig {
            replacement_rules: vec![ReplacementRule::default()],
            workers: vec![w],
            ..Default::default()
        };
        assert!(cfg.materialize("alpha").unwrap().replacement_rules.is_empty());
    }

    #[test]
    fn disabled_worker_is_not_materialized() {
        let mut w = worker("alpha");
        w.enabled = false;
        let cfg = RelayConfig {
            workers: vec![w, worker("beta")],
            ..Default::default()
        };
        assert!(cfg.materialize("alpha").is_none());
        let all = cfg.materialize_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].worker_id, "beta");
    }

    #[test]
    fn fingerprint_tracks_changes() {
        let cfg = RelayConfig {
            workers: vec![worker("alpha")],
            ..Default::default()
        };
        let before = cfg.materialize("alpha").unwrap().fingerprint();
        assert_eq!(before, cfg.materialize("alpha").unwrap().fingerprint());
        assert_eq!(before.len(), 64);

        let mut changed = cfg.clone();
        changed.workers[0].credentials.api_hash = Secret::new("rotated".into());
        assert_ne!(before, changed.materialize("alpha").unwrap().fingerprint());

        let mut changed = cfg.clone();
        changed.workers[0].channel_pairs[0].backfill_count = 5;
        assert_ne!(before, changed.materialize("alpha").unwrap().fingerprint());
    }
}
