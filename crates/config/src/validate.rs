//! Configuration validation engine.
//!
//! Parses the config file, flags unknown/misspelled keys, type errors and
//! semantic problems (duplicate workers, shared sessions, bad regex rules).

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use serde_json::Value;

use crate::{
    loader::{find_config_file, load_config_value},
    migrate::migrate_legacy,
    schema::{FilterMode, RelayConfig},
};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "workers", "pairs",
    /// "rules", "filters", "settings"
    pub category: &'static str,
    /// Dotted path, e.g. "workers[0].api_hash"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<std::path::PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

fn diag(
    severity: Severity,
    category: &'static str,
    path: impl Into<String>,
    message: impl Into<String>,
) -> Diagnostic {
    Diagnostic {
        severity,
        category,
        path: path.into(),
        message: message.into(),
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    Array(Box<KnownKeys>),
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Leaf, Struct};

    let pair = || {
        Array(Box::new(Struct(HashMap::from([
            ("source", Leaf),
            ("target", Leaf),
            ("enabled", Leaf),
            ("backfill_count", Leaf),
        ]))))
    };
    let rules = || {
        Array(Box::new(Struct(HashMap::from([
            ("find", Leaf),
            ("replace", Leaf),
            ("case_sensitive", Leaf),
            ("is_regex", Leaf),
        ]))))
    };
    let filters = || {
        Struct(HashMap::from([
            ("enabled", Leaf),
            ("mode", Leaf),
            ("keywords", Leaf),
        ]))
    };
    let settings = || {
        Struct(HashMap::from([
            ("retry_attempts", Leaf),
            ("retry_delay_secs", Leaf),
            ("retry_delay", Leaf),
            ("flood_wait_extra_delay_secs", Leaf),
            ("flood_wait_extra_delay", Leaf),
            ("max_message_length", Leaf),
            ("poll_interval_secs", Leaf),
            ("poll_batch_size", Leaf),
            ("reload_interval_secs", Leaf),
            ("add_source_link", Leaf),
            ("source_link_text", Leaf),
            ("id_map_max_entries", Leaf),
            ("id_map_retain_entries", Leaf),
            ("max_deferrals", Leaf),
            ("log_level", Leaf),
        ]))
    };
    let credentials = [
        "api_id",
        "api_hash",
        "session_name",
        "bridge_url",
        "bridge_token",
    ];

    let mut worker = HashMap::from([
        ("worker_id", Leaf),
        ("enabled", Leaf),
        ("channel_pairs", pair()),
        ("replacement_rules", rules()),
        ("filters", filters()),
        ("settings", settings()),
    ]);
    for key in credentials {
        worker.insert(key, Leaf);
    }

    Struct(HashMap::from([
        (
            "supervisor",
            Struct(HashMap::from([
                ("health_interval_secs", Leaf),
                ("stop_timeout_secs", Leaf),
                ("restart_delay_secs", Leaf),
                ("quick_exit_window_secs", Leaf),
                ("quick_exit_cooldown_secs", Leaf),
                ("max_restarts", Leaf),
                ("session_lock_wait_secs", Leaf),
            ])),
        ),
        (
            "storage",
            Struct(HashMap::from([
                ("data_dir", Leaf),
                ("sessions_dir", Leaf),
                ("reload_marker", Leaf),
            ])),
        ),
        ("replacement_rules", rules()),
        ("filters", filters()),
        ("settings", settings()),
        ("workers", Array(Box::new(Struct(worker)))),
        (
            "api_credentials",
            Struct(credentials.iter().map(|k| (*k, Leaf)).collect()),
        ),
        ("channel_pairs", pair()),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate the config file at `path`, or the discovered one when `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path.map(Path::to_path_buf).or_else(find_config_file);

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![diag(
                Severity::Error,
                "syntax",
                "",
                "no config file found",
            )],
            config_path: None,
        };
    };

    let mut result = match load_config_value(&actual_path) {
        Ok(value) => validate_value(&value),
        Err(e) => ValidationResult {
            diagnostics: vec![diag(
                Severity::Error,
                "syntax",
                "",
                format!("failed to parse config file: {e}"),
            )],
            config_path: None,
        },
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate an already-parsed config tree without touching the filesystem.
#[must_use]
pub fn validate_value(value: &Value) -> ValidationResult {
    let mut diagnostics = Vec::new();

    check_unknown_fields(value, &build_schema_map(), "", &mut diagnostics);

    match serde_json::from_value::<RelayConfig>(value.clone()) {
        Ok(mut config) => {
            if migrate_legacy(&mut config) {
                diagnostics.push(diag(
                    Severity::Info,
                    "workers",
                    "api_credentials",
                    "legacy single-account layout; run `tgrelay config migrate` to rewrite it",
                ));
            }
            check_semantics(&config, &mut diagnostics);
        },
        Err(e) => diagnostics.push(diag(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn check_unknown_fields(
    value: &Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (value, schema) {
        (Value::Object(map), KnownKeys::Struct(fields)) => {
            let known: Vec<&str> = fields.keys().copied().collect();
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match fields.get(key.as_str()) {
                    Some(child_schema) => {
                        check_unknown_fields(child, child_schema, &path, diagnostics);
                    },
                    None => {
                        let message = match suggest(key, &known, 3) {
                            Some(hint) => format!("unknown field (did you mean \"{hint}\"?)"),
                            None => "unknown field".to_string(),
                        };
                        diagnostics.push(diag(Severity::Warning, "unknown-field", path, message));
                    },
                }
            }
        },
        (Value::Array(items), KnownKeys::Array(item_schema)) => {
            for (i, item) in items.iter().enumerate() {
                check_unknown_fields(item, item_schema, &format!("{prefix}[{i}]"), diagnostics);
            }
        },
        _ => {},
    }
}

fn check_semantics(config: &RelayConfig, diagnostics: &mut Vec<Diagnostic>) {
    if config.workers.iter().all(|w| !w.enabled) {
        diagnostics.push(diag(
            Severity::Warning,
            "workers",
            "workers",
            "no enabled workers; the supervisor will idle",
        ));
    }

    let mut worker_ids = HashSet::new();
    let mut sessions: HashMap<&str, &str> = HashMap::new();
    for (i, worker) in config.workers.iter().enumerate() {
        let at = format!("workers[{i}]");
        if worker.worker_id.trim().is_empty() {
            diagnostics.push(diag(
                Severity::Error,
                "workers",
                format!("{at}.worker_id"),
                "worker_id must not be empty",
            ));
        } else if !worker_ids.insert(worker.worker_id.as_str()) {
            diagnostics.push(diag(
                Severity::Error,
                "workers",
                format!("{at}.worker_id"),
                format!("duplicate worker_id \"{}\"", worker.worker_id),
            ));
        }
        if !worker.enabled {
            continue;
        }
        if !worker.credentials.is_configured() {
            diagnostics.push(diag(
                Severity::Error,
                "workers",
                format!("{at}.api_hash"),
                "api_id and api_hash are required",
            ));
        }
        let session = worker.credentials.session_name.as_str();
        if let Some(other) = sessions.insert(session, worker.worker_id.as_str()) {
            diagnostics.push(diag(
                Severity::Error,
                "workers",
                format!("{at}.session_name"),
                format!("session \"{session}\" is already used by worker \"{other}\""),
            ));
        }
    }

    for desc in config.materialize_all() {
        let Some(i) = config
            .workers
            .iter()
            .position(|w| w.worker_id == desc.worker_id)
        else {
            continue;
        };
        let at = format!("workers[{i}]");

        let mut keys = HashSet::new();
        for (j, pair) in desc.channel_pairs.iter().enumerate() {
            let path = format!("{at}.channel_pairs[{j}]");
            if pair.source == pair.target {
                diagnostics.push(diag(
                    Severity::Error,
                    "pairs",
                    path.clone(),
                    "source and target are the same chat",
                ));
            }
            if !keys.insert(pair.key()) {
                diagnostics.push(diag(
                    Severity::Warning,
                    "pairs",
                    path,
                    format!("duplicate pair {}", pair.key()),
                ));
            }
        }

        for (j, rule) in desc.replacement_rules.iter().enumerate() {
            let path = format!("{at}.replacement_rules[{j}]");
            if rule.find.is_empty() {
                diagnostics.push(diag(
                    Severity::Warning,
                    "rules",
                    path,
                    "empty `find`; rule is ignored",
                ));
            } else if rule.is_regex
                && let Err(e) = regex::Regex::new(&rule.find)
            {
                diagnostics.push(diag(
                    Severity::Error,
                    "rules",
                    path,
                    format!("invalid regex: {e}"),
                ));
            }
        }

        if desc.filters.enabled && desc.filters.keywords.is_empty() {
            let hint = match desc.filters.mode {
                FilterMode::Whitelist => "every message with text is forwarded",
                FilterMode::Blacklist => "nothing is blocked",
            };
            diagnostics.push(diag(
                Severity::Warning,
                "filters",
                format!("{at}.filters"),
                format!("filters enabled without keywords; {hint}"),
            ));
        }

        if desc.settings.retry_attempts == 0 {
            diagnostics.push(diag(
                Severity::Error,
                "settings",
                format!("{at}.settings.retry_attempts"),
                "retry_attempts must be at least 1",
            ));
        }
        if desc.settings.id_map_retain_entries > desc.settings.id_map_max_entries {
            diagnostics.push(diag(
                Severity::Warning,
                "settings",
                format!("{at}.settings.id_map_retain_entries"),
                "retain count exceeds the cap; eviction will keep the cap instead",
            ));
        }
    }
}
