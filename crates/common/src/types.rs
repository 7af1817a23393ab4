//! Identifier types shared by the relay engine, config and supervisor.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// Platform chat/channel identifier (channels use the `-100…` form).
pub type ChatId = i64;

/// Platform message identifier, unique and increasing within one chat.
pub type MessageId = i64;

/// Exit status of a worker that could not obtain its session lock. The
/// supervisor marks such workers failed instead of restarting them.
pub const EXIT_SESSION_LOCKED: i32 = 75;

/// Identity of one forwarding edge inside a worker: `"<source>:<target>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub source: ChatId,
    pub target: ChatId,
}

impl PairKey {
    #[must_use]
    pub fn new(source: ChatId, target: ChatId) -> Self {
        Self { source, target }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.target)
    }
}

impl FromStr for PairKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Both ids may be negative, so split on the separator rather than '-'.
        let (source, target) = s
            .split_once(':')
            .ok_or_else(|| Error::invalid_pair_key(s))?;
        let source = source
            .trim()
            .parse()
            .map_err(|_| Error::invalid_pair_key(s))?;
        let target = target
            .trim()
            .parse()
            .map_err(|_| Error::invalid_pair_key(s))?;
        Ok(Self { source, target })
    }
}

impl Serialize for PairKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PairKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::collections::BTreeMap};

    #[test]
    fn display_and_parse_negative_ids() {
        let key = PairKey::new(-1001234, -1005678);
        assert_eq!(key.to_string(), "-1001234:-1005678");
        assert_eq!("-1001234:-1005678".parse::<PairKey>().unwrap(), key);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("nope".parse::<PairKey>().is_err());
        assert!("1:two".parse::<PairKey>().is_err());
    }

    #[test]
    fn usable_as_json_map_key() {
        let mut map = BTreeMap::new();
        map.insert(PairKey::new(1, 2), "done");
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"1:2":"done"}"#);
        let back: BTreeMap<PairKey, String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[&PairKey::new(1, 2)], "done");
    }
}
