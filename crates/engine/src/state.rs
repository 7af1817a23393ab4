//! Durable relay state: cursors, backfill tracking and the id-map.

use std::collections::{BTreeMap, HashSet, VecDeque};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tgrelay_common::{ChatId, MessageId, PairKey},
};

/// Where one source message landed in one target chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapEntry {
    pub source: ChatId,
    pub source_msg: MessageId,
    pub target: ChatId,
    pub target_msg: MessageId,
    pub timestamp: DateTime<Utc>,
}

/// Bounded (source, source message, target) → target message mapping.
///
/// Serialized as a flat list of entries in insertion order, which is also
/// the eviction order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<IdMapEntry>", into = "Vec<IdMapEntry>")]
pub struct IdMap {
    entries: BTreeMap<(ChatId, MessageId, ChatId), (u64, IdMapEntry)>,
    next_seq: u64,
}

impl From<Vec<IdMapEntry>> for IdMap {
    fn from(list: Vec<IdMapEntry>) -> Self {
        let mut map = Self::default();
        for entry in list {
            map.insert(entry);
        }
        map
    }
}

impl From<IdMap> for Vec<IdMapEntry> {
    fn from(map: IdMap) -> Self {
        let mut ordered: Vec<_> = map.entries.into_values().collect();
        ordered.sort_by_key(|(seq, _)| *seq);
        ordered.into_iter().map(|(_, e)| e).collect()
    }
}

impl IdMap {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, entry: IdMapEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert((entry.source, entry.source_msg, entry.target), (seq, entry));
    }

    pub fn record(
        &mut self,
        source: ChatId,
        source_msg: MessageId,
        target: ChatId,
        target_msg: MessageId,
    ) {
        self.insert(IdMapEntry {
            source,
            source_msg,
            target,
            target_msg,
            timestamp: Utc::now(),
        });
    }

    #[must_use]
    pub fn lookup(&self, source: ChatId, source_msg: MessageId, target: ChatId) -> Option<MessageId> {
        self.entries
            .get(&(source, source_msg, target))
            .map(|(_, e)| e.target_msg)
    }

    #[must_use]
    pub fn contains(&self, source: ChatId, source_msg: MessageId, target: ChatId) -> bool {
        self.entries.contains_key(&(source, source_msg, target))
    }

    /// Remove and return every entry for `source_msg`. With `source` unset
    /// the message id is matched in every source chat.
    pub fn take(&mut self, source: Option<ChatId>, source_msg: MessageId) -> Vec<IdMapEntry> {
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|(s, m, _)| *m == source_msg && source.is_none_or(|src| src == *s))
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .map(|(_, e)| e)
            .collect()
    }

    /// Once the map holds more than `max` entries, drop the oldest and keep
    /// the newest `retain`. Returns the number evicted.
    pub fn evict(&mut self, max: usize, retain: usize) -> usize {
        if self.entries.len() <= max {
            return 0;
        }
        let keep = retain.min(max);
        let mut by_age: Vec<_> = self.entries.iter().map(|(k, (seq, _))| (*seq, *k)).collect();
        by_age.sort_unstable();
        let excess = self.entries.len() - keep;
        for (_, key) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        excess
    }
}

/// Everything a worker persists between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayState {
    pub cursors: BTreeMap<ChatId, MessageId>,
    pub backfill: BTreeMap<PairKey, DateTime<Utc>>,
    pub id_map: IdMap,
}

impl RelayState {
    #[must_use]
    pub fn cursor(&self, source: ChatId) -> Option<MessageId> {
        self.cursors.get(&source).copied()
    }

    /// Move the cursor forward to `id`. Never moves it back.
    pub fn advance_cursor(&mut self, source: ChatId, id: MessageId) {
        let cursor = self.cursors.entry(source).or_insert(id);
        *cursor = (*cursor).max(id);
    }

    #[must_use]
    pub fn is_backfilled(&self, key: &PairKey) -> bool {
        self.backfill.contains_key(key)
    }

    pub fn mark_backfilled(&mut self, key: PairKey) {
        self.backfill.insert(key, Utc::now());
    }

    /// Forget that `key` was backfilled. Returns whether it was tracked.
    pub fn reset_backfill(&mut self, key: &PairKey) -> bool {
        self.backfill.remove(key).is_some()
    }
}

/// Bounded memory of recently relayed album group ids.
#[derive(Debug, Clone)]
pub struct GroupMemory {
    order: VecDeque<i64>,
    seen: HashSet<i64>,
    capacity: usize,
}

impl GroupMemory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn contains(&self, group_id: i64) -> bool {
        self.seen.contains(&group_id)
    }

    pub fn remember(&mut self, group_id: i64) {
        if !self.seen.insert(group_id) {
            return;
        }
        self.order.push_back(group_id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_never_regresses() {
        let mut state = RelayState::default();
        assert_eq!(state.cursor(-1), None);
        state.advance_cursor(-1, 10);
        state.advance_cursor(-1, 4);
        assert_eq!(state.cursor(-1), Some(10));
        state.advance_cursor(-1, 11);
        assert_eq!(state.cursor(-1), Some(11));
    }

    #[test]
    fn id_map_keeps_one_entry_per_target() {
        let mut map = IdMap::default();
        map.record(-1, 5, -2, 50);
        map.record(-1, 5, -3, 70);
        assert_eq!(map.lookup(-1, 5, -2), Some(50));
        assert_eq!(map.lookup(-1, 5, -3), Some(70));
        assert_eq!(map.lookup(-1, 5, -4), None);

        let taken = map.take(Some(-1), 5);
        assert_eq!(taken.len(), 2);
        assert!(map.is_empty());
        assert!(map.take(Some(-1), 5).is_empty());
    }

    #[test]
    fn take_without_chat_matches_any_source() {
        let mut map = IdMap::default();
        map.record(-1, 5, -2, 50);
        map.record(-9, 5, -2, 51);
        map.record(-9, 6, -2, 52);
        assert_eq!(map.take(None, 5).len(), 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn eviction_keeps_newest() {
        let mut map = IdMap::default();
        for i in 0..5001 {
            map.record(-1, i, -2, i + 1000);
        }
        assert_eq!(map.evict(5000, 4000), 1001);
        assert_eq!(map.len(), 4000);
        assert!(!map.contains(-1, 1000, -2));
        assert!(map.contains(-1, 1001, -2));
        assert!(map.contains(-1, 5000, -2));
        assert_eq!(map.evict(5000, 4000), 0);
    }

    #[test]
    fn id_map_serializes_in_insertion_order() {
        let mut map = IdMap::default();
        map.record(-1, 9, -2, 90);
        map.record(-1, 3, -2, 30);
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json[0]["source_msg"], 9);
        assert_eq!(json[1]["source_msg"], 3);

        let mut back: IdMap = serde_json::from_value(json).unwrap();
        back.record(-1, 4, -2, 40);
        back.evict(2, 2);
        assert!(!back.contains(-1, 9, -2));
    }

    #[test]
    fn reset_backfill() {
        let mut state = RelayState::default();
        let key = PairKey::new(-1, -2);
        state.mark_backfilled(key);
        assert!(state.is_backfilled(&key));
        assert!(state.reset_backfill(&key));
        assert!(!state.reset_backfill(&key));
    }

    #[test]
    fn group_memory_is_bounded() {
        let mut groups = GroupMemory::new(100);
        for g in 0..150 {
            groups.remember(g);
        }
        assert!(!groups.contains(49));
        assert!(groups.contains(50));
        assert!(groups.contains(149));
    }
}
