use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use xchat_types::{CacheKey, FreshnessToken, Row};

use crate::CacheEntry;

/// Arena-backed entry table with an explicit recency order.
///
/// `slots` owns the entries, `index` maps keys to slots and `recency` maps a
/// monotonically increasing use tick to the slot, so the smallest tick is the
/// least recently used entry.
pub(crate) struct EntryTable {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<CacheKey, usize>,
    recency: BTreeMap<u64, usize>,
    tick: u64,
}

struct Slot {
    key: CacheKey,
    entry: CacheEntry,
    last_used: u64,
}

pub(crate) enum Found {
    /// Shared rows plus the column order they were projected in.
    Hit { rows: Arc<Vec<Row>>, columns: Vec<String> },
    Stale,
    Missing,
}

impl EntryTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn contains(&self, key: &CacheKey) -> bool {
        self.index.contains_key(key)
    }

    /// Serve `key` if its stored token equals `current`. A mismatched entry
    /// is dropped on the spot.
    pub(crate) fn lookup(&mut self, key: &CacheKey, current: FreshnessToken) -> Found {
        let Some(&slot_idx) = self.index.get(key) else {
            return Found::Missing;
        };
        let fresh = self.slots[slot_idx]
            .as_ref()
            .map(|s| s.entry.token == current)
            .unwrap_or(false);
        if !fresh {
            self.remove(key);
            return Found::Stale;
        }
        self.touch(slot_idx);
        match &self.slots[slot_idx] {
            Some(slot) => Found::Hit {
                rows: Arc::clone(&slot.entry.rows),
                columns: slot.entry.descriptor.columns.clone(),
            },
            None => Found::Missing,
        }
    }

    pub(crate) fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
        self.remove(&key);
        self.tick += 1;
        let slot = Slot {
            key: key.clone(),
            entry,
            last_used: self.tick,
        };
        let slot_idx = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot_idx);
        self.recency.insert(self.tick, slot_idx);
    }

    pub(crate) fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let slot_idx = self.index.remove(key)?;
        let slot = self.slots[slot_idx].take()?;
        self.recency.remove(&slot.last_used);
        self.free.push(slot_idx);
        Some(slot.entry)
    }

    /// Evict least recently used entries until at most `capacity` remain.
    /// `keep` is never chosen, so an entry just stored for a waiting caller
    /// survives even when it alone exceeds the capacity.
    pub(crate) fn evict_to(&mut self, capacity: usize, keep: Option<&CacheKey>) -> Vec<CacheKey> {
        let mut evicted = Vec::new();
        while self.len() > capacity {
            let victim = self
                .recency
                .values()
                .filter_map(|&i| self.slots[i].as_ref())
                .map(|s| s.key.clone())
                .find(|k| Some(k) != keep);
            let Some(key) = victim else { break };
            self.remove(&key);
            evicted.push(key);
        }
        evicted
    }

    pub(crate) fn remove_source(&mut self, source: &str) -> usize {
        let keys: Vec<CacheKey> = self
            .slots
            .iter()
            .flatten()
            .filter(|s| s.entry.descriptor.raw_data_source == source)
            .map(|s| s.key.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    fn touch(&mut self, slot_idx: usize) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.slots[slot_idx].as_mut() {
            self.recency.remove(&slot.last_used);
            slot.last_used = tick;
            self.recency.insert(tick, slot_idx);
        }
    }
}
