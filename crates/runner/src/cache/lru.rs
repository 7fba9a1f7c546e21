use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Behavior knobs for the LRU index.
#[derive(Debug, Clone)]
pub struct LruConfig {
    /// Upper bound on the summed entry sizes.
    pub max_size: u64,
    /// How many victims a single prune round may evict.
    pub items_to_prune: usize,
    /// A get only refreshes the access order every Nth call.
    pub gets_per_promote: u32,
    /// Entries released within this window are only evicted when no other
    /// victim suffices, so a back-to-back refetch stays free.
    pub grace: Duration,
}

impl Default for LruConfig {
    fn default() -> Self {
        LruConfig {
            max_size: 5000,
            items_to_prune: 500,
            gets_per_promote: 3,
            grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
struct Slot<V> {
    value: V,
    size: u64,
    last_access: u64,
    gets: u32,
    pins: u32,
    released_at: Option<Instant>,
}

/// Size-bounded LRU map with pinning.  Eviction happens synchronously inside
/// `set`; a pinned entry is never a victim.  When the victims available are
/// insufficient, admission fails and the value is handed back.
#[derive(Debug)]
pub struct LruCache<K, V> {
    config: LruConfig,
    tick: u64,
    total: u64,
    slots: HashMap<K, Slot<V>>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(config: LruConfig) -> Self {
        LruCache {
            config,
            tick: 0,
            total: 0,
            slots: HashMap::new(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Admits `key`, evicting least-recently-used unpinned entries while the
    /// size bound is exceeded.  Returns the evicted pairs, or the rejected
    /// value when eviction could not make enough room.  A failed admission
    /// has no side effects.
    pub fn set(&mut self, key: K, value: V, size: u64) -> Result<Vec<(K, V)>, V> {
        let replaced = self.slots.remove(&key).map(|slot| {
            self.total -= slot.size;
            slot
        });

        let needed = (self.total + size).saturating_sub(self.config.max_size);
        if needed > 0 {
            let evictable: u64 = self
                .slots
                .values()
                .filter(|slot| slot.pins == 0)
                .map(|slot| slot.size)
                .sum();
            if evictable < needed {
                if let Some(old) = replaced {
                    self.total += old.size;
                    self.slots.insert(key, old);
                }
                return Err(value);
            }
        }

        self.tick += 1;
        self.total += size;
        self.slots.insert(
            key.clone(),
            Slot {
                value,
                size,
                last_access: self.tick,
                gets: 0,
                pins: 0,
                released_at: None,
            },
        );

        let mut evicted = Vec::new();
        while self.total > self.config.max_size {
            let round = self.prune_round(&key);
            debug_assert!(!round.is_empty());
            if round.is_empty() {
                break;
            }
            for (k, v, s) in round {
                self.total -= s;
                evicted.push((k, v));
            }
        }
        Ok(evicted)
    }

    /// One eviction round of up to `items_to_prune` victims, preferring
    /// entries outside the release grace window.
    fn prune_round(&mut self, protect: &K) -> Vec<(K, V, u64)> {
        let now = Instant::now();
        let mut candidates: Vec<(&K, u64, bool)> = self
            .slots
            .iter()
            .filter(|(k, slot)| slot.pins == 0 && *k != protect)
            .map(|(k, slot)| {
                let recent = slot
                    .released_at
                    .map(|at| now.duration_since(at) < self.config.grace)
                    .unwrap_or(false);
                (k, slot.last_access, recent)
            })
            .collect();
        // Aged entries first, each group least-recently-used first.
        candidates.sort_by_key(|(_, last_access, recent)| (*recent, *last_access));

        let keys: Vec<K> = candidates
            .into_iter()
            .take(self.config.items_to_prune.max(1))
            .map(|(k, _, _)| k.clone())
            .collect();
        keys.into_iter()
            .map(|k| {
                let slot = self.slots.remove(&k).unwrap();
                (k, slot.value, slot.size)
            })
            .collect()
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let gets_per_promote = self.config.gets_per_promote.max(1);
        let tick = &mut self.tick;
        self.slots.get_mut(key).map(|slot| {
            slot.gets += 1;
            if slot.gets >= gets_per_promote {
                slot.gets = 0;
                *tick += 1;
                slot.last_access = *tick;
            }
            &slot.value
        })
    }

    /// Residency check that does not disturb the access order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.slots.get(key).map(|slot| &slot.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn pin(&mut self, key: &K) -> bool {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.pins += 1;
            true
        } else {
            false
        }
    }

    pub fn unpin(&mut self, key: &K) {
        if let Some(slot) = self.slots.get_mut(key) {
            if slot.pins == 0 {
                log::warn!("unbalanced unpin ignored");
                return;
            }
            slot.pins -= 1;
            if slot.pins == 0 {
                slot.released_at = Some(Instant::now());
            }
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.slots.remove(key).map(|slot| {
            self.total -= slot.size;
            slot.value
        })
    }
}
