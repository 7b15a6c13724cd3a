use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Never evicts. For small enumerable dimensions.
    Unbounded,
    /// Once `high` entries are exceeded, least recently used entries are
    /// evicted until `low` remain.
    Watermark { high: usize, low: usize },
    /// Every lookup goes to the warehouse.
    Disabled,
}

struct CacheState<K, V> {
    entries: HashMap<K, (V, u64)>,
    recency: BTreeMap<u64, K>,
    tick: u64,
}

/// Value to key cache in front of the warehouse. Losing an entry only costs
/// a round trip; the warehouse stays the source of truth.
pub struct BoundedCache<K, V> {
    policy: CachePolicy,
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.policy == CachePolicy::Disabled {
            return None;
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        let entry = state.entries.get_mut(key)?;
        if let CachePolicy::Watermark { .. } = self.policy {
            state.tick += 1;
            if let Some(k) = state.recency.remove(&entry.1) {
                state.recency.insert(state.tick, k);
            }
            entry.1 = state.tick;
        }
        Some(entry.0.clone())
    }

    pub fn set(&self, key: K, value: V) {
        let (high, low) = match self.policy {
            CachePolicy::Disabled => return,
            CachePolicy::Unbounded => {
                self.lock().entries.insert(key, (value, 0));
                return;
            }
            CachePolicy::Watermark { high, low } => (high, low),
        };
        let mut guard = self.lock();
        let state = &mut *guard;
        state.tick += 1;
        let tick = state.tick;
        if let Some((_, old)) = state.entries.insert(key.clone(), (value, tick))
        {
            state.recency.remove(&old);
        }
        state.recency.insert(tick, key);
        if state.entries.len() > high {
            let before = state.entries.len();
            while state.entries.len() > low {
                let Some((_, oldest)) = state.recency.pop_first() else {
                    break;
                };
                state.entries.remove(&oldest);
            }
            debug!(
                "cache evicted {} entries",
                before - state.entries.len()
            );
        }
    }

    #[cfg(test)]
    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some((_, stamp)) = state.entries.remove(key) {
            state.recency.remove(&stamp);
        }
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.recency.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_evicts_least_recent_down_to_low() {
        let cache = BoundedCache::new(CachePolicy::Watermark { high: 4, low: 2 });
        for (i, v) in ["a", "b", "c", "d"].iter().enumerate() {
            cache.set(v.to_string(), i as i64);
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.get("a"), Some(0));

        cache.set("e".to_string(), 4);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(0));
        assert_eq!(cache.get("e"), Some(4));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("d"), None);
    }

    #[test]
    fn overwrite_does_not_leak_recency_slots() {
        let cache = BoundedCache::new(CachePolicy::Watermark { high: 2, low: 1 });
        cache.set("a".to_string(), 1);
        cache.set("a".to_string(), 2);
        cache.set("b".to_string(), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(2));
        cache.remove("a");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unbounded_and_disabled() {
        let cache = BoundedCache::new(CachePolicy::Unbounded);
        for i in 0..1000 {
            cache.set(i, i);
        }
        assert_eq!(cache.len(), 1000);
        cache.clear();
        assert!(cache.is_empty());

        let off = BoundedCache::new(CachePolicy::Disabled);
        off.set("x".to_string(), 1);
        assert_eq!(off.get("x"), None);
        assert!(off.is_empty());
    }
}
