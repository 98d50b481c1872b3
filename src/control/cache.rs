// src/control/cache.rs
//
// Owned result caches. Neither type locks; the owner decides which
// critical section they live in.

/// Remembers the result computed for the most recent input. A lookup hits
/// only when the new input is identical to that input.
#[derive(Debug, Clone)]
pub struct InputCache<K, V> {
    entry: Option<(K, V)>,
    hits: u64,
}

impl<K: PartialEq, V: Clone> InputCache<K, V> {
    pub fn new() -> Self {
        Self {
            entry: None,
            hits: 0,
        }
    }

    pub fn lookup(&mut self, key: &K) -> Option<V> {
        match &self.entry {
            Some((cached_key, value)) if cached_key == key => {
                self.hits += 1;
                Some(value.clone())
            }
            _ => None,
        }
    }

    pub fn store(&mut self, key: K, value: V) {
        self.entry = Some((key, value));
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}

impl<K: PartialEq, V: Clone> Default for InputCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-value cache valid for `ttl_secs` after it was stored. Time is
/// passed in (seconds on any monotonic scale).
#[derive(Debug, Clone)]
pub struct TtlCache<V> {
    ttl_secs: f64,
    entry: Option<(f64, V)>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl_secs: f64) -> Self {
        Self {
            ttl_secs,
            entry: None,
        }
    }

    pub fn get(&self, now: f64) -> Option<V> {
        match &self.entry {
            Some((stored_at, value)) if now - stored_at < self.ttl_secs => Some(value.clone()),
            _ => None,
        }
    }

    pub fn put(&mut self, value: V, now: f64) {
        self.entry = Some((now, value));
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_cache_hits_only_on_identical_key() {
        let mut cache: InputCache<(u32, Option<u8>), &str> = InputCache::new();
        assert_eq!(cache.lookup(&(1, None)), None);
        cache.store((1, None), "hold");
        assert_eq!(cache.lookup(&(1, None)), Some("hold"));
        assert_eq!(cache.lookup(&(1, Some(2))), None);
        assert_eq!(cache.lookup(&(2, None)), None);
        assert_eq!(cache.hits(), 1);
        cache.invalidate();
        assert_eq!(cache.lookup(&(1, None)), None);
    }

    #[test]
    fn test_ttl_cache_expires() {
        let mut cache = TtlCache::new(60.0);
        assert_eq!(cache.get(0.0), None);
        cache.put(7, 100.0);
        assert_eq!(cache.get(159.9), Some(7));
        assert_eq!(cache.get(160.0), None);
    }
}
