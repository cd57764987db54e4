use dashmap::DashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Short-lived set of observed event ids.
///
/// Backs idempotent consumption of the broker's at-least-once stream: the
/// first observation of an id wins, later ones are ignored. Entries expire
/// by time rather than count so memory stays bounded without ever evicting
/// an id that could still arrive as a duplicate.
pub struct ExpiringEventSet {
    ttl: Duration,
    inner: DashMap<Uuid, Instant>,
}

impl ExpiringEventSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: DashMap::new(),
        }
    }

    /// Record an observation. Returns true when this is the first (fresh)
    /// observation of the id within the TTL window.
    pub fn insert(&self, id: Uuid) -> bool {
        let now = Instant::now();
        match self.inner.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) >= self.ttl {
                    occupied.insert(now);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.inner
            .get(id)
            .map(|seen| seen.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Drop expired entries. Called from the router's maintenance task.
    pub fn prune(&self) {
        let ttl = self.ttl;
        self.inner.retain(|_, seen| seen.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_wins() {
        let set = ExpiringEventSet::new(Duration::from_secs(60));
        let id = Uuid::new_v4();

        assert!(set.insert(id));
        assert!(!set.insert(id), "duplicate within ttl must be rejected");
        assert!(set.contains(&id));
        assert!(!set.contains(&Uuid::new_v4()));
    }

    #[test]
    fn test_expired_entries_are_fresh_again() {
        let set = ExpiringEventSet::new(Duration::from_millis(10));
        let id = Uuid::new_v4();

        assert!(set.insert(id));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!set.contains(&id));
        assert!(set.insert(id), "an expired id counts as a new observation");
    }

    #[test]
    fn test_prune_bounds_memory_by_time() {
        let set = ExpiringEventSet::new(Duration::from_millis(10));
        for _ in 0..50 {
            set.insert(Uuid::new_v4());
        }
        assert_eq!(set.len(), 50);

        std::thread::sleep(Duration::from_millis(20));
        set.prune();
        assert!(set.is_empty());
    }
}
