//! Connection admission control.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

struct LimiterInner {
    active: usize,
    ids: HashSet<String>,
}

/// Caps the number of concurrently admitted connections.
///
/// A single mutex guards both the count and the id set so `add` can check
/// and insert atomically.
pub struct ConnectionLimiter {
    max_connections: usize,
    inner: Mutex<LimiterInner>,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            inner: Mutex::new(LimiterInner {
                active: 0,
                ids: HashSet::new(),
            }),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Whether a connection would be admitted right now. Does not reserve a slot.
    pub fn can_accept(&self) -> bool {
        self.inner.lock().active < self.max_connections
    }

    /// Admit `id` if there is room and it is not already present.
    pub fn add(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.active >= self.max_connections {
            warn!(
                connection_id = id,
                max = self.max_connections,
                "Connection limit reached, rejecting connection"
            );
            return false;
        }
        if !inner.ids.insert(id.to_string()) {
            warn!(connection_id = id, "Duplicate connection id");
            return false;
        }
        inner.active += 1;
        debug!(
            connection_id = id,
            active = inner.active,
            max = self.max_connections,
            "Connection admitted"
        );
        true
    }

    /// Release `id`. Unknown ids are ignored.
    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.lock();
        if inner.ids.remove(id) {
            inner.active -= 1;
            debug!(
                connection_id = id,
                active = inner.active,
                max = self.max_connections,
                "Connection released"
            );
        } else {
            debug!(connection_id = id, "Release of unknown connection ignored");
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    /// Drop all tracked connections.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.active = 0;
        inner.ids.clear();
        info!("Connection limiter reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn add_refuses_at_limit_without_changing_state() {
        let limiter = ConnectionLimiter::new(2);
        assert!(limiter.add("a"));
        assert!(limiter.add("b"));
        assert_eq!(limiter.active_count(), 2);
        assert!(!limiter.can_accept());

        assert!(!limiter.add("c"));
        assert_eq!(limiter.active_count(), 2);

        limiter.remove("c");
        assert_eq!(limiter.active_count(), 2);

        limiter.remove("a");
        assert!(limiter.can_accept());
        assert!(limiter.add("c"));
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let limiter = ConnectionLimiter::new(5);
        assert!(limiter.add("same"));
        assert!(!limiter.add("same"));
        assert_eq!(limiter.active_count(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let limiter = ConnectionLimiter::new(1);
        assert!(limiter.add("x"));
        limiter.remove("x");
        limiter.remove("x");
        limiter.remove("never-added");
        assert_eq!(limiter.active_count(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let limiter = ConnectionLimiter::new(3);
        limiter.add("a");
        limiter.add("b");
        limiter.reset();
        assert_eq!(limiter.active_count(), 0);
        assert!(limiter.add("a"));
    }

    #[test]
    fn count_never_exceeds_limit_under_contention() {
        let limiter = Arc::new(ConnectionLimiter::new(4));
        let handles: Vec<_> = (0..16)
            .map(|t| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let id = format!("{}-{}", t, i);
                        if limiter.add(&id) {
                            assert!(limiter.active_count() <= 4);
                            limiter.remove(&id);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(limiter.active_count(), 0);
    }
}
