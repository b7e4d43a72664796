//! Pool of inference API tokens.
//!
//! Callers borrow a key for the length of one request and give it back by
//! dropping the [`KeyLease`]. A key the endpoint rate-limited sits out for
//! the configured cooldown before it is handed out again.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Slot {
    key: Arc<str>,
    in_flight: usize,
    cooling_until: Option<Instant>,
    last_used: u64,
}

struct Inner {
    slots: Vec<Slot>,
    sequence: u64,
}

pub struct KeyPool {
    inner: Arc<Mutex<Inner>>,
    cooldown: Duration,
}

impl KeyPool {
    pub fn new<I, S>(keys: I, cooldown: Duration) -> Result<Self, KeyPoolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let slots: Vec<Slot> = keys
            .into_iter()
            .map(|k| k.as_ref().trim().to_string())
            .filter(|k| !k.is_empty())
            .map(|k| Slot {
                key: Arc::from(k),
                in_flight: 0,
                cooling_until: None,
                last_used: 0,
            })
            .collect();

        if slots.is_empty() {
            return Err(KeyPoolError::Empty);
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner { slots, sequence: 0 })),
            cooldown,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the least-loaded key that is not cooling down. Ties go to the
    /// key used longest ago.
    pub fn allocate(&self) -> Result<KeyLease, KeyPoolError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.sequence += 1;
        let sequence = inner.sequence;

        let index = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.cooling_until.map_or(true, |until| until <= now))
            .min_by_key(|(_, s)| (s.in_flight, s.last_used))
            .map(|(i, _)| i);

        let Some(index) = index else {
            let retry_after = inner
                .slots
                .iter()
                .filter_map(|s| s.cooling_until)
                .min()
                .map_or(Duration::ZERO, |until| until.saturating_duration_since(now));
            return Err(KeyPoolError::AllCoolingDown { retry_after });
        };

        let slot = &mut inner.slots[index];
        slot.cooling_until = None;
        slot.in_flight += 1;
        slot.last_used = sequence;

        Ok(KeyLease {
            pool: Arc::clone(&self.inner),
            index,
            key: Arc::clone(&slot.key),
            cooldown: self.cooldown,
        })
    }
}

/// A borrowed key. Dropping it returns the key to the pool.
pub struct KeyLease {
    pool: Arc<Mutex<Inner>>,
    index: usize,
    key: Arc<str>,
    cooldown: Duration,
}

impl KeyLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Return the key and bench it for the pool's cooldown.
    pub fn rate_limited(self) {
        let until = Instant::now() + self.cooldown;
        self.pool.lock().slots[self.index].cooling_until = Some(until);
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        let mut inner = self.pool.lock();
        let slot = &mut inner.slots[self.index];
        slot.in_flight = slot.in_flight.saturating_sub(1);
    }
}

impl std::fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLease").field("index", &self.index).finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyPoolError {
    #[error("No inference API keys configured")]
    Empty,

    #[error("Every inference API key is rate limited (next free in {retry_after:?})")]
    AllCoolingDown { retry_after: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spreads_concurrent_leases_across_keys() {
        let pool = KeyPool::new(["a", "b"], Duration::from_secs(60)).unwrap();
        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();
        assert_ne!(first.key(), second.key());
    }

    #[test]
    fn dropped_lease_makes_key_available_again() {
        let pool = KeyPool::new(["only"], Duration::from_secs(60)).unwrap();
        let lease = pool.allocate().unwrap();
        let again = pool.allocate().unwrap();
        assert_eq!(lease.key(), again.key());
        drop(lease);
        drop(again);

        let inner = pool.inner.lock();
        assert_eq!(inner.slots[0].in_flight, 0);
    }

    #[test]
    fn rate_limited_key_is_skipped_until_cooldown_ends() {
        let pool = KeyPool::new(["a", "b"], Duration::from_secs(60)).unwrap();
        let lease = pool.allocate().unwrap();
        let benched = lease.key().to_string();
        lease.rate_limited();

        for _ in 0..3 {
            let lease = pool.allocate().unwrap();
            assert_ne!(lease.key(), benched);
        }
    }

    #[test]
    fn all_keys_cooling_is_reported() {
        let pool = KeyPool::new(["a"], Duration::from_secs(60)).unwrap();
        pool.allocate().unwrap().rate_limited();

        match pool.allocate() {
            Err(KeyPoolError::AllCoolingDown { retry_after }) => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected cooldown error, got {other:?}"),
        }
    }

    #[test]
    fn zero_cooldown_releases_immediately() {
        let pool = KeyPool::new(["a"], Duration::ZERO).unwrap();
        pool.allocate().unwrap().rate_limited();
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn blank_keys_are_rejected() {
        assert!(matches!(
            KeyPool::new(["", "  "], Duration::ZERO),
            Err(KeyPoolError::Empty)
        ));
    }
}
