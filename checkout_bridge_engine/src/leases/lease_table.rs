use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::time::Instant;

/// Proof of ownership of a lease. Only the holder of the current token can update or release the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LeaseError {
    #[error("The key is already leased")]
    Held,
    #[error("The lease is no longer held by this token")]
    NotOwner,
}

struct LeaseEntry<V> {
    token: LeaseToken,
    value: V,
    expires_at: Instant,
}

struct Inner<K, V> {
    entries: HashMap<K, LeaseEntry<V>>,
    next_token: u64,
}

/// A concurrent map of exclusive, time-limited leases.
///
/// Acquire is atomic: of any number of callers racing for the same key, exactly one wins. A lease that outlives its
/// TTL is treated as abandoned and can be taken over; the evicted value is handed to the new owner so that it can be
/// cleaned up.
///
/// The critical sections never await, so a plain mutex is used.
pub struct LeaseTable<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
    ttl: Duration,
}

impl<K, V> Clone for LeaseTable<K, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner), ttl: self.ttl }
    }
}

impl<K, V> LeaseTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        let inner = Inner { entries: HashMap::new(), next_token: 0 };
        Self { inner: Arc::new(Mutex::new(inner)), ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the lease on `key`. Fails with [`LeaseError::Held`] if a live lease exists. If an expired lease is
    /// replaced, its value is returned alongside the new token.
    pub fn try_acquire(&self, key: K, value: V) -> Result<(LeaseToken, Option<V>), LeaseError> {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.entries.get(&key).is_some_and(|e| e.expires_at > now) {
            return Err(LeaseError::Held);
        }
        let evicted = inner.entries.remove(&key).map(|e| e.value);
        inner.next_token += 1;
        let token = LeaseToken(inner.next_token);
        inner.entries.insert(key, LeaseEntry { token, value, expires_at: now + self.ttl });
        Ok((token, evicted))
    }

    /// Replaces the value held under a lease and renews its expiry.
    pub fn update(&self, key: &K, token: LeaseToken, value: V) -> Result<(), LeaseError> {
        let mut inner = self.lock();
        match inner.entries.get_mut(key) {
            Some(entry) if entry.token == token => {
                entry.value = value;
                entry.expires_at = Instant::now() + self.ttl;
                Ok(())
            },
            _ => Err(LeaseError::NotOwner),
        }
    }

    /// Removes the lease if `token` still owns it. A lease that has since been taken over is left untouched.
    pub fn release(&self, key: &K, token: LeaseToken) -> Option<V> {
        let mut inner = self.lock();
        let owned = inner.entries.get(key).is_some_and(|e| e.token == token);
        owned.then(|| inner.entries.remove(key)).flatten().map(|e| e.value)
    }

    /// Returns the value of a live lease.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let inner = self.lock();
        inner.entries.get(key).filter(|e| e.expires_at > now).map(|e| e.value.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.lock().entries.get(key).is_some_and(|e| e.expires_at > now)
    }

    /// The number of live leases.
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.lock().entries.values().filter(|e| e.expires_at > now).count()
    }

    /// Drops every expired lease and returns what was evicted.
    pub fn sweep_expired(&self) -> Vec<(K, V)> {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired =
            inner.entries.iter().filter(|(_, e)| e.expires_at <= now).map(|(k, _)| k.clone()).collect::<Vec<K>>();
        expired.into_iter().filter_map(|k| inner.entries.remove(&k).map(|e| (k, e.value))).collect()
    }
}
