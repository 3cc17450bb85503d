//! Expiring-lease registry keyed by an opaque identity.
//!
//! Leases are renewed on every heartbeat. The registry never runs its own
//! timer; the server manager's checker drains `pop_expired` on the wake
//! cadence, so each expired lease is observed exactly once. Renewing a lease
//! that already expired reports `Expired` so late heartbeats from a server
//! that is being recovered can be rejected.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renewal {
    Renewed,
    /// The lease does not exist (never granted, cancelled, or expired).
    Expired,
}

#[derive(Default)]
struct Leases {
    /// Expiry deadline per identity.
    deadlines: BTreeMap<String, Instant>,
    /// Delay-ordered view for cheap expiry pops.
    ordered: BTreeSet<(Instant, String)>,
}

pub struct LeaseTracker {
    duration: Duration,
    inner: Mutex<Leases>,
}

impl LeaseTracker {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            inner: Mutex::new(Leases::default()),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Grant (or re-grant) a lease for `id`, starting a fresh expiry window.
    pub fn grant(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let deadline = Instant::now() + self.duration;
        if let Some(old) = inner.deadlines.insert(id.to_string(), deadline) {
            inner.ordered.remove(&(old, id.to_string()));
        }
        inner.ordered.insert((deadline, id.to_string()));
    }

    pub fn renew(&self, id: &str) -> Renewal {
        let mut inner = self.inner.lock().unwrap();
        let Some(old) = inner.deadlines.get(id).copied() else {
            return Renewal::Expired;
        };
        let deadline = Instant::now() + self.duration;
        inner.deadlines.insert(id.to_string(), deadline);
        inner.ordered.remove(&(old, id.to_string()));
        inner.ordered.insert((deadline, id.to_string()));
        Renewal::Renewed
    }

    /// Drop a lease without treating it as expired (server reported its own
    /// shutdown). Returns whether the lease existed.
    pub fn cancel(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.deadlines.remove(id) {
            Some(deadline) => {
                inner.ordered.remove(&(deadline, id.to_string()));
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().deadlines.contains_key(id)
    }

    /// Pop every lease whose deadline has passed. Popped leases are gone;
    /// the caller owns firing their expiry handling.
    pub fn pop_expired(&self, now: Instant) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let mut expired = Vec::new();
        while let Some((deadline, id)) = inner.ordered.first().cloned() {
            if deadline > now {
                break;
            }
            inner.ordered.remove(&(deadline, id.clone()));
            inner.deadlines.remove(&id);
            expired.push(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
