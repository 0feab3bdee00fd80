//! Proxy pool with countable leases
//!
//! Provides thread-safe proxy leasing with per-endpoint concurrency caps.
//! The pool is the only state shared across sessions, so every mutation
//! happens under one lock; callers arrive from independent session threads
//! as well as tab tasks inside a session.

mod record;
mod store;

pub use record::{ProxyRecord, ProxyScheme};
pub use store::ProxyStore;

use std::collections::HashMap;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A granted claim on one proxy. Carries an immutable snapshot of the record
/// as it looked at acquire time.
#[derive(Debug, Clone)]
pub struct ProxyLease {
    pub id: Uuid,
    pub proxy: ProxyRecord,
}

struct PoolInner {
    records: Vec<ProxyRecord>,
    /// lease id -> proxy id, so release is idempotent per lease
    outstanding: HashMap<Uuid, String>,
}

/// Centralized proxy leasing for all sessions.
///
/// Callers never touch the pool table directly; `acquire`/`release` is the
/// whole mutation surface.
pub struct ProxyLeaseManager {
    inner: Mutex<PoolInner>,
}

impl std::fmt::Debug for ProxyLeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ProxyLeaseManager")
            .field("proxies", &inner.records.len())
            .field("outstanding", &inner.outstanding.len())
            .finish()
    }
}

impl ProxyLeaseManager {
    pub fn new(records: Vec<ProxyRecord>) -> Self {
        info!("ProxyLeaseManager initialized with {} proxies", records.len());
        Self {
            inner: Mutex::new(PoolInner {
                records,
                outstanding: HashMap::new(),
            }),
        }
    }

    /// Empty pool; `acquire` always returns None.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Load the pool from the durable store.
    pub fn from_store(store: &ProxyStore) -> Self {
        Self::new(store.load())
    }

    /// Claim a proxy.
    ///
    /// With `proxy_id` only that endpoint is considered. Otherwise all
    /// enabled endpoints are candidates, optionally narrowed by `geo`, and
    /// the least-loaded one wins. Returns None when nothing is eligible;
    /// the caller decides whether to proceed proxy-less or abort.
    pub fn acquire(&self, proxy_id: Option<&str>, geo: Option<&str>) -> Option<ProxyLease> {
        let mut inner = self.inner.lock();

        let candidate_idx = {
            let mut candidates: Vec<usize> = inner
                .records
                .iter()
                .enumerate()
                .filter(|(_, r)| match proxy_id {
                    Some(id) => r.id == id,
                    None => {
                        r.enabled
                            && geo
                                .map(|g| r.geo.as_deref() == Some(g))
                                .unwrap_or(true)
                    }
                })
                .filter(|(_, r)| r.eligible())
                .map(|(i, _)| i)
                .collect();

            // Load-balancing tie-break: least in-use first
            candidates.sort_by_key(|&i| inner.records[i].in_use);
            candidates.first().copied()
        };

        let idx = match candidate_idx {
            Some(idx) => idx,
            None => {
                debug!("No eligible proxy (pinned: {:?}, geo: {:?})", proxy_id, geo);
                return None;
            }
        };

        inner.records[idx].in_use += 1;
        let snapshot = inner.records[idx].clone();
        let lease_id = Uuid::new_v4();
        inner.outstanding.insert(lease_id, snapshot.id.clone());

        debug!(
            "Leased proxy {} (in use: {}, cap: {})",
            snapshot.id, snapshot.in_use, snapshot.max_concurrent
        );

        Some(ProxyLease {
            id: lease_id,
            proxy: snapshot,
        })
    }

    /// Return a lease. Safe to call more than once per lease and after the
    /// proxy was deleted from the pool; extra calls are no-ops.
    pub fn release(&self, lease: &ProxyLease) {
        let mut inner = self.inner.lock();

        let proxy_id = match inner.outstanding.remove(&lease.id) {
            Some(id) => id,
            None => return, // never granted, or already released
        };

        if let Some(record) = inner.records.iter_mut().find(|r| r.id == proxy_id) {
            record.in_use = record.in_use.saturating_sub(1);
            debug!("Released proxy {} (in use: {})", proxy_id, record.in_use);
        }
    }

    /// Write preflight telemetry back onto the record.
    pub fn record_check(&self, proxy_id: &str, egress_ip: &str) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.iter_mut().find(|r| r.id == proxy_id) {
            record.last_check = Some(Utc::now());
            record.last_ip = Some(egress_ip.to_string());
        }
    }

    /// Insert or replace a record, keeping any live in-use count.
    pub fn upsert(&self, record: ProxyRecord) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.records.iter_mut().find(|r| r.id == record.id) {
            let in_use = existing.in_use;
            *existing = record;
            existing.in_use = in_use;
        } else {
            inner.records.push(record);
        }
    }

    pub fn remove(&self, proxy_id: &str) {
        let mut inner = self.inner.lock();
        let had_leases = inner.records.iter().any(|r| r.id == proxy_id && r.in_use > 0);
        inner.records.retain(|r| r.id != proxy_id);
        if had_leases {
            warn!("Proxy {} removed with leases outstanding", proxy_id);
        }
    }

    /// Snapshot of the pool for display or persistence.
    pub fn list(&self) -> Vec<ProxyRecord> {
        self.inner.lock().records.clone()
    }

    /// Persist the current pool (minus transient counters) to the store.
    pub fn persist(&self, store: &ProxyStore) {
        store.save(&self.list());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize, max_concurrent: u32) -> ProxyLeaseManager {
        let records = (0..n)
            .map(|i| {
                let mut r = ProxyRecord::new(
                    &format!("p{}", i),
                    ProxyScheme::Http,
                    &format!("10.0.0.{}", i),
                    8080,
                );
                r.max_concurrent = max_concurrent;
                r
            })
            .collect();
        ProxyLeaseManager::new(records)
    }

    #[test]
    fn test_cap_never_exceeded_and_saturation() {
        // 5 proxies, cap 2 each: 10 leases succeed, none over cap, 11th fails
        let mgr = pool(5, 2);
        let mut leases = Vec::new();
        for _ in 0..10 {
            let lease = mgr.acquire(None, None).expect("lease within capacity");
            assert!(lease.proxy.in_use <= 2);
            leases.push(lease);
        }
        assert!(mgr.acquire(None, None).is_none());

        for record in mgr.list() {
            assert_eq!(record.in_use, 2);
        }

        mgr.release(&leases.pop().unwrap());
        assert!(mgr.acquire(None, None).is_some());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mgr = pool(1, 1);
        let lease = mgr.acquire(None, None).unwrap();
        mgr.release(&lease);
        mgr.release(&lease);
        mgr.release(&lease);
        assert_eq!(mgr.list()[0].in_use, 0);
    }

    #[test]
    fn test_release_after_remove_is_noop() {
        let mgr = pool(2, 0);
        let lease = mgr.acquire(Some("p0"), None).unwrap();
        mgr.remove("p0");
        mgr.release(&lease);
        assert_eq!(mgr.list().len(), 1);
    }

    #[test]
    fn test_least_loaded_wins() {
        let mgr = pool(3, 0);
        let first = mgr.acquire(None, None).unwrap();
        let second = mgr.acquire(None, None).unwrap();
        assert_ne!(first.proxy.id, second.proxy.id);
        let third = mgr.acquire(None, None).unwrap();
        assert_ne!(third.proxy.id, first.proxy.id);
        assert_ne!(third.proxy.id, second.proxy.id);
    }

    #[test]
    fn test_geo_filter() {
        let mut a = ProxyRecord::new("ru1", ProxyScheme::Http, "h1", 1);
        a.geo = Some("ru".into());
        let mut b = ProxyRecord::new("de1", ProxyScheme::Http, "h2", 1);
        b.geo = Some("de".into());
        let mgr = ProxyLeaseManager::new(vec![a, b]);

        let lease = mgr.acquire(None, Some("de")).unwrap();
        assert_eq!(lease.proxy.id, "de1");
        assert!(mgr.acquire(None, Some("fr")).is_none());
    }

    #[test]
    fn test_pinned_respects_cap() {
        let mut r = ProxyRecord::new("p0", ProxyScheme::Http, "h", 1);
        r.max_concurrent = 1;
        let mgr = ProxyLeaseManager::new(vec![r]);

        let lease = mgr.acquire(Some("p0"), None).unwrap();
        assert!(mgr.acquire(Some("p0"), None).is_none());
        mgr.release(&lease);
        assert!(mgr.acquire(Some("p0"), None).is_some());
    }

    #[test]
    fn test_disabled_excluded_from_auto() {
        let mut r = ProxyRecord::new("p0", ProxyScheme::Http, "h", 1);
        r.enabled = false;
        let mgr = ProxyLeaseManager::new(vec![r]);
        assert!(mgr.acquire(None, None).is_none());
    }

    #[test]
    fn test_concurrent_acquire_release_balances() {
        use std::sync::Arc;

        let mgr = Arc::new(pool(5, 2));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    if let Some(lease) = mgr.acquire(None, None) {
                        assert!(lease.proxy.in_use <= 2);
                        mgr.release(&lease);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for record in mgr.list() {
            assert_eq!(record.in_use, 0);
        }
    }
}
