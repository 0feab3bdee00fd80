//! Lock-free run statistics
//!
//! Atomic counters feeding the periodic progress callbacks; never consulted
//! by control flow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Counters for one scrape run.
#[derive(Debug)]
pub struct RunStats {
    pub queries: AtomicU64,
    pub resolved: AtomicU64,
    pub unresolved: AtomicU64,
    pub errors: AtomicU64,
    pub start_time: AtomicU64,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            queries: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            unresolved: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            start_time: AtomicU64::new(now_secs()),
        }
    }

    pub fn record_resolved(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unresolved(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.unresolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn unresolved_count(&self) -> u64 {
        self.unresolved.load(Ordering::Relaxed)
    }

    /// Queries completed per hour since the run started.
    pub fn queries_per_hour(&self) -> f64 {
        let elapsed_hours = (now_secs().saturating_sub(self.start_time.load(Ordering::Relaxed))) as f64 / 3600.0;
        if elapsed_hours < 0.001 {
            return 0.0;
        }
        self.queries.load(Ordering::Relaxed) as f64 / elapsed_hours
    }

    pub fn reset(&self) {
        self.queries.store(0, Ordering::Relaxed);
        self.resolved.store(0, Ordering::Relaxed);
        self.unresolved.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.start_time.store(now_secs(), Ordering::Relaxed);
    }

    /// Snapshot for serialization
    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            queries_per_hour: self.queries_per_hour(),
        }
    }
}

/// Serializable snapshot of run stats
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatsSnapshot {
    pub queries: u64,
    pub resolved: u64,
    pub unresolved: u64,
    pub errors: u64,
    pub queries_per_hour: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = RunStats::new();
        stats.record_resolved();
        stats.record_resolved();
        stats.record_unresolved();
        stats.record_error();

        let snap = stats.snapshot();
        assert_eq!(snap.queries, 3);
        assert_eq!(snap.resolved, 2);
        assert_eq!(snap.unresolved, 1);
        assert_eq!(snap.errors, 1);

        stats.reset();
        assert_eq!(stats.query_count(), 0);
    }
}
