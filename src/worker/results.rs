//! Shared phrase -> frequency result map

use std::collections::HashMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Outcome of one phrase lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub phrase: String,
    /// 0 when unresolved
    pub frequency: u64,
    /// False when the query timed out without a correlated response
    pub resolved: bool,
    pub at: DateTime<Utc>,
    /// Tab that produced (or gave up on) this phrase
    pub tab: usize,
}

impl QueryResult {
    pub fn resolved(phrase: &str, frequency: u64, tab: usize) -> Self {
        Self {
            phrase: phrase.to_string(),
            frequency,
            resolved: true,
            at: Utc::now(),
            tab,
        }
    }

    pub fn unresolved(phrase: &str, tab: usize) -> Self {
        Self {
            phrase: phrase.to_string(),
            frequency: 0,
            resolved: false,
            at: Utc::now(),
            tab,
        }
    }
}

/// Append-only per-key result map shared by all tab tasks of a session.
#[derive(Default)]
pub struct ResultSet {
    inner: Mutex<HashMap<String, QueryResult>>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a result unless the phrase is already present. Returns whether
    /// the insert happened; a second write for the same phrase is a no-op.
    pub fn insert_once(&self, result: QueryResult) -> bool {
        let mut map = self.inner.lock();
        if map.contains_key(&result.phrase) {
            return false;
        }
        map.insert(result.phrase.clone(), result);
        true
    }

    pub fn contains(&self, phrase: &str) -> bool {
        self.inner.lock().contains_key(phrase)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn snapshot(&self) -> HashMap<String, QueryResult> {
        self.inner.lock().clone()
    }

    pub fn into_map(self) -> HashMap<String, QueryResult> {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent_per_phrase() {
        let results = ResultSet::new();
        assert!(results.insert_once(QueryResult::resolved("a", 10, 0)));
        assert!(!results.insert_once(QueryResult::resolved("a", 999, 3)));
        assert!(results.insert_once(QueryResult::unresolved("b", 1)));

        let map = results.into_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"].frequency, 10);
        assert_eq!(map["a"].tab, 0);
        assert!(!map["b"].resolved);
        assert_eq!(map["b"].frequency, 0);
    }
}
