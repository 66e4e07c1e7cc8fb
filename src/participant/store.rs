//! Participant-local key-value store
//!
//! Mutated only by applying committed operations; everything else reads.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct KvStore {
    map: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    /// Numeric view of a key; absent or non-numeric values read as zero.
    pub fn balance(&self, key: &str) -> f64 {
        match self.map.get(key) {
            None => 0.0,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "Non-numeric balance treated as 0");
                0.0
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.map.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_defaults_to_zero() {
        let mut store = KvStore::new();
        assert_eq!(store.balance("a"), 0.0);

        store.set("a", "12.5");
        assert_eq!(store.balance("a"), 12.5);

        store.set("b", "not a number");
        assert_eq!(store.balance("b"), 0.0);
    }
}
