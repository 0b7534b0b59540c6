use crate::contracts::{MetadataDescriptor, MetadataItem, MetadataResult, MetadataSnapshot};
use std::collections::HashMap;

/// Latest result per declared metadata key. Snapshots always list every
/// declared key in declaration order.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    descriptors: Vec<MetadataDescriptor>,
    results: HashMap<String, MetadataResult>,
    value_cap: usize,
    revision: u64,
}

impl MetadataStore {
    pub fn new(descriptors: Vec<MetadataDescriptor>, value_cap: usize) -> Self {
        Self {
            descriptors,
            results: HashMap::new(),
            value_cap,
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_declared(&self, key: &str) -> bool {
        self.descriptors.iter().any(|descriptor| descriptor.key == key)
    }

    /// Replaces the result for `key`. Unknown keys are ignored and reported
    /// as `false`.
    pub fn post(&mut self, key: &str, mut result: MetadataResult) -> bool {
        if !self.is_declared(key) {
            return false;
        }
        if result.value.len() > self.value_cap {
            let original = result.value.len();
            let mut cut = self.value_cap;
            while !result.value.is_char_boundary(cut) {
                cut -= 1;
            }
            result.value.truncate(cut);
            result.error = format!(
                "value of {original} bytes exceeded the {} byte limit and was truncated",
                self.value_cap
            );
        }
        self.results.insert(key.to_string(), result);
        self.revision += 1;
        true
    }

    pub fn result(&self, key: &str) -> Option<&MetadataResult> {
        self.results.get(key)
    }

    pub fn snapshot(&self) -> MetadataSnapshot {
        let items = self
            .descriptors
            .iter()
            .map(|descriptor| MetadataItem {
                description: descriptor.clone(),
                result: self.results.get(&descriptor.key).cloned().unwrap_or_default(),
            })
            .collect();
        MetadataSnapshot {
            revision: self.revision,
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn descriptor(key: &str, display_name: &str) -> MetadataDescriptor {
        MetadataDescriptor {
            key: key.to_string(),
            display_name: display_name.to_string(),
            script: "echo hi".to_string(),
            interval: 10,
            timeout: 3,
        }
    }

    fn store() -> MetadataStore {
        MetadataStore::new(
            vec![
                descriptor("foo1", "First Meta"),
                descriptor("foo2", "Second Meta"),
                descriptor("foo3", "TooLong"),
            ],
            32 << 10,
        )
    }

    fn result(value: &str, error: &str) -> MetadataResult {
        MetadataResult {
            collected_at: Some(Utc::now()),
            value: value.to_string(),
            error: error.to_string(),
        }
    }

    #[test]
    fn snapshot_lists_every_declared_key_in_order() {
        let mut store = store();
        assert!(store.post("foo1", result("bar", "")));

        let snapshot = store.snapshot();
        let keys: Vec<&str> = snapshot
            .items
            .iter()
            .map(|item| item.description.key.as_str())
            .collect();
        assert_eq!(keys, vec!["foo1", "foo2", "foo3"]);
        assert_eq!(snapshot.items[0].result.value, "bar");
        assert!(snapshot.items[1].result.collected_at.is_none());
        assert_eq!(snapshot.revision, 1);
    }

    #[test]
    fn unknown_key_is_accepted_and_ignored() {
        let mut store = store();
        assert!(!store.post("unknown", result("bar", "")));
        assert_eq!(store.revision(), 0);
        assert!(store.result("unknown").is_none());
    }

    #[test]
    fn oversized_value_is_truncated_with_error() {
        let mut store = store();
        let cap = 32 << 10;
        store.post("foo3", result(&"a".repeat(cap * 2), "original error"));

        let stored = store.result("foo3").expect("stored");
        assert_eq!(stored.value.len(), cap);
        assert!(!stored.error.is_empty());
        assert_ne!(stored.error, "original error");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut store = MetadataStore::new(vec![descriptor("k", "K")], 5);
        store.post("k", result("ééé", ""));
        assert_eq!(store.result("k").expect("stored").value, "éé");
    }

    #[test]
    fn post_replaces_result_wholesale() {
        let mut store = store();
        store.post("foo1", result("bar", "error"));
        store.post("foo1", result("baz", ""));
        let stored = store.result("foo1").expect("stored");
        assert_eq!(stored.value, "baz");
        assert_eq!(stored.error, "");
    }
}
