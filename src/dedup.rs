use std::collections::HashSet;

use tracing::debug;

use crate::record::NormalizedRecord;

/// In-memory snapshot of the durable fingerprint set, loaded from the
/// store at the start of a run. The set only ever grows.
#[derive(Debug, Default)]
pub struct FingerprintSet {
    inner: HashSet<String>,
}

impl FingerprintSet {
    pub fn new(fingerprints: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: fingerprints.into_iter().collect(),
        }
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.inner.contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// The delta to persist: records whose fingerprint is absent from the set.
/// Exact-fingerprint equality only, no fuzzy matching. Duplicates within
/// the batch itself keep their first occurrence.
pub fn filter_new(records: Vec<NormalizedRecord>, seen: &FingerprintSet) -> Vec<NormalizedRecord> {
    let total = records.len();
    let mut in_batch: HashSet<String> = HashSet::new();
    let new_records: Vec<NormalizedRecord> = records
        .into_iter()
        .filter(|r| !seen.contains(&r.fingerprint) && in_batch.insert(r.fingerprint.clone()))
        .collect();
    debug!(
        "Dedup: {} of {} records are new ({} already seen)",
        new_records.len(),
        total,
        total - new_records.len()
    );
    new_records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{normalize, RawRecord};
    use serde_json::json;

    fn record(mmsi: &str, ts: &str) -> NormalizedRecord {
        let raw: RawRecord = [
            ("mmsi".to_string(), json!(mmsi)),
            ("timestamp".to_string(), json!(ts)),
        ]
        .into_iter()
        .collect();
        normalize("t", &raw, &["mmsi".into(), "timestamp".into()]).unwrap()
    }

    #[test]
    fn all_new_against_empty_set() {
        let records = vec![record("1", "a"), record("2", "a")];
        let out = filter_new(records.clone(), &FingerprintSet::default());
        assert_eq!(out, records);
    }

    #[test]
    fn seen_records_are_filtered() {
        let a = record("1", "a");
        let b = record("2", "a");
        let seen = FingerprintSet::new([a.fingerprint.clone()]);
        let out = filter_new(vec![a, b.clone()], &seen);
        assert_eq!(out, vec![b]);
    }

    #[test]
    fn within_batch_duplicates_keep_first() {
        let a = record("1", "a");
        let out = filter_new(vec![a.clone(), a.clone()], &FingerprintSet::default());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn second_pass_yields_nothing() {
        let records = vec![record("1", "a"), record("2", "a")];
        let first = filter_new(records.clone(), &FingerprintSet::default());
        let seen = FingerprintSet::new(first.iter().map(|r| r.fingerprint.clone()));
        assert!(filter_new(records, &seen).is_empty());
    }

    #[test]
    fn filter_has_no_side_effects_on_set() {
        let seen = FingerprintSet::new(["x".to_string()]);
        let _ = filter_new(vec![record("1", "a")], &seen);
        assert_eq!(seen.len(), 1);
    }
}
