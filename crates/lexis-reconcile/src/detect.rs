//! Natural-key grouping and canonical selection.

use std::collections::{BTreeMap, BTreeSet};

use lexis_core::{KeyMode, NaturalKeyed, Token};
use serde::Serialize;

/// Records without a key are counted but not grouped.
#[derive(Debug, Clone)]
pub struct Detection<T> {
    groups: BTreeMap<String, Vec<T>>,
    excluded: usize,
}

impl<T: NaturalKeyed> Detection<T> {
    pub fn records_grouped(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn excluded(&self) -> usize {
        self.excluded
    }

    pub fn duplicate_groups(&self) -> impl Iterator<Item = (&str, &[T])> {
        self.groups
            .iter()
            .filter(|(_, records)| records.len() > 1)
            .map(|(key, records)| (key.as_str(), records.as_slice()))
    }

    pub fn duplicate_group_count(&self) -> usize {
        self.duplicate_groups().count()
    }

    pub fn surplus_records(&self) -> usize {
        self.duplicate_groups().map(|(_, r)| r.len() - 1).sum()
    }

    pub fn duplicate_keys(&self) -> Vec<String> {
        self.duplicate_groups().map(|(k, _)| k.to_string()).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.duplicate_group_count() == 0
    }
}

impl Detection<Token> {
    /// Duplicate groups whose members sit at more than one position. Under the
    /// two-part key these may be legitimate repeats rather than re-ingestion.
    pub fn groups_with_distinct_positions(&self) -> usize {
        self.duplicate_groups()
            .filter(|(_, records)| {
                records
                    .iter()
                    .map(|t| t.position)
                    .collect::<BTreeSet<_>>()
                    .len()
                    > 1
            })
            .count()
    }
}

pub fn detect_duplicates<T: NaturalKeyed>(
    records: impl IntoIterator<Item = T>,
    mode: KeyMode,
) -> Detection<T> {
    let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
    let mut excluded = 0usize;
    for record in records {
        match record.natural_key(mode) {
            Some(key) => groups.entry(key).or_default().push(record),
            None => excluded += 1,
        }
    }
    Detection { groups, excluded }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalDecision {
    pub key: String,
    pub keep_id: String,
    pub delete_ids: Vec<String>,
}

/// Newest `created_at` wins; equal timestamps keep the smaller id. The group is
/// sorted here so fetch order never matters.
pub fn select_canonical<T: NaturalKeyed>(key: &str, records: &[T]) -> Option<CanonicalDecision> {
    let mut ordered = records.iter().collect::<Vec<_>>();
    ordered.sort_by(|a, b| {
        b.created_at()
            .cmp(&a.created_at())
            .then_with(|| a.record_id().cmp(b.record_id()))
    });
    let (keep, rest) = ordered.split_first()?;
    Some(CanonicalDecision {
        key: key.to_string(),
        keep_id: keep.record_id().to_string(),
        delete_ids: rest.iter().map(|r| r.record_id().to_string()).collect(),
    })
}

pub fn plan_deletions<T: NaturalKeyed>(detection: &Detection<T>) -> Vec<CanonicalDecision> {
    detection
        .duplicate_groups()
        .filter_map(|(key, records)| select_canonical(key, records))
        .collect()
}
