use crate::error::Result;
use crate::error::SwrError;
use crate::hash_diff::DatasetComparator;
use crate::table::KeyField;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::HashSet;

/// Outcome of [`partition()`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    pub created: Vec<Value>,
    pub updated: Vec<Value>,
    pub removed: Vec<Value>,
}

impl Partition {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Split `after` into records created, updated and removed relative to `before`.
///
/// Records are matched by `id_field`. A key matched twice in `after` is reported as [`SwrError::DuplicateKey`].
/// Matched pairs whose structural hash didn't change are dropped from `updated`. Records without a usable key can't
/// be matched and count as created.
pub fn partition<K: Into<KeyField>>(after: &[Value], before: &[Value], id_field: K) -> Result<Partition> {
    let key_field = id_field.into();

    let before_index = before
        .iter()
        .filter_map(|record| key_field.key_of(record).map(|key| (key, record)))
        .collect::<HashMap<_, _>>();

    let mut matched = HashSet::new();
    let mut matched_old = Vec::new();
    let mut candidates = Vec::new();
    let mut created = Vec::new();

    for record in after {
        match key_field
            .key_of(record)
            .and_then(|key| before_index.get(&key).map(|old| (key, *old)))
        {
            Some((key, old)) => {
                if !matched.insert(key.clone()) {
                    return Err(SwrError::DuplicateKey(key));
                }
                matched_old.push(old);
                candidates.push(record);
            }
            None => created.push(record.clone()),
        }
    }

    let removed = before
        .iter()
        .filter(|record| {
            key_field
                .key_of(record)
                .is_none_or(|key| !matched.contains(&key))
        })
        .cloned()
        .collect();

    // Every candidate is compared, so the comparator must never trip here.
    let mut comparator = DatasetComparator::new(&key_field, matched_old).with_threshold(usize::MAX);
    let updated = candidates
        .into_iter()
        .filter(|record| !comparator.compare(record))
        .cloned()
        .collect();

    Ok(Partition {
        created,
        updated,
        removed,
    })
}
