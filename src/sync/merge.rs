//! Gap-filling merge policy
//!
//! A remote record never erases local data. Empty remote values are ignored,
//! local gaps are filled, and populated local values are only replaced when
//! the remote copy is strictly newer by the source's own timestamp.

use crate::database::RecordStore;
use crate::error::DbError;
use crate::models::{is_empty_value, LocalRecord, UpsertOutcome};

/// Merge `remote` into `local`
///
/// Identity (`kind`, `canonical_id`, `source`) always comes from `local`.
pub fn merge_fill_gaps(local: &LocalRecord, remote: &LocalRecord) -> LocalRecord {
    let remote_is_newer = match (remote.source_updated_at, local.source_updated_at) {
        (Some(r), Some(l)) => r > l,
        _ => false,
    };

    let mut merged = local.clone();
    for (name, value) in &remote.fields {
        if is_empty_value(value) {
            continue;
        }
        let local_empty = merged.fields.get(name).map_or(true, is_empty_value);
        if local_empty || remote_is_newer {
            merged.fields.insert(name.clone(), value.clone());
        }
    }

    merged.source_updated_at = match (local.source_updated_at, remote.source_updated_at) {
        (Some(l), Some(r)) => Some(l.max(r)),
        (l, r) => l.or(r),
    };
    merged.last_reconciled_at = remote.last_reconciled_at.max(local.last_reconciled_at);
    merged.active = true;
    merged
}

/// Upsert `record` under the gap-filling policy
///
/// `record.last_reconciled_at` is stored as given; callers stamp it from
/// their clock.
pub async fn merge_upsert(
    store: &dyn RecordStore,
    record: &LocalRecord,
) -> Result<UpsertOutcome, DbError> {
    let mut create = record.clone();
    create.fields.retain(|_, v| !is_empty_value(v));
    create.active = true;

    let update = match store.find_unique(record.kind, &record.canonical_id).await? {
        Some(local) => merge_fill_gaps(&local, &create),
        None => create.clone(),
    };

    store.upsert(&record.canonical_id, &create, &update).await
}
