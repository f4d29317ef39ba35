//! Change detection and batched upserts for one page of normalized rows.

use std::collections::HashMap;

use hfx_core::{EstablishmentRow, RatingChange};
use hfx_storage::EstablishmentStore;

use crate::{PipelineError, PipelineStats};

/// Classify a batch against the store and append change events for rows
/// whose rating moved.
///
/// Exactly one bulk read per batch, keyed by the batch's FHRSIDs. Rows with
/// no prior state count as new (the upsert creates them); rows whose stored
/// rating matches are untouched. Failures here are logged and swallowed:
/// change tracking is diagnostic, the upsert is what must succeed.
///
/// Returns the number of change events written.
pub async fn detect_rating_changes(
    store: &dyn EstablishmentStore,
    rows: &[EstablishmentRow],
    stats: &mut PipelineStats,
) -> u64 {
    let fhrsids: Vec<i64> = rows.iter().map(|r| r.fhrsid).collect();
    let existing = match store.get_by_fhrsids(&fhrsids).await {
        Ok(existing) => existing,
        Err(err) => {
            stats.record_error(PipelineError::ChangeLookup { source: err });
            return 0;
        }
    };
    let existing: HashMap<i64, _> = existing.into_iter().map(|e| (e.fhrsid, e)).collect();

    let mut changes = 0;
    for row in rows {
        let Some(old) = existing.get(&row.fhrsid) else {
            stats.new_establishments += 1;
            continue;
        };
        if old.rating_value == row.rating_value {
            continue;
        }
        let change = RatingChange {
            fhrsid: row.fhrsid,
            old_rating: old.rating_value.clone(),
            new_rating: row.rating_value.clone(),
            old_hygiene: old.hygiene_score,
            new_hygiene: row.hygiene_score,
            old_structural: old.structural_score,
            new_structural: row.structural_score,
            old_management: old.management_score,
            new_management: row.management_score,
        };
        match store.record_rating_change(&change).await {
            Ok(()) => changes += 1,
            Err(err) => stats.record_error(PipelineError::ChangeRecord {
                fhrsid: row.fhrsid,
                source: err,
            }),
        }
    }
    changes
}

/// Write rows in sub-batches of at most `batch_size`, one upsert call each.
/// A failed sub-batch is logged with its size and dropped; its siblings
/// still attempt to write.
pub async fn upsert_in_batches(
    store: &dyn EstablishmentStore,
    rows: &[EstablishmentRow],
    batch_size: usize,
    stats: &mut PipelineStats,
) {
    for chunk in rows.chunks(batch_size.max(1)) {
        if let Err(err) = store.upsert_establishments(chunk).await {
            stats.record_error(PipelineError::UpsertBatch {
                rows: chunk.len(),
                source: err,
            });
        }
    }
}
