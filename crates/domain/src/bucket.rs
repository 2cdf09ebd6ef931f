use std::collections::{BTreeMap, BTreeSet};

use fleetward_core::HolderId;

/// Partitions `bucket_count` buckets across `live_holders` with minimal churn.
///
/// Each live holder ends with either `bucket_count / holders` buckets or one
/// more; at most `bucket_count % holders` holders get the extra one. Pass one
/// keeps every slot whose previous holder is live and still within that
/// share, walking slots in order; pass two hands each freed slot to the
/// holder with the fewest slots (lowest holder id on ties). A holder whose
/// previous count is at or below the floor share never loses a slot.
///
/// With no live holders every slot is cleared.
#[must_use]
pub fn balance(
    previous: &[Option<HolderId>],
    live_holders: &BTreeSet<HolderId>,
    bucket_count: usize,
) -> Vec<Option<HolderId>> {
    if live_holders.is_empty() {
        return vec![None; bucket_count];
    }

    let fair_share = bucket_count / live_holders.len();
    let mut extra_slots = bucket_count % live_holders.len();
    let mut counts: BTreeMap<HolderId, usize> =
        live_holders.iter().map(|holder| (*holder, 0)).collect();

    let mut assignment: Vec<Option<HolderId>> = (0..bucket_count)
        .map(|slot| previous.get(slot).copied().flatten())
        .collect();

    for slot in &mut assignment {
        let Some(holder) = *slot else {
            continue;
        };
        let Some(count) = counts.get_mut(&holder) else {
            *slot = None;
            continue;
        };

        if *count < fair_share {
            *count += 1;
        } else if *count == fair_share && extra_slots > 0 {
            *count += 1;
            extra_slots -= 1;
        } else {
            *slot = None;
        }
    }

    for slot in &mut assignment {
        if slot.is_some() {
            continue;
        }

        if let Some((holder, count)) = counts.iter_mut().min_by_key(|(_, count)| **count) {
            *slot = Some(*holder);
            *count += 1;
        }
    }

    assignment
}
