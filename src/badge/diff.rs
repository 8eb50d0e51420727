use std::collections::BTreeMap;

use crate::types::{BadgeSet, Transition, TransitionKind};

/// Compare two badge states and emit the category-level transitions.
///
/// `gained = current − previous`, `lost = previous − current`. Gained events
/// come before lost events; within each kind, ascending category id (both
/// inputs are BTreeMaps, so iteration order gives this for free). Running
/// the same inputs twice yields identical output.
///
/// A category held previously but entirely absent from `current_ranks` is
/// treated as a data gap, not a loss: no event is emitted. A real loss
/// requires the category to still be present with a rank worse than 1 —
/// transient holes in the upstream response must not fire loss alerts.
///
/// An empty `previous` (first-ever observation) emits a gained event for
/// every rank-1 category. First sight is a legitimate notification, not a
/// bootstrap to suppress.
pub fn diff(
    asin: &str,
    previous: &BadgeSet,
    previous_ranks: &BTreeMap<String, i64>,
    current: &BadgeSet,
    current_ranks: &BTreeMap<String, i64>,
    detected_at: i64,
) -> Vec<Transition> {
    let mut transitions = Vec::new();

    for (category_id, badge) in current {
        if previous.contains_key(category_id) {
            continue;
        }
        transitions.push(Transition {
            asin: asin.to_string(),
            category_id: category_id.clone(),
            category_name: badge.category_name.clone(),
            kind: TransitionKind::Gained,
            rank_before: previous_ranks.get(category_id).copied(),
            rank_after: Some(1),
            detected_at,
        });
    }

    for (category_id, badge) in previous {
        if current.contains_key(category_id) {
            continue;
        }
        // Absent from the new response entirely: inconclusive, skip.
        let Some(&rank_after) = current_ranks.get(category_id) else {
            continue;
        };
        transitions.push(Transition {
            asin: asin.to_string(),
            category_id: category_id.clone(),
            category_name: badge.category_name.clone(),
            kind: TransitionKind::Lost,
            rank_before: Some(1),
            rank_after: Some(rank_after),
            detected_at,
        });
    }

    transitions
}

/// Merge the extracted badge set with held badges whose categories are
/// absent from the new response. The differ treats absence as inconclusive,
/// so those badges are neither lost nor re-confirmed — carrying them
/// forward keeps the baseline stable and prevents a spurious second
/// "gained" when the category reappears at rank 1. A badge whose category
/// IS present (at any rank) never carries forward: rank 1 re-extracts it,
/// a worse rank emits a loss.
pub fn carry_forward(
    previous: &BadgeSet,
    mut current: BadgeSet,
    current_ranks: &BTreeMap<String, i64>,
) -> BadgeSet {
    for (category_id, badge) in previous {
        if !current_ranks.contains_key(category_id) {
            current.entry(category_id.clone()).or_insert_with(|| badge.clone());
        }
    }
    current
}
