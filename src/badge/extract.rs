use crate::types::{Badge, BadgeSet, ProductSnapshot};

/// Extract the Best Seller badge set from a snapshot: every category where
/// the ASIN currently ranks #1. Pure and total — a snapshot with missing or
/// garbled rank data simply yields an empty set (the parser already flagged
/// it incomplete; upstream data completeness varies run to run and must not
/// abort processing).
pub fn extract(snapshot: &ProductSnapshot) -> BadgeSet {
    let mut badges = BadgeSet::new();

    for (category_id, &rank) in &snapshot.sales_ranks {
        if rank != 1 {
            continue;
        }
        let category_name = snapshot
            .category_names
            .get(category_id)
            .cloned()
            .unwrap_or_else(|| format!("Category {category_id}"));
        badges.insert(
            category_id.clone(),
            Badge {
                category_id: category_id.clone(),
                category_name,
                rank,
            },
        );
    }

    badges
}
