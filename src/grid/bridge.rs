//! Translates library change details into grid updates.

use tracing::debug;

use super::BatchUpdate;
use crate::geometry::PositionKey;
use crate::library::ChangeDetails;
use crate::models::AssetSnapshot;

/// What the owner must do in response to one library change.
#[derive(Debug)]
pub enum Reconciliation {
    /// Nothing in the displayed scope changed.
    Unchanged,
    Incremental(IncrementalChange),
    /// The change cannot be expressed as index sets.
    Reload(AssetSnapshot),
}

/// An index-set change, applied together with the snapshot swap.
#[derive(Debug)]
pub struct IncrementalChange {
    pub snapshot: AssetSnapshot,
    pub update: BatchUpdate,
    /// Positions at or after this index may now hold a different asset.
    first_shifted: Option<usize>,
    reconfigured: Vec<usize>,
}

impl IncrementalChange {
    /// Whether anything prefetched for `key` was made for different content.
    pub fn is_stale(&self, key: PositionKey) -> bool {
        self.first_shifted.is_some_and(|first| key.item >= first)
            || self.reconfigured.binary_search(&key.item).is_ok()
    }
}

pub fn reconcile(section: usize, details: Option<ChangeDetails>) -> Reconciliation {
    let Some(details) = details else {
        return Reconciliation::Unchanged;
    };

    if !details.incremental {
        debug!(assets = details.after.len(), "Non-incremental library change");
        return Reconciliation::Reload(details.after);
    }

    let update = BatchUpdate::from_diff(section, &details.diff);
    debug!(
        deleted = update.deleted.len(),
        inserted = update.inserted.len(),
        reconfigured = update.reconfigured.len(),
        moved = update.moved.len(),
        "Incremental library change"
    );

    Reconciliation::Incremental(IncrementalChange {
        snapshot: details.after,
        update,
        first_shifted: details.diff.first_structural_index(),
        reconfigured: details.diff.changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::test_asset;

    #[test]
    fn test_no_details_is_unchanged() {
        assert!(matches!(reconcile(0, None), Reconciliation::Unchanged));
    }

    #[test]
    fn test_full_reset_requests_reload() {
        let after = AssetSnapshot::new(None, vec![test_asset("a", 1)]);
        match reconcile(0, Some(ChangeDetails::full_reset(after.clone()))) {
            Reconciliation::Reload(snapshot) => assert!(snapshot.same_instance(&after)),
            other => panic!("expected reload, got {:?}", other),
        }
    }

    #[test]
    fn test_incremental_marks_shifted_and_changed_positions() {
        let before = AssetSnapshot::new(
            None,
            vec![
                test_asset("a", 5),
                test_asset("b", 4),
                test_asset("c", 3),
                test_asset("d", 2),
            ],
        );
        let mut edited = test_asset("a", 5);
        edited.modified_at = 99;
        // "c" removed; "a" edited in place.
        let after = AssetSnapshot::new(
            None,
            vec![edited, test_asset("b", 4), test_asset("d", 2)],
        );

        let change = match reconcile(0, Some(ChangeDetails::between(&before, after))) {
            Reconciliation::Incremental(change) => change,
            other => panic!("expected incremental, got {:?}", other),
        };

        assert_eq!(change.update.deleted, vec![PositionKey::item(2)]);
        assert_eq!(change.update.reconfigured, vec![PositionKey::item(0)]);
        assert!(change.is_stale(PositionKey::item(0)));
        assert!(!change.is_stale(PositionKey::item(1)));
        assert!(change.is_stale(PositionKey::item(2)));
        assert!(change.is_stale(PositionKey::item(3)));
    }
}
