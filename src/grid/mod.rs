//! Image prefetch and display pipeline for the asset grid.
//!
//! - `ImageRequestCoordinator` - position -> in-flight request map, prefetch
//! - `CellPresenter` - per-cell display state machine
//! - `bridge` - library change -> batched grid update
//! - `AssetGridAdapter` - data-source callbacks over the coordinator
//!
//! Everything here is owned by one thread. Decode callbacks only send
//! events; owners drain them with `process_events()`.

pub mod adapter;
pub mod bridge;
pub mod coordinator;
pub mod presenter;

use std::time::Duration;

use crate::delivery::DeliveryChannel;
use crate::geometry::{PixelSize, PositionKey, Size};
use crate::imaging::{Frame, RequestId};
use crate::library::IndexDiff;
use crate::models::{Asset, AssetSnapshot};

pub use adapter::{AssetGridAdapter, CellBinder};
pub use bridge::{IncrementalChange, Reconciliation};
pub use coordinator::{CoordinatorBuilder, ImageRequestCoordinator};
pub use presenter::{CellPresenter, PresenterState};

/// The platform grid view, as driven by the core.
///
/// Implementations must not call back into the data source synchronously
/// from these methods.
pub trait GridView {
    fn reload_data(&self);

    fn perform_batch_updates(&self, update: &BatchUpdate);

    /// Size of the first visible cell, if laid out.
    fn visible_cell_size(&self) -> Option<Size>;

    fn display_scale(&self) -> f64;
}

/// One atomic set of grid mutations.
///
/// Applied in field order: section deletes, section inserts, item deletes
/// (old positions), inserts (new positions), reconfigures, then moves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchUpdate {
    pub deleted_sections: Vec<usize>,
    pub inserted_sections: Vec<usize>,
    pub deleted: Vec<PositionKey>,
    pub inserted: Vec<PositionKey>,
    pub reconfigured: Vec<PositionKey>,
    pub moved: Vec<(PositionKey, PositionKey)>,
}

impl BatchUpdate {
    /// Item-level update for one section.
    pub fn from_diff(section: usize, diff: &IndexDiff) -> Self {
        let mut update = Self::default();
        update.append_diff(section, section, diff);
        update
    }

    /// Append item changes where old indices live in `old_section` and new
    /// ones in `new_section`.
    pub fn append_diff(&mut self, old_section: usize, new_section: usize, diff: &IndexDiff) {
        let old = |i: &usize| PositionKey::new(old_section, *i);
        let new = |i: &usize| PositionKey::new(new_section, *i);
        self.deleted.extend(diff.removed.iter().map(old));
        self.inserted.extend(diff.inserted.iter().map(new));
        self.reconfigured.extend(diff.changed.iter().map(new));
        self.moved.extend(
            diff.moves
                .iter()
                .map(|(from, to)| (old(from), new(to))),
        );
    }

    pub fn is_empty(&self) -> bool {
        self.deleted_sections.is_empty()
            && self.inserted_sections.is_empty()
            && self.deleted.is_empty()
            && self.inserted.is_empty()
            && self.reconfigured.is_empty()
            && self.moved.is_empty()
    }
}

/// Data-source callbacks the grid view invokes.
pub trait GridDataSource {
    type Cell;

    fn number_of_sections(&self) -> usize;

    fn number_of_items(&self, section: usize) -> usize;

    /// Bind the cell at `key`; `None` for a position outside the data.
    fn cell_for_item(&mut self, grid: &dyn GridView, key: PositionKey) -> Option<Self::Cell>;

    fn prefetch_items(&mut self, _keys: &[PositionKey]) {}

    fn cancel_prefetching(&mut self, _keys: &[PositionKey]) {}
}

/// How a surface should switch to a new image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    FadeIn(Duration),
    Immediate,
}

/// The view a presenter draws into.
pub trait CellSurface {
    fn display(&mut self, image: Option<&Frame>, transition: Transition);
}

/// Estimated pixel size for a position; `None` skips prefetching it.
pub type SizeEstimator = Box<dyn Fn(&dyn GridView, PositionKey) -> Option<PixelSize>>;

/// First visible cell size times the display scale.
pub fn default_size_estimator() -> SizeEstimator {
    Box::new(|grid: &dyn GridView, _key: PositionKey| {
        let size = grid.visible_cell_size()?;
        if size.is_zero() {
            return None;
        }
        Some(size.scaled(grid.display_scale()))
    })
}

/// Progress of one prefetch request.
#[derive(Debug, Clone, PartialEq)]
pub enum PrefetchState {
    Preparing,
    Prefetching(RequestId),
    PrefetchedDegraded(RequestId, Option<Frame>),
    Prefetched(RequestId, Option<Frame>),
}

impl PrefetchState {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            PrefetchState::Preparing => None,
            PrefetchState::Prefetching(id)
            | PrefetchState::PrefetchedDegraded(id, _)
            | PrefetchState::Prefetched(id, _) => Some(*id),
        }
    }

    pub fn image(&self) -> Option<&Frame> {
        match self {
            PrefetchState::PrefetchedDegraded(_, image) | PrefetchState::Prefetched(_, image) => {
                image.as_ref()
            }
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PrefetchState::Prefetched(..))
    }
}

/// Value carried by a prefetch delivery channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchedImage {
    pub requested_size: PixelSize,
    pub state: PrefetchState,
}

impl PrefetchedImage {
    pub fn new(requested_size: PixelSize, state: PrefetchState) -> Self {
        Self {
            requested_size,
            state,
        }
    }
}

/// What a cell is bound to.
#[derive(Debug, Clone)]
pub struct Item {
    pub snapshot: AssetSnapshot,
    pub index: usize,
    pub channel: Option<DeliveryChannel<PrefetchedImage>>,
}

impl Item {
    pub fn asset(&self) -> Option<&Asset> {
        self.snapshot.get(self.index)
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot.same_instance(&other.snapshot)
            && self.index == other.index
            && self.channel.as_ref().map(|c| c.id()) == other.channel.as_ref().map(|c| c.id())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingGrid;
    use super::*;

    #[test]
    fn test_default_estimator_scales_cell_size() {
        let grid = RecordingGrid::new(100.0, 2.0);
        let estimate = default_size_estimator();
        assert_eq!(
            estimate(grid.as_ref(), PositionKey::item(0)),
            Some(PixelSize::new(200, 200))
        );

        grid.cell_size.set(None);
        assert_eq!(estimate(grid.as_ref(), PositionKey::item(0)), None);
    }

    #[test]
    fn test_batch_update_from_diff() {
        let diff = IndexDiff {
            removed: vec![1],
            inserted: vec![0],
            changed: vec![2],
            moves: vec![(3, 4)],
        };
        let update = BatchUpdate::from_diff(0, &diff);
        assert_eq!(update.deleted, vec![PositionKey::item(1)]);
        assert_eq!(update.inserted, vec![PositionKey::item(0)]);
        assert_eq!(update.reconfigured, vec![PositionKey::item(2)]);
        assert_eq!(update.moved, vec![(PositionKey::item(3), PositionKey::item(4))]);
        assert!(!update.is_empty());
        assert!(BatchUpdate::default().is_empty());
    }

    #[test]
    fn test_prefetch_state_accessors() {
        let id = RequestId(3);
        assert_eq!(PrefetchState::Preparing.request_id(), None);
        assert_eq!(PrefetchState::Prefetching(id).request_id(), Some(id));
        assert!(!PrefetchState::PrefetchedDegraded(id, None).is_terminal());
        assert!(PrefetchState::Prefetched(id, None).is_terminal());
    }
}
