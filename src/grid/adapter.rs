use tracing::trace;

use super::{GridDataSource, GridView, ImageRequestCoordinator, Item};
use crate::geometry::PositionKey;

/// Builds the host's cell for a position from its `Item`.
pub type CellBinder<C> = Box<dyn FnMut(&dyn GridView, PositionKey, Item) -> C>;

/// Answers the asset grid's data-source callbacks from the coordinator.
pub struct AssetGridAdapter<C> {
    coordinator: ImageRequestCoordinator,
    binder: CellBinder<C>,
}

impl<C> AssetGridAdapter<C> {
    pub fn new(coordinator: ImageRequestCoordinator, binder: CellBinder<C>) -> Self {
        Self {
            coordinator,
            binder,
        }
    }

    pub fn coordinator(&self) -> &ImageRequestCoordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut ImageRequestCoordinator {
        &mut self.coordinator
    }
}

impl<C> GridDataSource for AssetGridAdapter<C> {
    type Cell = C;

    fn number_of_sections(&self) -> usize {
        1
    }

    fn number_of_items(&self, section: usize) -> usize {
        if section == 0 {
            self.coordinator.snapshot().len()
        } else {
            0
        }
    }

    fn cell_for_item(&mut self, grid: &dyn GridView, key: PositionKey) -> Option<C> {
        if key.section != 0 || key.item >= self.coordinator.snapshot().len() {
            return None;
        }
        let item = Item {
            snapshot: self.coordinator.snapshot().clone(),
            index: key.item,
            channel: self.coordinator.channel_for(key),
        };
        trace!(%key, prefetched = item.channel.is_some(), "Binding cell");
        Some((self.binder)(grid, key, item))
    }

    fn prefetch_items(&mut self, keys: &[PositionKey]) {
        self.coordinator.prefetch(keys);
    }

    fn cancel_prefetching(&mut self, keys: &[PositionKey]) {
        self.coordinator.cancel_prefetch(keys);
    }
}
