//! Album selector data source.
//!
//! Smart albums come first, then user albums. A section only exists while
//! its group is non-empty, so section numbers shift as groups appear and
//! disappear.

use std::rc::Rc;
use std::sync::Arc;

use flume::Receiver;
use tracing::{debug, info, warn};

use crate::error::{GalleryError, GalleryResult};
use crate::geometry::PositionKey;
use crate::grid::{BatchUpdate, GridDataSource, GridView};
use crate::library::{AuthorizationStatus, IndexDiff, LibraryChange, PhotoLibrary};
use crate::models::{Album, AlbumId, AlbumListing};

/// Builds the host's cell for one album.
pub type AlbumBinder<C> = Box<dyn FnMut(&dyn GridView, PositionKey, &Album) -> C>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    Smart,
    User,
}

/// Section numbers of the smart and user groups for a listing.
fn sections(listing: &AlbumListing) -> (Option<usize>, Option<usize>) {
    match (listing.smart.is_empty(), listing.user.is_empty()) {
        (false, false) => (Some(0), Some(1)),
        (false, true) => (Some(0), None),
        (true, false) => (None, Some(0)),
        (true, true) => (None, None),
    }
}

fn diff_albums(before: &[Album], after: &[Album]) -> IndexDiff {
    IndexDiff::compute(before, after, |album| album.id.clone(), |old, new| old != new)
}

pub struct AlbumsDataSource<C> {
    library: Arc<dyn PhotoLibrary>,
    grid: Rc<dyn GridView>,
    binder: AlbumBinder<C>,
    listing: AlbumListing,
    changes_rx: Option<Receiver<LibraryChange>>,
}

impl<C> AlbumsDataSource<C> {
    pub fn new(library: Arc<dyn PhotoLibrary>, grid: Rc<dyn GridView>, binder: AlbumBinder<C>) -> Self {
        Self {
            library,
            grid,
            binder,
            listing: AlbumListing::default(),
            changes_rx: None,
        }
    }

    pub fn listing(&self) -> &AlbumListing {
        &self.listing
    }

    pub fn load(&mut self) -> GalleryResult<()> {
        let status = match self.library.authorization_status() {
            AuthorizationStatus::NotDetermined => self.library.request_authorization(),
            status => status,
        };
        if !status.allows_access() {
            return Err(GalleryError::AuthorizationDenied(status));
        }

        if self.changes_rx.is_none() {
            self.changes_rx = Some(self.library.register_change_observer());
        }

        self.listing = self.library.fetch_albums()?;
        info!(
            smart = self.listing.smart.len(),
            user = self.listing.user.len(),
            "Loaded album listing"
        );
        self.grid.reload_data();
        Ok(())
    }

    fn group(&self, section: usize) -> Option<Group> {
        match sections(&self.listing) {
            (Some(s), _) if s == section => Some(Group::Smart),
            (_, Some(u)) if u == section => Some(Group::User),
            _ => None,
        }
    }

    fn albums(&self, group: Group) -> &[Album] {
        match group {
            Group::Smart => &self.listing.smart,
            Group::User => &self.listing.user,
        }
    }

    pub fn album_at(&self, key: PositionKey) -> Option<&Album> {
        let group = self.group(key.section)?;
        self.albums(group).get(key.item)
    }

    pub fn position_of(&self, album: &AlbumId) -> Option<PositionKey> {
        let (smart, user) = sections(&self.listing);
        let (section, albums) = match album {
            AlbumId::Smart(_) => (smart?, &self.listing.smart),
            AlbumId::User(_) => (user?, &self.listing.user),
        };
        albums
            .iter()
            .position(|a| &a.id == album)
            .map(|item| PositionKey::new(section, item))
    }

    /// Refetch the listing if the library changed since the last call.
    pub fn process_events(&mut self) -> usize {
        let latest = self
            .changes_rx
            .as_ref()
            .and_then(|rx| rx.try_iter().last());
        let Some(change) = latest else {
            return 0;
        };

        match self.library.fetch_albums() {
            Ok(after) => {
                debug!(revision = change.revision, "Album listing changed");
                self.library_did_change(after);
            }
            Err(e) => warn!(error = %e, "Failed to refetch albums after library change"),
        }
        1
    }

    /// Swap in `after` and tell the grid what moved, in one batch.
    pub fn library_did_change(&mut self, after: AlbumListing) {
        let (old_smart, old_user) = sections(&self.listing);
        let (new_smart, new_user) = sections(&after);

        let mut update = BatchUpdate::default();
        for (old, new) in [(old_smart, new_smart), (old_user, new_user)] {
            match (old, new) {
                (Some(old), None) => update.deleted_sections.push(old),
                (None, Some(new)) => update.inserted_sections.push(new),
                _ => {}
            }
        }

        if let (Some(old), Some(new)) = (old_smart, new_smart) {
            update.append_diff(old, new, &diff_albums(&self.listing.smart, &after.smart));
        }
        if let (Some(old), Some(new)) = (old_user, new_user) {
            update.append_diff(old, new, &diff_albums(&self.listing.user, &after.user));
        }

        self.listing = after;
        if update.is_empty() {
            return;
        }
        debug!(
            deleted_sections = update.deleted_sections.len(),
            inserted_sections = update.inserted_sections.len(),
            items = update.deleted.len() + update.inserted.len() + update.reconfigured.len(),
            "Applying album changes"
        );
        self.grid.perform_batch_updates(&update);
    }
}

impl<C> GridDataSource for AlbumsDataSource<C> {
    type Cell = C;

    fn number_of_sections(&self) -> usize {
        let (smart, user) = sections(&self.listing);
        smart.is_some() as usize + user.is_some() as usize
    }

    fn number_of_items(&self, section: usize) -> usize {
        self.group(section).map_or(0, |group| self.albums(group).len())
    }

    fn cell_for_item(&mut self, grid: &dyn GridView, key: PositionKey) -> Option<C> {
        let group = self.group(key.section)?;
        let album = match group {
            Group::Smart => self.listing.smart.get(key.item)?,
            Group::User => self.listing.user.get(key.item)?,
        };
        Some((self.binder)(grid, key, album))
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::grid::test_support::RecordingGrid;
    use crate::library::ChangeDetails;
    use crate::models::{AssetSnapshot, SmartAlbum};

    fn album(id: AlbumId, count: usize) -> Album {
        Album {
            title: id.to_string(),
            id,
            asset_count: count,
            latest_at: 0,
        }
    }

    fn user(name: &str, count: usize) -> Album {
        album(AlbumId::User(name.to_string()), count)
    }

    fn smart(kind: SmartAlbum) -> Album {
        album(AlbumId::Smart(kind), 1)
    }

    #[derive(Default)]
    struct AlbumLibrary {
        listing: Mutex<AlbumListing>,
        observers: Mutex<Vec<flume::Sender<LibraryChange>>>,
    }

    impl AlbumLibrary {
        fn set(&self, listing: AlbumListing) {
            *self.listing.lock() = listing;
            for tx in self.observers.lock().iter() {
                let _ = tx.send(LibraryChange { revision: 1 });
            }
        }
    }

    impl PhotoLibrary for AlbumLibrary {
        fn authorization_status(&self) -> AuthorizationStatus {
            AuthorizationStatus::Authorized
        }

        fn request_authorization(&self) -> AuthorizationStatus {
            AuthorizationStatus::Authorized
        }

        fn fetch_assets(&self, scope: Option<&AlbumId>) -> GalleryResult<AssetSnapshot> {
            Ok(AssetSnapshot::empty(scope.cloned()))
        }

        fn fetch_albums(&self) -> GalleryResult<AlbumListing> {
            Ok(self.listing.lock().clone())
        }

        fn register_change_observer(&self) -> Receiver<LibraryChange> {
            let (tx, rx) = flume::unbounded();
            self.observers.lock().push(tx);
            rx
        }

        fn change_details(&self, _: &LibraryChange, _: &AssetSnapshot) -> Option<ChangeDetails> {
            None
        }
    }

    fn source(
        listing: AlbumListing,
    ) -> (Arc<AlbumLibrary>, Rc<RecordingGrid>, AlbumsDataSource<String>) {
        let library = Arc::new(AlbumLibrary::default());
        *library.listing.lock() = listing;
        let grid = RecordingGrid::new(80.0, 1.0);
        let binder: AlbumBinder<String> =
            Box::new(|_: &dyn GridView, _: PositionKey, album: &Album| album.title.clone());
        let mut source = AlbumsDataSource::new(library.clone(), grid.clone(), binder);
        source.load().unwrap();
        (library, grid, source)
    }

    #[test]
    fn test_sections_only_for_non_empty_groups() {
        let (_lib, grid, source) = source(AlbumListing {
            smart: vec![],
            user: vec![user("Trips", 3), user("Pets", 1)],
        });
        assert_eq!(grid.reloads.get(), 1);
        assert_eq!(source.number_of_sections(), 1);
        assert_eq!(source.number_of_items(0), 2);
        assert_eq!(source.number_of_items(1), 0);
        assert_eq!(
            source.album_at(PositionKey::new(0, 1)).map(|a| a.title.as_str()),
            Some("Pets")
        );
    }

    #[test]
    fn test_smart_albums_come_first() {
        let (_lib, grid, mut source) = source(AlbumListing {
            smart: vec![smart(SmartAlbum::Panoramas)],
            user: vec![user("Trips", 3)],
        });
        assert_eq!(source.number_of_sections(), 2);
        assert_eq!(
            source.position_of(&AlbumId::User("Trips".into())),
            Some(PositionKey::new(1, 0))
        );
        assert_eq!(
            source.position_of(&AlbumId::Smart(SmartAlbum::Panoramas)),
            Some(PositionKey::new(0, 0))
        );
        assert_eq!(source.position_of(&AlbumId::Smart(SmartAlbum::Verticals)), None);
        assert_eq!(
            source.cell_for_item(grid.as_ref(), PositionKey::new(0, 0)),
            Some("Panoramas".to_string())
        );
        assert_eq!(source.cell_for_item(grid.as_ref(), PositionKey::new(2, 0)), None);
    }

    #[test]
    fn test_group_appearing_inserts_section() {
        let (library, grid, mut source) = source(AlbumListing {
            smart: vec![],
            user: vec![user("Trips", 3)],
        });

        library.set(AlbumListing {
            smart: vec![smart(SmartAlbum::Verticals)],
            user: vec![user("Trips", 3), user("Pets", 1)],
        });
        assert_eq!(source.process_events(), 1);

        let batches = grid.batches.borrow();
        assert_eq!(batches.len(), 1);
        let update = &batches[0];
        assert_eq!(update.inserted_sections, vec![0]);
        assert!(update.deleted_sections.is_empty());
        // User albums moved from section 0 to section 1.
        assert_eq!(update.inserted, vec![PositionKey::new(1, 1)]);
        assert!(update.deleted.is_empty());
        assert_eq!(source.number_of_sections(), 2);
    }

    #[test]
    fn test_group_emptying_deletes_section() {
        let (library, grid, mut source) = source(AlbumListing {
            smart: vec![smart(SmartAlbum::Panoramas)],
            user: vec![user("Trips", 3)],
        });

        library.set(AlbumListing {
            smart: vec![smart(SmartAlbum::Panoramas)],
            user: vec![],
        });
        source.process_events();

        let batches = grid.batches.borrow();
        assert_eq!(batches[0].deleted_sections, vec![1]);
        assert!(batches[0].deleted.is_empty());
        assert_eq!(source.number_of_sections(), 1);
    }

    #[test]
    fn test_changed_album_is_reconfigured() {
        let (library, grid, mut source) = source(AlbumListing {
            smart: vec![],
            user: vec![user("Trips", 3), user("Pets", 1)],
        });

        library.set(AlbumListing {
            smart: vec![],
            user: vec![user("Trips", 4), user("Pets", 1)],
        });
        source.process_events();

        let batches = grid.batches.borrow();
        assert_eq!(batches[0].reconfigured, vec![PositionKey::new(0, 0)]);
        assert_eq!(source.album_at(PositionKey::new(0, 0)).unwrap().asset_count, 4);
    }

    #[test]
    fn test_identical_listing_sends_no_batch() {
        let (library, grid, mut source) = source(AlbumListing {
            smart: vec![],
            user: vec![user("Trips", 3)],
        });

        library.set(AlbumListing {
            smart: vec![],
            user: vec![user("Trips", 3)],
        });
        source.process_events();
        assert!(grid.batches.borrow().is_empty());
        assert_eq!(source.process_events(), 0);
    }
}
