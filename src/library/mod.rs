//! Photo library abstraction and the local directory-tree backend.
//!
//! - `PhotoLibrary` - authorization, asset/album fetches, change notifications
//! - `ChangeDetails` - what changed between two snapshots of one scope
//! - `LocalLibrary` - a directory tree indexed in SQLite

pub mod diff;
pub mod local;

use flume::Receiver;

use crate::error::GalleryResult;
use crate::models::{AlbumId, AlbumListing, AssetSnapshot};

pub use diff::IndexDiff;
pub use local::{LocalLibrary, ScanSummary};

/// Access level granted to the photo library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    NotDetermined,
    Restricted,
    Denied,
    Authorized,
    Limited,
}

impl AuthorizationStatus {
    pub fn allows_access(&self) -> bool {
        matches!(
            self,
            AuthorizationStatus::Authorized | AuthorizationStatus::Limited
        )
    }
}

/// Opaque notification that the library changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryChange {
    pub revision: u64,
}

/// Changes between a snapshot and its refetched successor.
#[derive(Debug, Clone)]
pub struct ChangeDetails {
    pub after: AssetSnapshot,
    pub diff: IndexDiff,
    /// `false` when the change cannot be expressed as index sets and the
    /// grid has to reload.
    pub incremental: bool,
}

impl ChangeDetails {
    pub fn between(before: &AssetSnapshot, after: AssetSnapshot) -> Self {
        let diff = IndexDiff::compute(
            before.assets(),
            after.assets(),
            |asset| asset.id.clone(),
            |old, new| old.modified_at != new.modified_at,
        );
        Self {
            after,
            diff,
            incremental: true,
        }
    }

    pub fn full_reset(after: AssetSnapshot) -> Self {
        Self {
            after,
            diff: IndexDiff::default(),
            incremental: false,
        }
    }
}

/// The platform photo library, as seen by the gallery core.
pub trait PhotoLibrary: Send + Sync {
    fn authorization_status(&self) -> AuthorizationStatus;

    /// Ask for access; returns the resulting status.
    fn request_authorization(&self) -> AuthorizationStatus;

    /// Assets in `scope` (all assets when `None`), newest first.
    fn fetch_assets(&self, scope: Option<&AlbumId>) -> GalleryResult<AssetSnapshot>;

    fn fetch_albums(&self) -> GalleryResult<AlbumListing>;

    /// Register for change notifications. Each call gets its own receiver.
    fn register_change_observer(&self) -> Receiver<LibraryChange>;

    /// What changed relative to `snapshot`; `None` when nothing in its scope did.
    fn change_details(&self, change: &LibraryChange, snapshot: &AssetSnapshot)
        -> Option<ChangeDetails>;
}
