use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use xxhash_rust::xxh3::Xxh3;

/// Stable identifier of one asset in the library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One photo record in the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: AssetId,
    pub path: PathBuf,
    /// Creation time, Unix seconds. Snapshots sort on this, newest first.
    pub created_at: i64,
    /// Modification stamp; a change marks the asset as changed in diffs.
    pub modified_at: i64,
    pub width: u32,
    pub height: u32,
}

impl Asset {
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f64 / self.height as f64
        }
    }
}

/// Built-in albums derived from asset geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SmartAlbum {
    /// Width at least twice the height.
    Panoramas,
    /// Taller than wide.
    Verticals,
}

impl SmartAlbum {
    pub const ALL: [SmartAlbum; 2] = [SmartAlbum::Panoramas, SmartAlbum::Verticals];

    pub fn title(&self) -> &'static str {
        match self {
            SmartAlbum::Panoramas => "Panoramas",
            SmartAlbum::Verticals => "Verticals",
        }
    }

    pub fn contains(&self, asset: &Asset) -> bool {
        match self {
            SmartAlbum::Panoramas => asset.height > 0 && asset.width >= asset.height * 2,
            SmartAlbum::Verticals => asset.height > asset.width,
        }
    }
}

/// Scope of an asset fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlbumId {
    Smart(SmartAlbum),
    User(String),
}

impl AlbumId {
    /// Smart album whose title matches `name` (ignoring case), else a user album.
    pub fn from_name(name: &str) -> Self {
        SmartAlbum::ALL
            .into_iter()
            .find(|kind| kind.title().eq_ignore_ascii_case(name))
            .map(AlbumId::Smart)
            .unwrap_or_else(|| AlbumId::User(name.to_string()))
    }
}

impl fmt::Display for AlbumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlbumId::Smart(kind) => f.write_str(kind.title()),
            AlbumId::User(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Album {
    pub id: AlbumId,
    pub title: String,
    pub asset_count: usize,
    /// Creation time of the newest asset, used to order albums.
    pub latest_at: i64,
}

/// Albums grouped the way the album selector shows them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlbumListing {
    pub smart: Vec<Album>,
    pub user: Vec<Album>,
}

struct SnapshotInner {
    scope: Option<AlbumId>,
    assets: Vec<Asset>,
    fingerprint: u64,
}

/// Ordered, immutable point-in-time view of the assets in one scope.
///
/// Cloning is cheap; a library change produces a new snapshot rather than
/// mutating an existing one.
#[derive(Clone)]
pub struct AssetSnapshot {
    inner: Arc<SnapshotInner>,
}

impl AssetSnapshot {
    /// Build a snapshot, sorting newest first (ties broken by id).
    pub fn new(scope: Option<AlbumId>, mut assets: Vec<Asset>) -> Self {
        assets.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        let fingerprint = Self::compute_fingerprint(&assets);
        Self {
            inner: Arc::new(SnapshotInner {
                scope,
                assets,
                fingerprint,
            }),
        }
    }

    pub fn empty(scope: Option<AlbumId>) -> Self {
        Self::new(scope, Vec::new())
    }

    fn compute_fingerprint(assets: &[Asset]) -> u64 {
        let mut hasher = Xxh3::new();
        for asset in assets {
            hasher.update(asset.id.as_str().as_bytes());
            hasher.update(&asset.modified_at.to_le_bytes());
        }
        hasher.digest()
    }

    pub fn scope(&self) -> Option<&AlbumId> {
        self.inner.scope.as_ref()
    }

    pub fn len(&self) -> usize {
        self.inner.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.assets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Asset> {
        self.inner.assets.get(index)
    }

    pub fn assets(&self) -> &[Asset] {
        &self.inner.assets
    }

    pub fn index_of(&self, id: &AssetId) -> Option<usize> {
        self.inner.assets.iter().position(|a| &a.id == id)
    }

    /// Hash of the ordered (id, modification) pairs.
    pub fn fingerprint(&self) -> u64 {
        self.inner.fingerprint
    }

    /// Whether both handles refer to the same snapshot instance.
    pub fn same_instance(&self, other: &AssetSnapshot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for AssetSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetSnapshot")
            .field("scope", &self.inner.scope)
            .field("len", &self.inner.assets.len())
            .field("fingerprint", &format_args!("{:016x}", self.inner.fingerprint))
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_asset(id: &str, created_at: i64) -> Asset {
    Asset {
        id: AssetId::new(id),
        path: PathBuf::from(format!("/library/{id}.jpg")),
        created_at,
        modified_at: created_at,
        width: 400,
        height: 300,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_album_from_name() {
        assert_eq!(
            AlbumId::from_name("panoramas"),
            AlbumId::Smart(SmartAlbum::Panoramas)
        );
        assert_eq!(AlbumId::from_name("Trips"), AlbumId::User("Trips".into()));
    }

    #[test]
    fn test_snapshot_sorted_newest_first() {
        let snapshot = AssetSnapshot::new(
            None,
            vec![test_asset("a", 10), test_asset("b", 30), test_asset("c", 20)],
        );
        let ids: Vec<_> = snapshot.assets().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(snapshot.index_of(&AssetId::new("a")), Some(2));
    }

    #[test]
    fn test_fingerprint_tracks_modification() {
        let before = AssetSnapshot::new(None, vec![test_asset("a", 1), test_asset("b", 2)]);
        let same = AssetSnapshot::new(None, vec![test_asset("b", 2), test_asset("a", 1)]);
        assert_eq!(before.fingerprint(), same.fingerprint());
        assert!(!before.same_instance(&same));

        let mut touched = test_asset("a", 1);
        touched.modified_at = 99;
        let after = AssetSnapshot::new(None, vec![touched, test_asset("b", 2)]);
        assert_ne!(before.fingerprint(), after.fingerprint());
    }

    #[test]
    fn test_smart_album_membership() {
        let mut wide = test_asset("wide", 0);
        wide.width = 4000;
        wide.height = 1000;
        let mut tall = test_asset("tall", 0);
        tall.width = 1000;
        tall.height = 1500;

        assert!(SmartAlbum::Panoramas.contains(&wide));
        assert!(!SmartAlbum::Panoramas.contains(&tall));
        assert!(SmartAlbum::Verticals.contains(&tall));
        assert!(!SmartAlbum::Verticals.contains(&wide));
    }
}
