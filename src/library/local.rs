//! Photo library backed by a directory tree.
//!
//! Every image file under the root is an asset; every first-level
//! sub-directory is a user album. Metadata is kept in an `AssetIndex` and
//! refreshed by `rescan`, which skips files whose mtime and size are
//! unchanged and notifies change observers when anything moved.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use flume::{Receiver, Sender};
use image::ImageReader;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

use super::{AuthorizationStatus, ChangeDetails, LibraryChange, PhotoLibrary};
use crate::error::{GalleryError, GalleryResult};
use crate::models::{
    Album, AlbumId, AlbumListing, AssetIndex, AssetSnapshot, IndexedAsset, SmartAlbum,
};

/// Outcome of one rescan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub total: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Files whose dimensions could not be read (indexed as 0x0).
    pub errors: usize,
}

impl ScanSummary {
    pub fn has_changes(&self) -> bool {
        self.updated > 0 || self.removed > 0
    }
}

/// A file found by the directory walk.
#[derive(Debug, Clone)]
struct DiscoveredFile {
    path: PathBuf,
    album: Option<String>,
    mtime: i64,
    created_at: i64,
    size: i64,
}

pub struct LocalLibrary {
    root: PathBuf,
    index: Mutex<AssetIndex>,
    revision: AtomicU64,
    last_scan: Mutex<i64>,
    observers: Mutex<Vec<Sender<LibraryChange>>>,
}

impl LocalLibrary {
    /// Wrap an index around `root`. Call `rescan` to populate it.
    pub fn new(root: impl Into<PathBuf>, index: AssetIndex) -> Self {
        Self {
            root: root.into(),
            index: Mutex::new(index),
            revision: AtomicU64::new(0),
            last_scan: Mutex::new(0),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Rescan on tokio's blocking pool.
    pub async fn scan_async(self: &Arc<Self>) -> Result<ScanSummary> {
        let library = Arc::clone(self);
        tokio::task::spawn_blocking(move || library.rescan())
            .await
            .context("Scan task panicked")?
    }

    /// Re-index the directory tree and notify observers if anything changed.
    pub fn rescan(&self) -> Result<ScanSummary> {
        info!(root = ?self.root, "Scanning photo library");
        let stamp = self.next_scan_stamp();

        let discovered = discover_files(&self.root)?;
        let mut index = self.index.lock();
        let cache_map = index.cache_map()?;

        let mut summary = ScanSummary {
            total: discovered.len(),
            ..ScanSummary::default()
        };
        let mut updates = Vec::new();
        let mut unchanged_paths = Vec::new();

        for file in discovered {
            match cache_map.get(&file.path) {
                Some(cached) if cached.mtime == file.mtime && cached.size == file.size => {
                    trace!(path = ?file.path, "Index hit");
                    summary.unchanged += 1;
                    unchanged_paths.push(file.path);
                }
                _ => {
                    let (width, height) = match read_dimensions(&file.path) {
                        Ok(dims) => dims,
                        Err(e) => {
                            warn!(path = ?file.path, error = %e, "Failed to read image dimensions");
                            summary.errors += 1;
                            (0, 0)
                        }
                    };
                    updates.push(IndexedAsset {
                        path: file.path,
                        album: file.album,
                        created_at: file.created_at,
                        mtime: file.mtime,
                        size: file.size,
                        width,
                        height,
                        last_seen: stamp,
                    });
                    summary.updated += 1;
                }
            }
        }

        index.upsert_batch(&updates)?;
        index.touch_last_seen(&unchanged_paths, stamp)?;
        summary.removed = index.delete_stale(stamp)?.len();
        drop(index);

        info!(
            "Scan complete: {} total, {} updated, {} unchanged, {} removed, {} errors",
            summary.total, summary.updated, summary.unchanged, summary.removed, summary.errors
        );

        if summary.has_changes() {
            self.notify_observers();
        }
        Ok(summary)
    }

    /// Strictly increasing stamp for `last_seen`, even for rescans within one second.
    fn next_scan_stamp(&self) -> i64 {
        let mut last = self.last_scan.lock();
        let stamp = AssetIndex::now().max(*last + 1);
        *last = stamp;
        stamp
    }

    fn notify_observers(&self) {
        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        let change = LibraryChange { revision };
        let mut observers = self.observers.lock();
        observers.retain(|tx| tx.send(change).is_ok());
        debug!(revision, observers = observers.len(), "Library change published");
    }

    fn album_listing(&self) -> Result<AlbumListing> {
        let index = self.index.lock();

        let mut smart = Vec::new();
        for kind in SmartAlbum::ALL {
            let assets = index.assets_in_smart_album(kind)?;
            if let Some(newest) = assets.first() {
                smart.push(Album {
                    id: AlbumId::Smart(kind),
                    title: kind.title().to_string(),
                    asset_count: assets.len(),
                    latest_at: newest.created_at,
                });
            }
        }

        let user = index
            .user_albums()?
            .into_iter()
            .map(|summary| Album {
                id: AlbumId::User(summary.name.clone()),
                title: summary.name,
                asset_count: summary.asset_count,
                latest_at: summary.latest_at,
            })
            .collect();

        Ok(AlbumListing { smart, user })
    }
}

impl PhotoLibrary for LocalLibrary {
    fn authorization_status(&self) -> AuthorizationStatus {
        match std::fs::read_dir(&self.root) {
            Ok(_) => AuthorizationStatus::Authorized,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                AuthorizationStatus::Denied
            }
            Err(e) => {
                debug!(root = ?self.root, error = %e, "Library root not readable");
                AuthorizationStatus::Restricted
            }
        }
    }

    fn request_authorization(&self) -> AuthorizationStatus {
        // A directory tree has no consent prompt; access is what the OS grants.
        self.authorization_status()
    }

    fn fetch_assets(&self, scope: Option<&AlbumId>) -> GalleryResult<AssetSnapshot> {
        let index = self.index.lock();
        let assets = match scope {
            None => index.assets_in_album(None)?,
            Some(AlbumId::Smart(kind)) => index.assets_in_smart_album(*kind)?,
            Some(AlbumId::User(name)) => {
                if !index.album_exists(name)? {
                    return Err(GalleryError::UnknownAlbum(name.clone()));
                }
                index.assets_in_album(Some(name))?
            }
        };
        Ok(AssetSnapshot::new(scope.cloned(), assets))
    }

    fn fetch_albums(&self) -> GalleryResult<AlbumListing> {
        Ok(self.album_listing()?)
    }

    fn register_change_observer(&self) -> Receiver<LibraryChange> {
        let (tx, rx) = flume::unbounded();
        self.observers.lock().push(tx);
        rx
    }

    fn change_details(
        &self,
        change: &LibraryChange,
        snapshot: &AssetSnapshot,
    ) -> Option<ChangeDetails> {
        trace!(revision = change.revision, "Computing change details");

        let after = match self.fetch_assets(snapshot.scope()) {
            Ok(after) => after,
            Err(GalleryError::UnknownAlbum(name)) => {
                info!(album = %name, "Album disappeared, requesting full reload");
                return Some(ChangeDetails::full_reset(AssetSnapshot::empty(
                    snapshot.scope().cloned(),
                )));
            }
            Err(e) => {
                warn!(error = %e, "Failed to refetch assets after library change");
                return None;
            }
        };

        if after.fingerprint() == snapshot.fingerprint() {
            return None;
        }
        Some(ChangeDetails::between(snapshot, after))
    }
}

fn is_image_extension(ext: &str) -> bool {
    matches!(
        ext.to_lowercase().as_str(),
        "jpg" | "jpeg" | "png" | "webp" | "gif" | "bmp" | "tiff" | "tif"
    )
}

fn unix_seconds(time: std::io::Result<SystemTime>) -> Option<i64> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

/// Walks the library root and returns every image file, sorted by path.
fn discover_files(root: &Path) -> Result<Vec<DiscoveredFile>> {
    if !root.is_dir() {
        anyhow::bail!("Library root is not a directory: {:?}", root);
    }

    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_dir() {
            continue;
        }

        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !is_image_extension(ext) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to read metadata for {:?}: {}", path, e);
                continue;
            }
        };

        let mtime = unix_seconds(metadata.modified()).unwrap_or(0);
        let created_at = unix_seconds(metadata.created()).unwrap_or(mtime);

        files.push(DiscoveredFile {
            path: path.to_path_buf(),
            album: album_for(root, path),
            mtime,
            created_at,
            size: metadata.len() as i64,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// First-level directory of `path` under `root`, if the file is nested.
fn album_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let first = components.next()?;
    // A file directly under the root has a single component.
    components.next()?;
    Some(first.as_os_str().to_string_lossy().into_owned())
}

/// Reads image dimensions from the header without decoding pixels.
fn read_dimensions(path: &Path) -> Result<(u32, u32)> {
    ImageReader::open(path)
        .with_context(|| format!("Failed to open image: {:?}", path))?
        .with_guessed_format()
        .context("Failed to guess image format")?
        .into_dimensions()
        .with_context(|| format!("Failed to read dimensions: {:?}", path))
}
