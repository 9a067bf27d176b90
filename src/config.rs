//! Runtime configuration for the gallery.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use directories::{ProjectDirs, UserDirs};

/// Default number of decode worker threads.
pub const DEFAULT_WORKERS: usize = 2;

/// Maximum number of decode worker threads.
pub const MAX_WORKERS: usize = 4;

/// Default event pump interval (~60fps).
const DEFAULT_POLL_MS: u64 = 16;

/// How the image manager delivers frames for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// A fast degraded frame first, then the final frame.
    Opportunistic,
    /// Only the final frame.
    HighQuality,
    /// Only one fast frame.
    Fast,
}

/// Resampling quality used for the final frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    Fast,
    Exact,
}

/// How the decoded image is fitted into the requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    AspectFill,
    AspectFit,
}

/// Options passed along with every image request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    pub delivery_mode: DeliveryMode,
    pub resize_mode: ResizeMode,
    pub content_mode: ContentMode,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Opportunistic,
            resize_mode: ResizeMode::Fast,
            content_mode: ContentMode::AspectFill,
        }
    }
}

/// Top-level gallery configuration.
#[derive(Debug, Clone)]
pub struct GalleryConfig {
    /// Root directory of the local photo library.
    pub library_root: Option<PathBuf>,
    /// SQLite asset index location.
    pub index_path: Option<PathBuf>,
    /// Grid columns.
    pub columns: usize,
    /// Device pixels per layout point.
    pub display_scale: f64,
    /// Viewport width in points.
    pub viewport_width: f64,
    /// Rows visible at once.
    pub visible_rows: usize,
    /// Rows prefetched ahead of the visible area.
    pub prefetch_rows: usize,
    /// Decode worker threads.
    pub workers: usize,
    /// Fade applied when an image first appears in a cell.
    pub fade_in: Duration,
    /// Interval at which the owning context drains events.
    pub poll_interval: Duration,
    /// Interval at which the library is rescanned for changes.
    pub change_poll_interval: Duration,
    pub request: RequestOptions,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            library_root: None,
            index_path: None,
            columns: 3,
            display_scale: 2.0,
            viewport_width: 390.0,
            visible_rows: 6,
            prefetch_rows: 2,
            workers: DEFAULT_WORKERS,
            fade_in: Duration::from_millis(100),
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            change_poll_interval: Duration::from_secs(2),
            request: RequestOptions::default(),
        }
    }
}

impl GalleryConfig {
    pub fn with_library_root(mut self, root: PathBuf) -> Self {
        self.library_root = Some(root);
        self
    }

    pub fn with_index_path(mut self, path: PathBuf) -> Self {
        self.index_path = Some(path);
        self
    }

    pub fn with_columns(mut self, columns: usize) -> Self {
        self.columns = columns.max(1);
        self
    }

    pub fn with_display_scale(mut self, scale: f64) -> Self {
        if scale.is_finite() && scale > 0.0 {
            self.display_scale = scale;
        }
        self
    }

    pub fn with_visible_rows(mut self, rows: usize) -> Self {
        self.visible_rows = rows.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, MAX_WORKERS);
        self
    }

    pub fn with_request_options(mut self, request: RequestOptions) -> Self {
        self.request = request;
        self
    }

    /// Side length of one square grid cell in points.
    pub fn cell_side(&self) -> f64 {
        self.viewport_width / self.columns.max(1) as f64
    }

    /// Library root, defaulting to the user's pictures directory.
    pub fn resolved_library_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.library_root {
            return Ok(root.clone());
        }
        let dirs = UserDirs::new().context("Failed to determine user directories")?;
        dirs.picture_dir()
            .map(|p| p.to_path_buf())
            .context("No pictures directory configured for this user")
    }

    /// Index path, defaulting to `XDG_CACHE_HOME/photogrid/assets.sqlite`.
    pub fn resolved_index_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.index_path {
            return Ok(path.clone());
        }
        let proj_dirs = ProjectDirs::from("", "", "photogrid")
            .context("Failed to determine project directories")?;
        Ok(proj_dirs.cache_dir().join("assets.sqlite"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_request_options() {
        let options = RequestOptions::default();
        assert_eq!(options.delivery_mode, DeliveryMode::Opportunistic);
        assert_eq!(options.resize_mode, ResizeMode::Fast);
        assert_eq!(options.content_mode, ContentMode::AspectFill);
    }

    #[test]
    fn test_workers_clamped() {
        assert_eq!(GalleryConfig::default().with_workers(0).workers, 1);
        assert_eq!(GalleryConfig::default().with_workers(64).workers, MAX_WORKERS);
    }

    #[test]
    fn test_cell_side() {
        let config = GalleryConfig::default().with_columns(3);
        assert!((config.cell_side() - 130.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_scale_ignored() {
        let config = GalleryConfig::default().with_display_scale(-1.0);
        assert_eq!(config.display_scale, 2.0);
    }

    #[test]
    fn test_explicit_paths_win() {
        let config = GalleryConfig::default()
            .with_library_root("/photos".into())
            .with_index_path("/tmp/index.sqlite".into());
        assert_eq!(config.resolved_library_root().unwrap(), PathBuf::from("/photos"));
        assert_eq!(
            config.resolved_index_path().unwrap(),
            PathBuf::from("/tmp/index.sqlite")
        );
    }
}
