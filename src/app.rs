//! Headless gallery session.
//!
//! Drives the prefetch pipeline the way a scrolling grid would: an
//! in-memory grid view of `columns` square cells, a recycled pool of cell
//! presenters covering the visible rows, and one owning thread that pumps
//! events at the poll interval.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use flume::{RecvTimeoutError, Sender};
use tokio::runtime::Builder as TokioRuntimeBuilder;
use tracing::{debug, info, warn};

use crate::collections::{AlbumBinder, AlbumsDataSource};
use crate::config::GalleryConfig;
use crate::geometry::{PositionKey, Size};
use crate::grid::{
    AssetGridAdapter, BatchUpdate, CellBinder, CellPresenter, CellSurface, GridDataSource,
    GridView, ImageRequestCoordinator, Item, Transition,
};
use crate::imaging::decode::DecodeImageManager;
use crate::imaging::{Frame, ImageManager};
use crate::library::LocalLibrary;
use crate::memory::MemoryPressure;
use crate::models::{Album, AlbumId, AssetIndex};

/// How long one scroll step may wait for its visible cells to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Grid view with fixed square cells and no drawing.
struct HeadlessGrid {
    cell_side: f64,
    scale: f64,
    reloads: Cell<usize>,
    batches: Cell<usize>,
    /// Set when the visible cells must be rebound.
    dirty: Cell<bool>,
}

impl HeadlessGrid {
    fn new(cell_side: f64, scale: f64) -> Rc<Self> {
        Rc::new(Self {
            cell_side,
            scale,
            reloads: Cell::new(0),
            batches: Cell::new(0),
            dirty: Cell::new(false),
        })
    }
}

impl GridView for HeadlessGrid {
    fn reload_data(&self) {
        self.reloads.set(self.reloads.get() + 1);
        self.dirty.set(true);
    }

    fn perform_batch_updates(&self, update: &BatchUpdate) {
        debug!(
            deleted = update.deleted.len(),
            inserted = update.inserted.len(),
            reconfigured = update.reconfigured.len(),
            moved = update.moved.len(),
            "Grid batch update"
        );
        self.batches.set(self.batches.get() + 1);
        self.dirty.set(true);
    }

    fn visible_cell_size(&self) -> Option<Size> {
        Some(Size::new(self.cell_side, self.cell_side))
    }

    fn display_scale(&self) -> f64 {
        self.scale
    }
}

#[derive(Debug, Default)]
struct DisplayCounters {
    frames: Cell<usize>,
    fades: Cell<usize>,
    clears: Cell<usize>,
}

/// Cell surface that only counts what it was asked to show.
struct CountingSurface(Rc<DisplayCounters>);

impl CellSurface for CountingSurface {
    fn display(&mut self, image: Option<&Frame>, transition: Transition) {
        let counters = &self.0;
        match image {
            Some(_) => counters.frames.set(counters.frames.get() + 1),
            None => counters.clears.set(counters.clears.get() + 1),
        }
        if matches!(transition, Transition::FadeIn(_)) {
            counters.fades.set(counters.fades.get() + 1);
        }
    }
}

/// Background thread that rescans the library at a fixed interval.
struct ChangeWatcher {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    fn spawn(library: Arc<LocalLibrary>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("library-watcher".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match library.rescan() {
                        Ok(summary) if summary.has_changes() => {
                            info!(?summary, "Library changed on disk")
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Background rescan failed"),
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .context("Failed to spawn library watcher")?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// What one scroll pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub assets: usize,
    pub rows: usize,
    pub frames_displayed: usize,
    pub fade_ins: usize,
    pub prefetches_issued: usize,
    /// Scroll steps that hit the settle timeout.
    pub unsettled_steps: usize,
    pub prefetching_enabled: bool,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} assets in {} rows, {} frames displayed ({} faded in), {} prefetches, {} unsettled steps, prefetch {}",
            self.assets,
            self.rows,
            self.frames_displayed,
            self.fade_ins,
            self.prefetches_issued,
            self.unsettled_steps,
            if self.prefetching_enabled { "on" } else { "off" }
        )
    }
}

pub struct GallerySession {
    config: GalleryConfig,
    // Presenters and the adapter go first so their requests are cancelled
    // before the decode pool shuts down.
    presenters: Vec<CellPresenter>,
    adapter: AssetGridAdapter<Item>,
    grid: Rc<HeadlessGrid>,
    counters: Rc<DisplayCounters>,
    memory: MemoryPressure,
    _watcher: ChangeWatcher,
    library: Arc<LocalLibrary>,
    top_row: usize,
}

impl GallerySession {
    /// Scan the library, start the decode pool and load `album`.
    pub fn open(config: GalleryConfig, album: Option<AlbumId>) -> Result<Self> {
        let root = config.resolved_library_root()?;
        let index_path = config.resolved_index_path()?;
        let index = AssetIndex::open(&index_path)?;
        let library = Arc::new(LocalLibrary::new(root, index));

        let runtime = TokioRuntimeBuilder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build scan runtime")?;
        let scan = runtime.block_on(library.scan_async())?;
        info!(
            total = scan.total,
            updated = scan.updated,
            removed = scan.removed,
            errors = scan.errors,
            "Initial scan complete"
        );

        let manager: Arc<dyn ImageManager> = Arc::new(DecodeImageManager::new(config.workers)?);
        let memory = MemoryPressure::new();
        let grid = HeadlessGrid::new(config.cell_side(), config.display_scale);

        let mut coordinator =
            ImageRequestCoordinator::builder(library.clone(), manager.clone(), grid.clone())
                .request_options(config.request.clone())
                .memory_pressure(&memory)
                .build();
        coordinator.load(album)?;

        let binder: CellBinder<Item> = Box::new(|_: &dyn GridView, _: PositionKey, item: Item| item);
        let adapter = AssetGridAdapter::new(coordinator, binder);

        let counters = Rc::new(DisplayCounters::default());
        let side = config.cell_side();
        let pool = config.visible_rows * config.columns;
        let presenters = (0..pool)
            .map(|_| {
                let mut presenter = CellPresenter::new(
                    manager.clone(),
                    config.request.clone(),
                    Box::new(CountingSurface(counters.clone())),
                )
                .with_fade_in(config.fade_in)
                .with_display_scale(config.display_scale);
                presenter.set_view_size(Size::new(side, side));
                presenter
            })
            .collect();

        let watcher = ChangeWatcher::spawn(library.clone(), config.change_poll_interval)?;

        Ok(Self {
            config,
            presenters,
            adapter,
            grid,
            counters,
            memory,
            _watcher: watcher,
            library,
            top_row: 0,
        })
    }

    pub fn asset_count(&self) -> usize {
        self.adapter.number_of_items(0)
    }

    fn row_count(&self) -> usize {
        self.asset_count().div_ceil(self.config.columns)
    }

    fn row_keys(&self, row: usize) -> Vec<PositionKey> {
        let columns = self.config.columns;
        let count = self.asset_count();
        (row * columns..(row + 1) * columns)
            .filter(|index| *index < count)
            .map(PositionKey::item)
            .collect()
    }

    /// Bind every cell of `row` to the presenter that the row recycles.
    fn bind_row(&mut self, row: usize) {
        let columns = self.config.columns;
        let pool = self.presenters.len();
        for column in 0..columns {
            let index = row * columns + column;
            let item = self
                .adapter
                .cell_for_item(&*self.grid, PositionKey::item(index));
            self.presenters[index % pool].set_item(item);
        }
    }

    fn bind_visible(&mut self) {
        for row in self.top_row..self.top_row + self.config.visible_rows {
            self.bind_row(row);
        }
    }

    /// Scroll to `top` and prefetch what lies just below the visible rows.
    fn scroll_to(&mut self, top: usize) {
        let visible = self.config.visible_rows;

        if top == 0 {
            self.top_row = 0;
            self.bind_visible();
        } else {
            let behind = self.row_keys(top - 1);
            self.adapter.cancel_prefetching(&behind);
            self.top_row = top;
            self.bind_row(top + visible - 1);
        }

        // Rows already in the prefetch window stay tracked; only the row
        // entering it is new.
        let prefetch_end = top + visible + self.config.prefetch_rows;
        let first_new = if top == 0 { visible } else { prefetch_end - 1 };
        let ahead: Vec<PositionKey> = (first_new..prefetch_end)
            .flat_map(|row| self.row_keys(row))
            .collect();
        if !ahead.is_empty() {
            self.adapter.prefetch_items(&ahead);
        }
    }

    /// Drain events until every presenter settled or the timeout passed.
    ///
    /// Returns whether the visible cells settled.
    fn pump(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut handled = self.adapter.coordinator_mut().process_events();
            if self.grid.dirty.replace(false) {
                self.bind_visible();
            }
            handled += self
                .presenters
                .iter_mut()
                .map(|presenter| presenter.process_events())
                .sum::<usize>();

            if handled == 0 && self.presenters.iter().all(|p| p.is_settled()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Scroll through the whole library one row at a time.
    ///
    /// `memory_warning_at` fires a memory warning when that row reaches the
    /// top of the viewport.
    pub fn run(&mut self, memory_warning_at: Option<usize>) -> SessionSummary {
        self.grid.dirty.set(false);
        let rows = self.row_count();
        let steps = rows.saturating_sub(self.config.visible_rows) + 1;
        let mut unsettled_steps = 0;

        info!(
            assets = self.asset_count(),
            rows,
            columns = self.config.columns,
            root = ?self.library.root(),
            "Scrolling gallery"
        );

        for top in 0..steps {
            if memory_warning_at == Some(top) {
                let notified = self.memory.signal();
                info!(row = top, notified, "Simulated memory warning");
            }

            self.scroll_to(top);
            if !self.pump(SETTLE_TIMEOUT) {
                warn!(row = top, "Visible cells did not settle in time");
                unsettled_steps += 1;
            }
            debug!(
                row = top,
                tracked = self.adapter.coordinator().tracked_count(),
                "Scroll step done"
            );
        }

        let summary = SessionSummary {
            assets: self.asset_count(),
            rows,
            frames_displayed: self.counters.frames.get(),
            fade_ins: self.counters.fades.get(),
            prefetches_issued: self.adapter.coordinator().prefetches_issued(),
            unsettled_steps,
            prefetching_enabled: self.adapter.coordinator().is_prefetching_enabled(),
        };
        info!(
            %summary,
            reloads = self.grid.reloads.get(),
            batches = self.grid.batches.get(),
            "Session finished"
        );
        summary
    }

    /// Album selector rows, smart albums first.
    pub fn list_albums(&self) -> Result<Vec<String>> {
        let grid = HeadlessGrid::new(self.config.cell_side(), self.config.display_scale);
        let binder: AlbumBinder<String> = Box::new(|_: &dyn GridView, _: PositionKey, album: &Album| {
            format!("{} ({})", album.title, album.asset_count)
        });
        let mut albums = AlbumsDataSource::new(self.library.clone(), grid.clone(), binder);
        albums.load()?;

        let mut lines = Vec::new();
        for section in 0..albums.number_of_sections() {
            for item in 0..albums.number_of_items(section) {
                if let Some(line) = albums.cell_for_item(&*grid, PositionKey::new(section, item)) {
                    lines.push(line);
                }
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;
    use tempfile::TempDir;

    use super::*;

    fn library_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("Trips")).unwrap();
        for i in 0..5 {
            RgbImage::new(24, 16)
                .save(dir.path().join(format!("img{}.png", i)))
                .unwrap();
        }
        RgbImage::new(40, 10)
            .save(dir.path().join("Trips").join("pano.png"))
            .unwrap();
        RgbImage::new(10, 30)
            .save(dir.path().join("Trips").join("tall.png"))
            .unwrap();
        dir
    }

    fn config(dir: &TempDir) -> GalleryConfig {
        let mut config = GalleryConfig::default()
            .with_library_root(dir.path().to_path_buf())
            .with_index_path(dir.path().join("index").join("assets.sqlite"))
            .with_columns(2)
            .with_visible_rows(2)
            .with_display_scale(1.0);
        config.viewport_width = 32.0;
        config.poll_interval = Duration::from_millis(2);
        config.change_poll_interval = Duration::from_secs(60);
        config
    }

    #[test]
    fn test_scroll_displays_every_visible_cell() {
        let dir = library_dir();
        let mut session = GallerySession::open(config(&dir), None).unwrap();
        assert_eq!(session.asset_count(), 7);

        let summary = session.run(None);
        assert_eq!(summary.rows, 4);
        assert_eq!(summary.unsettled_steps, 0);
        assert!(summary.frames_displayed >= 7);
        assert!(summary.prefetching_enabled);
        assert!(session.presenters.iter().all(|p| p.is_settled()));
    }

    #[test]
    fn test_memory_warning_disables_prefetch() {
        let dir = library_dir();
        let mut session = GallerySession::open(config(&dir), None).unwrap();

        let summary = session.run(Some(1));
        assert!(!summary.prefetching_enabled);
        assert_eq!(summary.unsettled_steps, 0);
        assert!(summary.frames_displayed >= 7);
        // Only the first step's rows 2 and 3 went out.
        assert_eq!(summary.prefetches_issued, 3);
    }

    #[test]
    fn test_memory_warning_before_first_step_issues_no_prefetch() {
        let dir = library_dir();
        let mut session = GallerySession::open(config(&dir), None).unwrap();

        let summary = session.run(Some(0));
        assert!(!summary.prefetching_enabled);
        assert_eq!(summary.prefetches_issued, 0);
        assert_eq!(session.adapter.coordinator().tracked_count(), 0);
        assert_eq!(summary.unsettled_steps, 0);
        assert!(summary.frames_displayed >= 7);
    }

    #[test]
    fn test_album_scope_and_listing() {
        let dir = library_dir();
        let session =
            GallerySession::open(config(&dir), Some(AlbumId::User("Trips".into()))).unwrap();
        assert_eq!(session.asset_count(), 2);

        let lines = session.list_albums().unwrap();
        assert_eq!(
            lines,
            vec![
                "Panoramas (1)".to_string(),
                "Verticals (1)".to_string(),
                "Trips (2)".to_string()
            ]
        );
    }

    #[test]
    fn test_unknown_album_fails_to_open() {
        let dir = library_dir();
        let result = GallerySession::open(config(&dir), Some(AlbumId::User("Nope".into())));
        assert!(result.is_err());
    }
}
