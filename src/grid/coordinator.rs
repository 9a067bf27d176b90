//! Bridges the grid's prefetch and display needs to the image manager.
//!
//! The coordinator owns the position -> delivery channel map and the current
//! asset snapshot. Image-manager callbacks and channel finish handlers run
//! on arbitrary threads; they only post `CoordinatorEvent`s, which the owner
//! applies in `process_events()`. At most one tracked request exists per
//! position: re-prefetching a position finishes the old channel, whose
//! finish handler cancels the old request, before a new one is issued.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use flume::{Receiver, Sender};
use tracing::{debug, info, trace, warn};

use super::bridge::{self, Reconciliation};
use super::{default_size_estimator, GridView, PrefetchState, PrefetchedImage, SizeEstimator};
use crate::config::RequestOptions;
use crate::delivery::{ChannelId, DeliveryChannel};
use crate::error::{GalleryError, GalleryResult, ImageError};
use crate::geometry::PositionKey;
use crate::imaging::{Delivery, ImageManager, ImageRequest, ImageResponse};
use crate::library::{AuthorizationStatus, LibraryChange, PhotoLibrary};
use crate::memory::MemoryPressure;
use crate::models::{AlbumId, AssetSnapshot};

/// Section holding the assets.
const ASSET_SECTION: usize = 0;

enum CoordinatorEvent {
    Delivered {
        key: PositionKey,
        channel: ChannelId,
        response: ImageResponse,
    },
    ChannelFinished {
        key: PositionKey,
        channel: ChannelId,
    },
}

pub struct CoordinatorBuilder {
    library: Arc<dyn PhotoLibrary>,
    manager: Arc<dyn ImageManager>,
    grid: Rc<dyn GridView>,
    estimator: Option<SizeEstimator>,
    options: RequestOptions,
    memory: Option<MemoryPressure>,
}

impl CoordinatorBuilder {
    pub fn size_estimator(mut self, estimator: SizeEstimator) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn request_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn memory_pressure(mut self, memory: &MemoryPressure) -> Self {
        self.memory = Some(memory.clone());
        self
    }

    pub fn build(self) -> ImageRequestCoordinator {
        let (events_tx, events_rx) = flume::unbounded();
        ImageRequestCoordinator {
            library: self.library,
            manager: self.manager,
            grid: self.grid,
            estimator: self.estimator.unwrap_or_else(default_size_estimator),
            options: self.options,
            snapshot: AssetSnapshot::empty(None),
            channels: HashMap::new(),
            prefetching_enabled: true,
            prefetches_issued: 0,
            events_tx,
            events_rx,
            memory_rx: self.memory.as_ref().map(MemoryPressure::register),
            memory: self.memory,
            changes_rx: None,
        }
    }
}

pub struct ImageRequestCoordinator {
    library: Arc<dyn PhotoLibrary>,
    manager: Arc<dyn ImageManager>,
    grid: Rc<dyn GridView>,
    estimator: SizeEstimator,
    options: RequestOptions,
    snapshot: AssetSnapshot,
    channels: HashMap<PositionKey, DeliveryChannel<PrefetchedImage>>,
    prefetching_enabled: bool,
    prefetches_issued: usize,
    events_tx: Sender<CoordinatorEvent>,
    events_rx: Receiver<CoordinatorEvent>,
    memory_rx: Option<Receiver<()>>,
    memory: Option<MemoryPressure>,
    changes_rx: Option<Receiver<LibraryChange>>,
}

impl ImageRequestCoordinator {
    pub fn builder(
        library: Arc<dyn PhotoLibrary>,
        manager: Arc<dyn ImageManager>,
        grid: Rc<dyn GridView>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            library,
            manager,
            grid,
            estimator: None,
            options: RequestOptions::default(),
            memory: None,
        }
    }

    pub fn snapshot(&self) -> &AssetSnapshot {
        &self.snapshot
    }

    pub fn image_manager(&self) -> &Arc<dyn ImageManager> {
        &self.manager
    }

    pub fn request_options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn is_prefetching_enabled(&self) -> bool {
        self.prefetching_enabled
    }

    /// Re-arm prefetching after a memory warning. Never done automatically.
    ///
    /// Re-enabling also listens for the next memory warning.
    pub fn set_prefetching_enabled(&mut self, enabled: bool) {
        if self.prefetching_enabled != enabled {
            info!(enabled, "Prefetching toggled");
        }
        self.prefetching_enabled = enabled;
        if enabled && self.memory_rx.is_none() {
            self.memory_rx = self.memory.as_ref().map(MemoryPressure::register);
        }
    }

    /// Prefetch requests issued since this coordinator was built.
    pub fn prefetches_issued(&self) -> usize {
        self.prefetches_issued
    }

    /// Number of positions with a tracked channel.
    pub fn tracked_count(&self) -> usize {
        self.channels.len()
    }

    /// The live channel for `key`, if one is tracked and not finished.
    pub fn channel_for(&self, key: PositionKey) -> Option<DeliveryChannel<PrefetchedImage>> {
        self.channels
            .get(&key)
            .filter(|channel| !channel.is_finished())
            .cloned()
    }

    /// Show the assets of `scope` (everything when `None`), newest first.
    pub fn load(&mut self, scope: Option<AlbumId>) -> GalleryResult<()> {
        let status = match self.library.authorization_status() {
            AuthorizationStatus::NotDetermined => self.library.request_authorization(),
            status => status,
        };
        if !status.allows_access() {
            warn!(?status, "Photo library access not granted");
            return Err(GalleryError::AuthorizationDenied(status));
        }

        if self.changes_rx.is_none() {
            self.changes_rx = Some(self.library.register_change_observer());
        }

        let snapshot = self.library.fetch_assets(scope.as_ref())?;
        info!(scope = ?scope, assets = snapshot.len(), "Loaded asset snapshot");

        self.cancel_all();
        self.snapshot = snapshot;
        self.grid.reload_data();
        Ok(())
    }

    /// Start requests ahead of display for each position.
    pub fn prefetch(&mut self, keys: &[PositionKey]) {
        if self.memory_warning_received() {
            self.handle_memory_warning();
        }
        if !self.prefetching_enabled {
            trace!(count = keys.len(), "Prefetching disabled, ignoring");
            return;
        }

        for &key in keys {
            if let Some(old) = self.channels.remove(&key) {
                trace!(%key, channel = %old.id(), "Replacing prefetch");
                old.finish();
            }
            self.start_prefetch(key);
        }
    }

    fn start_prefetch(&mut self, key: PositionKey) {
        let Some(target_size) = (self.estimator)(self.grid.as_ref(), key) else {
            trace!(%key, "No size estimate, skipping prefetch");
            return;
        };
        let Some(asset) = self.snapshot.get(key.item) else {
            return;
        };

        let channel = DeliveryChannel::with_value(PrefetchedImage::new(
            target_size,
            PrefetchState::Preparing,
        ));
        let channel_id = channel.id();

        let manager = Arc::clone(&self.manager);
        let events = self.events_tx.clone();
        channel.on_finish(move |last: Option<&PrefetchedImage>| {
            if let Some(request_id) = last.and_then(|value| value.state.request_id()) {
                manager.cancel_image_request(request_id);
            }
            let _ = events.send(CoordinatorEvent::ChannelFinished {
                key,
                channel: channel_id,
            });
        });

        let events = self.events_tx.clone();
        let request_id = self.manager.request_image(
            ImageRequest {
                asset: asset.clone(),
                target_size,
                options: self.options.clone(),
            },
            Box::new(move |response| {
                let _ = events.send(CoordinatorEvent::Delivered {
                    key,
                    channel: channel_id,
                    response,
                });
            }),
        );

        self.prefetches_issued += 1;
        debug!(%key, %request_id, target = %target_size, "Prefetch issued");
        channel.publish(PrefetchedImage::new(
            target_size,
            PrefetchState::Prefetching(request_id),
        ));
        self.channels.insert(key, channel);
    }

    /// Stop prefetches for positions that left the prefetch window.
    ///
    /// Each channel is finished, which cancels its request and removes its
    /// map entry before this returns.
    pub fn cancel_prefetch(&mut self, keys: &[PositionKey]) {
        for key in keys {
            if let Some(channel) = self.channels.get(key) {
                trace!(%key, channel = %channel.id(), "Cancelling prefetch");
                // The finish handler cancels the request and posts the removal.
                channel.finish();
            }
        }
        self.drain_events();
    }

    /// Apply pending decode results, memory warnings and library changes.
    ///
    /// Returns the number of events handled.
    pub fn process_events(&mut self) -> usize {
        let mut handled = self.drain_events();

        if self.memory_warning_received() {
            self.handle_memory_warning();
            handled += 1;
        }

        // Only the newest change matters: each diff is against the current snapshot.
        let latest = self
            .changes_rx
            .as_ref()
            .and_then(|rx| rx.try_iter().last());
        if let Some(change) = latest {
            self.handle_library_change(change);
            handled += 1;
        }

        handled
    }

    fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    fn memory_warning_received(&mut self) -> bool {
        let Some(rx) = &self.memory_rx else {
            return false;
        };
        match rx.try_recv() {
            Ok(()) => {
                self.memory_rx = None;
                true
            }
            Err(flume::TryRecvError::Empty) => false,
            Err(flume::TryRecvError::Disconnected) => {
                self.memory_rx = None;
                false
            }
        }
    }

    fn handle_memory_warning(&mut self) {
        info!(
            live = self.channels.len(),
            "Memory warning, disabling prefetch"
        );
        self.prefetching_enabled = false;
    }

    fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::ChannelFinished { key, channel } => {
                if self.channels.get(&key).map(|c| c.id()) == Some(channel) {
                    self.channels.remove(&key);
                    trace!(%key, %channel, "Prefetch entry removed");
                }
            }
            CoordinatorEvent::Delivered {
                key,
                channel,
                response,
            } => self.handle_delivery(key, channel, response),
        }
    }

    fn handle_delivery(&mut self, key: PositionKey, channel_id: ChannelId, response: ImageResponse) {
        let Some(channel) = self.channels.get(&key).filter(|c| c.id() == channel_id) else {
            trace!(%key, request_id = %response.request_id, "Stale delivery ignored");
            return;
        };
        if channel.is_finished() {
            return;
        }
        let Some(current) = channel.current_value() else {
            return;
        };
        if current.state.request_id() != Some(response.request_id) || current.state.is_terminal() {
            trace!(%key, request_id = %response.request_id, "Superseded delivery ignored");
            return;
        }

        match response.outcome {
            Delivery::Frame { image, degraded } => {
                let state = if degraded {
                    PrefetchState::PrefetchedDegraded(response.request_id, image)
                } else {
                    PrefetchState::Prefetched(response.request_id, image)
                };
                trace!(%key, request_id = %response.request_id, degraded, "Prefetch frame");
                channel.publish(PrefetchedImage::new(current.requested_size, state));
            }
            Delivery::Cancelled => {
                debug!(%key, request_id = %response.request_id, "Prefetch cancelled");
                channel.fail(ImageError::Cancelled);
                channel.finish();
            }
            Delivery::Failed(error) => {
                warn!(%key, request_id = %response.request_id, %error, "Prefetch failed");
                channel.fail(error);
                channel.finish();
            }
        }
    }

    fn handle_library_change(&mut self, change: LibraryChange) {
        let details = self.library.change_details(&change, &self.snapshot);

        match bridge::reconcile(ASSET_SECTION, details) {
            Reconciliation::Unchanged => {
                trace!(revision = change.revision, "Library change outside scope");
            }
            Reconciliation::Incremental(change) => {
                self.snapshot = change.snapshot.clone();
                if !change.update.is_empty() {
                    self.grid.perform_batch_updates(&change.update);
                }

                let stale: Vec<PositionKey> = self
                    .channels
                    .keys()
                    .copied()
                    .filter(|key| change.is_stale(*key))
                    .collect();
                debug!(
                    assets = self.snapshot.len(),
                    invalidated = stale.len(),
                    "Applied incremental library change"
                );
                self.cancel_prefetch(&stale);
            }
            Reconciliation::Reload(snapshot) => {
                info!(assets = snapshot.len(), "Reloading grid after library change");
                self.cancel_all();
                self.snapshot = snapshot;
                self.grid.reload_data();
            }
        }
    }

    /// Finish every tracked channel.
    fn cancel_all(&mut self) {
        let keys: Vec<PositionKey> = self.channels.keys().copied().collect();
        if !keys.is_empty() {
            debug!(count = keys.len(), "Cancelling all prefetches");
        }
        self.cancel_prefetch(&keys);
    }
}

impl Drop for ImageRequestCoordinator {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
