//! Per-cell display logic.
//!
//! A presenter is bound to one reusable cell. It shows the frame for the
//! bound `Item`, taking it from the item's prefetch channel when that was
//! made for the right size and requesting its own otherwise. Three inputs
//! drive it: `set_item` (reuse), `set_view_size`/`set_display_scale`
//! (layout) and `process_events` (channel updates and request results).
//!
//! A presenter owns at most one self-issued request at a time and never
//! lets a decode outlive its binding: rebinding or dropping cancels the
//! request and finishes any channel it is still waiting on.

use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender};
use tracing::{debug, trace, warn};

use super::{CellSurface, Item, PrefetchedImage, Transition};
use crate::config::RequestOptions;
use crate::delivery::{DeliveryChannel, Next, Subscription, Update};
use crate::geometry::{PixelSize, Size};
use crate::imaging::{Delivery, Frame, ImageManager, ImageRequest, ImageResponse, RequestId};

/// Coarse state, derived from what the presenter holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterState {
    Idle,
    AwaitingPrefetch,
    Displaying,
    SelfRequesting,
}

/// A prefetch channel the presenter has not finished consuming.
struct Attachment {
    channel: DeliveryChannel<PrefetchedImage>,
    /// `None` until the size check passed.
    subscription: Option<Subscription<PrefetchedImage>>,
}

pub struct CellPresenter {
    manager: Arc<dyn ImageManager>,
    options: RequestOptions,
    fade_in: Duration,
    display_scale: f64,
    surface: Box<dyn CellSurface>,
    item: Option<Item>,
    image: Option<Frame>,
    view_size: Size,
    attachment: Option<Attachment>,
    current_request: Option<RequestId>,
    /// Pixel size of what is shown or on its way.
    target: Option<PixelSize>,
    responses_tx: Sender<ImageResponse>,
    responses_rx: Receiver<ImageResponse>,
}

impl CellPresenter {
    pub fn new(
        manager: Arc<dyn ImageManager>,
        options: RequestOptions,
        surface: Box<dyn CellSurface>,
    ) -> Self {
        let (responses_tx, responses_rx) = flume::unbounded();
        Self {
            manager,
            options,
            fade_in: Duration::from_millis(100),
            display_scale: 1.0,
            surface,
            item: None,
            image: None,
            view_size: Size::ZERO,
            attachment: None,
            current_request: None,
            target: None,
            responses_tx,
            responses_rx,
        }
    }

    pub fn with_fade_in(mut self, fade_in: Duration) -> Self {
        self.fade_in = fade_in;
        self
    }

    pub fn with_display_scale(mut self, scale: f64) -> Self {
        self.display_scale = scale;
        self
    }

    pub fn item(&self) -> Option<&Item> {
        self.item.as_ref()
    }

    pub fn image(&self) -> Option<&Frame> {
        self.image.as_ref()
    }

    pub fn current_request(&self) -> Option<RequestId> {
        self.current_request
    }

    pub fn state(&self) -> PresenterState {
        if self.current_request.is_some() && self.image.is_none() {
            PresenterState::SelfRequesting
        } else if self.image.is_some() {
            PresenterState::Displaying
        } else if self.attachment.is_some() {
            PresenterState::AwaitingPrefetch
        } else {
            PresenterState::Idle
        }
    }

    /// Nothing outstanding: no request in flight and no channel being consumed.
    pub fn is_settled(&self) -> bool {
        self.current_request.is_none() && self.attachment.is_none()
    }

    fn wanted_size(&self) -> PixelSize {
        self.view_size.scaled(self.display_scale)
    }

    /// Bind to a new item, or unbind with `None`.
    pub fn set_item(&mut self, item: Option<Item>) {
        if self.item == item {
            return;
        }

        self.teardown();
        self.set_image(None);
        self.target = None;
        self.item = item;

        let channel = match &self.item {
            None => return,
            Some(item) => item.channel.clone(),
        };
        match channel {
            Some(channel) => {
                self.attachment = Some(Attachment {
                    channel,
                    subscription: None,
                });
                self.check_attachment();
            }
            None => self.request(),
        }
    }

    pub fn set_view_size(&mut self, size: Size) {
        if self.view_size == size {
            return;
        }
        self.view_size = size;
        self.layout_changed();
    }

    pub fn set_display_scale(&mut self, scale: f64) {
        if self.display_scale == scale {
            return;
        }
        self.display_scale = scale;
        self.layout_changed();
    }

    /// Unbind and release everything.
    pub fn prepare_for_reuse(&mut self) {
        self.set_item(None);
    }

    /// Apply channel updates and request results. Returns events handled.
    pub fn process_events(&mut self) -> usize {
        self.drain_attachment() + self.drain_responses()
    }

    fn layout_changed(&mut self) {
        if self.item.is_none() {
            return;
        }
        if let Some(attachment) = &self.attachment {
            if attachment.subscription.is_none() {
                self.check_attachment();
                return;
            }
        }

        let wanted = self.wanted_size();
        if wanted.is_zero() {
            return;
        }

        if let Some(attachment) = &self.attachment {
            let requested = attachment.channel.current_value().map(|v| v.requested_size);
            if requested != Some(wanted) {
                debug!(?requested, %wanted, "Prefetch size no longer matches view");
                self.abandon_attachment();
                self.request();
            }
            return;
        }

        if self.target != Some(wanted) {
            self.request();
        }
    }

    /// Validate the attached channel against the view and start consuming it.
    fn check_attachment(&mut self) {
        let wanted = self.wanted_size();
        if wanted.is_zero() {
            trace!("View not measured yet, deferring prefetch check");
            return;
        }
        let Some(attachment) = &self.attachment else {
            return;
        };

        let channel = attachment.channel.clone();
        let value = channel.current_value().unwrap_or_else(|| {
            panic!("attached delivery channel {} has no current value", channel.id())
        });

        if value.requested_size != wanted {
            debug!(
                channel = %channel.id(),
                requested = %value.requested_size,
                %wanted,
                "Prefetch size mismatch, requesting at view size"
            );
            self.abandon_attachment();
            self.request();
            return;
        }

        self.target = Some(wanted);
        self.set_image(value.state.image().cloned());

        if value.state.is_terminal() {
            // Final frame already there; the coordinator keeps the channel.
            self.attachment = None;
        } else if channel.is_finished() {
            self.attachment = None;
            self.request();
        } else if let Some(attachment) = &mut self.attachment {
            attachment.subscription = Some(channel.subscribe());
        }
    }

    fn drain_attachment(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let next = match self.attachment.as_ref().and_then(|a| a.subscription.as_ref()) {
                Some(subscription) => subscription.try_next(),
                None => break,
            };

            match next {
                Next::Pending => break,
                Next::Update(Update::Value(value)) => {
                    handled += 1;
                    // An unmeasured view defers the size check to its next layout pass.
                    let wanted = self.wanted_size();
                    if !wanted.is_zero() && value.requested_size != wanted {
                        debug!(requested = %value.requested_size, "Prefetch size mismatch during delivery");
                        self.abandon_attachment();
                        self.request();
                        break;
                    }
                    self.set_image(value.state.image().cloned());
                    if value.state.is_terminal() {
                        // Consumed; nothing more will come that this cell needs.
                        self.abandon_attachment();
                        break;
                    }
                }
                Next::Update(Update::Failed(error)) => {
                    handled += 1;
                    debug!(%error, "Prefetch failed, requesting directly");
                    self.abandon_attachment();
                    self.request();
                    break;
                }
                Next::Ended => {
                    handled += 1;
                    trace!("Prefetch ended without a final frame, requesting directly");
                    self.attachment = None;
                    self.request();
                    break;
                }
            }
        }
        handled
    }

    fn drain_responses(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(response) = self.responses_rx.try_recv() {
            handled += 1;
            if Some(response.request_id) != self.current_request {
                trace!(request_id = %response.request_id, "Stale response ignored");
                continue;
            }

            match response.outcome {
                Delivery::Frame { image, degraded } => {
                    self.set_image(image);
                    if !degraded {
                        self.current_request = None;
                    }
                }
                Delivery::Cancelled => {
                    self.current_request = None;
                }
                Delivery::Failed(error) => {
                    warn!(request_id = %response.request_id, %error, "Image request failed");
                    self.current_request = None;
                    self.set_image(None);
                }
            }
        }
        handled
    }

    /// Issue a request at the view's pixel size, replacing any previous one.
    fn request(&mut self) {
        self.cancel_request();
        self.target = None;

        let Some(asset) = self.item.as_ref().and_then(Item::asset) else {
            return;
        };
        let target_size = self.wanted_size();
        if target_size.is_zero() {
            trace!(asset = %asset.id, "View not measured, request deferred");
            return;
        }

        let request = ImageRequest {
            asset: asset.clone(),
            target_size,
            options: self.options.clone(),
        };
        let tx = self.responses_tx.clone();
        let request_id = self.manager.request_image(
            request,
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        );

        debug!(%request_id, target = %target_size, "Cell issued its own request");
        self.current_request = Some(request_id);
        self.target = Some(target_size);
    }

    fn cancel_request(&mut self) {
        if let Some(request_id) = self.current_request.take() {
            trace!(%request_id, "Cancelling cell request");
            self.manager.cancel_image_request(request_id);
        }
    }

    /// Stop consuming the attached channel and finish it.
    fn abandon_attachment(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            attachment.channel.finish();
        }
    }

    fn teardown(&mut self) {
        self.cancel_request();
        self.abandon_attachment();
    }

    fn set_image(&mut self, image: Option<Frame>) {
        if self.image == image {
            return;
        }
        let transition = match (&self.image, &image) {
            (None, Some(_)) => Transition::FadeIn(self.fade_in),
            _ => Transition::Immediate,
        };
        self.image = image;
        self.surface.display(self.image.as_ref(), transition);
    }
}

impl Drop for CellPresenter {
    fn drop(&mut self) {
        self.teardown();
    }
}
