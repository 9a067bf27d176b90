//! Hand-driven `ImageManager` for tests.

use std::collections::HashMap;
use std::sync::Arc;

use image::RgbaImage;
use parking_lot::Mutex;

use super::{Delivery, Frame, ImageManager, ImageRequest, ImageResponse, RequestId, ResultHandler};
use crate::error::ImageError;

#[derive(Default)]
struct ManualState {
    next_id: u64,
    issued: Vec<(RequestId, ImageRequest)>,
    handlers: HashMap<RequestId, Arc<ResultHandler>>,
    cancelled: Vec<RequestId>,
}

/// Records every request and cancellation; tests fire responses by hand.
#[derive(Default)]
pub struct ManualImageManager {
    state: Mutex<ManualState>,
}

impl ManualImageManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn issued(&self) -> Vec<(RequestId, ImageRequest)> {
        self.state.lock().issued.clone()
    }

    pub fn last_issued(&self) -> Option<(RequestId, ImageRequest)> {
        self.state.lock().issued.last().cloned()
    }

    pub fn cancelled(&self) -> Vec<RequestId> {
        self.state.lock().cancelled.clone()
    }

    pub fn was_cancelled(&self, id: RequestId) -> bool {
        self.state.lock().cancelled.contains(&id)
    }

    /// Requests that were neither cancelled nor completed.
    pub fn live(&self) -> Vec<RequestId> {
        let state = self.state.lock();
        state
            .issued
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| state.handlers.contains_key(id) && !state.cancelled.contains(id))
            .collect()
    }

    pub fn deliver(&self, id: RequestId, image: Frame, degraded: bool) {
        self.respond(
            id,
            Delivery::Frame {
                image: Some(image),
                degraded,
            },
        );
    }

    pub fn fail(&self, id: RequestId, error: ImageError) {
        self.respond(id, Delivery::Failed(error));
    }

    pub fn respond_cancelled(&self, id: RequestId) {
        self.respond(id, Delivery::Cancelled);
    }

    fn respond(&self, id: RequestId, outcome: Delivery) {
        let handler = {
            let mut state = self.state.lock();
            if outcome.is_final() {
                state.handlers.remove(&id)
            } else {
                state.handlers.get(&id).cloned()
            }
        };
        let handler = handler.unwrap_or_else(|| panic!("no live handler for {}", id));
        handler(ImageResponse {
            request_id: id,
            outcome,
        });
    }
}

impl ImageManager for ManualImageManager {
    fn request_image(&self, request: ImageRequest, handler: ResultHandler) -> RequestId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = RequestId(state.next_id);
        state.issued.push((id, request));
        state.handlers.insert(id, Arc::new(handler));
        id
    }

    fn cancel_image_request(&self, id: RequestId) {
        self.state.lock().cancelled.push(id);
    }
}

/// A blank frame of the given size.
pub fn test_frame(width: u32, height: u32) -> Frame {
    Frame::new(RgbaImage::new(width, height))
}
