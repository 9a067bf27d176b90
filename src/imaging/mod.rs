//! Asynchronous image requests.
//!
//! - `ImageManager` - issue/cancel decode requests, results via callback
//! - `DecodeImageManager` - worker-pool backend built on the image crate
//! - `CancellationToken` - cooperative abort flag carried by each job

pub mod cancel;
pub mod decode;
#[cfg(test)]
pub mod testing;

use std::fmt;
use std::sync::Arc;

use image::RgbaImage;

use crate::config::RequestOptions;
use crate::error::ImageError;
use crate::geometry::PixelSize;
use crate::models::Asset;

pub use cancel::CancellationToken;
pub use decode::DecodeImageManager;

/// Handle of one issued image request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req{}", self.0)
    }
}

/// A decoded RGBA8 frame ready for display.
///
/// Cheap to clone; equality is identity, so re-applying the same frame can
/// be detected without comparing pixels.
#[derive(Clone)]
pub struct Frame(Arc<RgbaImage>);

impl Frame {
    pub fn new(image: RgbaImage) -> Self {
        Self(Arc::new(image))
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    pub fn size(&self) -> PixelSize {
        PixelSize::new(self.width(), self.height())
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.size())
    }
}

/// What to decode and how.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub asset: Asset,
    pub target_size: PixelSize,
    pub options: RequestOptions,
}

/// One callback payload. A request may produce several.
#[derive(Debug, Clone)]
pub enum Delivery {
    Frame { image: Option<Frame>, degraded: bool },
    Cancelled,
    Failed(ImageError),
}

impl Delivery {
    /// Whether no further callbacks follow this one.
    pub fn is_final(&self) -> bool {
        !matches!(self, Delivery::Frame { degraded: true, .. })
    }
}

#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub request_id: RequestId,
    pub outcome: Delivery,
}

/// Result callback. May be invoked from any thread, several times per request.
pub type ResultHandler = Box<dyn Fn(ImageResponse) + Send + Sync>;

/// Platform image service as seen by the gallery core.
pub trait ImageManager: Send + Sync {
    /// Start a request. Returns immediately; results arrive through `handler`.
    fn request_image(&self, request: ImageRequest, handler: ResultHandler) -> RequestId;

    /// Cancel a request. Unknown or completed ids are ignored.
    fn cancel_image_request(&self, id: RequestId);
}
