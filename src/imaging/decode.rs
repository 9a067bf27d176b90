//! Worker-pool image manager backed by the image crate.
//!
//! - Bounded pool of named decode threads fed through a flume queue
//! - Every job carries a `CancellationToken` checked at each break point
//! - Opportunistic requests get a nearest-filter degraded frame first
//! - Results go straight to the request's handler on the worker thread

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use flume::{Receiver, Sender};
use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, ImageFormat};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::{
    CancellationToken, Delivery, Frame, ImageManager, ImageRequest, ImageResponse, RequestId,
    ResultHandler,
};
use crate::config::{ContentMode, DeliveryMode, ResizeMode, DEFAULT_WORKERS, MAX_WORKERS};
use crate::error::ImageError;
use crate::geometry::PixelSize;

/// Degraded frames are decoded at this fraction of the target size.
const DEGRADED_DIVISOR: u32 = 4;

/// How long an idle worker waits before re-checking the shutdown flag.
const IDLE_WAIT: Duration = Duration::from_millis(100);

struct DecodeJob {
    id: RequestId,
    request: ImageRequest,
    token: CancellationToken,
    handler: ResultHandler,
}

type ActiveJobs = Arc<Mutex<HashMap<RequestId, CancellationToken>>>;

pub struct DecodeImageManager {
    job_tx: Option<Sender<DecodeJob>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    busy_workers: Arc<AtomicUsize>,
    active: ActiveJobs,
    next_id: AtomicU64,
}

impl DecodeImageManager {
    /// Start a pool with `workers` threads (clamped to `1..=MAX_WORKERS`).
    pub fn new(workers: usize) -> Result<Self> {
        let num_workers = workers.clamp(1, MAX_WORKERS);

        let (job_tx, job_rx) = flume::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let busy_workers = Arc::new(AtomicUsize::new(0));
        let active: ActiveJobs = Arc::new(Mutex::new(HashMap::new()));

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let rx = job_rx.clone();
            let shutdown = Arc::clone(&shutdown);
            let busy = Arc::clone(&busy_workers);
            let active = Arc::clone(&active);

            let handle = thread::Builder::new()
                .name(format!("decode-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, rx, shutdown, busy, active))
                .context("Failed to spawn decode worker")?;
            handles.push(handle);
        }

        debug!(num_workers, "Started decode worker pool");

        Ok(Self {
            job_tx: Some(job_tx),
            workers: handles,
            shutdown,
            busy_workers,
            active,
            next_id: AtomicU64::new(1),
        })
    }

    /// Pool with the default worker count.
    pub fn with_default_workers() -> Result<Self> {
        Self::new(DEFAULT_WORKERS)
    }

    /// Requests issued and neither completed nor cancelled.
    pub fn pending_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn busy_worker_count(&self) -> usize {
        self.busy_workers.load(Ordering::Relaxed)
    }

    pub fn shutdown(&mut self) {
        debug!("Shutting down decode pool");
        self.shutdown.store(true, Ordering::SeqCst);

        for token in self.active.lock().values() {
            token.cancel();
        }
        // Closing the queue wakes idle workers immediately.
        self.job_tx = None;

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("Decode pool shutdown complete");
    }
}

impl ImageManager for DecodeImageManager {
    fn request_image(&self, request: ImageRequest, handler: ResultHandler) -> RequestId {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();

        trace!(request_id = %id, asset = %request.asset.id, target = %request.target_size, "Image requested");

        let job = DecodeJob {
            id,
            request,
            token: token.clone(),
            handler,
        };

        let Some(tx) = &self.job_tx else {
            respond(&job, Delivery::Cancelled);
            return id;
        };

        self.active.lock().insert(id, token);
        if let Err(flume::SendError(job)) = tx.send(job) {
            error!(request_id = %id, "Decode queue disconnected");
            self.active.lock().remove(&id);
            respond(&job, Delivery::Cancelled);
        }
        id
    }

    fn cancel_image_request(&self, id: RequestId) {
        if let Some(token) = self.active.lock().get(&id) {
            trace!(request_id = %id, "Cancelling image request");
            token.cancel();
        }
    }
}

impl Drop for DecodeImageManager {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::Relaxed) {
            self.shutdown();
        }
    }
}

fn worker_loop(
    worker_id: usize,
    rx: Receiver<DecodeJob>,
    shutdown: Arc<AtomicBool>,
    busy: Arc<AtomicUsize>,
    active: ActiveJobs,
) {
    debug!(worker_id, "Decode worker started");

    loop {
        match rx.recv_timeout(IDLE_WAIT) {
            Ok(job) => {
                busy.fetch_add(1, Ordering::Relaxed);
                if shutdown.load(Ordering::Relaxed) {
                    job.token.cancel();
                }
                process_job(&job);
                active.lock().remove(&job.id);
                busy.fetch_sub(1, Ordering::Relaxed);
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker_id, "Decode worker stopped");
}

/// Runs one job to completion, cancellation or failure.
fn process_job(job: &DecodeJob) {
    if job.token.is_cancelled() {
        respond(job, Delivery::Cancelled);
        return;
    }

    let path = &job.request.asset.path;
    let source = match load_source(path) {
        Ok(image) => image,
        Err(e) => {
            warn!(?path, error = %e, "Failed to load image");
            respond(job, Delivery::Failed(e));
            return;
        }
    };

    let target = job.request.target_size;
    let content = job.request.options.content_mode;

    match job.request.options.delivery_mode {
        DeliveryMode::Opportunistic => {
            let small = PixelSize::new(
                (target.width / DEGRADED_DIVISOR).max(1),
                (target.height / DEGRADED_DIVISOR).max(1),
            );
            let degraded = render(&source, small, content, FilterType::Nearest);
            if !deliver_frame(job, degraded, true) {
                return;
            }
            let filter = final_filter(job.request.options.resize_mode);
            let image = render(&source, target, content, filter);
            deliver_frame(job, image, false);
        }
        DeliveryMode::HighQuality => {
            let filter = final_filter(job.request.options.resize_mode);
            let image = render(&source, target, content, filter);
            deliver_frame(job, image, false);
        }
        DeliveryMode::Fast => {
            let image = render(&source, target, content, FilterType::Triangle);
            deliver_frame(job, image, false);
        }
    }
}

/// Delivers a frame unless the job was cancelled. Returns whether it was delivered.
fn deliver_frame(job: &DecodeJob, image: Frame, degraded: bool) -> bool {
    if job.token.is_cancelled() {
        trace!(request_id = %job.id, "Request cancelled before delivery");
        respond(job, Delivery::Cancelled);
        return false;
    }
    respond(
        job,
        Delivery::Frame {
            image: Some(image),
            degraded,
        },
    );
    true
}

fn respond(job: &DecodeJob, outcome: Delivery) {
    (job.handler)(ImageResponse {
        request_id: job.id,
        outcome,
    });
}

fn final_filter(mode: ResizeMode) -> FilterType {
    match mode {
        ResizeMode::Exact => FilterType::CatmullRom,
        ResizeMode::Fast => FilterType::Triangle,
    }
}

/// Resizes into `target` and converts to RGBA8 for display.
fn render(source: &DynamicImage, target: PixelSize, content: ContentMode, filter: FilterType) -> Frame {
    let width = target.width.max(1);
    let height = target.height.max(1);
    let resized = match content {
        ContentMode::AspectFill => source.resize_to_fill(width, height, filter),
        ContentMode::AspectFit => source.resize(width, height, filter),
    };
    Frame::new(resized.to_rgba8())
}

/// Decodes the source file. Animated GIFs use their first frame.
fn load_source(path: &Path) -> std::result::Result<DynamicImage, ImageError> {
    let bytes = std::fs::read(path).map_err(|_| ImageError::Unavailable {
        path: path.to_path_buf(),
    })?;
    decode_bytes(path, bytes).map_err(|e| ImageError::Decode {
        path: path.to_path_buf(),
        message: format!("{:#}", e),
    })
}

fn decode_bytes(path: &Path, bytes: Vec<u8>) -> Result<DynamicImage> {
    let format = image::guess_format(&bytes).ok();

    if format == Some(ImageFormat::Gif) {
        let decoder = GifDecoder::new(Cursor::new(bytes))
            .with_context(|| format!("Failed to decode GIF: {:?}", path))?;
        let frame = decoder
            .into_frames()
            .next()
            .ok_or_else(|| anyhow!("GIF has no frames: {:?}", path))?
            .context("Failed to decode GIF frame")?;
        return Ok(DynamicImage::ImageRgba8(frame.into_buffer()));
    }

    match format {
        Some(fmt) => image::load_from_memory_with_format(&bytes, fmt)
            .with_context(|| format!("Failed to decode image: {:?}", path)),
        None => image::load_from_memory(&bytes)
            .with_context(|| format!("Failed to decode image: {:?}", path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestOptions;
    use crate::models::{Asset, AssetId};
    use image::RgbImage;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn asset_at(path: PathBuf) -> Asset {
        Asset {
            id: AssetId::new(path.to_string_lossy()),
            path,
            created_at: 0,
            modified_at: 0,
            width: 64,
            height: 32,
        }
    }

    fn collect(
        manager: &DecodeImageManager,
        request: ImageRequest,
    ) -> (RequestId, Vec<ImageResponse>) {
        let (tx, rx) = flume::unbounded();
        let id = manager.request_image(
            request,
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        );

        let mut responses = Vec::new();
        while let Ok(response) = rx.recv_timeout(Duration::from_secs(5)) {
            let done = response.outcome.is_final();
            responses.push(response);
            if done {
                break;
            }
        }
        (id, responses)
    }

    fn frame_of(response: &ImageResponse) -> (PixelSize, bool) {
        match &response.outcome {
            Delivery::Frame {
                image: Some(image),
                degraded,
            } => (image.size(), *degraded),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_opportunistic_delivers_degraded_then_final() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wide.png");
        RgbImage::new(64, 32).save(&path).unwrap();

        let manager = DecodeImageManager::new(1).unwrap();
        let (id, responses) = collect(
            &manager,
            ImageRequest {
                asset: asset_at(path),
                target_size: PixelSize::new(16, 16),
                options: RequestOptions::default(),
            },
        );

        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r.request_id == id));
        assert_eq!(frame_of(&responses[0]), (PixelSize::new(4, 4), true));
        // Aspect fill crops to the exact target.
        assert_eq!(frame_of(&responses[1]), (PixelSize::new(16, 16), false));
    }

    #[test]
    fn test_high_quality_aspect_fit_single_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wide.png");
        RgbImage::new(64, 32).save(&path).unwrap();

        let manager = DecodeImageManager::new(1).unwrap();
        let options = RequestOptions {
            delivery_mode: DeliveryMode::HighQuality,
            resize_mode: ResizeMode::Exact,
            content_mode: ContentMode::AspectFit,
            ..RequestOptions::default()
        };
        let (_, responses) = collect(
            &manager,
            ImageRequest {
                asset: asset_at(path),
                target_size: PixelSize::new(16, 16),
                options,
            },
        );

        assert_eq!(responses.len(), 1);
        assert_eq!(frame_of(&responses[0]), (PixelSize::new(16, 8), false));
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let manager = DecodeImageManager::new(1).unwrap();
        let (_, responses) = collect(
            &manager,
            ImageRequest {
                asset: asset_at(PathBuf::from("/no/such/photo.jpg")),
                target_size: PixelSize::new(16, 16),
                options: RequestOptions::default(),
            },
        );

        assert_eq!(responses.len(), 1);
        assert!(matches!(
            responses[0].outcome,
            Delivery::Failed(ImageError::Unavailable { .. })
        ));
    }

    #[test]
    fn test_corrupt_file_fails_to_decode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        let manager = DecodeImageManager::new(1).unwrap();
        let (_, responses) = collect(
            &manager,
            ImageRequest {
                asset: asset_at(path),
                target_size: PixelSize::new(16, 16),
                options: RequestOptions::default(),
            },
        );

        assert!(matches!(
            responses[0].outcome,
            Delivery::Failed(ImageError::Decode { .. })
        ));
    }

    #[test]
    fn test_cancel_before_processing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        RgbImage::new(8, 8).save(&path).unwrap();

        let (tx, rx) = flume::unbounded();
        let job = DecodeJob {
            id: RequestId(7),
            request: ImageRequest {
                asset: asset_at(path),
                target_size: PixelSize::new(4, 4),
                options: RequestOptions::default(),
            },
            token: CancellationToken::new(),
            handler: Box::new(move |response| {
                let _ = tx.send(response);
            }),
        };

        job.token.cancel();
        process_job(&job);

        let responses: Vec<_> = rx.try_iter().collect();
        assert_eq!(responses.len(), 1);
        assert!(matches!(responses[0].outcome, Delivery::Cancelled));
    }

    #[test]
    fn test_cancel_unknown_id_is_ignored() {
        let manager = DecodeImageManager::new(1).unwrap();
        manager.cancel_image_request(RequestId(9999));
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let mut manager = DecodeImageManager::new(2).unwrap();
        manager.shutdown();
        assert!(manager.workers.is_empty());
        assert_eq!(manager.busy_worker_count(), 0);
    }
}
