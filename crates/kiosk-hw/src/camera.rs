//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{FrameSink, SourceError, SourceKind, VideoSource};
use async_trait::async_trait;
use image::RgbImage;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::oneshot;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
/// Consecutive dequeue failures before the capture thread gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 30;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpeg,
    /// 8-bit grayscale.
    Grey,
    /// Packed 24-bit RGB.
    Rgb24,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"GREY" => Some(PixelFormat::Grey),
            b"RGB3" => Some(PixelFormat::Rgb24),
            _ => None,
        }
    }
}

/// Open V4L2 device with a negotiated colour format.
struct Camera {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl Camera {
    fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; accept whatever colour format the driver settles on
        // as long as we can convert it.
        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, MJPG, GREY or RGB3)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    fn decode(&self, buf: &[u8], sequence: u32) -> Result<Frame, CameraError> {
        let (w, h) = (self.width, self.height);
        let image = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, w, h)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}")))?,
            PixelFormat::Grey => frame::grey_to_rgb(buf, w, h)
                .map_err(|e| CameraError::CaptureFailed(format!("GREY conversion failed: {e}")))?,
            PixelFormat::Mjpeg => image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                .map_err(|e| CameraError::CaptureFailed(format!("MJPG decode failed: {e}")))?
                .to_rgb8(),
            PixelFormat::Rgb24 => {
                let expected = (w * h * 3) as usize;
                if buf.len() < expected {
                    return Err(CameraError::CaptureFailed(format!(
                        "RGB3 buffer too short: expected {expected}, got {}",
                        buf.len()
                    )));
                }
                RgbImage::from_raw(w, h, buf[..expected].to_vec())
                    .ok_or_else(|| CameraError::CaptureFailed("RGB3 buffer rejected".into()))?
            }
        };
        Ok(Frame::new(image, sequence))
    }

    /// List available V4L2 video capture devices.
    fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Local camera as a [`VideoSource`]. Frames are captured on a dedicated
/// OS thread; the device is released when the source is stopped or dropped.
pub struct CameraSource {
    device_path: String,
    worker: Option<CaptureWorker>,
}

impl CameraSource {
    pub fn new(device_path: &str) -> Self {
        Self {
            device_path: device_path.to_string(),
            worker: None,
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn list_devices() -> Vec<DeviceInfo> {
        Camera::list_devices()
    }
}

#[async_trait]
impl VideoSource for CameraSource {
    async fn start(&mut self, sink: FrameSink) -> Result<(), SourceError> {
        if self.worker.is_some() {
            return Err(SourceError::AlreadyStarted);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let device_path = self.device_path.clone();
        let thread_stop = stop.clone();

        let thread = std::thread::Builder::new()
            .name("kiosk-camera".into())
            .spawn(move || capture_loop(&device_path, sink, thread_stop, ready_tx))
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;
        self.worker = Some(CaptureWorker { stop, thread });

        let ready = ready_rx
            .await
            .unwrap_or_else(|_| Err(CameraError::CaptureFailed("capture thread exited".into())));
        if let Err(e) = ready {
            self.stop();
            return Err(e.into());
        }
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Relaxed);
            if worker.thread.join().is_err() {
                tracing::warn!(device = %self.device_path, "capture thread panicked");
            }
            tracing::info!(device = %self.device_path, "camera released");
        }
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Camera
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    device_path: &str,
    sink: FrameSink,
    stop: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), CameraError>>,
) {
    let camera = match Camera::open(device_path) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut stream = match MmapStream::with_buffers(&camera.device, BufType::VideoCapture, 4) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(CameraError::CaptureFailed(format!(
                "failed to create mmap stream: {e}"
            ))));
            return;
        }
    };

    let mut ready = Some(ready);
    let mut failures = 0u32;

    while !stop.load(Ordering::Relaxed) {
        let result = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))
            .and_then(|(buf, meta)| camera.decode(buf, meta.sequence));

        match result {
            Ok(frame) => {
                failures = 0;
                sink.send_replace(Some(Arc::new(frame)));
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Err(e) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e));
                    return;
                }
                failures += 1;
                tracing::warn!(error = %e, failures, "camera frame dropped");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    tracing::error!(device = device_path, "camera stopped delivering frames");
                    // Readers must not keep analysing the last frame.
                    sink.send_replace(None);
                    break;
                }
            }
        }
    }
    // Dropping the sink here closes the feed.
    tracing::debug!(device = device_path, "capture loop exiting");
}
