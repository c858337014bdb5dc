//! kiosk-hw — frame acquisition for the attendance pipeline.
//!
//! V4L2 camera capture, a pulled still-image stream, and the hashed
//! device fingerprint used for kiosk registration.

pub mod camera;
pub mod fingerprint;
pub mod frame;
pub mod snapshot;
pub mod source;

pub use camera::{CameraError, CameraSource, DeviceInfo};
pub use fingerprint::{device_fingerprint, DeviceTraits};
pub use frame::{encode_jpeg, Frame, FrameError};
pub use snapshot::SnapshotSource;
pub use source::{create_video_source, frame_channel, FrameFeed, FrameSink, SourceError, SourceKind, SourceSettings, VideoSource};
