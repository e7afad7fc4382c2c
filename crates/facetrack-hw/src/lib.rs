//! facetrack-hw — Camera capture for the recognition worker.
//!
//! Provides V4L2-based frame capture and the [`FrameSource`] seam the
//! worker reads frames through.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraConfig, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameSource};
