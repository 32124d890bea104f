//! Narrow synchronous boundary to the camera hardware

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::frame::{CameraTimestamp, PixelFormat};
use crate::error::CameraError;

/// Debayering method used when converting a raw capture to lens images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMethod {
    /// Fastest method, halves the output resolution
    Downsample4,
    /// Greyscale at half resolution
    Mono,
    Nearest,
    HqLinear,
}

impl ColorMethod {
    /// Whether lens images come out at half the sensor resolution
    pub fn halves_resolution(self) -> bool {
        matches!(self, ColorMethod::Downsample4 | ColorMethod::Mono)
    }
}

/// Orientation of the stitched panorama
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewAngle {
    Front0Pole5,
    Top0Pole5,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanoramicSettings {
    pub view_angle: ViewAngle,
    pub alpha_mask: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for PanoramicSettings {
    fn default() -> Self {
        Self {
            view_angle: ViewAngle::Front0Pole5,
            alpha_mask: true,
            width: 4096,
            height: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Ladybug,
    Ladybug3,
    Ladybug5,
    Compressor,
    Unknown,
}

impl DeviceType {
    /// Generations that can stream raw 8-bit sensor data
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            DeviceType::Ladybug3 | DeviceType::Ladybug5 | DeviceType::Compressor
        )
    }
}

#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub model: String,
    pub serial: u32,
    pub device_type: DeviceType,
}

/// One grab straight off the sensor head, before color conversion
#[derive(Debug, Clone)]
pub struct RawCapture {
    pub timestamp: CameraTimestamp,
    /// Sensor columns of a single lens
    pub cols: u32,
    /// Sensor rows of a single lens
    pub rows: u32,
    pub data: Bytes,
}

/// Stitched output of all lenses
#[derive(Debug, Clone)]
pub struct PanoramicImage {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

/// Camera driver contract.
///
/// Every call may block on hardware I/O. Failures must be classified as
/// [`CameraError::Transient`] or [`CameraError::Fatal`].
pub trait CameraDriver: Send {
    /// Open the device and load its calibration.
    fn init(&mut self) -> Result<(), CameraError>;

    /// Prepare the stitching engine.
    fn configure(
        &mut self,
        settings: &PanoramicSettings,
        method: ColorMethod,
    ) -> Result<(), CameraError>;

    fn camera_info(&mut self) -> Result<CameraInfo, CameraError>;

    fn start(&mut self) -> Result<(), CameraError>;

    fn grab(&mut self) -> Result<RawCapture, CameraError>;

    /// Debayer a capture into one buffer per lens, in lens-index order.
    fn convert(
        &mut self,
        raw: &RawCapture,
        method: ColorMethod,
    ) -> Result<Vec<Bytes>, CameraError>;

    fn stitch(&mut self, raw: &RawCapture) -> Result<PanoramicImage, CameraError>;

    fn stop(&mut self);

    fn destroy(&mut self);
}
