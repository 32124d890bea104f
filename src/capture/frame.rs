use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Capture time in the camera's own clock domain (IEEE-1394 cycle timer
/// plus the host-side seconds/microseconds the driver stamps on a grab).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraTimestamp {
    pub cycle_count: u32,
    pub cycle_offset: u32,
    pub cycle_seconds: u32,
    pub micro_seconds: u32,
    pub seconds: u32,
}

/// Bit flag naming one sensor of the rig, or the stitched panorama.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum LensTag {
    Cam0,
    Cam1,
    Cam2,
    Cam3,
    Cam4,
    Cam5,
    Panoramic,
}

impl LensTag {
    pub const LENSES: [LensTag; 6] = [
        LensTag::Cam0,
        LensTag::Cam1,
        LensTag::Cam2,
        LensTag::Cam3,
        LensTag::Cam4,
        LensTag::Cam5,
    ];

    /// Tag of the lens at `index`, if the rig has one there.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::LENSES.get(index).copied()
    }

    pub fn bits(self) -> u32 {
        match self {
            LensTag::Panoramic => 1 << 6,
            lens => 1 << (lens as u32),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LensTag::Cam0 => "CAM0",
            LensTag::Cam1 => "CAM1",
            LensTag::Cam2 => "CAM2",
            LensTag::Cam3 => "CAM3",
            LensTag::Cam4 => "CAM4",
            LensTag::Cam5 => "CAM5",
            LensTag::Panoramic => "PANORAMIC",
        }
    }
}

impl fmt::Display for LensTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<LensTag> for u32 {
    fn from(tag: LensTag) -> u32 {
        tag.bits()
    }
}

impl TryFrom<u32> for LensTag {
    type Error = String;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            1 => Ok(LensTag::Cam0),
            2 => Ok(LensTag::Cam1),
            4 => Ok(LensTag::Cam2),
            8 => Ok(LensTag::Cam3),
            16 => Ok(LensTag::Cam4),
            32 => Ok(LensTag::Cam5),
            64 => Ok(LensTag::Panoramic),
            other => Err(format!("unknown lens flag {other:#x}")),
        }
    }
}

/// Pixel layouts a lens or panoramic buffer may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Bgra32,
    Rgba32,
    Bgr24,
    Rgb24,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra32 | PixelFormat::Rgba32 => 4,
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// One lens worth of converted pixels
#[derive(Debug, Clone)]
pub struct LensBuffer {
    pub lens: LensTag,
    pub data: Bytes,
}

/// One time-synchronized capture spanning all lenses.
///
/// Owned by the pipeline until [`RawFrame::into_tasks`] moves every buffer
/// into its own task.
#[derive(Debug)]
pub struct RawFrame {
    /// Monotonic within one pipeline run
    pub sequence: u64,
    pub timestamp: CameraTimestamp,
    pub lenses: Vec<LensBuffer>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Identity of the frame a task belongs to, carried through the pool so the
/// aggregator knows how many lens results to expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTicket {
    pub sequence: u64,
    pub timestamp: CameraTimestamp,
    pub lens_count: usize,
}

/// A single lens buffer on its way to exactly one compression worker
#[derive(Debug)]
pub struct LensImageTask {
    pub ticket: FrameTicket,
    pub lens: LensTag,
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes, 0 when rows are tightly packed
    pub stride: usize,
    pub format: PixelFormat,
    pub quality: u8,
}

impl RawFrame {
    pub fn ticket(&self) -> FrameTicket {
        FrameTicket {
            sequence: self.sequence,
            timestamp: self.timestamp,
            lens_count: self.lenses.len(),
        }
    }

    /// Split the frame into per-lens tasks in lens-index order, consuming it.
    pub fn into_tasks(self, quality: u8) -> Vec<LensImageTask> {
        let ticket = self.ticket();
        let (width, height, format) = (self.width, self.height, self.format);

        self.lenses
            .into_iter()
            .map(|buffer| LensImageTask {
                ticket,
                lens: buffer.lens,
                data: buffer.data,
                width,
                height,
                stride: 0,
                format,
                quality,
            })
            .collect()
    }
}
