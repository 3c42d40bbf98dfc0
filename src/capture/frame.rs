use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::control::{ControlProperties, DynamicProperties};
use crate::time::FrameTimestamps;

/// Pixel formats moving through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit Bayer, RGGB quad order
    Raw8Rggb,
    Rgb24,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Raw8Rggb | PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorSpace {
    #[default]
    Raw,
    Srgb,
    Rec709,
}

/// Geometry and format of one plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceDesc {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl SurfaceDesc {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
        }
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn byte_len(&self) -> usize {
        self.stride() * self.height as usize
    }
}

/// Pooled pixel storage: one plane per sibling camera.
///
/// Allocated once when its pool is created and overwritten in place for every
/// frame afterwards.
#[derive(Debug)]
pub struct ImageBuffer {
    desc: SurfaceDesc,
    planes: Vec<BytesMut>,
    /// Opaque value the client may attach to an output frame.
    pub client_tag: u64,
}

impl ImageBuffer {
    pub fn allocate(desc: SurfaceDesc, siblings: usize) -> Self {
        let planes = (0..siblings.max(1))
            .map(|_| {
                let mut plane = BytesMut::with_capacity(desc.byte_len());
                plane.resize(desc.byte_len(), 0);
                plane
            })
            .collect();
        Self {
            desc,
            planes,
            client_tag: 0,
        }
    }

    pub fn desc(&self) -> SurfaceDesc {
        self.desc
    }

    pub fn sibling_count(&self) -> usize {
        self.planes.len()
    }

    pub fn plane(&self, sibling: usize) -> &[u8] {
        &self.planes[sibling]
    }

    pub fn plane_mut(&mut self, sibling: usize) -> &mut [u8] {
        &mut self.planes[sibling]
    }
}

/// Per-frame capture information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub camera_id: u32,
    /// Hardware frame counter reported by the capture source.
    pub frame_id: u64,
    /// Engine sequence number; gaps only where a drop was reported.
    pub sequence: u64,
    pub timestamps: FrameTimestamps,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub sibling_count: u32,
    pub color_space: ColorSpace,
}

/// Everything the pipeline knows about one frame, attached to it for its
/// lifetime in the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub image_info: ImageInfo,
    /// Client control surface in force when the frame was captured.
    pub control: ControlProperties,
    /// Settings actually applied to this frame.
    pub dynamic: DynamicProperties,
    pub embedded_top: Vec<u8>,
    pub embedded_bottom: Vec<u8>,
}

impl FrameMetadata {
    pub fn sequence(&self) -> u64 {
        self.image_info.sequence
    }
}
