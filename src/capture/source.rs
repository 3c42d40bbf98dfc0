//! Capture hardware boundary

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::frame::{ImageBuffer, PixelFormat, SurfaceDesc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    CsiA,
    CsiB,
    CsiAb,
    CsiC,
    CsiD,
    CsiCd,
    CsiE,
    CsiEf,
}

/// Capture-settings descriptor handed to the capture hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub interface: InterfaceType,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub lanes: u8,
    pub pixel_clock_hz: u64,
    pub mipi_clock_khz: u32,
    pub frame_rate: f32,
    /// Aggregated virtual channels (one plane per camera).
    pub siblings: u32,
    pub camera_id: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interface: InterfaceType::CsiAb,
            format: PixelFormat::Raw8Rggb,
            width: 640,
            height: 480,
            lanes: 4,
            pixel_clock_hz: 74_250_000,
            mipi_clock_khz: 800_000,
            frame_rate: 30.0,
            siblings: 1,
            camera_id: 0,
        }
    }
}

impl CaptureSettings {
    pub fn surface(&self) -> SurfaceDesc {
        SurfaceDesc::new(self.format, self.width, self.height)
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.frame_rate)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(format!(
                "capture resolution {}x{} must be non-zero and even",
                self.width, self.height
            ));
        }
        if !matches!(self.lanes, 1 | 2 | 4) {
            return Err(format!("lane count {} must be 1, 2 or 4", self.lanes));
        }
        if !(self.frame_rate > 0.0) {
            return Err(format!("frame rate {} must be positive", self.frame_rate));
        }
        if self.siblings == 0 {
            return Err("sibling count must be at least 1".into());
        }
        if self.format != PixelFormat::Raw8Rggb {
            return Err(format!("capture format {:?} unsupported", self.format));
        }
        Ok(())
    }
}

/// Millisecond timeout for hardware waits, with a distinguished infinite value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTimeout {
    Millis(u32),
    Infinite,
}

impl CaptureTimeout {
    pub fn from_duration(d: Duration) -> Self {
        CaptureTimeout::Millis(d.as_millis().min(u32::MAX as u128) as u32)
    }

    pub fn as_duration(self) -> Option<Duration> {
        match self {
            CaptureTimeout::Millis(ms) => Some(Duration::from_millis(ms as u64)),
            CaptureTimeout::Infinite => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureErrorCode {
    /// No frame completed within the watchdog.
    Timeout,
    /// Single CSI frame-start/frame-end discontinuity.
    FrameDiscontinuity,
    /// Frame shorter than programmed.
    ShortFrame,
    /// CSI input stream lost.
    StreamFailure,
}

impl CaptureErrorCode {
    /// Codes that start a failure episode on first occurrence.
    pub fn is_persistent(self) -> bool {
        matches!(self, CaptureErrorCode::StreamFailure)
    }
}

/// Structured capture error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFault {
    pub stream_id: u32,
    pub frame_id: u64,
    pub virtual_channel_id: u32,
    pub code: CaptureErrorCode,
}

impl fmt::Display for CaptureFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} on stream {} vc {} frame {}",
            self.code, self.stream_id, self.virtual_channel_id, self.frame_id
        )
    }
}

impl std::error::Error for CaptureFault {}

/// A frame the hardware reports as complete, not yet copied out.
#[derive(Debug, Clone, PartialEq)]
pub struct HwFrame {
    pub frame_id: u64,
    pub embedded_top: Vec<u8>,
    pub embedded_bottom: Vec<u8>,
}

/// Capture hardware: blocking "get next frame" with explicit timeout.
pub trait CaptureSource: Send {
    fn settings(&self) -> &CaptureSettings;

    fn start(&mut self) -> Result<(), CaptureFault> {
        Ok(())
    }

    fn stop(&mut self) {}

    /// Wait for the next completed hardware frame.
    fn wait_frame(&mut self, timeout: CaptureTimeout) -> Result<HwFrame, CaptureFault>;

    /// Copy the completed frame's pixels into `dst`.
    fn read_frame(&mut self, frame: &HwFrame, dst: &mut ImageBuffer) -> Result<(), CaptureFault>;
}
