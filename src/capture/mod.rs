pub mod frame;
pub mod simulated;
pub mod source;

pub use frame::{ColorSpace, FrameMetadata, ImageBuffer, ImageInfo, PixelFormat, SurfaceDesc};
pub use simulated::{FaultInjector, SimulatedIsc, SimulatedSensor, SimulatedSource};
pub use source::{
    CaptureErrorCode, CaptureFault, CaptureSettings, CaptureSource, CaptureTimeout, HwFrame,
    InterfaceType,
};
