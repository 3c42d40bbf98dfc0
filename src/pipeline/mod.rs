//! Component graph: ports, lifecycle and the per-component worker threads.

mod component;
mod graph;
mod port;
pub(crate) mod stages;

pub use component::{ComponentId, ComponentKind, ComponentState, Health};
pub use graph::{CaptureMode, ComponentSpec, OutputFrame, Pipeline};
pub use port::{ImagePacket, Packet, PortDecl, PortDirection, PortType, SensorCommand, StatsPacket};
