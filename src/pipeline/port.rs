use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capture::frame::{FrameMetadata, ImageBuffer};
use crate::control::DynamicProperties;
use crate::isp::StatsRecord;
use crate::pool::Pooled;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    Image,
    Stats,
    SensorControl,
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortType::Image => "image",
            PortType::Stats => "stats",
            PortType::SensorControl => "sensor-control",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortDecl {
    pub port: PortType,
    pub direction: PortDirection,
    /// The component is not wired until this port is attached.
    pub mandatory: bool,
}

impl PortDecl {
    pub const fn input(port: PortType, mandatory: bool) -> Self {
        Self {
            port,
            direction: PortDirection::Input,
            mandatory,
        }
    }

    pub const fn output(port: PortType, mandatory: bool) -> Self {
        Self {
            port,
            direction: PortDirection::Output,
            mandatory,
        }
    }
}

/// A frame and the metadata travelling with it.
#[derive(Debug)]
pub struct ImagePacket {
    pub image: Pooled<ImageBuffer>,
    pub meta: FrameMetadata,
}

#[derive(Debug)]
pub struct StatsPacket {
    pub stats: Pooled<StatsRecord>,
    pub meta: FrameMetadata,
}

/// Settings issued at a capture safe point, to be written to the sensor.
#[derive(Debug, Clone, Default)]
pub struct SensorCommand {
    pub sequence: u64,
    pub settings: Option<DynamicProperties>,
}

/// What flows along one graph edge.
#[derive(Debug)]
pub enum Packet {
    Image(ImagePacket),
    Stats(StatsPacket),
    SensorControl(Pooled<SensorCommand>),
}

impl Packet {
    pub fn port(&self) -> PortType {
        match self {
            Packet::Image(_) => PortType::Image,
            Packet::Stats(_) => PortType::Stats,
            Packet::SensorControl(_) => PortType::SensorControl,
        }
    }
}
