use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use super::port::{PortDecl, PortDirection, PortType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(pub u32);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    Capture,
    Isp,
    ControlAlgorithm,
    SensorControl,
    Output,
    FileReader,
}

const CAPTURE_PORTS: &[PortDecl] = &[
    PortDecl::output(PortType::Image, true),
    PortDecl::output(PortType::SensorControl, false),
];
const FILE_READER_PORTS: &[PortDecl] = &[PortDecl::output(PortType::Image, true)];
const ISP_PORTS: &[PortDecl] = &[
    PortDecl::input(PortType::Image, true),
    PortDecl::output(PortType::Image, false),
    PortDecl::output(PortType::Stats, false),
];
const CONTROL_ALGORITHM_PORTS: &[PortDecl] = &[PortDecl::input(PortType::Stats, true)];
const SENSOR_CONTROL_PORTS: &[PortDecl] = &[PortDecl::input(PortType::SensorControl, true)];
const OUTPUT_PORTS: &[PortDecl] = &[PortDecl::input(PortType::Image, true)];

impl ComponentKind {
    pub fn ports(self) -> &'static [PortDecl] {
        match self {
            ComponentKind::Capture => CAPTURE_PORTS,
            ComponentKind::FileReader => FILE_READER_PORTS,
            ComponentKind::Isp => ISP_PORTS,
            ComponentKind::ControlAlgorithm => CONTROL_ALGORITHM_PORTS,
            ComponentKind::SensorControl => SENSOR_CONTROL_PORTS,
            ComponentKind::Output => OUTPUT_PORTS,
        }
    }

    pub fn declares(self, port: PortType, direction: PortDirection) -> bool {
        self.ports()
            .iter()
            .any(|d| d.port == port && d.direction == direction)
    }

    /// Frame producers. A pipeline has exactly one.
    pub fn is_source(self) -> bool {
        matches!(self, ComponentKind::Capture | ComponentKind::FileReader)
    }

    pub fn label(self) -> &'static str {
        match self {
            ComponentKind::Capture => "capture",
            ComponentKind::Isp => "isp",
            ComponentKind::ControlAlgorithm => "control-algorithm",
            ComponentKind::SensorControl => "sensor-control",
            ComponentKind::Output => "output",
            ComponentKind::FileReader => "file-reader",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Component lifecycle.
///
/// `Created -> Wired -> Running -> Stopping -> Stopped -> Destroyed`, with
/// `Stopped -> Running` on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    Created,
    Wired,
    Running,
    Stopping,
    Stopped,
    Destroyed,
}

impl ComponentState {
    /// Graph edits are only allowed before a component has ever run.
    pub fn accepts_wiring(self) -> bool {
        matches!(self, ComponentState::Created | ComponentState::Wired)
    }

    pub fn can_start(self) -> bool {
        matches!(self, ComponentState::Wired | ComponentState::Stopped)
    }

    pub fn can_destroy(self) -> bool {
        matches!(
            self,
            ComponentState::Created | ComponentState::Wired | ComponentState::Stopped
        )
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whether a component is keeping up or running degraded after a hardware fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Degraded,
}

/// Health shared between a worker thread and the pipeline.
#[derive(Debug)]
pub struct HealthCell(AtomicU8);

impl HealthCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn get(&self) -> Health {
        match self.0.load(Ordering::Acquire) {
            0 => Health::Healthy,
            _ => Health::Degraded,
        }
    }

    /// Store `health`, returning the previous value.
    pub fn set(&self, health: Health) -> Health {
        let raw = match health {
            Health::Healthy => 0,
            Health::Degraded => 1,
        };
        match self.0.swap(raw, Ordering::AcqRel) {
            0 => Health::Healthy,
            _ => Health::Degraded,
        }
    }
}

impl Default for HealthCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_only_produce() {
        for kind in [ComponentKind::Capture, ComponentKind::FileReader] {
            assert!(kind.is_source());
            assert!(kind
                .ports()
                .iter()
                .all(|p| p.direction == PortDirection::Output));
        }
        assert!(ComponentKind::Isp.declares(PortType::Image, PortDirection::Input));
        assert!(!ComponentKind::Output.declares(PortType::Stats, PortDirection::Input));
    }

    #[test]
    fn health_swap_reports_previous() {
        let cell = HealthCell::new();
        assert_eq!(cell.set(Health::Degraded), Health::Healthy);
        assert_eq!(cell.set(Health::Degraded), Health::Degraded);
        assert_eq!(cell.set(Health::Healthy), Health::Degraded);
        assert_eq!(cell.get(), Health::Healthy);
    }
}
