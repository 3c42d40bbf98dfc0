use thiserror::Error;

use crate::metadata::MetadataKind;
use crate::pipeline::{ComponentId, ComponentKind, ComponentState, PortType};
use crate::pool::AcquireError;

#[derive(Error, Debug)]
pub enum IppError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown component {0}")]
    UnknownComponent(ComponentId),

    #[error("Unknown pipeline {0}")]
    UnknownPipeline(u32),

    #[error("{what} capacity exceeded (limit {limit})")]
    CapacityExceeded { what: &'static str, limit: usize },

    #[error("Port mismatch: {src_kind} cannot feed {dst_kind} through a {port} port")]
    PortMismatch {
        src_kind: ComponentKind,
        dst_kind: ComponentKind,
        port: PortType,
    },

    #[error("{port} port of component {component} is already attached")]
    PortInUse { component: ComponentId, port: PortType },

    #[error("Attaching {src} -> {dst} would create a cycle")]
    CycleDetected { src: ComponentId, dst: ComponentId },

    #[error("Graph incomplete: {0}")]
    GraphIncomplete(String),

    #[error("Component {component} cannot {operation} while {state}")]
    InvalidState {
        component: ComponentId,
        state: ComponentState,
        operation: &'static str,
    },

    #[error("Pipeline is not running")]
    NotRunning,

    #[error("Pipeline is already running")]
    AlreadyRunning,

    #[error("Single capture requires trigger capture mode")]
    NotTriggerMode,

    #[error("Control property {field} = {value} outside [{min}, {max}]")]
    InvalidControl {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },

    #[error("Timed out")]
    TimedOut,

    #[error("Pipeline is stopping")]
    Stopping,

    #[error("Buffer pool exhausted")]
    Exhausted,

    #[error("Metadata kind {0:?} not present in blob")]
    MetadataNotPresent(MetadataKind),

    #[error("Metadata blob corrupt: {0}")]
    MetadataCorrupt(String),

    #[error("Destination buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error(transparent)]
    Encode(#[from] bincode::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<AcquireError> for IppError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::TimedOut => IppError::TimedOut,
            AcquireError::Stopping => IppError::Stopping,
            AcquireError::Exhausted => IppError::Exhausted,
        }
    }
}

pub type Result<T> = std::result::Result<T, IppError>;
