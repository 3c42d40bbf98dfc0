//! Worker bodies of the component kinds.
//!
//! Every stage runs on its own thread for the duration of one start/stop
//! cycle. It owns the pools of its output ports; the pipeline only closes,
//! reopens and inspects them.

mod capture;
mod control_algorithm;
mod file_reader;
mod isp;
mod output;
mod sensor_control;

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{select, Receiver, Sender, TryRecvError};

pub(crate) use capture::CaptureStage;
pub(crate) use control_algorithm::ControlAlgorithmStage;
pub(crate) use file_reader::FileReaderStage;
pub(crate) use isp::IspStage;
pub(crate) use output::OutputStage;
pub(crate) use sensor_control::SensorControlStage;

use super::component::{ComponentId, ComponentKind, Health, HealthCell};
use super::port::{ImagePacket, Packet, PortType};
use crate::capture::frame::SurfaceDesc;
use crate::control::{ControlQueue, StaticProperties};
use crate::error::Result;
use crate::events::{ComponentHandle, EventData, EventDispatcher, EventType};
use crate::pool::PoolControl;
use crate::time::TimeSource;

/// Start-time facts a stage needs to size its pools.
pub(crate) struct PrepareContext<'a> {
    pub pipeline: u32,
    pub id: ComponentId,
    /// Image surface arriving on the Image input port, if any.
    pub input_surface: Option<SurfaceDesc>,
    pub siblings: usize,
    pub statics: &'a StaticProperties,
}

impl PrepareContext<'_> {
    pub fn pool_name(&self, kind: ComponentKind, port: PortType) -> String {
        format!("p{}-{}{}-{}", self.pipeline, kind, self.id, port)
    }
}

pub(crate) trait Stage: Send {
    fn kind(&self) -> ComponentKind;

    /// Surface emitted on the Image output port for a given input surface.
    fn output_surface(&self, _input: Option<SurfaceDesc>) -> Option<SurfaceDesc> {
        None
    }

    /// Allocate pools and start-time resources. Pools survive restarts.
    fn prepare(&mut self, cx: &PrepareContext<'_>) -> Result<()>;

    fn pools(&self) -> Vec<(PortType, Arc<dyn PoolControl>)> {
        Vec::new()
    }

    /// Worker loop. Returns when the stop signal fires or a neighbour hangs up.
    fn run(&mut self, io: StageIo, cx: &StageContext);

    /// Release resources when the component is destroyed.
    fn destroy(&mut self) {}
}

/// Channel endpoints handed to one worker.
#[derive(Default)]
pub(crate) struct StageIo {
    pub inputs: Vec<(PortType, Receiver<Packet>)>,
    pub outputs: Vec<(PortType, Sender<Packet>)>,
    pub trigger: Option<Receiver<()>>,
    pub ready: Option<Sender<ImagePacket>>,
}

impl StageIo {
    pub fn take_input(&mut self, port: PortType) -> Option<Receiver<Packet>> {
        let idx = self.inputs.iter().position(|(p, _)| *p == port)?;
        Some(self.inputs.swap_remove(idx).1)
    }

    pub fn take_output(&mut self, port: PortType) -> Option<Sender<Packet>> {
        let idx = self.outputs.iter().position(|(p, _)| *p == port)?;
        Some(self.outputs.swap_remove(idx).1)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Tuning {
    pub frame_period: Duration,
    pub capture_timeout: Duration,
    pub csi_failure_threshold: u32,
    pub plugin_budget: Duration,
    pub capture_core: Option<usize>,
}

/// Shared state a worker reads while running.
pub(crate) struct StageContext {
    pub handle: ComponentHandle,
    pub kind: ComponentKind,
    pub events: Arc<EventDispatcher>,
    pub time: TimeSource,
    pub stop: Receiver<()>,
    pub health: Arc<HealthCell>,
    pub control: Arc<ControlQueue>,
    pub statics: StaticProperties,
    pub tuning: Tuning,
}

impl StageContext {
    pub fn emit(&self, event: EventType, data: EventData) {
        self.events.dispatch(self.kind, self.handle, event, data);
    }

    /// The stop sender is dropped, never sent on.
    pub fn stopping(&self) -> bool {
        matches!(self.stop.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Mark degraded; true if this starts a new degraded period.
    pub fn degrade(&self) -> bool {
        self.health.set(Health::Degraded) == Health::Healthy
    }

    /// Mark healthy; true if the component was degraded.
    pub fn recover(&self) -> bool {
        self.health.set(Health::Healthy) == Health::Degraded
    }

    /// Park until stop. Used after unrecoverable faults.
    pub fn wait_for_stop(&self) {
        let _ = self.stop.recv();
    }
}

/// Send downstream unless stop fires first; false means the worker should exit.
pub(crate) fn forward<T>(tx: &Sender<T>, item: T, stop: &Receiver<()>) -> bool {
    select! {
        send(tx, item) -> res => res.is_ok(),
        recv(stop) -> _ => false,
    }
}

/// Block for the next packet on `input`; `None` on stop or hang-up.
pub(crate) fn next_packet(input: &Receiver<Packet>, stop: &Receiver<()>) -> Option<Packet> {
    select! {
        recv(stop) -> _ => None,
        recv(input) -> msg => msg.ok(),
    }
}
