use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::component::{ComponentId, ComponentKind, ComponentState, Health, HealthCell};
use super::port::{ImagePacket, PortDirection, PortType};
use super::stages::{
    CaptureStage, ControlAlgorithmStage, FileReaderStage, IspStage, OutputStage, PrepareContext,
    SensorControlStage, Stage, StageContext, StageIo, Tuning,
};
use crate::capture::frame::{FrameMetadata, ImageBuffer, SurfaceDesc};
use crate::capture::source::CaptureSource;
use crate::control::{ActiveArray, ControlProperties, ControlQueue, KneePoint, StaticProperties, MAX_SETTINGS_DELAY};
use crate::error::{IppError, Result};
use crate::events::{ComponentHandle, EventData, EventDispatcher, EventType};
use crate::isp::IspVersion;
use crate::metadata::MetadataBlob;
use crate::plugin::PluginFactory;
use crate::pool::{PoolControl, PoolSnapshot};
use crate::sensor::{SensorAttributes, SensorDevice};
use crate::time::TimeSource;
use crate::PipelineConfig;

/// How the source component is paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Capture every frame the hardware delivers.
    #[default]
    FreeRun,
    /// Capture one frame per `single_capture` request.
    Trigger,
}

/// Everything needed to build one component.
pub enum ComponentSpec {
    Capture {
        source: Box<dyn CaptureSource>,
        pool_capacity: Option<usize>,
    },
    FileReader {
        path: PathBuf,
        surface: SurfaceDesc,
        siblings: u32,
        frame_rate: f32,
        looping: bool,
        pool_capacity: Option<usize>,
    },
    Isp {
        version: Option<IspVersion>,
        image_pool: Option<usize>,
        stats_pool: Option<usize>,
    },
    ControlAlgorithm {
        /// `None` runs the pipeline on its default controls.
        plugin: Option<Box<dyn PluginFactory>>,
    },
    SensorControl {
        device: Box<dyn SensorDevice>,
        settings_delay: u8,
        knee_points: Vec<KneePoint>,
    },
    Output,
}

impl ComponentSpec {
    pub fn capture(source: impl CaptureSource + 'static) -> Self {
        ComponentSpec::Capture {
            source: Box::new(source),
            pool_capacity: None,
        }
    }

    pub fn file_reader(path: impl Into<PathBuf>, surface: SurfaceDesc, frame_rate: f32) -> Self {
        ComponentSpec::FileReader {
            path: path.into(),
            surface,
            siblings: 1,
            frame_rate,
            looping: false,
            pool_capacity: None,
        }
    }

    pub fn isp() -> Self {
        ComponentSpec::Isp {
            version: None,
            image_pool: None,
            stats_pool: None,
        }
    }

    pub fn control_algorithm(plugin: impl PluginFactory + 'static) -> Self {
        ComponentSpec::ControlAlgorithm {
            plugin: Some(Box::new(plugin)),
        }
    }

    pub fn sensor_control(device: impl SensorDevice + 'static, settings_delay: u8) -> Self {
        ComponentSpec::SensorControl {
            device: Box::new(device),
            settings_delay,
            knee_points: Vec::new(),
        }
    }

    pub fn output() -> Self {
        ComponentSpec::Output
    }

    pub fn kind(&self) -> ComponentKind {
        match self {
            ComponentSpec::Capture { .. } => ComponentKind::Capture,
            ComponentSpec::FileReader { .. } => ComponentKind::FileReader,
            ComponentSpec::Isp { .. } => ComponentKind::Isp,
            ComponentSpec::ControlAlgorithm { .. } => ComponentKind::ControlAlgorithm,
            ComponentSpec::SensorControl { .. } => ComponentKind::SensorControl,
            ComponentSpec::Output => ComponentKind::Output,
        }
    }
}

impl fmt::Debug for ComponentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ComponentSpec").field(&self.kind()).finish()
    }
}

/// Construction facts the static properties are derived from.
enum SlotFacts {
    Source {
        surface: SurfaceDesc,
        siblings: u32,
        frame_rate: f32,
    },
    Sensor {
        attributes: SensorAttributes,
        settings_delay: u8,
        knee_points: Vec<KneePoint>,
    },
    Isp(IspVersion),
    None,
}

struct Slot {
    id: ComponentId,
    kind: ComponentKind,
    state: ComponentState,
    health: Arc<HealthCell>,
    /// `None` while the worker thread owns it.
    stage: Option<Box<dyn Stage>>,
    facts: SlotFacts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    src: ComponentId,
    dst: ComponentId,
    port: PortType,
}

struct RunState {
    stop: Sender<()>,
    trigger: Option<Sender<()>>,
    workers: Vec<(ComponentId, JoinHandle<Box<dyn Stage>>)>,
}

struct Inner {
    next_id: u32,
    slots: Vec<Slot>,
    edges: Vec<Edge>,
    run: Option<RunState>,
    statics: Option<StaticProperties>,
    pools: Vec<(ComponentId, PortType, Arc<dyn PoolControl>)>,
    /// Workers that outlived the stop grace period. Their components stay
    /// Stopping until the thread is joined.
    detached: Vec<(ComponentId, JoinHandle<Box<dyn Stage>>)>,
}

impl Inner {
    fn slot(&self, id: ComponentId) -> Result<&Slot> {
        self.slots
            .iter()
            .find(|s| s.id == id && s.state != ComponentState::Destroyed)
            .ok_or(IppError::UnknownComponent(id))
    }

    fn slot_mut(&mut self, id: ComponentId) -> Result<&mut Slot> {
        self.slots
            .iter_mut()
            .find(|s| s.id == id && s.state != ComponentState::Destroyed)
            .ok_or(IppError::UnknownComponent(id))
    }

    fn live(&self) -> impl Iterator<Item = &Slot> {
        self.slots
            .iter()
            .filter(|s| s.state != ComponentState::Destroyed)
    }

    fn attached(&self, id: ComponentId, port: PortType, direction: PortDirection) -> bool {
        self.edges.iter().any(|e| {
            e.port == port
                && match direction {
                    PortDirection::Input => e.dst == id,
                    PortDirection::Output => e.src == id,
                }
        })
    }

    fn unattached_mandatory(&self, slot: &Slot) -> Option<PortType> {
        slot.kind
            .ports()
            .iter()
            .find(|d| d.mandatory && !self.attached(slot.id, d.port, d.direction))
            .map(|d| d.port)
    }

    /// Move a not-yet-started component between Created and Wired.
    fn refresh_wiring(&mut self, id: ComponentId) {
        let Some(idx) = self.slots.iter().position(|s| s.id == id) else {
            return;
        };
        if !self.slots[idx].state.accepts_wiring() {
            return;
        }
        let wired = self.unattached_mandatory(&self.slots[idx]).is_none();
        self.slots[idx].state = if wired {
            ComponentState::Wired
        } else {
            ComponentState::Created
        };
    }

    fn reaches(&self, from: ComponentId, to: ComponentId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            stack.extend(self.edges.iter().filter(|e| e.src == id).map(|e| e.dst));
        }
        false
    }

    /// Every mandatory port attached and exactly one source.
    fn check_complete(&self) -> Result<&Slot> {
        for slot in self.live() {
            if let Some(port) = self.unattached_mandatory(slot) {
                return Err(IppError::GraphIncomplete(format!(
                    "{} {} has no {port} connection",
                    slot.kind, slot.id
                )));
            }
        }
        let mut sources = self.live().filter(|s| s.kind.is_source());
        let source = sources
            .next()
            .ok_or_else(|| IppError::GraphIncomplete("no capture or file reader component".into()))?;
        if sources.next().is_some() {
            return Err(IppError::GraphIncomplete("more than one frame source".into()));
        }
        Ok(source)
    }

    fn build_statics(&self, config: &PipelineConfig) -> Result<StaticProperties> {
        let source = self.check_complete()?;
        let SlotFacts::Source {
            surface,
            siblings,
            frame_rate,
        } = &source.facts
        else {
            return Err(IppError::GraphIncomplete(format!("{} {} is not a source", source.kind, source.id)));
        };

        let sensor = self.live().find_map(|s| match &s.facts {
            SlotFacts::Sensor {
                attributes,
                settings_delay,
                knee_points,
            } => Some((attributes.clone(), *settings_delay, knee_points.clone())),
            _ => None,
        });
        let (sensor, settings_delay, knee_points) =
            sensor.unwrap_or_else(|| (SensorAttributes::passive(*frame_rate), 0, Vec::new()));

        let isp_version = self
            .live()
            .find_map(|s| match s.facts {
                SlotFacts::Isp(version) => Some(version),
                _ => None,
            })
            .unwrap_or(config.isp_version);

        Ok(StaticProperties {
            active_array: ActiveArray {
                width: surface.width,
                height: surface.height,
            },
            sibling_count: *siblings,
            knee_points,
            sensor,
            isp_version,
            settings_delay,
            max_digital_gain: config.max_digital_gain,
        })
    }

    /// Kahn order over live components; the graph is acyclic by construction.
    fn topo_order(&self) -> Vec<ComponentId> {
        let ids: Vec<ComponentId> = self.live().map(|s| s.id).collect();
        let mut indegree: HashMap<ComponentId, usize> = ids.iter().map(|id| (*id, 0)).collect();
        for edge in &self.edges {
            if let Some(n) = indegree.get_mut(&edge.dst) {
                *n += 1;
            }
        }
        let mut ready: Vec<ComponentId> = ids.iter().copied().filter(|id| indegree[id] == 0).collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(id) = ready.pop() {
            order.push(id);
            for edge in self.edges.iter().filter(|e| e.src == id) {
                if let Some(n) = indegree.get_mut(&edge.dst) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(edge.dst);
                    }
                }
            }
        }
        order
    }

    /// Join detached workers that have since exited.
    fn reap_detached(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = self
            .detached
            .drain(..)
            .partition(|(_, handle)| handle.is_finished());
        self.detached = running;
        for (id, handle) in finished {
            let stage = handle.join().ok();
            let Some(slot) = self.slots.iter_mut().find(|s| s.id == id) else {
                continue;
            };
            if stage.is_none() {
                error!(component = %id, "Detached worker panicked outside its stage");
            }
            slot.stage = stage;
            if slot.state == ComponentState::Stopping {
                slot.state = ComponentState::Stopped;
                info!(component = %id, "Detached worker exited");
            }
        }
    }

    fn pool_capacity(&self, id: ComponentId, port: PortType) -> usize {
        self.pools
            .iter()
            .find(|(owner, p, _)| *owner == id && *p == port)
            .map(|(_, _, pool)| pool.capacity())
            .unwrap_or(1)
    }
}

/// Delivery end of an Output component.
struct OutputSlot {
    ready: Option<Receiver<ImagePacket>>,
    /// Frames handed to the client and not yet returned.
    held: Arc<AtomicUsize>,
}

/// A graph of components sharing one control queue and one capture mode.
pub struct Pipeline {
    id: u32,
    config: PipelineConfig,
    events: Arc<EventDispatcher>,
    time: TimeSource,
    control: Arc<ControlQueue>,
    inner: Mutex<Inner>,
    // Lock order: `inner` before `outputs`.
    outputs: Mutex<HashMap<ComponentId, OutputSlot>>,
}

impl Pipeline {
    pub(crate) fn new(id: u32, config: PipelineConfig, events: Arc<EventDispatcher>, time: TimeSource) -> Self {
        Self {
            id,
            config,
            events,
            time,
            control: Arc::new(ControlQueue::new(0)),
            inner: Mutex::new(Inner {
                next_id: 0,
                slots: Vec::new(),
                edges: Vec::new(),
                run: None,
                statics: None,
                pools: Vec::new(),
                detached: Vec::new(),
            }),
            outputs: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().run.is_some()
    }

    pub fn add_component(&self, spec: ComponentSpec) -> Result<ComponentId> {
        let mut inner = self.inner.lock();
        if inner.run.is_some() {
            return Err(IppError::AlreadyRunning);
        }
        if inner.live().count() >= self.config.max_components {
            return Err(IppError::CapacityExceeded {
                what: "components per pipeline",
                limit: self.config.max_components,
            });
        }

        let kind = spec.kind();
        let cfg = &self.config;
        let depths = match &spec {
            ComponentSpec::Capture { pool_capacity, .. } | ComponentSpec::FileReader { pool_capacity, .. } => {
                vec![("pool_capacity", *pool_capacity)]
            }
            ComponentSpec::Isp {
                image_pool,
                stats_pool,
                ..
            } => vec![("image_pool", *image_pool), ("stats_pool", *stats_pool)],
            _ => Vec::new(),
        };
        if let Some((field, _)) = depths.iter().find(|(_, depth)| *depth == Some(0)) {
            return Err(IppError::InvalidConfig(format!("{kind} {field} must be at least 1")));
        }
        let (stage, facts): (Box<dyn Stage>, SlotFacts) = match spec {
            ComponentSpec::Capture { source, pool_capacity } => {
                let settings = source.settings();
                let facts = SlotFacts::Source {
                    surface: settings.surface(),
                    siblings: settings.siblings,
                    frame_rate: settings.frame_rate,
                };
                let stage = CaptureStage::new(
                    source,
                    pool_capacity.unwrap_or(cfg.capture_pool),
                    cfg.command_pool,
                );
                (Box::new(stage), facts)
            }
            ComponentSpec::FileReader {
                path,
                surface,
                siblings,
                frame_rate,
                looping,
                pool_capacity,
            } => {
                let facts = SlotFacts::Source {
                    surface,
                    siblings: siblings.max(1),
                    frame_rate,
                };
                let stage = FileReaderStage::new(
                    path,
                    surface,
                    siblings,
                    frame_rate,
                    looping,
                    pool_capacity.unwrap_or(cfg.capture_pool),
                );
                (Box::new(stage), facts)
            }
            ComponentSpec::Isp {
                version,
                image_pool,
                stats_pool,
            } => {
                let version = version.unwrap_or(cfg.isp_version);
                let stage = IspStage::new(
                    version,
                    image_pool.unwrap_or(cfg.isp_pool),
                    stats_pool.unwrap_or(cfg.stats_pool),
                );
                (Box::new(stage), SlotFacts::Isp(version))
            }
            ComponentSpec::ControlAlgorithm { plugin } => {
                (Box::new(ControlAlgorithmStage::new(plugin)), SlotFacts::None)
            }
            ComponentSpec::SensorControl {
                device,
                settings_delay,
                knee_points,
            } => {
                if settings_delay > MAX_SETTINGS_DELAY {
                    return Err(IppError::InvalidConfig(format!(
                        "settings delay {settings_delay} exceeds {MAX_SETTINGS_DELAY} frames"
                    )));
                }
                let facts = SlotFacts::Sensor {
                    attributes: device.attributes(),
                    settings_delay,
                    knee_points,
                };
                (Box::new(SensorControlStage::new(device)), facts)
            }
            ComponentSpec::Output => (Box::new(OutputStage), SlotFacts::None),
        };

        let id = ComponentId(inner.next_id);
        inner.next_id += 1;
        inner.slots.push(Slot {
            id,
            kind,
            state: ComponentState::Created,
            health: Arc::new(HealthCell::new()),
            stage: Some(stage),
            facts,
        });
        inner.refresh_wiring(id);
        inner.statics = None;
        if kind == ComponentKind::Output {
            self.outputs.lock().insert(
                id,
                OutputSlot {
                    ready: None,
                    held: Arc::new(AtomicUsize::new(0)),
                },
            );
        }
        debug!(pipeline = self.id, component = %id, %kind, "Component added");
        Ok(id)
    }

    /// Connect `src`'s output port to `dst`'s input port of the same type.
    pub fn attach(&self, src: ComponentId, dst: ComponentId, port: PortType) -> Result<()> {
        let mut inner = self.inner.lock();
        let (src_kind, dst_kind) = {
            let s = inner.slot(src)?;
            let d = inner.slot(dst)?;
            for slot in [s, d] {
                if !slot.state.accepts_wiring() {
                    return Err(IppError::InvalidState {
                        component: slot.id,
                        state: slot.state,
                        operation: "attach",
                    });
                }
            }
            (s.kind, d.kind)
        };
        if !src_kind.declares(port, PortDirection::Output) || !dst_kind.declares(port, PortDirection::Input) {
            return Err(IppError::PortMismatch {
                src_kind,
                dst_kind,
                port,
            });
        }
        if inner.attached(src, port, PortDirection::Output) {
            return Err(IppError::PortInUse { component: src, port });
        }
        if inner.attached(dst, port, PortDirection::Input) {
            return Err(IppError::PortInUse { component: dst, port });
        }
        if src == dst || inner.reaches(dst, src) {
            return Err(IppError::CycleDetected { src, dst });
        }

        inner.edges.push(Edge { src, dst, port });
        inner.refresh_wiring(src);
        inner.refresh_wiring(dst);
        inner.statics = None;
        debug!(pipeline = self.id, %src, %dst, %port, "Ports attached");
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.run.is_some() {
            return Err(IppError::AlreadyRunning);
        }
        inner.reap_detached();
        let source_id = inner.check_complete()?.id;
        for slot in inner.live() {
            if !slot.state.can_start() {
                return Err(IppError::InvalidState {
                    component: slot.id,
                    state: slot.state,
                    operation: "start",
                });
            }
            if slot.stage.is_none() {
                return Err(IppError::GraphIncomplete(format!(
                    "{} {} lost its worker in an earlier stop",
                    slot.kind, slot.id
                )));
            }
        }

        let statics = inner.build_statics(&self.config)?;
        self.control.set_limits(statics.clone());
        inner.statics = Some(statics.clone());

        let (siblings, frame_rate) = match inner.slot(source_id)?.facts {
            SlotFacts::Source {
                siblings,
                frame_rate,
                ..
            } => (siblings as usize, frame_rate),
            _ => (1, statics.sensor.frame_rate),
        };

        // Prepare upstream first so image surfaces propagate downstream.
        let order = inner.topo_order();
        let mut surfaces: HashMap<ComponentId, SurfaceDesc> = HashMap::new();
        let mut pools = Vec::new();
        for id in &order {
            let input_surface = inner
                .edges
                .iter()
                .find(|e| e.dst == *id && e.port == PortType::Image)
                .and_then(|e| surfaces.get(&e.src).copied());
            let Some(slot) = inner
                .slots
                .iter_mut()
                .find(|s| s.id == *id && s.state != ComponentState::Destroyed)
            else {
                continue;
            };
            let Some(stage) = slot.stage.as_mut() else {
                continue;
            };
            let cx = PrepareContext {
                pipeline: self.id,
                id: *id,
                input_surface,
                siblings,
                statics: &statics,
            };
            stage.prepare(&cx)?;
            if let Some(surface) = stage.output_surface(input_surface) {
                surfaces.insert(*id, surface);
            }
            for (port, pool) in stage.pools() {
                pool.reopen();
                pools.push((*id, port, pool));
            }
        }
        inner.pools = pools;
        self.control.restart();

        let frame_period = Duration::from_secs_f32(1.0 / frame_rate.max(1.0));
        let tuning = Tuning {
            frame_period,
            capture_timeout: frame_period * self.config.capture_timeout_frames,
            csi_failure_threshold: self.config.csi_failure_threshold,
            plugin_budget: Duration::from_micros(self.config.plugin_budget_us),
            capture_core: self.config.capture_core,
        };

        let mut ios: HashMap<ComponentId, StageIo> = order.iter().map(|id| (*id, StageIo::default())).collect();
        for edge in &inner.edges {
            let (tx, rx) = channel::bounded(inner.pool_capacity(edge.src, edge.port));
            if let Some(io) = ios.get_mut(&edge.src) {
                io.outputs.push((edge.port, tx));
            }
            if let Some(io) = ios.get_mut(&edge.dst) {
                io.inputs.push((edge.port, rx));
            }
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let trigger = match self.config.capture_mode {
            CaptureMode::Trigger => {
                let (tx, rx) = channel::unbounded();
                if let Some(io) = ios.get_mut(&source_id) {
                    io.trigger = Some(rx);
                }
                Some(tx)
            }
            CaptureMode::FreeRun => None,
        };

        {
            let mut outputs = self.outputs.lock();
            for (id, out) in outputs.iter_mut() {
                let Some(upstream) = inner.edges.iter().find(|e| e.dst == *id && e.port == PortType::Image) else {
                    continue;
                };
                let (tx, rx) = channel::bounded(inner.pool_capacity(upstream.src, PortType::Image));
                if let Some(io) = ios.get_mut(id) {
                    io.ready = Some(tx);
                }
                out.ready = Some(rx);
            }
        }

        let mut workers = Vec::with_capacity(order.len());
        for id in order {
            let Some(slot) = inner
                .slots
                .iter_mut()
                .find(|s| s.id == id && s.state != ComponentState::Destroyed)
            else {
                continue;
            };
            let Some(stage) = slot.stage.take() else {
                continue;
            };
            slot.health.set(Health::Healthy);
            let cx = StageContext {
                handle: ComponentHandle {
                    pipeline: self.id,
                    component: id,
                },
                kind: slot.kind,
                events: Arc::clone(&self.events),
                time: self.time.clone(),
                stop: stop_rx.clone(),
                health: Arc::clone(&slot.health),
                control: Arc::clone(&self.control),
                statics: statics.clone(),
                tuning: tuning.clone(),
            };
            let io = ios.remove(&id).unwrap_or_default();
            let spawned = thread::Builder::new()
                .name(format!("ipp{}-{}{}", self.id, slot.kind.label(), id.0))
                .spawn(move || run_worker(stage, io, cx));
            match spawned {
                Ok(handle) => {
                    slot.state = ComponentState::Running;
                    workers.push((id, handle));
                }
                Err(e) => {
                    // The stage moved into the failed closure; the component cannot restart.
                    error!(pipeline = self.id, component = %id, error = %e, "Failed to spawn worker");
                    slot.state = ComponentState::Stopped;
                    inner.run = Some(RunState {
                        stop: stop_tx,
                        trigger,
                        workers,
                    });
                    drop(guard);
                    self.stop();
                    return Err(IppError::Io(e));
                }
            }
        }

        inner.run = Some(RunState {
            stop: stop_tx,
            trigger,
            workers,
        });
        info!(
            pipeline = self.id,
            mode = ?self.config.capture_mode,
            settings_delay = statics.settings_delay,
            "Pipeline started"
        );
        Ok(())
    }

    /// Stop every worker and reclaim buffers. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        let Some(run) = inner.run.take() else {
            return;
        };
        for slot in inner.slots.iter_mut() {
            if slot.state == ComponentState::Running {
                slot.state = ComponentState::Stopping;
            }
        }

        let RunState {
            stop,
            trigger,
            workers,
        } = run;
        drop(stop);
        drop(trigger);
        for (_, _, pool) in &inner.pools {
            pool.close();
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.stop_grace_ms);
        for (id, handle) in workers {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            let kind = inner.slot(id).map(|s| s.kind).ok();
            if !handle.is_finished() {
                error!(pipeline = self.id, component = %id, "Worker ignored stop; detaching it");
                if let Some(kind) = kind {
                    self.emit(kind, id, EventType::ComponentFailure, EventData::Message("worker did not stop within the grace period".into()));
                }
                inner.detached.push((id, handle));
                continue;
            }
            match handle.join() {
                Ok(stage) => {
                    if let Ok(slot) = inner.slot_mut(id) {
                        slot.stage = Some(stage);
                    }
                }
                Err(_) => error!(pipeline = self.id, component = %id, "Worker thread panicked outside its stage"),
            }
        }

        let held: HashMap<ComponentId, usize> = {
            let mut outputs = self.outputs.lock();
            outputs
                .iter_mut()
                .map(|(id, out)| {
                    if let Some(ready) = out.ready.take() {
                        let abandoned = ready.try_iter().count();
                        if abandoned > 0 {
                            debug!(pipeline = self.id, output = %id, abandoned, "Dropped undelivered frames");
                        }
                    }
                    (*id, out.held.load(Ordering::Acquire))
                })
                .collect()
        };

        for (owner, port, pool) in &inner.pools {
            let expected = inner
                .edges
                .iter()
                .find(|e| e.src == *owner && e.port == *port)
                .and_then(|e| held.get(&e.dst).copied())
                .unwrap_or(0);
            let outstanding = pool.outstanding();
            if outstanding != expected {
                let kind = inner.slot(*owner).map(|s| s.kind).unwrap_or(ComponentKind::Output);
                self.emit(
                    kind,
                    *owner,
                    EventType::BufferLeak,
                    EventData::Pool {
                        pool: pool.name().to_string(),
                        outstanding,
                        expected,
                    },
                );
            }
        }

        let inner = &mut *inner;
        for slot in inner.slots.iter_mut() {
            if slot.state == ComponentState::Stopping && !inner.detached.iter().any(|(d, _)| *d == slot.id) {
                slot.state = ComponentState::Stopped;
            }
        }
        info!(pipeline = self.id, detached = inner.detached.len(), "Pipeline stopped");
    }

    /// Queue one capture request. Requests accumulate.
    pub fn single_capture(&self) -> Result<()> {
        if self.config.capture_mode != CaptureMode::Trigger {
            return Err(IppError::NotTriggerMode);
        }
        let inner = self.inner.lock();
        let trigger = inner
            .run
            .as_ref()
            .and_then(|run| run.trigger.as_ref())
            .ok_or(IppError::NotRunning)?;
        trigger.send(()).map_err(|_| IppError::Stopping)
    }

    /// Validate against the static limits and queue for the next safe point.
    pub fn apply_control_properties(&self, props: ControlProperties) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.run.is_none() {
                let statics = inner.build_statics(&self.config)?;
                self.control.set_limits(statics.clone());
                inner.statics = Some(statics);
            }
        }
        self.control.submit_client(props)
    }

    pub fn get_static_properties(&self) -> Result<StaticProperties> {
        let mut inner = self.inner.lock();
        if let Some(statics) = &inner.statics {
            return Ok(statics.clone());
        }
        let statics = inner.build_statics(&self.config)?;
        inner.statics = Some(statics.clone());
        Ok(statics)
    }

    pub fn get_default_control_properties(&self) -> Result<ControlProperties> {
        Ok(self.get_static_properties()?.default_controls())
    }

    /// Client controls in force, including a write not yet applied.
    pub fn control_properties(&self) -> Option<ControlProperties> {
        self.control.client_properties()
    }

    /// Wait for the next completed frame of an Output component.
    ///
    /// `None` waits until a frame arrives or the pipeline stops.
    pub fn get_output(&self, output: ComponentId, timeout: Option<Duration>) -> Result<OutputFrame> {
        let (ready, held) = {
            let outputs = self.outputs.lock();
            let slot = outputs
                .get(&output)
                .ok_or(IppError::UnknownComponent(output))?;
            let ready = slot.ready.clone().ok_or(IppError::NotRunning)?;
            (ready, Arc::clone(&slot.held))
        };
        let packet = match timeout {
            Some(timeout) => ready.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => IppError::TimedOut,
                RecvTimeoutError::Disconnected => IppError::Stopping,
            })?,
            None => ready.recv().map_err(|_| IppError::Stopping)?,
        };
        Ok(OutputFrame::new(packet, held))
    }

    /// Give a frame back to its pool.
    pub fn return_output(&self, frame: OutputFrame) {
        frame.release();
    }

    /// Stays `Stopping` while a worker detached at stop is still running.
    pub fn component_state(&self, id: ComponentId) -> Result<ComponentState> {
        let mut inner = self.inner.lock();
        inner.reap_detached();
        inner
            .slots
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.state)
            .ok_or(IppError::UnknownComponent(id))
    }

    pub fn component_health(&self, id: ComponentId) -> Result<Health> {
        Ok(self.inner.lock().slot(id)?.health.get())
    }

    pub fn components(&self) -> Vec<(ComponentId, ComponentKind, ComponentState)> {
        let mut inner = self.inner.lock();
        inner.reap_detached();
        inner
            .live()
            .map(|s| (s.id, s.kind, s.state))
            .collect()
    }

    pub fn pool_snapshots(&self) -> Vec<PoolSnapshot> {
        self.inner
            .lock()
            .pools
            .iter()
            .map(|(_, _, pool)| pool.snapshot())
            .collect()
    }

    /// Destroy one component. Its connections are removed with it.
    pub fn destroy_component(&self, id: ComponentId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.reap_detached();
        let slot = inner.slot_mut(id)?;
        if !slot.state.can_destroy() {
            return Err(IppError::InvalidState {
                component: id,
                state: slot.state,
                operation: "destroy",
            });
        }
        if let Some(mut stage) = slot.stage.take() {
            stage.destroy();
        }
        slot.state = ComponentState::Destroyed;

        let neighbours: Vec<ComponentId> = inner
            .edges
            .iter()
            .filter_map(|e| match (e.src == id, e.dst == id) {
                (true, _) => Some(e.dst),
                (_, true) => Some(e.src),
                _ => None,
            })
            .collect();
        inner.edges.retain(|e| e.src != id && e.dst != id);
        for n in neighbours {
            inner.refresh_wiring(n);
        }
        inner.pools.retain(|(owner, _, _)| *owner != id);
        inner.statics = None;
        self.outputs.lock().remove(&id);
        debug!(pipeline = self.id, component = %id, "Component destroyed");
        Ok(())
    }

    /// Stop, then destroy every component.
    pub fn destroy(&self) {
        self.stop();
        let mut inner = self.inner.lock();
        inner.reap_detached();
        for (id, _) in inner.detached.drain(..) {
            warn!(pipeline = self.id, component = %id, "Destroying pipeline with a worker still running");
        }
        for slot in inner.slots.iter_mut() {
            if let Some(mut stage) = slot.stage.take() {
                stage.destroy();
            }
            slot.state = ComponentState::Destroyed;
        }
        inner.edges.clear();
        inner.pools.clear();
        inner.statics = None;
        self.outputs.lock().clear();
    }

    fn emit(&self, kind: ComponentKind, id: ComponentId, event: EventType, data: EventData) {
        let handle = ComponentHandle {
            pipeline: self.id,
            component: id,
        };
        self.events.dispatch(kind, handle, event, data);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .finish()
    }
}

fn run_worker(mut stage: Box<dyn Stage>, io: StageIo, cx: StageContext) -> Box<dyn Stage> {
    debug!(handle = %cx.handle, kind = %cx.kind, "Worker started");
    let result = panic::catch_unwind(AssertUnwindSafe(|| stage.run(io, &cx)));
    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "worker panicked".into());
        cx.degrade();
        cx.emit(EventType::ComponentFailure, EventData::Message(message));
    }
    debug!(handle = %cx.handle, "Worker exiting");
    stage
}

/// Decrements the Output's held count when the frame goes back.
struct Lease(Arc<AtomicUsize>);

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A completed frame on loan to the client.
///
/// Dropping it (or passing it to [`Pipeline::return_output`]) returns the
/// buffer to the pool it came from.
pub struct OutputFrame {
    packet: ImagePacket,
    _lease: Lease,
}

impl OutputFrame {
    fn new(packet: ImagePacket, held: Arc<AtomicUsize>) -> Self {
        held.fetch_add(1, Ordering::AcqRel);
        Self {
            packet,
            _lease: Lease(held),
        }
    }

    pub fn image(&self) -> &ImageBuffer {
        &self.packet.image
    }

    pub fn image_mut(&mut self) -> &mut ImageBuffer {
        &mut self.packet.image
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.packet.meta
    }

    pub fn sequence(&self) -> u64 {
        self.packet.meta.sequence()
    }

    /// Serialize this frame's metadata for the typed accessor.
    pub fn metadata_blob(&self) -> Result<MetadataBlob> {
        MetadataBlob::encode(&self.packet.meta)
    }

    pub fn release(self) {
        drop(self)
    }
}

impl fmt::Debug for OutputFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputFrame")
            .field("sequence", &self.sequence())
            .field("pool", &self.packet.image.pool_name())
            .finish()
    }
}
