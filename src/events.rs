//! Event reporting from component threads to one client handler.
//!
//! Handlers run on the reporting component's own thread. They must not block
//! and must not call back into the pipeline that reported the event.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tracing::{error, info, trace, warn};

use crate::capture::CaptureFault;
use crate::pipeline::{ComponentId, ComponentKind};
use crate::time::TimeSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    FrameDone,
    EndOfStream,
    CaptureFrameDrop,
    CsiFrameDiscontinuity,
    CaptureTimeout,
    ControlAlgorithmFailure,
    CsiInputStreamFailure,
    I2cTransmissionFailure,
    BufferLeak,
    ComponentFailure,
}

impl EventType {
    pub fn severity(self) -> Severity {
        match self {
            EventType::FrameDone | EventType::EndOfStream => Severity::Info,
            EventType::CaptureFrameDrop
            | EventType::CsiFrameDiscontinuity
            | EventType::CaptureTimeout
            | EventType::ControlAlgorithmFailure => Severity::Warning,
            EventType::CsiInputStreamFailure
            | EventType::I2cTransmissionFailure
            | EventType::BufferLeak
            | EventType::ComponentFailure => Severity::Error,
        }
    }

    fn label(self) -> &'static str {
        match self {
            EventType::FrameDone => "frame_done",
            EventType::EndOfStream => "end_of_stream",
            EventType::CaptureFrameDrop => "capture_frame_drop",
            EventType::CsiFrameDiscontinuity => "csi_frame_discontinuity",
            EventType::CaptureTimeout => "capture_timeout",
            EventType::ControlAlgorithmFailure => "control_algorithm_failure",
            EventType::CsiInputStreamFailure => "csi_input_stream_failure",
            EventType::I2cTransmissionFailure => "i2c_transmission_failure",
            EventType::BufferLeak => "buffer_leak",
            EventType::ComponentFailure => "component_failure",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventData {
    None,
    Frame { sequence: u64 },
    Capture(CaptureFault),
    Sensor { address: Option<u8>, message: String },
    Pool { pool: String, outstanding: usize, expected: usize },
    Message(String),
}

/// Identifies the reporting component across pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentHandle {
    pub pipeline: u32,
    pub component: ComponentId,
}

impl fmt::Display for ComponentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pipeline, self.component)
    }
}

/// A read-only snapshot handed to the event handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub component: ComponentKind,
    pub handle: ComponentHandle,
    pub event: EventType,
    pub data: EventData,
    /// Manager-epoch monotonic time of the report.
    pub timestamp_ns: u64,
}

impl Event {
    pub fn severity(&self) -> Severity {
        self.event.severity()
    }
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle(&self, event: &Event) {
        self(event)
    }
}

struct HandlerSlot(Box<dyn EventHandler>);

/// Receiving end of [`EventDispatcher::channel`].
#[derive(Clone)]
pub struct EventChannel {
    rx: flume::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventChannel {
    pub fn receiver(&self) -> &flume::Receiver<Event> {
        &self.rx
    }

    /// Events discarded because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The single handler registration of a manager.
pub struct EventDispatcher {
    handler: ArcSwapOption<HandlerSlot>,
    time: TimeSource,
    delivered: AtomicU64,
    handler_panics: AtomicU64,
}

impl EventDispatcher {
    pub fn new(time: TimeSource) -> Self {
        Self {
            handler: ArcSwapOption::empty(),
            time,
            delivered: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
        }
    }

    /// Replace the registered handler.
    pub fn register<H: EventHandler + 'static>(&self, handler: H) {
        self.handler
            .store(Some(Arc::new(HandlerSlot(Box::new(handler)))));
    }

    pub fn clear(&self) {
        self.handler.store(None);
    }

    /// Route events into a bounded channel instead of a callback.
    ///
    /// Replaces any registered handler. When the channel is full the event is
    /// counted as dropped; the reporting thread never waits.
    pub fn channel(&self, capacity: usize) -> EventChannel {
        let (tx, rx) = flume::bounded(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&dropped);
        self.register(move |event: &Event| {
            if tx.try_send(event.clone()).is_err() {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
        EventChannel { rx, dropped }
    }

    pub fn dispatch(
        &self,
        component: ComponentKind,
        handle: ComponentHandle,
        event: EventType,
        data: EventData,
    ) {
        let event = Event {
            component,
            handle,
            event,
            data,
            timestamp_ns: self.time.monotonic_ns(),
        };
        log_event(&event);
        metrics::counter!("ipp_events_total", "event" => event.event.label()).increment(1);

        let Some(slot) = self.handler.load_full() else {
            return;
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| slot.0.handle(&event)));
        match result {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.handler_panics.fetch_add(1, Ordering::Relaxed);
                error!(event = %event.event, handle = %event.handle, "Event handler panicked");
            }
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn handler_panics(&self) -> u64 {
        self.handler_panics.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("registered", &self.handler.load().is_some())
            .field("delivered", &self.delivered())
            .finish()
    }
}

fn log_event(event: &Event) {
    let kind = event.component;
    let handle = event.handle;
    match (event.event, event.severity()) {
        (EventType::FrameDone, _) => trace!(%kind, %handle, data = ?event.data, "frame done"),
        (_, Severity::Info) => info!(%kind, %handle, event = %event.event, data = ?event.data, "pipeline event"),
        (_, Severity::Warning) => warn!(%kind, %handle, event = %event.event, data = ?event.data, "pipeline warning"),
        (_, Severity::Error) => error!(%kind, %handle, event = %event.event, data = ?event.data, "pipeline error"),
    }
}
