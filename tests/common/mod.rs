#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ipp::capture::{CaptureSettings, SimulatedSensor};
use ipp::{ComponentId, Event, EventType, IppError, Pipeline, PipelineManager};

pub fn settings() -> CaptureSettings {
    CaptureSettings {
        width: 32,
        height: 16,
        frame_rate: 200.0,
        ..CaptureSettings::default()
    }
}

pub fn sensor() -> SimulatedSensor {
    SimulatedSensor::default()
}

/// A sensor whose writes land `delay` frames late.
pub fn sensor_with_delay(delay: u8) -> SimulatedSensor {
    SimulatedSensor::with_settings_delay(SimulatedSensor::default().attributes().clone(), delay)
}

/// Exposure time the sensor wrote into a frame's top embedded line.
pub fn embedded_exposure(line: &[u8]) -> f32 {
    f32::from_le_bytes([line[9], line[10], line[11], line[12]])
}

/// Every event delivered to the manager's handler.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn install(manager: &PipelineManager) -> Self {
        let recorder = Recorder::default();
        let sink = Arc::clone(&recorder.events);
        manager.register_event_handler(move |event: &Event| {
            if event.event != EventType::FrameDone {
                sink.lock().push(event.clone());
            }
        });
        recorder
    }

    pub fn count(&self, kind: EventType) -> usize {
        self.events.lock().iter().filter(|e| e.event == kind).count()
    }

    pub fn of(&self, kind: EventType) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event == kind)
            .cloned()
            .collect()
    }
}

/// Drain outputs until `done` holds or the deadline passes.
pub fn pump_until(pipeline: &Pipeline, output: ComponentId, deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        match pipeline.get_output(output, Some(Duration::from_millis(20))) {
            Ok(frame) => pipeline.return_output(frame),
            Err(IppError::TimedOut) => {}
            Err(e) => panic!("get_output failed: {e}"),
        }
    }
    done()
}
