use std::sync::Arc;

use crossbeam::channel::{select, Sender};
use tracing::{debug, error, info, warn};

use super::{forward, PrepareContext, Stage, StageContext, StageIo};
use crate::capture::frame::{ColorSpace, FrameMetadata, ImageBuffer, ImageInfo, SurfaceDesc};
use crate::capture::source::{CaptureErrorCode, CaptureFault, CaptureSource, CaptureTimeout};
use crate::control::{DynamicProperties, FrameControl};
use crate::error::{IppError, Result};
use crate::events::{EventData, EventType};
use crate::pipeline::component::ComponentKind;
use crate::pipeline::port::{ImagePacket, Packet, PortType, SensorCommand};
use crate::pool::{AcquireError, BufferPool, PoolControl};

/// Tracks consecutive CSI faults and turns them into one report per episode.
struct CsiMonitor {
    threshold: u32,
    consecutive: u32,
    in_episode: bool,
}

impl CsiMonitor {
    fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            in_episode: false,
        }
    }

    fn fault(&mut self, fault: CaptureFault, cx: &StageContext) {
        self.consecutive += 1;
        if self.in_episode {
            debug!(%fault, consecutive = self.consecutive, "CSI fault during failure episode");
            return;
        }
        if fault.code.is_persistent() || self.consecutive >= self.threshold {
            self.in_episode = true;
            cx.degrade();
            cx.emit(EventType::CsiInputStreamFailure, EventData::Capture(fault));
            return;
        }
        let event = match fault.code {
            CaptureErrorCode::Timeout => EventType::CaptureTimeout,
            _ => EventType::CsiFrameDiscontinuity,
        };
        cx.emit(event, EventData::Capture(fault));
    }

    fn success(&mut self, cx: &StageContext) {
        if self.in_episode {
            info!(
                handle = %cx.handle,
                failed_frames = self.consecutive,
                "CSI input recovered"
            );
            cx.recover();
        }
        self.in_episode = false;
        self.consecutive = 0;
    }
}

pub(crate) struct CaptureStage {
    source: Box<dyn CaptureSource>,
    pool_capacity: usize,
    command_capacity: usize,
    images: Option<Arc<BufferPool<ImageBuffer>>>,
    commands: Option<Arc<BufferPool<SensorCommand>>>,
    next_sequence: u64,
    /// Safe point taken for a frame the hardware has not delivered yet.
    prepared: Option<(u64, FrameControl)>,
    /// Latest issued settings not yet handed to SensorControl.
    pending: Option<(u64, DynamicProperties)>,
}

impl CaptureStage {
    pub fn new(source: Box<dyn CaptureSource>, pool_capacity: usize, command_capacity: usize) -> Self {
        Self {
            source,
            pool_capacity,
            command_capacity,
            images: None,
            commands: None,
            next_sequence: 0,
            prepared: None,
            pending: None,
        }
    }

    /// Capture one hardware frame. Returns false when the worker should exit.
    fn capture_one(
        &mut self,
        images: &Arc<BufferPool<ImageBuffer>>,
        out: &Sender<Packet>,
        sensor: Option<&Sender<Packet>>,
        monitor: &mut CsiMonitor,
        cx: &StageContext,
    ) -> bool {
        // Safe point, before the sensor starts exposing the frame. A frame
        // lost at the CSI keeps its safe point for the next attempt.
        let (sequence, frame_control) = match self.prepared.take() {
            Some(prepared) => prepared,
            None => {
                let sequence = self.next_sequence;
                let Some(frame_control) = cx.control.begin_frame(sequence) else {
                    error!(handle = %cx.handle, "Capture started without static properties");
                    return false;
                };
                self.next_sequence += 1;
                if let Some(issued) = &frame_control.issued {
                    self.pending = Some((sequence, issued.clone()));
                }
                (sequence, frame_control)
            }
        };
        if !self.flush_command(sensor, cx) {
            return false;
        }
        if sensor.is_some() {
            self.await_sensor_writes(sequence, cx);
        }

        let timeout = CaptureTimeout::from_duration(cx.tuning.capture_timeout);
        let hw = match self.source.wait_frame(timeout) {
            Ok(hw) => hw,
            Err(fault) => {
                self.prepared = Some((sequence, frame_control));
                monitor.fault(fault, cx);
                return !cx.stopping();
            }
        };
        let timestamps = cx.time.stamp();

        let mut image = match images.acquire(Some(cx.tuning.frame_period)) {
            Ok(image) => image,
            Err(AcquireError::Stopping) => return false,
            Err(_) => {
                metrics::counter!("ipp_frames_dropped_total", "reason" => "no_free_slot").increment(1);
                cx.emit(EventType::CaptureFrameDrop, EventData::Frame { sequence });
                monitor.success(cx);
                return true;
            }
        };
        if let Err(fault) = self.source.read_frame(&hw, &mut image) {
            drop(image);
            metrics::counter!("ipp_frames_dropped_total", "reason" => "read_failure").increment(1);
            cx.emit(EventType::CaptureFrameDrop, EventData::Frame { sequence });
            monitor.fault(fault, cx);
            return true;
        }
        monitor.success(cx);
        image.client_tag = 0;

        let desc = image.desc();
        let meta = FrameMetadata {
            image_info: ImageInfo {
                camera_id: self.source.settings().camera_id,
                frame_id: hw.frame_id,
                sequence,
                timestamps,
                width: desc.width,
                height: desc.height,
                format: desc.format,
                sibling_count: image.sibling_count() as u32,
                color_space: ColorSpace::Raw,
            },
            control: frame_control.client,
            dynamic: frame_control.active,
            embedded_top: hw.embedded_top,
            embedded_bottom: hw.embedded_bottom,
        };
        metrics::counter!("ipp_frames_captured_total").increment(1);
        forward(out, Packet::Image(ImagePacket { image, meta }), &cx.stop)
    }

    /// Give in-flight sensor writes until the capture watchdog to reach the bus.
    fn await_sensor_writes(&self, sequence: u64, cx: &StageContext) {
        let Some(pool) = self.commands.as_ref() else {
            return;
        };
        if !pool.wait_idle(cx.tuning.capture_timeout) && !cx.stopping() {
            debug!(sequence, in_flight = pool.outstanding(), "Sensor writes still pending at frame start");
        }
    }

    /// Hand the latest issued settings to SensorControl if a command slot is free.
    fn flush_command(&mut self, sensor: Option<&Sender<Packet>>, cx: &StageContext) -> bool {
        let (Some(tx), Some(pool)) = (sensor, self.commands.as_ref()) else {
            self.pending = None;
            return true;
        };
        let Some((sequence, settings)) = self.pending.take() else {
            return true;
        };
        match pool.try_acquire() {
            Ok(mut command) => {
                command.sequence = sequence;
                command.settings = Some(settings);
                forward(tx, Packet::SensorControl(command), &cx.stop)
            }
            Err(AcquireError::Stopping) => false,
            Err(_) => {
                // SensorControl still busy; keep only the newest settings.
                debug!(sequence, "Sensor command slots busy, coalescing");
                self.pending = Some((sequence, settings));
                true
            }
        }
    }
}

impl Stage for CaptureStage {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Capture
    }

    fn output_surface(&self, _input: Option<SurfaceDesc>) -> Option<SurfaceDesc> {
        Some(self.source.settings().surface())
    }

    fn prepare(&mut self, cx: &PrepareContext<'_>) -> Result<()> {
        let settings = self.source.settings().clone();
        settings.validate().map_err(IppError::InvalidConfig)?;
        if self.images.is_none() {
            let surface = settings.surface();
            let siblings = settings.siblings as usize;
            self.images = Some(BufferPool::new(
                cx.pool_name(ComponentKind::Capture, PortType::Image),
                self.pool_capacity,
                || ImageBuffer::allocate(surface, siblings),
            ));
            self.commands = Some(BufferPool::new(
                cx.pool_name(ComponentKind::Capture, PortType::SensorControl),
                self.command_capacity,
                SensorCommand::default,
            ));
        }
        self.prepared = None;
        self.pending = None;
        Ok(())
    }

    fn pools(&self) -> Vec<(PortType, Arc<dyn PoolControl>)> {
        let mut pools: Vec<(PortType, Arc<dyn PoolControl>)> = Vec::new();
        if let Some(images) = &self.images {
            pools.push((PortType::Image, images.clone() as Arc<dyn PoolControl>));
        }
        if let Some(commands) = &self.commands {
            pools.push((PortType::SensorControl, commands.clone() as Arc<dyn PoolControl>));
        }
        pools
    }

    fn run(&mut self, mut io: StageIo, cx: &StageContext) {
        if let Some(core) = cx.tuning.capture_core {
            if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
                warn!(core, "Failed to pin capture thread");
            }
        }
        let (Some(out), Some(images)) = (io.take_output(PortType::Image), self.images.clone()) else {
            error!(handle = %cx.handle, "Capture has no image output");
            return;
        };
        let sensor = io.take_output(PortType::SensorControl);

        if let Err(fault) = self.source.start() {
            cx.degrade();
            cx.emit(EventType::CsiInputStreamFailure, EventData::Capture(fault));
            cx.wait_for_stop();
            return;
        }
        let mut monitor = CsiMonitor::new(cx.tuning.csi_failure_threshold);
        info!(
            handle = %cx.handle,
            trigger_mode = io.trigger.is_some(),
            "Capture running"
        );

        match io.trigger.take() {
            Some(trigger) => loop {
                select! {
                    recv(cx.stop) -> _ => break,
                    recv(trigger) -> msg => {
                        if msg.is_err()
                            || !self.capture_one(&images, &out, sensor.as_ref(), &mut monitor, cx)
                        {
                            break;
                        }
                    }
                }
            },
            None => {
                while !cx.stopping() {
                    if !self.capture_one(&images, &out, sensor.as_ref(), &mut monitor, cx) {
                        break;
                    }
                }
            }
        }

        self.source.stop();
        debug!(handle = %cx.handle, next_sequence = self.next_sequence, "Capture stopped");
    }
}
