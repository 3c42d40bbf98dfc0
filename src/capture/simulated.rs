//! Simulated CSI sensor for tests and the demo binary.
//!
//! [`SimulatedSensor`] is a shared register file. [`SimulatedIsc`] writes it
//! the way an I2C driver would, and [`SimulatedSource`] renders raw RGGB frames
//! whose brightness follows the exposure latched at frame start.
//!
//! Like real sensors, register writes land `settings_delay` frame starts after
//! they were made; with a delay of 0 a write made before a frame starts
//! applies to that frame.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use super::frame::ImageBuffer;
use super::source::{
    CaptureErrorCode, CaptureFault, CaptureSettings, CaptureSource, CaptureTimeout, HwFrame,
};
use crate::sensor::{ExposureControl, IscError, Range, SensorAttributes, SensorDevice, WbGains};

/// Scene color cast applied to R, G, B before the sensor's white balance.
const SCENE_CAST: [f32; 3] = [1.3, 1.0, 0.7];

#[derive(Debug, Clone, Copy, PartialEq)]
struct Registers {
    exposure: ExposureControl,
    wb: WbGains,
}

#[derive(Debug)]
struct RegisterFile {
    /// Last values written over I2C.
    programmed: Registers,
    /// Writes latched at recent frame starts, oldest first.
    in_flight: VecDeque<Registers>,
    settings_delay: usize,
}

impl RegisterFile {
    fn flush(&mut self) {
        self.in_flight.clear();
        self.in_flight
            .extend(std::iter::repeat(self.programmed).take(self.settings_delay));
    }

    /// Latch the programmed registers and return the ones this frame uses.
    fn frame_start(&mut self) -> Registers {
        self.in_flight.push_back(self.programmed);
        let mut active = self.programmed;
        while self.in_flight.len() > self.settings_delay {
            if let Some(oldest) = self.in_flight.pop_front() {
                active = oldest;
            }
        }
        active
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    attributes: SensorAttributes,
    registers: Arc<Mutex<RegisterFile>>,
}

impl SimulatedSensor {
    pub fn new(attributes: SensorAttributes) -> Self {
        Self::with_settings_delay(attributes, 0)
    }

    /// A sensor whose register writes take effect `settings_delay` frames late.
    pub fn with_settings_delay(attributes: SensorAttributes, settings_delay: u8) -> Self {
        let exposure = ExposureControl {
            exposure_time_us: attributes.exposure_time_us.clamp(10_000.0),
            analog_gain: attributes.analog_gain.min,
        };
        let mut registers = RegisterFile {
            programmed: Registers {
                exposure,
                wb: WbGains::UNITY,
            },
            in_flight: VecDeque::new(),
            settings_delay: settings_delay as usize,
        };
        registers.flush();
        Self {
            attributes,
            registers: Arc::new(Mutex::new(registers)),
        }
    }

    pub fn attributes(&self) -> &SensorAttributes {
        &self.attributes
    }

    /// Exposure last written, whether or not a frame has used it yet.
    pub fn exposure(&self) -> ExposureControl {
        self.registers.lock().programmed.exposure
    }

    pub fn white_balance(&self) -> WbGains {
        self.registers.lock().programmed.wb
    }

    pub fn source(&self, settings: CaptureSettings) -> SimulatedSource {
        SimulatedSource {
            sensor: self.clone(),
            settings,
            faults: FaultInjector::default(),
            next_frame_id: 0,
            next_due: None,
            exposed: None,
        }
    }

    pub fn isc(&self) -> SimulatedIsc {
        SimulatedIsc {
            sensor: self.clone(),
            failures: FaultInjector::default(),
            address: 0x1a,
        }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(SensorAttributes {
            name: "sim-ar0231".into(),
            exposure_time_us: Range::new(10.0, 33_000.0),
            analog_gain: Range::new(1.0, 16.0),
            wb_gain: Range::new(0.25, 8.0),
            frame_rate: 30.0,
        })
    }
}

/// Queue of scripted faults consumed one per hardware operation.
#[derive(Debug, Clone)]
pub struct FaultInjector<T = CaptureErrorCode> {
    queue: Arc<Mutex<VecDeque<T>>>,
}

impl<T> Default for FaultInjector<T> {
    fn default() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl<T: Clone> FaultInjector<T> {
    pub fn inject(&self, fault: T, count: usize) {
        let mut queue = self.queue.lock();
        queue.extend(std::iter::repeat(fault).take(count));
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    fn next(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }
}

pub struct SimulatedSource {
    sensor: SimulatedSensor,
    settings: CaptureSettings,
    faults: FaultInjector,
    next_frame_id: u64,
    next_due: Option<Instant>,
    /// Registers latched for the last frame `wait_frame` returned.
    exposed: Option<(u64, Registers)>,
}

impl SimulatedSource {
    pub fn fault_injector(&self) -> FaultInjector {
        self.faults.clone()
    }

    fn pace(&mut self, timeout: CaptureTimeout) -> Result<(), CaptureFault> {
        let period = self.settings.frame_period();
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        let wait = due.saturating_duration_since(now);
        if let Some(limit) = timeout.as_duration() {
            if wait > limit {
                thread::sleep(limit);
                return Err(self.fault(CaptureErrorCode::Timeout));
            }
        }
        if !wait.is_zero() {
            thread::sleep(wait);
        }
        // Don't accumulate debt after a stall.
        self.next_due = Some(due.max(now) + period);
        Ok(())
    }

    fn fault(&self, code: CaptureErrorCode) -> CaptureFault {
        CaptureFault {
            stream_id: self.settings.camera_id,
            frame_id: self.next_frame_id,
            virtual_channel_id: 0,
            code,
        }
    }

    fn embedded_line(frame_id: u64, exposure: &ExposureControl, marker: u8) -> Vec<u8> {
        let mut line = Vec::with_capacity(17);
        line.push(marker);
        line.extend_from_slice(&frame_id.to_le_bytes());
        line.extend_from_slice(&exposure.exposure_time_us.to_le_bytes());
        line.extend_from_slice(&exposure.analog_gain.to_le_bytes());
        line
    }
}

impl CaptureSource for SimulatedSource {
    fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    fn start(&mut self) -> Result<(), CaptureFault> {
        self.next_due = None;
        self.exposed = None;
        // Streaming on applies every pending write at once.
        self.sensor.registers.lock().flush();
        debug!(camera = self.settings.camera_id, "Simulated capture started");
        Ok(())
    }

    fn wait_frame(&mut self, timeout: CaptureTimeout) -> Result<HwFrame, CaptureFault> {
        self.pace(timeout)?;
        if let Some(code) = self.faults.next() {
            let fault = self.fault(code);
            self.next_frame_id += 1;
            return Err(fault);
        }
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        let registers = self.sensor.registers.lock().frame_start();
        self.exposed = Some((frame_id, registers));
        Ok(HwFrame {
            frame_id,
            embedded_top: Self::embedded_line(frame_id, &registers.exposure, 0xa5),
            embedded_bottom: Self::embedded_line(frame_id, &registers.exposure, 0x5a),
        })
    }

    fn read_frame(&mut self, frame: &HwFrame, dst: &mut ImageBuffer) -> Result<(), CaptureFault> {
        let desc = dst.desc();
        let short = CaptureFault {
            stream_id: self.settings.camera_id,
            frame_id: frame.frame_id,
            virtual_channel_id: 0,
            code: CaptureErrorCode::ShortFrame,
        };
        if desc.width != self.settings.width || desc.height != self.settings.height {
            return Err(short);
        }
        // Only the most recent frame is still in the sensor's buffer.
        let Registers { exposure, wb } = match self.exposed {
            Some((id, registers)) if id == frame.frame_id => registers,
            _ => return Err(short),
        };
        // 10 ms at unity gain lands mid-scale for the brightest scene region.
        let scale = exposure.total() / 10_000.0 * 128.0;
        let w = desc.width as usize;
        let h = desc.height as usize;
        for sibling in 0..dst.sibling_count() {
            let plane = dst.plane_mut(sibling);
            for y in 0..h {
                for x in 0..w {
                    let radiance = 0.2 + 0.8 * (x + y) as f32 / (w + h) as f32;
                    let (cast, gain) = match (y % 2, x % 2) {
                        (0, 0) => (SCENE_CAST[0], wb.r),
                        (0, _) => (SCENE_CAST[1], wb.gr),
                        (_, 0) => (SCENE_CAST[1], wb.gb),
                        _ => (SCENE_CAST[2], wb.b),
                    };
                    let value = radiance * cast * gain * scale;
                    plane[y * w + x] = value.clamp(0.0, 255.0) as u8;
                }
            }
        }
        Ok(())
    }
}

pub struct SimulatedIsc {
    sensor: SimulatedSensor,
    failures: FaultInjector<IscError>,
    address: u8,
}

impl SimulatedIsc {
    /// Make the next `count` register writes fail with an I2C error.
    pub fn inject_failures(&self, count: usize) {
        self.failures.inject(
            IscError::Transmission {
                address: self.address,
            },
            count,
        );
    }

    pub fn failure_injector(&self) -> FaultInjector<IscError> {
        self.failures.clone()
    }

    fn check(&self) -> Result<(), IscError> {
        match self.failures.next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl SensorDevice for SimulatedIsc {
    fn attributes(&self) -> SensorAttributes {
        self.sensor.attributes.clone()
    }

    fn set_exposure(&mut self, exposure: &ExposureControl) -> Result<(), IscError> {
        self.check()?;
        let attrs = &self.sensor.attributes;
        if !attrs.exposure_time_us.contains(exposure.exposure_time_us)
            || !attrs.analog_gain.contains(exposure.analog_gain)
        {
            return Err(IscError::Rejected(format!("{exposure:?}")));
        }
        self.sensor.registers.lock().programmed.exposure = *exposure;
        Ok(())
    }

    fn set_white_balance(&mut self, gains: &WbGains) -> Result<(), IscError> {
        self.check()?;
        self.sensor.registers.lock().programmed.wb = *gains;
        Ok(())
    }
}
