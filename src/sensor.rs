//! Image Sensor Control (ISC) boundary.
//!
//! The pipeline never touches sensor registers itself. SensorControl forwards
//! exposure and white-balance writes to a [`SensorDevice`], which typically
//! sits behind an I2C bus and may take milliseconds per call.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sensor exposure: integration time and analog gain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureControl {
    pub exposure_time_us: f32,
    pub analog_gain: f32,
}

impl ExposureControl {
    /// Total exposure in gain-microseconds.
    pub fn total(&self) -> f32 {
        self.exposure_time_us * self.analog_gain
    }
}

/// Per-channel white-balance gains for an RGGB sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WbGains {
    pub r: f32,
    pub gr: f32,
    pub gb: f32,
    pub b: f32,
}

impl WbGains {
    pub const UNITY: WbGains = WbGains {
        r: 1.0,
        gr: 1.0,
        gb: 1.0,
        b: 1.0,
    };

    pub fn as_array(&self) -> [f32; 4] {
        [self.r, self.gr, self.gb, self.b]
    }
}

impl Default for WbGains {
    fn default() -> Self {
        Self::UNITY
    }
}

/// Inclusive `[min, max]` range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f32,
    pub max: f32,
}

impl Range {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }
}

/// Read-only sensor limits reported by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorAttributes {
    pub name: String,
    pub exposure_time_us: Range,
    pub analog_gain: Range,
    pub wb_gain: Range,
    pub frame_rate: f32,
}

impl SensorAttributes {
    /// Limits assumed when no sensor-control device is wired.
    pub fn passive(frame_rate: f32) -> Self {
        Self {
            name: "passive".into(),
            exposure_time_us: Range::new(1.0, 1_000_000.0),
            analog_gain: Range::new(1.0, 64.0),
            wb_gain: Range::new(0.25, 8.0),
            frame_rate,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IscError {
    #[error("I2C transmission failed at address {address:#04x}")]
    Transmission { address: u8 },
    #[error("Sensor rejected value: {0}")]
    Rejected(String),
}

/// Opaque sensor/serializer device handle.
pub trait SensorDevice: Send {
    fn attributes(&self) -> SensorAttributes;

    fn set_exposure(&mut self, exposure: &ExposureControl) -> Result<(), IscError>;

    fn set_white_balance(&mut self, gains: &WbGains) -> Result<(), IscError>;

    /// Program several exposures for HDR bracketing; defaults to the first one.
    fn set_bracketed_exposure(&mut self, exposures: &[ExposureControl]) -> Result<(), IscError> {
        match exposures.first() {
            Some(first) => self.set_exposure(first),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        exposures: Vec<ExposureControl>,
    }

    impl SensorDevice for Recorder {
        fn attributes(&self) -> SensorAttributes {
            SensorAttributes::passive(30.0)
        }

        fn set_exposure(&mut self, exposure: &ExposureControl) -> Result<(), IscError> {
            self.exposures.push(*exposure);
            Ok(())
        }

        fn set_white_balance(&mut self, _gains: &WbGains) -> Result<(), IscError> {
            Ok(())
        }
    }

    #[test]
    fn bracketed_exposure_falls_back_to_first() {
        let mut device = Recorder::default();
        let short = ExposureControl {
            exposure_time_us: 100.0,
            analog_gain: 1.0,
        };
        let long = ExposureControl {
            exposure_time_us: 8_000.0,
            analog_gain: 2.0,
        };
        device.set_bracketed_exposure(&[short, long]).unwrap();
        device.set_bracketed_exposure(&[]).unwrap();
        assert_eq!(device.exposures, vec![short]);
    }

    #[test]
    fn range_clamps_and_contains() {
        let range = Range::new(1.0, 16.0);
        assert!(range.contains(1.0));
        assert!(!range.contains(16.5));
        assert_eq!(range.clamp(0.2), 1.0);
        assert_eq!(range.clamp(40.0), 16.0);
    }
}
