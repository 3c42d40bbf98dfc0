//! Control surface of a pipeline and the queue that feeds it into frames.
//!
//! Client writes ([`ControlQueue::submit_client`]) and control-algorithm writes
//! ([`ControlQueue::submit_algorithm`]) land in single pending slots; the last
//! writer before the next safe point wins. At the safe point, the start of a
//! capture, [`ControlQueue::begin_frame`] folds the pending writes into a new
//! [`DynamicProperties`] and pushes it through a delay line whose length is
//! the sensor's settings delay, so an update issued at frame `k` is stamped on
//! frames from `k + delay` onward.

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};

use crate::error::{IppError, Result};
use crate::isp::IspVersion;
use crate::sensor::{ExposureControl, SensorAttributes, WbGains};

pub const MAX_SETTINGS_DELAY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AeMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwbMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AntiFlicker {
    Off,
    Hz50,
    Hz60,
    Auto,
}

impl AntiFlicker {
    /// Light-intensity period in microseconds, if a mains frequency is selected.
    pub fn period_us(self) -> Option<f32> {
        match self {
            AntiFlicker::Hz50 => Some(10_000.0),
            AntiFlicker::Hz60 => Some(8_333.3),
            AntiFlicker::Off | AntiFlicker::Auto => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AeState {
    Inactive,
    Searching,
    Converged,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwbState {
    Inactive,
    Searching,
    Converged,
    Locked,
}

/// Row-major 3x3 color-correction matrix, applied to linear RGB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorCorrectionMatrix(pub [[f32; 3]; 3]);

impl ColorCorrectionMatrix {
    pub const IDENTITY: ColorCorrectionMatrix =
        ColorCorrectionMatrix([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
}

impl Default for ColorCorrectionMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Statistics-engine settings for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSettings {
    /// Raw value at or above which a window pixel counts as clipped.
    pub clip_threshold: u8,
    pub flicker_detection: bool,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            clip_threshold: 250,
            flicker_detection: true,
        }
    }
}

/// Per-stream ISP settings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IspSettings {
    pub stats: StatsSettings,
    pub ccm: ColorCorrectionMatrix,
}

/// The mutable control surface a client pushes into a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlProperties {
    pub ae_mode: AeMode,
    pub awb_mode: AwbMode,
    /// Used when `ae_mode` is manual.
    pub exposure: ExposureControl,
    /// Used when `awb_mode` is manual.
    pub wb_gains: WbGains,
    pub anti_flicker: AntiFlicker,
    pub digital_gain: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KneePoint {
    pub input: u32,
    pub output: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveArray {
    pub width: u32,
    pub height: u32,
}

/// Immutable camera properties, fixed once the graph is complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticProperties {
    pub active_array: ActiveArray,
    pub sibling_count: u32,
    pub knee_points: Vec<KneePoint>,
    pub sensor: SensorAttributes,
    pub isp_version: IspVersion,
    pub settings_delay: u8,
    pub max_digital_gain: f32,
}

impl StaticProperties {
    pub fn default_controls(&self) -> ControlProperties {
        ControlProperties {
            ae_mode: AeMode::Auto,
            awb_mode: AwbMode::Auto,
            exposure: ExposureControl {
                exposure_time_us: self.sensor.exposure_time_us.clamp(10_000.0),
                analog_gain: self.sensor.analog_gain.min,
            },
            wb_gains: WbGains::UNITY,
            anti_flicker: AntiFlicker::Auto,
            digital_gain: 1.0,
        }
    }

    /// Check every numeric control against the sensor and ISP limits.
    pub fn validate(&self, props: &ControlProperties) -> Result<()> {
        let sensor = &self.sensor;
        check("exposure_time_us", props.exposure.exposure_time_us, sensor.exposure_time_us.min, sensor.exposure_time_us.max)?;
        check("analog_gain", props.exposure.analog_gain, sensor.analog_gain.min, sensor.analog_gain.max)?;
        for (field, value) in [
            ("wb_gains.r", props.wb_gains.r),
            ("wb_gains.gr", props.wb_gains.gr),
            ("wb_gains.gb", props.wb_gains.gb),
            ("wb_gains.b", props.wb_gains.b),
        ] {
            check(field, value, sensor.wb_gain.min, sensor.wb_gain.max)?;
        }
        check("digital_gain", props.digital_gain, 1.0, self.max_digital_gain)
    }

    fn clamp_exposure(&self, exposure: ExposureControl) -> ExposureControl {
        ExposureControl {
            exposure_time_us: self.sensor.exposure_time_us.clamp(exposure.exposure_time_us),
            analog_gain: self.sensor.analog_gain.clamp(exposure.analog_gain),
        }
    }

    fn clamp_wb(&self, gains: WbGains) -> WbGains {
        let range = self.sensor.wb_gain;
        WbGains {
            r: range.clamp(gains.r),
            gr: range.clamp(gains.gr),
            gb: range.clamp(gains.gb),
            b: range.clamp(gains.b),
        }
    }
}

fn check(field: &'static str, value: f32, min: f32, max: f32) -> Result<()> {
    // NaN fails both comparisons.
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(IppError::InvalidControl {
            field,
            value,
            min,
            max,
        })
    }
}

/// What a control algorithm computed from one frame's statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmOutput {
    /// Sequence of the frame whose statistics produced this output.
    pub source_sequence: u64,
    pub exposure: ExposureControl,
    pub wb_gains: WbGains,
    pub isp: IspSettings,
    pub ae_state: AeState,
    pub awb_state: AwbState,
}

/// Settings applied to one captured frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicProperties {
    /// Increments every time a new set of settings is issued.
    pub settings_id: u64,
    /// Frame at whose safe point these settings were issued.
    pub issued_at: u64,
    /// First frame stamped with these settings.
    pub effective_from: u64,
    pub ae_mode: AeMode,
    pub awb_mode: AwbMode,
    pub ae_state: AeState,
    pub awb_state: AwbState,
    pub exposure: ExposureControl,
    pub wb_gains: WbGains,
    pub digital_gain: f32,
    pub anti_flicker: AntiFlicker,
    pub isp: IspSettings,
    /// Statistics frame the control algorithm used, if any.
    pub algorithm_source: Option<u64>,
}

impl DynamicProperties {
    fn resolve(
        settings_id: u64,
        issued_at: u64,
        client: &ControlProperties,
        algorithm: Option<&AlgorithmOutput>,
        limits: &StaticProperties,
    ) -> Self {
        let auto_ae = client.ae_mode == AeMode::Auto;
        let auto_awb = client.awb_mode == AwbMode::Auto;
        let (exposure, ae_state) = match (auto_ae, algorithm) {
            (true, Some(alg)) => (limits.clamp_exposure(alg.exposure), alg.ae_state),
            (true, None) => (client.exposure, AeState::Searching),
            (false, _) => (client.exposure, AeState::Inactive),
        };
        let (wb_gains, awb_state) = match (auto_awb, algorithm) {
            (true, Some(alg)) => (limits.clamp_wb(alg.wb_gains), alg.awb_state),
            (true, None) => (client.wb_gains, AwbState::Searching),
            (false, _) => (client.wb_gains, AwbState::Inactive),
        };
        Self {
            settings_id,
            issued_at,
            effective_from: issued_at,
            ae_mode: client.ae_mode,
            awb_mode: client.awb_mode,
            ae_state,
            awb_state,
            exposure,
            wb_gains,
            digital_gain: client.digital_gain,
            anti_flicker: client.anti_flicker,
            isp: algorithm.map(|alg| alg.isp).unwrap_or_default(),
            algorithm_source: algorithm.map(|alg| alg.source_sequence),
        }
    }
}

/// Fixed-length delay between issuing settings and stamping them on frames.
struct DelayLine {
    delay: usize,
    ring: HeapRb<Option<DynamicProperties>>,
}

impl DelayLine {
    fn new(delay: u8) -> Self {
        let delay = delay as usize;
        Self {
            delay,
            ring: HeapRb::new(delay + 1),
        }
    }

    /// Feed this frame's entry, returning the entry issued `delay` frames ago.
    fn advance(&mut self, entry: Option<DynamicProperties>) -> Option<DynamicProperties> {
        if let Err(entry) = self.ring.try_push(entry) {
            // Full only if a previous pop was skipped; keep the newest entry.
            let _ = self.ring.try_pop();
            let _ = self.ring.try_push(entry);
        }
        if self.ring.occupied_len() > self.delay {
            self.ring.try_pop().flatten()
        } else {
            None
        }
    }
}

/// Result of a capture safe point.
#[derive(Debug, Clone)]
pub struct FrameControl {
    /// Settings stamped on the frame being captured.
    pub active: DynamicProperties,
    /// Client properties in force for this frame.
    pub client: ControlProperties,
    /// Settings issued at this safe point, to be written to the sensor now.
    pub issued: Option<DynamicProperties>,
}

struct ControlState {
    limits: Option<StaticProperties>,
    client: Option<ControlProperties>,
    pending_client: Option<ControlProperties>,
    pending_algorithm: Option<AlgorithmOutput>,
    latest_algorithm: Option<AlgorithmOutput>,
    delay_line: DelayLine,
    active: Option<DynamicProperties>,
    next_settings_id: u64,
}

/// The one structure both the client thread and the control-algorithm
/// thread write into.
pub struct ControlQueue {
    state: Mutex<ControlState>,
}

impl ControlQueue {
    pub fn new(settings_delay: u8) -> Self {
        Self {
            state: Mutex::new(ControlState {
                limits: None,
                client: None,
                pending_client: None,
                pending_algorithm: None,
                latest_algorithm: None,
                delay_line: DelayLine::new(settings_delay.min(MAX_SETTINGS_DELAY)),
                active: None,
                next_settings_id: 0,
            }),
        }
    }

    pub fn has_limits(&self) -> bool {
        self.state.lock().limits.is_some()
    }

    /// Install static limits. The first call also seeds the default controls.
    pub fn set_limits(&self, limits: StaticProperties) {
        let mut st = self.state.lock();
        if st.client.is_none() {
            st.client = Some(limits.default_controls());
        }
        st.limits = Some(limits);
    }

    /// Reset the delay line and the active settings for a fresh start.
    pub fn restart(&self) {
        let mut st = self.state.lock();
        let Some(limits) = st.limits.clone() else {
            return;
        };
        st.delay_line = DelayLine::new(limits.settings_delay.min(MAX_SETTINGS_DELAY));
        let client = st.client.clone().unwrap_or_else(|| limits.default_controls());
        let id = st.next_settings_id;
        st.next_settings_id += 1;
        st.active = Some(DynamicProperties::resolve(
            id,
            0,
            &client,
            st.latest_algorithm.as_ref(),
            &limits,
        ));
    }

    /// Validate and queue client properties; replaces any earlier pending write.
    pub fn submit_client(&self, props: ControlProperties) -> Result<()> {
        let mut st = self.state.lock();
        let limits = st
            .limits
            .as_ref()
            .ok_or_else(|| IppError::GraphIncomplete("static properties unavailable".into()))?;
        limits.validate(&props)?;
        st.pending_client = Some(props);
        Ok(())
    }

    pub fn submit_algorithm(&self, output: AlgorithmOutput) {
        self.state.lock().pending_algorithm = Some(output);
    }

    /// Client properties currently in force, including a not-yet-applied write.
    pub fn client_properties(&self) -> Option<ControlProperties> {
        let st = self.state.lock();
        st.pending_client.clone().or_else(|| st.client.clone())
    }

    /// Safe point for frame `sequence`.
    pub fn begin_frame(&self, sequence: u64) -> Option<FrameControl> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let limits = st.limits.as_ref()?;

        let client_changed = match st.pending_client.take() {
            Some(props) => {
                st.client = Some(props);
                true
            }
            None => false,
        };
        let algorithm_changed = match st.pending_algorithm.take() {
            Some(output) => {
                st.latest_algorithm = Some(output);
                true
            }
            None => false,
        };
        let client = st.client.clone().unwrap_or_else(|| limits.default_controls());

        let issued = if client_changed || algorithm_changed {
            let id = st.next_settings_id;
            st.next_settings_id += 1;
            Some(DynamicProperties::resolve(
                id,
                sequence,
                &client,
                st.latest_algorithm.as_ref(),
                limits,
            ))
        } else {
            None
        };

        if let Some(mut due) = st.delay_line.advance(issued.clone()) {
            due.effective_from = sequence;
            st.active = Some(due);
        }
        let active = match &st.active {
            Some(active) => active.clone(),
            None => {
                let id = st.next_settings_id;
                st.next_settings_id += 1;
                let initial = DynamicProperties::resolve(id, sequence, &client, None, limits);
                st.active = Some(initial.clone());
                initial
            }
        };

        Some(FrameControl {
            active,
            client,
            issued,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::Range;

    fn limits(delay: u8) -> StaticProperties {
        StaticProperties {
            active_array: ActiveArray {
                width: 64,
                height: 48,
            },
            sibling_count: 1,
            knee_points: vec![],
            sensor: SensorAttributes {
                name: "test".into(),
                exposure_time_us: Range::new(10.0, 33_000.0),
                analog_gain: Range::new(1.0, 16.0),
                wb_gain: Range::new(0.25, 8.0),
                frame_rate: 30.0,
            },
            isp_version: IspVersion::V5,
            settings_delay: delay,
            max_digital_gain: 8.0,
        }
    }

    fn queue(delay: u8) -> ControlQueue {
        let q = ControlQueue::new(delay);
        q.set_limits(limits(delay));
        q.restart();
        q
    }

    fn manual(exposure_time_us: f32) -> ControlProperties {
        ControlProperties {
            ae_mode: AeMode::Manual,
            exposure: ExposureControl {
                exposure_time_us,
                analog_gain: 1.0,
            },
            ..limits(0).default_controls()
        }
    }

    #[test]
    fn zero_delay_applies_on_next_frame() {
        let q = queue(0);
        let f0 = q.begin_frame(0).unwrap();
        q.submit_client(manual(5_000.0)).unwrap();
        let f1 = q.begin_frame(1).unwrap();

        assert_ne!(f0.active.exposure.exposure_time_us, 5_000.0);
        assert_eq!(f1.active.exposure.exposure_time_us, 5_000.0);
        assert_eq!(f1.active.effective_from, 1);
        assert!(f1.issued.is_some());
    }

    #[test]
    fn settings_delay_postpones_effect() {
        let q = queue(2);
        q.begin_frame(0).unwrap();
        q.submit_client(manual(5_000.0)).unwrap();

        let f1 = q.begin_frame(1).unwrap();
        let f2 = q.begin_frame(2).unwrap();
        let f3 = q.begin_frame(3).unwrap();

        assert!(f1.issued.is_some());
        assert_ne!(f1.active.exposure.exposure_time_us, 5_000.0);
        assert_ne!(f2.active.exposure.exposure_time_us, 5_000.0);
        assert_eq!(f3.active.exposure.exposure_time_us, 5_000.0);
        assert_eq!(f3.active.issued_at, 1);
        assert_eq!(f3.active.effective_from, 3);
    }

    #[test]
    fn last_write_before_safe_point_wins() {
        let q = queue(0);
        q.submit_client(manual(1_000.0)).unwrap();
        q.submit_client(manual(2_000.0)).unwrap();
        q.submit_client(manual(3_000.0)).unwrap();
        let f = q.begin_frame(0).unwrap();
        assert_eq!(f.active.exposure.exposure_time_us, 3_000.0);
    }

    #[test]
    fn out_of_range_controls_are_rejected() {
        let q = queue(0);
        let mut props = manual(1_000.0);
        props.exposure.analog_gain = 64.0;
        match q.submit_client(props) {
            Err(IppError::InvalidControl { field, .. }) => assert_eq!(field, "analog_gain"),
            other => panic!("unexpected {other:?}"),
        }

        let mut props = manual(1_000.0);
        props.digital_gain = f32::NAN;
        assert!(q.submit_client(props).is_err());
    }

    #[test]
    fn algorithm_output_only_drives_auto_modes() {
        let q = queue(0);
        q.begin_frame(0).unwrap();
        q.submit_algorithm(AlgorithmOutput {
            source_sequence: 0,
            exposure: ExposureControl {
                exposure_time_us: 99_000.0,
                analog_gain: 2.0,
            },
            wb_gains: WbGains {
                r: 2.0,
                gr: 1.0,
                gb: 1.0,
                b: 1.5,
            },
            isp: IspSettings::default(),
            ae_state: AeState::Searching,
            awb_state: AwbState::Converged,
        });
        let auto = q.begin_frame(1).unwrap();
        // Clamped to the sensor range.
        assert_eq!(auto.active.exposure.exposure_time_us, 33_000.0);
        assert_eq!(auto.active.wb_gains.r, 2.0);
        assert_eq!(auto.active.algorithm_source, Some(0));

        q.submit_client(manual(4_000.0)).unwrap();
        let manual_frame = q.begin_frame(2).unwrap();
        assert_eq!(manual_frame.active.exposure.exposure_time_us, 4_000.0);
        assert_eq!(manual_frame.active.ae_state, AeState::Inactive);
        // AWB stays on the algorithm's gains.
        assert_eq!(manual_frame.active.wb_gains.r, 2.0);
    }

    #[test]
    fn submit_requires_limits() {
        let q = ControlQueue::new(0);
        assert!(matches!(
            q.submit_client(manual(1_000.0)),
            Err(IppError::GraphIncomplete(_))
        ));
        assert!(q.begin_frame(0).is_none());
    }
}
