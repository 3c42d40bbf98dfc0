//! Image processing pipeline engine.
//!
//! A [`PipelineManager`] owns pipelines. A [`Pipeline`] is a graph of
//! components (capture, ISP, control algorithm, sensor control, output,
//! file reader), each on its own thread, exchanging pooled frame buffers over
//! typed ports. Control properties from the client and from a 3A plugin are
//! folded in at a per-frame safe point, and hardware faults are reported
//! through one event handler.

pub mod capture;
pub mod control;
pub mod error;
pub mod events;
pub mod isp;
pub mod manager;
pub mod metadata;
pub mod pipeline;
pub mod plugin;
pub mod pool;
pub mod sensor;
pub mod time;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::{CaptureSettings, FrameMetadata, ImageBuffer};
pub use control::{ControlProperties, DynamicProperties, StaticProperties};
pub use error::{IppError, Result};
pub use events::{Event, EventData, EventType, Severity};
pub use isp::IspVersion;
pub use manager::PipelineManager;
pub use metadata::{MetadataBlob, MetadataKind};
pub use pipeline::{CaptureMode, ComponentId, ComponentKind, ComponentSpec, ComponentState, Health, OutputFrame, Pipeline, PortType};

use control::MAX_SETTINGS_DELAY;
use sensor::{Range, SensorAttributes};

/// System configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub pipeline: PipelineConfig,
    pub capture: CaptureSettings,
    pub sensor: SensorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub max_pipelines: usize,
    /// `tracing_subscriber::EnvFilter` directive used by the demo binary.
    pub log_filter: String,
    pub event_channel_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_pipelines: 16,
            log_filter: "ipp=info".into(),
            event_channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_components: usize,
    pub capture_mode: CaptureMode,
    /// Default pool depths, used when a component spec leaves them unset.
    pub capture_pool: usize,
    pub isp_pool: usize,
    pub stats_pool: usize,
    pub command_pool: usize,
    /// ISP generation assumed for static properties when the graph has no ISP.
    pub isp_version: IspVersion,
    pub max_digital_gain: f32,
    /// Consecutive CSI faults that open a failure episode.
    pub csi_failure_threshold: u32,
    /// Hardware wait watchdog, in frame periods.
    pub capture_timeout_frames: u32,
    pub plugin_budget_us: u64,
    pub stop_grace_ms: u64,
    /// Pin the capture thread to this CPU core.
    pub capture_core: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_components: 16,
            capture_mode: CaptureMode::FreeRun,
            capture_pool: 4,
            isp_pool: 4,
            stats_pool: 4,
            command_pool: 2,
            isp_version: IspVersion::V5,
            max_digital_gain: 8.0,
            csi_failure_threshold: 3,
            capture_timeout_frames: 3,
            plugin_budget_us: 5_000,
            stop_grace_ms: 2_000,
            capture_core: None,
        }
    }
}

/// Sensor limits for the simulated sensor and sensor-control component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub name: String,
    pub exposure_time_us: Range,
    pub analog_gain: Range,
    pub wb_gain: Range,
    /// Frames between writing settings and seeing them on a captured frame.
    pub settings_delay: u8,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name: "sim-ar0231".into(),
            exposure_time_us: Range::new(10.0, 33_000.0),
            analog_gain: Range::new(1.0, 16.0),
            wb_gain: Range::new(0.25, 8.0),
            settings_delay: 2,
        }
    }
}

impl SensorConfig {
    pub fn attributes(&self, frame_rate: f32) -> SensorAttributes {
        SensorAttributes {
            name: self.name.clone(),
            exposure_time_us: self.exposure_time_us,
            analog_gain: self.analog_gain,
            wb_gain: self.wb_gain,
            frame_rate,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `IPP__SECTION__KEY`
    /// environment variables, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("IPP")
                .separator("__")
                .try_parsing(true),
        );
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(IppError::InvalidConfig(msg));

        if self.manager.max_pipelines == 0 {
            return invalid("manager.max_pipelines must be at least 1".into());
        }
        let p = &self.pipeline;
        if p.max_components == 0 {
            return invalid("pipeline.max_components must be at least 1".into());
        }
        for (name, depth) in [
            ("capture_pool", p.capture_pool),
            ("isp_pool", p.isp_pool),
            ("stats_pool", p.stats_pool),
            ("command_pool", p.command_pool),
        ] {
            if depth == 0 {
                return invalid(format!("pipeline.{name} must be at least 1"));
            }
        }
        if !(p.max_digital_gain >= 1.0) {
            return invalid(format!("pipeline.max_digital_gain {} below 1.0", p.max_digital_gain));
        }
        if p.csi_failure_threshold == 0 || p.capture_timeout_frames == 0 {
            return invalid("pipeline failure threshold and capture timeout must be at least 1".into());
        }
        self.capture
            .validate()
            .map_err(|e| IppError::InvalidConfig(format!("capture: {e}")))?;

        let s = &self.sensor;
        if s.settings_delay > MAX_SETTINGS_DELAY {
            return invalid(format!(
                "sensor.settings_delay {} exceeds {MAX_SETTINGS_DELAY}",
                s.settings_delay
            ));
        }
        for (name, range) in [
            ("exposure_time_us", s.exposure_time_us),
            ("analog_gain", s.analog_gain),
            ("wb_gain", s.wb_gain),
        ] {
            if !(range.min > 0.0 && range.min <= range.max) {
                return invalid(format!("sensor.{name} range [{}, {}] is not ordered and positive", range.min, range.max));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[pipeline]
capture_pool = 3
capture_mode = "trigger"

[capture]
width = 320
height = 240

[sensor]
settings_delay = 1
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.pipeline.capture_pool, 3);
        assert_eq!(config.pipeline.capture_mode, CaptureMode::Trigger);
        assert_eq!(config.capture.width, 320);
        assert_eq!(config.capture.lanes, 4);
        assert_eq!(config.sensor.settings_delay, 1);
        assert_eq!(config.manager.max_pipelines, 16);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut config = Config::default();
        config.sensor.settings_delay = 11;
        assert!(matches!(config.validate(), Err(IppError::InvalidConfig(_))));

        let mut config = Config::default();
        config.capture.width = 321;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.capture.lanes = 3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.stats_pool = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(Config::load(Some(&missing)), Err(IppError::Config(_))));
    }
}
