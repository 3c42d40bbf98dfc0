use tracing::trace;

use super::{ControlPlugin, PluginError, PluginInput};
use crate::control::{AeState, AlgorithmOutput, AntiFlicker, AwbState, IspSettings, StaticProperties};
use crate::sensor::{ExposureControl, WbGains};

/// Reference 3A plugin: mean-luma auto exposure and gray-world white balance.
#[derive(Debug, Clone)]
pub struct GrayWorldPlugin {
    /// Target mean luma, 0-255.
    pub target_luma: f32,
    /// Fraction of the exposure error corrected per frame.
    pub damping: f32,
    /// Relative error below which AE reports convergence.
    pub tolerance: f32,
    /// Windows with more clipped pixels than this fraction are ignored by AWB.
    pub max_clipped_fraction: f32,
}

impl Default for GrayWorldPlugin {
    fn default() -> Self {
        Self {
            target_luma: 110.0,
            damping: 0.6,
            tolerance: 0.05,
            max_clipped_fraction: 0.1,
        }
    }
}

impl GrayWorldPlugin {
    pub fn factory(self) -> impl Fn(&StaticProperties) -> Result<Box<dyn ControlPlugin>, PluginError> + Send + Sync {
        move |_static_properties: &StaticProperties| Ok(Box::new(self.clone()) as Box<dyn ControlPlugin>)
    }

    fn exposure(&self, input: &PluginInput<'_>) -> Result<(ExposureControl, AeState), PluginError> {
        let mean = input.stats.mean_luma();
        if mean <= 0.0 {
            return Err(PluginError::BadStatistics("empty histogram".into()));
        }
        let sensor = &input.static_properties.sensor;
        let current = input.applied.exposure;
        let error = self.target_luma / mean;
        let state = if (error - 1.0).abs() <= self.tolerance {
            AeState::Converged
        } else {
            AeState::Searching
        };

        let ratio = (1.0 + (error - 1.0) * self.damping).clamp(0.5, 2.0);
        let total = current.total() * ratio;

        let mut time = sensor.exposure_time_us.clamp(total / sensor.analog_gain.min);
        let flicker = match input.control.anti_flicker {
            AntiFlicker::Auto => AntiFlicker::Hz50,
            other => other,
        };
        if let Some(period) = flicker.period_us() {
            // Whole flicker periods only, once exposure is long enough for one.
            if time >= period {
                time = sensor.exposure_time_us.clamp((time / period).floor() * period);
            }
        }
        let gain = sensor.analog_gain.clamp(total / time);
        Ok((
            ExposureControl {
                exposure_time_us: time,
                analog_gain: gain,
            },
            state,
        ))
    }

    fn white_balance(&self, input: &PluginInput<'_>) -> (WbGains, AwbState) {
        let applied = input.applied.wb_gains;
        let (mut r, mut g, mut b) = (0.0f64, 0.0f64, 0.0f64);
        for window in &input.stats.lac().windows {
            if window.pixels == 0
                || window.clipped as f32 > window.pixels as f32 * self.max_clipped_fraction
            {
                continue;
            }
            let [wr, wgr, wgb, wb] = window.average;
            r += wr as f64;
            g += (wgr as f64 + wgb as f64) * 0.5;
            b += wb as f64;
        }
        if r <= 0.0 || g <= 0.0 || b <= 0.0 {
            return (applied, AwbState::Searching);
        }
        // Statistics are raw, before white balance, so gains are absolute.
        let gains = WbGains {
            r: (g / r) as f32,
            gr: 1.0,
            gb: 1.0,
            b: (g / b) as f32,
        };
        let settled = (gains.r - applied.r).abs() < 0.02 && (gains.b - applied.b).abs() < 0.02;
        let state = if settled {
            AwbState::Converged
        } else {
            AwbState::Searching
        };
        (gains, state)
    }
}

impl ControlPlugin for GrayWorldPlugin {
    fn process_ex(&mut self, input: &PluginInput<'_>) -> Result<AlgorithmOutput, PluginError> {
        let (exposure, ae_state) = self.exposure(input)?;
        let (wb_gains, awb_state) = self.white_balance(input);
        trace!(
            sequence = input.image_info.sequence,
            mean = input.stats.mean_luma(),
            exposure_us = exposure.exposure_time_us,
            gain = exposure.analog_gain,
            "gray-world update"
        );
        Ok(AlgorithmOutput {
            source_sequence: input.image_info.sequence,
            exposure,
            wb_gains,
            isp: IspSettings {
                stats: input.applied.isp.stats,
                ccm: input.applied.isp.ccm,
            },
            ae_state,
            awb_state,
        })
    }
}
