//! Control-algorithm plugin boundary.
//!
//! A plugin is created the first time its pipeline starts, called with
//! [`ControlPlugin::process_ex`] once per frame on the component's own
//! thread, and destroyed when the component goes away.
//! `process_ex` sits on the per-frame path and must return quickly.

pub mod gray_world;

use thiserror::Error;

use crate::capture::frame::ImageInfo;
use crate::control::{AlgorithmOutput, ControlProperties, DynamicProperties, StaticProperties};
use crate::isp::IspStats;

pub use gray_world::GrayWorldPlugin;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    #[error("plugin could not be created: {0}")]
    Create(String),
    #[error("statistics unusable: {0}")]
    BadStatistics(String),
    #[error("{0}")]
    Other(String),
}

/// Everything a plugin sees for one frame.
#[derive(Debug)]
pub struct PluginInput<'a> {
    pub image_info: &'a ImageInfo,
    pub static_properties: &'a StaticProperties,
    pub control: &'a ControlProperties,
    /// Settings the frame was captured with.
    pub applied: &'a DynamicProperties,
    pub stats: &'a IspStats,
}

pub trait ControlPlugin: Send {
    /// Compute settings for upcoming frames from one frame's statistics.
    fn process_ex(&mut self, input: &PluginInput<'_>) -> Result<AlgorithmOutput, PluginError>;

    /// Release plugin resources. Called exactly once.
    fn destroy(&mut self) {}
}

/// Client-supplied constructor for a [`ControlPlugin`].
pub trait PluginFactory: Send + Sync {
    fn create(&self, static_properties: &StaticProperties) -> Result<Box<dyn ControlPlugin>, PluginError>;
}

impl<F> PluginFactory for F
where
    F: Fn(&StaticProperties) -> Result<Box<dyn ControlPlugin>, PluginError> + Send + Sync,
{
    fn create(&self, static_properties: &StaticProperties) -> Result<Box<dyn ControlPlugin>, PluginError> {
        self(static_properties)
    }
}
