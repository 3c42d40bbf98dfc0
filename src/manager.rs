//! Owner of pipelines, the shared time base and the event handler.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{IppError, Result};
use crate::events::{EventChannel, EventDispatcher, EventHandler};
use crate::pipeline::Pipeline;
use crate::time::TimeSource;
use crate::{ManagerConfig, PipelineConfig};

/// Entry point of the engine.
///
/// Applications normally create one per process. Nothing enforces that, so
/// tests can run several managers side by side.
pub struct PipelineManager {
    config: ManagerConfig,
    time: TimeSource,
    events: Arc<EventDispatcher>,
    pipelines: Mutex<Vec<Arc<Pipeline>>>,
    next_id: Mutex<u32>,
}

impl PipelineManager {
    pub fn new(config: ManagerConfig) -> Self {
        let time = TimeSource::new();
        info!(max_pipelines = config.max_pipelines, "Pipeline manager created");
        Self {
            events: Arc::new(EventDispatcher::new(time.clone())),
            time,
            config,
            pipelines: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn time_source(&self) -> &TimeSource {
        &self.time
    }

    /// Install the single event handler, replacing any previous one.
    ///
    /// The handler runs on the reporting component's thread. It must not block
    /// and must not call back into a pipeline.
    pub fn register_event_handler<H: EventHandler + 'static>(&self, handler: H) {
        self.events.register(handler);
    }

    pub fn clear_event_handler(&self) {
        self.events.clear();
    }

    /// Route events into a bounded channel. Replaces the registered handler.
    pub fn event_channel(&self, capacity: usize) -> EventChannel {
        self.events.channel(capacity)
    }

    /// Same as [`event_channel`](Self::event_channel) with the configured capacity.
    pub fn default_event_channel(&self) -> EventChannel {
        self.events.channel(self.config.event_channel_capacity)
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn create_pipeline(&self, config: PipelineConfig) -> Result<Arc<Pipeline>> {
        let mut pipelines = self.pipelines.lock();
        if pipelines.len() >= self.config.max_pipelines {
            return Err(IppError::CapacityExceeded {
                what: "pipelines per manager",
                limit: self.config.max_pipelines,
            });
        }
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let pipeline = Arc::new(Pipeline::new(id, config, Arc::clone(&self.events), self.time.clone()));
        pipelines.push(Arc::clone(&pipeline));
        debug!(pipeline = id, "Pipeline created");
        Ok(pipeline)
    }

    pub fn pipeline(&self, id: u32) -> Result<Arc<Pipeline>> {
        self.pipelines
            .lock()
            .iter()
            .find(|p| p.id() == id)
            .cloned()
            .ok_or(IppError::UnknownPipeline(id))
    }

    pub fn pipelines(&self) -> Vec<Arc<Pipeline>> {
        self.pipelines.lock().clone()
    }

    /// Stop and destroy a pipeline and forget it.
    pub fn destroy_pipeline(&self, id: u32) -> Result<()> {
        let pipeline = {
            let mut pipelines = self.pipelines.lock();
            let idx = pipelines
                .iter()
                .position(|p| p.id() == id)
                .ok_or(IppError::UnknownPipeline(id))?;
            pipelines.swap_remove(idx)
        };
        pipeline.destroy();
        debug!(pipeline = id, "Pipeline destroyed");
        Ok(())
    }

    /// Destroy every pipeline.
    pub fn shutdown(&self) {
        let pipelines: Vec<_> = self.pipelines.lock().drain(..).collect();
        for pipeline in &pipelines {
            pipeline.destroy();
        }
        if !pipelines.is_empty() {
            info!(count = pipelines.len(), "Pipelines shut down");
        }
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_limit_is_enforced() {
        let manager = PipelineManager::new(ManagerConfig {
            max_pipelines: 2,
            ..ManagerConfig::default()
        });
        let a = manager.create_pipeline(PipelineConfig::default()).unwrap();
        let b = manager.create_pipeline(PipelineConfig::default()).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(matches!(
            manager.create_pipeline(PipelineConfig::default()),
            Err(IppError::CapacityExceeded { limit: 2, .. })
        ));

        manager.destroy_pipeline(a.id()).unwrap();
        assert!(matches!(manager.pipeline(a.id()), Err(IppError::UnknownPipeline(_))));
        manager.create_pipeline(PipelineConfig::default()).unwrap();
    }

    #[test]
    fn managers_are_independent() {
        let first = PipelineManager::new(ManagerConfig::default());
        let second = PipelineManager::new(ManagerConfig::default());
        first.create_pipeline(PipelineConfig::default()).unwrap();
        assert_eq!(first.pipelines().len(), 1);
        assert!(second.pipelines().is_empty());
        assert!(matches!(second.destroy_pipeline(0), Err(IppError::UnknownPipeline(0))));
    }
}
