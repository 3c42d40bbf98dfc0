use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use tracing::{debug, error, warn};

use super::{next_packet, PrepareContext, Stage, StageContext, StageIo};
use crate::error::{IppError, Result};
use crate::events::{EventData, EventType};
use crate::pipeline::component::ComponentKind;
use crate::pipeline::port::{Packet, PortType, StatsPacket};
use crate::plugin::{ControlPlugin, PluginFactory, PluginInput};

/// Runs the client's 3A plugin on each statistics record and queues its
/// output for the next capture safe point. Without a plugin, statistics are
/// consumed and the pipeline stays on its default controls.
pub(crate) struct ControlAlgorithmStage {
    factory: Option<Box<dyn PluginFactory>>,
    plugin: Option<Box<dyn ControlPlugin>>,
}

impl ControlAlgorithmStage {
    pub fn new(factory: Option<Box<dyn PluginFactory>>) -> Self {
        Self {
            factory,
            plugin: None,
        }
    }

    fn process(&mut self, packet: StatsPacket, cx: &StageContext) {
        let Some(plugin) = self.plugin.as_mut() else {
            return;
        };
        let StatsPacket { stats, meta } = packet;
        let sequence = meta.sequence();
        let input = PluginInput {
            image_info: &meta.image_info,
            static_properties: &cx.statics,
            control: &meta.control,
            applied: &meta.dynamic,
            stats: &stats.stats,
        };

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| plugin.process_ex(&input)));
        let elapsed = started.elapsed();
        drop(stats);

        metrics::histogram!("ipp_plugin_process_seconds").record(elapsed.as_secs_f64());
        if elapsed > cx.tuning.plugin_budget {
            warn!(
                handle = %cx.handle,
                sequence,
                elapsed_us = elapsed.as_micros() as u64,
                budget_us = cx.tuning.plugin_budget.as_micros() as u64,
                "Control plugin over budget"
            );
        }

        match result {
            Ok(Ok(output)) => cx.control.submit_algorithm(output),
            Ok(Err(e)) => cx.emit(
                EventType::ControlAlgorithmFailure,
                EventData::Message(format!("frame {sequence}: {e}")),
            ),
            Err(_) => cx.emit(
                EventType::ControlAlgorithmFailure,
                EventData::Message(format!("frame {sequence}: plugin panicked")),
            ),
        }
    }
}

impl Stage for ControlAlgorithmStage {
    fn kind(&self) -> ComponentKind {
        ComponentKind::ControlAlgorithm
    }

    fn prepare(&mut self, cx: &PrepareContext<'_>) -> Result<()> {
        if self.plugin.is_none() {
            if let Some(factory) = &self.factory {
                let plugin = factory
                    .create(cx.statics)
                    .map_err(|e| IppError::Plugin(e.to_string()))?;
                self.plugin = Some(plugin);
            }
        }
        Ok(())
    }

    fn run(&mut self, mut io: StageIo, cx: &StageContext) {
        let Some(input) = io.take_input(PortType::Stats) else {
            error!(handle = %cx.handle, "Control algorithm has no stats input");
            return;
        };
        if self.plugin.is_none() {
            debug!(handle = %cx.handle, "No control plugin; using default controls");
        }
        while let Some(packet) = next_packet(&input, &cx.stop) {
            match packet {
                Packet::Stats(packet) => self.process(packet, cx),
                other => debug!(port = %other.port(), "Control algorithm ignoring packet"),
            }
        }
    }

    fn destroy(&mut self) {
        if let Some(mut plugin) = self.plugin.take() {
            plugin.destroy();
        }
    }
}
