use tracing::{debug, error};

use super::{forward, next_packet, PrepareContext, Stage, StageContext, StageIo};
use crate::error::Result;
use crate::events::{EventData, EventType};
use crate::pipeline::component::ComponentKind;
use crate::pipeline::port::{Packet, PortType};

/// Terminal sink: makes completed frames available to `Pipeline::get_output`.
pub(crate) struct OutputStage;

impl Stage for OutputStage {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Output
    }

    fn prepare(&mut self, _cx: &PrepareContext<'_>) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, mut io: StageIo, cx: &StageContext) {
        let (Some(input), Some(ready)) = (io.take_input(PortType::Image), io.ready.take()) else {
            error!(handle = %cx.handle, "Output is not connected");
            return;
        };
        let mut delivered = 0u64;
        while let Some(packet) = next_packet(&input, &cx.stop) {
            let Packet::Image(packet) = packet else {
                continue;
            };
            let sequence = packet.meta.sequence();
            if !forward(&ready, packet, &cx.stop) {
                break;
            }
            delivered += 1;
            cx.emit(EventType::FrameDone, EventData::Frame { sequence });
        }
        debug!(handle = %cx.handle, delivered, "Output stopped");
    }
}
