use tracing::{debug, error, info, warn};

use super::{next_packet, PrepareContext, Stage, StageContext, StageIo};
use crate::control::DynamicProperties;
use crate::error::Result;
use crate::events::{EventData, EventType};
use crate::pipeline::component::ComponentKind;
use crate::pipeline::port::{Packet, PortType};
use crate::sensor::{IscError, SensorDevice};

/// Writes issued settings to the sensor through the ISC device.
pub(crate) struct SensorControlStage {
    device: Box<dyn SensorDevice>,
    in_episode: bool,
    consecutive: u32,
}

impl SensorControlStage {
    pub fn new(device: Box<dyn SensorDevice>) -> Self {
        Self {
            device,
            in_episode: false,
            consecutive: 0,
        }
    }

    fn apply(&mut self, sequence: u64, settings: &DynamicProperties, cx: &StageContext) {
        let result = self
            .device
            .set_exposure(&settings.exposure)
            .and_then(|()| self.device.set_white_balance(&settings.wb_gains));

        match result {
            Ok(()) => {
                if self.in_episode {
                    info!(handle = %cx.handle, failed_writes = self.consecutive, "I2C writes recovered");
                    cx.recover();
                }
                self.in_episode = false;
                self.consecutive = 0;
                debug!(sequence, settings_id = settings.settings_id, "Sensor settings written");
            }
            Err(IscError::Transmission { address }) => {
                self.consecutive += 1;
                if self.in_episode {
                    debug!(sequence, address, "I2C write failed during failure episode");
                    return;
                }
                self.in_episode = true;
                cx.degrade();
                cx.emit(
                    EventType::I2cTransmissionFailure,
                    EventData::Sensor {
                        address: Some(address),
                        message: format!("settings {} for frame {sequence}", settings.settings_id),
                    },
                );
            }
            Err(e @ IscError::Rejected(_)) => {
                warn!(handle = %cx.handle, sequence, error = %e, "Sensor rejected settings");
            }
        }
    }
}

impl Stage for SensorControlStage {
    fn kind(&self) -> ComponentKind {
        ComponentKind::SensorControl
    }

    fn prepare(&mut self, _cx: &PrepareContext<'_>) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, mut io: StageIo, cx: &StageContext) {
        let Some(input) = io.take_input(PortType::SensorControl) else {
            error!(handle = %cx.handle, "Sensor control has no command input");
            return;
        };
        while let Some(packet) = next_packet(&input, &cx.stop) {
            let Packet::SensorControl(mut command) = packet else {
                continue;
            };
            // The slot stays checked out until the bus transaction ends;
            // Capture waits on that before starting the next frame.
            if let Some(settings) = command.settings.take() {
                self.apply(command.sequence, &settings, cx);
            }
            drop(command);
        }
    }
}
