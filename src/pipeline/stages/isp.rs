use std::sync::Arc;

use crossbeam::channel::Sender;
use tracing::{debug, error, warn};

use super::{forward, next_packet, PrepareContext, Stage, StageContext, StageIo};
use crate::capture::frame::{ColorSpace, ImageBuffer, PixelFormat, SurfaceDesc};
use crate::error::{IppError, Result};
use crate::isp::{compute_stats, process_image, IspVersion, StatsRecord};
use crate::pipeline::component::ComponentKind;
use crate::pipeline::port::{ImagePacket, Packet, PortType, StatsPacket};
use crate::pool::{BufferPool, PoolControl};

pub(crate) struct IspStage {
    version: IspVersion,
    image_capacity: usize,
    stats_capacity: usize,
    images: Option<Arc<BufferPool<ImageBuffer>>>,
    stats: Option<Arc<BufferPool<StatsRecord>>>,
}

impl IspStage {
    pub fn new(version: IspVersion, image_capacity: usize, stats_capacity: usize) -> Self {
        Self {
            version,
            image_capacity,
            stats_capacity,
            images: None,
            stats: None,
        }
    }

    /// Statistics first, so the control loop sees them as early as possible.
    fn process(
        &self,
        packet: ImagePacket,
        image_tx: Option<&Sender<Packet>>,
        stats_tx: Option<&Sender<Packet>>,
        cx: &StageContext,
    ) -> bool {
        let ImagePacket { image: raw, mut meta } = packet;

        if let (Some(tx), Some(pool)) = (stats_tx, &self.stats) {
            let Ok(mut record) = pool.acquire(None) else {
                return false;
            };
            record.sequence = meta.sequence();
            compute_stats(&raw, &meta.dynamic.isp.stats, &mut record.stats);
            let packet = StatsPacket {
                stats: record,
                meta: meta.clone(),
            };
            if !forward(tx, Packet::Stats(packet), &cx.stop) {
                return false;
            }
        }

        if let (Some(tx), Some(pool)) = (image_tx, &self.images) {
            let Ok(mut image) = pool.acquire(None) else {
                return false;
            };
            process_image(&raw, &meta.dynamic, &mut image);
            drop(raw);
            image.client_tag = 0;
            let desc = image.desc();
            meta.image_info.width = desc.width;
            meta.image_info.height = desc.height;
            meta.image_info.format = desc.format;
            meta.image_info.color_space = ColorSpace::Srgb;
            return forward(tx, Packet::Image(ImagePacket { image, meta }), &cx.stop);
        }
        true
    }
}

impl Stage for IspStage {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Isp
    }

    fn output_surface(&self, input: Option<SurfaceDesc>) -> Option<SurfaceDesc> {
        input.map(|raw| self.version.output_surface(raw))
    }

    fn prepare(&mut self, cx: &PrepareContext<'_>) -> Result<()> {
        let raw = cx
            .input_surface
            .ok_or_else(|| IppError::GraphIncomplete(format!("ISP {} has no image source", cx.id)))?;
        if raw.format != PixelFormat::Raw8Rggb {
            return Err(IppError::InvalidConfig(format!(
                "ISP input format {:?} unsupported",
                raw.format
            )));
        }
        if self.images.is_none() {
            let surface = self.version.output_surface(raw);
            let siblings = cx.siblings;
            self.images = Some(BufferPool::new(
                cx.pool_name(ComponentKind::Isp, PortType::Image),
                self.image_capacity,
                || ImageBuffer::allocate(surface, siblings),
            ));
        }
        if self.stats.is_none() {
            let version = self.version;
            self.stats = Some(BufferPool::new(
                cx.pool_name(ComponentKind::Isp, PortType::Stats),
                self.stats_capacity,
                || StatsRecord::new(version),
            ));
        }
        Ok(())
    }

    fn pools(&self) -> Vec<(PortType, Arc<dyn PoolControl>)> {
        let mut pools: Vec<(PortType, Arc<dyn PoolControl>)> = Vec::new();
        if let Some(images) = &self.images {
            pools.push((PortType::Image, images.clone() as Arc<dyn PoolControl>));
        }
        if let Some(stats) = &self.stats {
            pools.push((PortType::Stats, stats.clone() as Arc<dyn PoolControl>));
        }
        pools
    }

    fn run(&mut self, mut io: StageIo, cx: &StageContext) {
        let Some(input) = io.take_input(PortType::Image) else {
            error!(handle = %cx.handle, "ISP has no image input");
            return;
        };
        let image_tx = io.take_output(PortType::Image);
        let stats_tx = io.take_output(PortType::Stats);
        if image_tx.is_none() && stats_tx.is_none() {
            warn!(handle = %cx.handle, "ISP has no attached outputs; frames are discarded");
        }

        let mut processed = 0u64;
        while let Some(packet) = next_packet(&input, &cx.stop) {
            let packet = match packet {
                Packet::Image(packet) => packet,
                other => {
                    debug!(port = %other.port(), "ISP ignoring unexpected packet");
                    continue;
                }
            };
            if !self.process(packet, image_tx.as_ref(), stats_tx.as_ref(), cx) {
                break;
            }
            processed += 1;
        }
        debug!(handle = %cx.handle, processed, "ISP stopped");
    }
}
