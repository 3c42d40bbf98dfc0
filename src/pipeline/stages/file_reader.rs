use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::select;
use tracing::{debug, error, info};

use super::{forward, PrepareContext, Stage, StageContext, StageIo};
use crate::capture::frame::{ColorSpace, FrameMetadata, ImageBuffer, ImageInfo, PixelFormat, SurfaceDesc};
use crate::error::{IppError, Result};
use crate::events::{EventData, EventType};
use crate::pipeline::component::ComponentKind;
use crate::pipeline::port::{ImagePacket, Packet, PortType};
use crate::pool::{BufferPool, PoolControl};

/// Replays raw frames stored back to back in a file.
pub(crate) struct FileReaderStage {
    path: PathBuf,
    surface: SurfaceDesc,
    siblings: u32,
    frame_rate: f32,
    looping: bool,
    pool_capacity: usize,
    images: Option<Arc<BufferPool<ImageBuffer>>>,
    next_sequence: u64,
}

enum ReadOutcome {
    Frame,
    EndOfStream,
}

impl FileReaderStage {
    pub fn new(
        path: PathBuf,
        surface: SurfaceDesc,
        siblings: u32,
        frame_rate: f32,
        looping: bool,
        pool_capacity: usize,
    ) -> Self {
        Self {
            path,
            surface,
            siblings: siblings.max(1),
            frame_rate,
            looping,
            pool_capacity,
            images: None,
            next_sequence: 0,
        }
    }

    fn frame_len(&self) -> u64 {
        (self.surface.byte_len() * self.siblings as usize) as u64
    }

    fn read_into(&self, reader: &mut BufReader<File>, image: &mut ImageBuffer) -> io::Result<ReadOutcome> {
        for attempt in 0..2 {
            let mut complete = true;
            for sibling in 0..image.sibling_count() {
                match reader.read_exact(image.plane_mut(sibling)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        complete = false;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if complete {
                return Ok(ReadOutcome::Frame);
            }
            if !self.looping || attempt > 0 {
                break;
            }
            // A trailing partial frame is ignored.
            reader.seek(SeekFrom::Start(0))?;
        }
        Ok(ReadOutcome::EndOfStream)
    }
}

impl Stage for FileReaderStage {
    fn kind(&self) -> ComponentKind {
        ComponentKind::FileReader
    }

    fn output_surface(&self, _input: Option<SurfaceDesc>) -> Option<SurfaceDesc> {
        Some(self.surface)
    }

    fn prepare(&mut self, cx: &PrepareContext<'_>) -> Result<()> {
        if self.surface.format != PixelFormat::Raw8Rggb
            || self.surface.width % 2 != 0
            || self.surface.height % 2 != 0
            || self.surface.width == 0
            || self.surface.height == 0
        {
            return Err(IppError::InvalidConfig(format!(
                "file reader surface {:?} must be non-empty even RAW8",
                self.surface
            )));
        }
        if !(self.frame_rate > 0.0) {
            return Err(IppError::InvalidConfig(format!(
                "file reader frame rate {} must be positive",
                self.frame_rate
            )));
        }
        let len = File::open(&self.path)?.metadata()?.len();
        if len < self.frame_len() {
            return Err(IppError::InvalidConfig(format!(
                "{} holds {len} bytes, less than one {} byte frame",
                self.path.display(),
                self.frame_len()
            )));
        }
        if self.images.is_none() {
            let surface = self.surface;
            let siblings = self.siblings as usize;
            self.images = Some(BufferPool::new(
                cx.pool_name(ComponentKind::FileReader, PortType::Image),
                self.pool_capacity,
                || ImageBuffer::allocate(surface, siblings),
            ));
        }
        Ok(())
    }

    fn pools(&self) -> Vec<(PortType, Arc<dyn PoolControl>)> {
        self.images
            .iter()
            .map(|p| (PortType::Image, p.clone() as Arc<dyn PoolControl>))
            .collect()
    }

    fn run(&mut self, mut io: StageIo, cx: &StageContext) {
        let (Some(out), Some(images)) = (io.take_output(PortType::Image), self.images.clone()) else {
            error!(handle = %cx.handle, "File reader has no image output");
            return;
        };
        let mut reader = match File::open(&self.path) {
            Ok(file) => BufReader::new(file),
            Err(e) => {
                cx.degrade();
                cx.emit(EventType::ComponentFailure, EventData::Message(e.to_string()));
                cx.wait_for_stop();
                return;
            }
        };
        let period = Duration::from_secs_f32(1.0 / self.frame_rate);
        let trigger = io.trigger.take();
        let mut frame_id = 0u64;
        info!(handle = %cx.handle, path = %self.path.display(), "File reader running");

        loop {
            match &trigger {
                Some(trigger) => select! {
                    recv(cx.stop) -> _ => break,
                    recv(trigger) -> msg => if msg.is_err() { break },
                },
                None => select! {
                    recv(cx.stop) -> _ => break,
                    default(period) => {}
                },
            }

            // Backpressure: wait for a slot rather than drop.
            let Ok(mut image) = images.acquire(None) else {
                break;
            };
            match self.read_into(&mut reader, &mut image) {
                Ok(ReadOutcome::Frame) => {}
                Ok(ReadOutcome::EndOfStream) => {
                    drop(image);
                    cx.emit(EventType::EndOfStream, EventData::Frame { sequence: self.next_sequence });
                    cx.wait_for_stop();
                    break;
                }
                Err(e) => {
                    drop(image);
                    cx.degrade();
                    cx.emit(EventType::ComponentFailure, EventData::Message(e.to_string()));
                    cx.wait_for_stop();
                    break;
                }
            }

            let sequence = self.next_sequence;
            self.next_sequence += 1;
            let Some(frame_control) = cx.control.begin_frame(sequence) else {
                error!(handle = %cx.handle, "File reader started without static properties");
                break;
            };
            let meta = FrameMetadata {
                image_info: ImageInfo {
                    camera_id: 0,
                    frame_id,
                    sequence,
                    timestamps: cx.time.stamp(),
                    width: self.surface.width,
                    height: self.surface.height,
                    format: self.surface.format,
                    sibling_count: self.siblings,
                    color_space: ColorSpace::Raw,
                },
                control: frame_control.client,
                dynamic: frame_control.active,
                embedded_top: Vec::new(),
                embedded_bottom: Vec::new(),
            };
            frame_id += 1;
            if !forward(&out, Packet::Image(ImagePacket { image, meta }), &cx.stop) {
                break;
            }
        }
        debug!(handle = %cx.handle, frames = frame_id, "File reader stopped");
    }
}
