mod common;

use std::io::Write;
use std::time::Duration;

use common::Recorder;
use ipp::capture::{PixelFormat, SurfaceDesc};
use ipp::{CaptureMode, ComponentSpec, EventType, IppError, ManagerConfig, PipelineConfig, PipelineManager, PortType};

const WIDTH: u32 = 16;
const HEIGHT: u32 = 8;

fn surface() -> SurfaceDesc {
    SurfaceDesc::new(PixelFormat::Raw8Rggb, WIDTH, HEIGHT)
}

/// Three frames filled with 10, 20 and 30.
fn recording() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for value in [10u8, 20, 30] {
        file.write_all(&vec![value; (WIDTH * HEIGHT) as usize]).unwrap();
    }
    file.flush().unwrap();
    file
}

#[test]
fn replays_then_reports_end_of_stream() {
    let file = recording();
    let manager = PipelineManager::new(ManagerConfig::default());
    let events = Recorder::install(&manager);
    let pipeline = manager.create_pipeline(PipelineConfig::default()).unwrap();

    let reader = pipeline
        .add_component(ComponentSpec::file_reader(file.path(), surface(), 500.0))
        .unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(reader, out, PortType::Image).unwrap();
    pipeline.start().unwrap();

    for (sequence, value) in [10u8, 20, 30].into_iter().enumerate() {
        let frame = pipeline.get_output(out, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(frame.sequence(), sequence as u64);
        assert!(frame.image().plane(0).iter().all(|&p| p == value));
        pipeline.return_output(frame);
    }
    assert!(matches!(
        pipeline.get_output(out, Some(Duration::from_millis(200))),
        Err(IppError::TimedOut)
    ));
    pipeline.stop();
    assert_eq!(events.count(EventType::EndOfStream), 1);
    assert_eq!(events.count(EventType::BufferLeak), 0);
}

#[test]
fn looping_wraps_to_the_first_frame() {
    let file = recording();
    let manager = PipelineManager::new(ManagerConfig::default());
    let events = Recorder::install(&manager);
    let pipeline = manager.create_pipeline(PipelineConfig::default()).unwrap();

    let reader = pipeline
        .add_component(ComponentSpec::FileReader {
            path: file.path().to_path_buf(),
            surface: surface(),
            siblings: 1,
            frame_rate: 500.0,
            looping: true,
            pool_capacity: Some(2),
        })
        .unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(reader, out, PortType::Image).unwrap();
    pipeline.start().unwrap();

    let values: Vec<u8> = (0..7)
        .map(|_| {
            let frame = pipeline.get_output(out, Some(Duration::from_secs(2))).unwrap();
            let value = frame.image().plane(0)[0];
            pipeline.return_output(frame);
            value
        })
        .collect();
    pipeline.stop();

    assert_eq!(values, vec![10, 20, 30, 10, 20, 30, 10]);
    assert_eq!(events.count(EventType::EndOfStream), 0);
}

#[test]
fn trigger_mode_reads_one_frame_per_request() {
    let file = recording();
    let manager = PipelineManager::new(ManagerConfig::default());
    let pipeline = manager
        .create_pipeline(PipelineConfig {
            capture_mode: CaptureMode::Trigger,
            ..PipelineConfig::default()
        })
        .unwrap();

    let reader = pipeline
        .add_component(ComponentSpec::file_reader(file.path(), surface(), 500.0))
        .unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(reader, out, PortType::Image).unwrap();
    pipeline.start().unwrap();

    pipeline.single_capture().unwrap();
    pipeline.single_capture().unwrap();
    for sequence in 0..2 {
        let frame = pipeline.get_output(out, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(frame.sequence(), sequence);
        pipeline.return_output(frame);
    }
    assert!(matches!(
        pipeline.get_output(out, Some(Duration::from_millis(100))),
        Err(IppError::TimedOut)
    ));
    pipeline.stop();
}

#[test]
fn short_recording_is_rejected_at_start() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0u8; 10]).unwrap();
    file.flush().unwrap();

    let manager = PipelineManager::new(ManagerConfig::default());
    let pipeline = manager.create_pipeline(PipelineConfig::default()).unwrap();
    let reader = pipeline
        .add_component(ComponentSpec::file_reader(file.path(), surface(), 30.0))
        .unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(reader, out, PortType::Image).unwrap();

    assert!(matches!(pipeline.start(), Err(IppError::InvalidConfig(_))));
    assert!(!pipeline.is_running());
}
