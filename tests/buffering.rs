mod common;

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use common::{sensor, settings, Recorder};
use ipp::{ComponentSpec, EventData, EventType, IppError, ManagerConfig, PipelineConfig, PipelineManager, PortType};

#[test]
fn unreturned_outputs_starve_the_pool_without_hanging() {
    let manager = PipelineManager::new(ManagerConfig::default());
    let events = Recorder::install(&manager);
    let pipeline = manager.create_pipeline(PipelineConfig::default()).unwrap();
    let sensor = sensor();

    let cap = pipeline
        .add_component(ComponentSpec::Capture {
            source: Box::new(sensor.source(settings())),
            pool_capacity: Some(3),
        })
        .unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(cap, out, PortType::Image).unwrap();
    pipeline.start().unwrap();

    let held: Vec<_> = (0..3)
        .map(|_| pipeline.get_output(out, Some(Duration::from_secs(2))).unwrap())
        .collect();
    let started = std::time::Instant::now();
    assert!(matches!(
        pipeline.get_output(out, Some(Duration::from_millis(100))),
        Err(IppError::TimedOut)
    ));
    assert!(started.elapsed() < Duration::from_secs(1));

    let pool = pipeline
        .pool_snapshots()
        .into_iter()
        .find(|p| p.name.contains("image"))
        .unwrap();
    assert_eq!(pool.capacity, 3);
    assert_eq!(pool.outstanding, 3);

    // Capture keeps running and reports the frames it could not store.
    thread::sleep(Duration::from_millis(50));
    assert!(events.count(EventType::CaptureFrameDrop) > 0);

    for frame in held {
        pipeline.return_output(frame);
    }
    pipeline.get_output(out, Some(Duration::from_secs(2))).unwrap();
    pipeline.stop();
    assert_eq!(events.count(EventType::BufferLeak), 0);
}

#[test]
fn sequence_gaps_match_reported_drops() {
    let manager = PipelineManager::new(ManagerConfig::default());
    let events = Recorder::install(&manager);
    let pipeline = manager
        .create_pipeline(PipelineConfig {
            capture_pool: 2,
            isp_pool: 2,
            ..PipelineConfig::default()
        })
        .unwrap();
    let sensor = sensor();

    let cap = pipeline.add_component(ComponentSpec::capture(sensor.source(settings()))).unwrap();
    let isp = pipeline.add_component(ComponentSpec::isp()).unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(cap, isp, PortType::Image).unwrap();
    pipeline.attach(isp, out, PortType::Image).unwrap();
    pipeline.start().unwrap();

    let mut sequences = Vec::new();
    for i in 0..30 {
        let frame = pipeline.get_output(out, Some(Duration::from_secs(2))).unwrap();
        sequences.push(frame.sequence());
        pipeline.return_output(frame);
        // A slow consumer every few frames forces capture to drop.
        if i % 5 == 0 {
            thread::sleep(Duration::from_millis(30));
        }
    }
    pipeline.stop();

    let dropped: HashSet<u64> = events
        .of(EventType::CaptureFrameDrop)
        .into_iter()
        .filter_map(|e| match e.data {
            EventData::Frame { sequence } => Some(sequence),
            _ => None,
        })
        .collect();

    for pair in sequences.windows(2) {
        assert!(pair[1] > pair[0], "out of order: {sequences:?}");
        for missing in pair[0] + 1..pair[1] {
            assert!(dropped.contains(&missing), "gap at {missing} without a drop event");
        }
    }
    for missing in 0..sequences[0] {
        assert!(dropped.contains(&missing));
    }
}
