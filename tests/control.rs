mod common;

use std::time::{Duration, Instant};

use common::{embedded_exposure, sensor, sensor_with_delay, settings};
use ipp::control::{AeMode, AwbMode};
use ipp::plugin::GrayWorldPlugin;
use ipp::{CaptureMode, ComponentSpec, ManagerConfig, PipelineConfig, PipelineManager, PortType};

/// One captured frame: what the metadata claims and what the sensor did.
struct Observed {
    sequence: u64,
    meta_exposure: f32,
    sensor_exposure: f32,
    brightness: u64,
}

fn exposures_around_change(delay: u8) -> Vec<Observed> {
    let manager = PipelineManager::new(ManagerConfig::default());
    let pipeline = manager
        .create_pipeline(PipelineConfig {
            capture_mode: CaptureMode::Trigger,
            capture_timeout_frames: 100,
            ..PipelineConfig::default()
        })
        .unwrap();
    let sensor = sensor_with_delay(delay);

    let cap = pipeline.add_component(ComponentSpec::capture(sensor.source(settings()))).unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    let sc = pipeline.add_component(ComponentSpec::sensor_control(sensor.isc(), delay)).unwrap();
    pipeline.attach(cap, out, PortType::Image).unwrap();
    pipeline.attach(cap, sc, PortType::SensorControl).unwrap();
    pipeline.start().unwrap();

    let mut seen = Vec::new();
    let capture = |seen: &mut Vec<Observed>| {
        pipeline.single_capture().unwrap();
        let frame = pipeline.get_output(out, Some(Duration::from_secs(2))).unwrap();
        seen.push(Observed {
            sequence: frame.sequence(),
            meta_exposure: frame.metadata().dynamic.exposure.exposure_time_us,
            sensor_exposure: embedded_exposure(&frame.metadata().embedded_top),
            brightness: frame.image().plane(0).iter().map(|&p| p as u64).sum(),
        });
    };
    for _ in 0..3 {
        capture(&mut seen);
    }

    let mut props = pipeline.get_default_control_properties().unwrap();
    props.ae_mode = AeMode::Manual;
    props.exposure.exposure_time_us = 5_000.0;
    pipeline.apply_control_properties(props).unwrap();

    for _ in 0..(3 + delay as usize) {
        capture(&mut seen);
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while sensor.exposure().exposure_time_us != 5_000.0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(sensor.exposure().exposure_time_us, 5_000.0);
    pipeline.stop();
    seen
}

/// Metadata must describe the exposure the sensor actually used.
fn assert_metadata_matches_sensor(seen: &[Observed]) {
    for frame in seen {
        assert_eq!(
            frame.meta_exposure, frame.sensor_exposure,
            "frame {} metadata disagrees with the sensor",
            frame.sequence
        );
    }
    for pair in seen.windows(2) {
        if pair[0].sensor_exposure == pair[1].sensor_exposure {
            assert_eq!(pair[0].brightness, pair[1].brightness, "frame {}", pair[1].sequence);
        } else {
            assert_ne!(pair[0].brightness, pair[1].brightness, "frame {}", pair[1].sequence);
        }
    }
}

#[test]
fn control_change_takes_effect_on_the_next_frame() {
    let seen = exposures_around_change(0);
    assert_eq!(seen.iter().map(|f| f.sequence).collect::<Vec<_>>(), (0..6).collect::<Vec<_>>());
    for frame in &seen {
        let expected = if frame.sequence < 3 { 10_000.0 } else { 5_000.0 };
        assert_eq!(frame.meta_exposure, expected, "frame {}", frame.sequence);
    }
    assert_metadata_matches_sensor(&seen);
}

#[test]
fn settings_delay_postpones_the_change() {
    let seen = exposures_around_change(2);
    for frame in &seen {
        let expected = if frame.sequence < 5 { 10_000.0 } else { 5_000.0 };
        assert_eq!(frame.meta_exposure, expected, "frame {}", frame.sequence);
    }
    assert_metadata_matches_sensor(&seen);
}

#[test]
fn last_write_before_the_safe_point_wins() {
    let manager = PipelineManager::new(ManagerConfig::default());
    let pipeline = manager
        .create_pipeline(PipelineConfig {
            capture_mode: CaptureMode::Trigger,
            ..PipelineConfig::default()
        })
        .unwrap();
    let sensor = sensor();
    let cap = pipeline.add_component(ComponentSpec::capture(sensor.source(settings()))).unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(cap, out, PortType::Image).unwrap();

    // Applying before start is allowed once the graph is complete.
    let mut props = pipeline.get_default_control_properties().unwrap();
    props.ae_mode = AeMode::Manual;
    props.awb_mode = AwbMode::Manual;
    props.exposure.exposure_time_us = 2_000.0;
    pipeline.apply_control_properties(props.clone()).unwrap();
    props.exposure.exposure_time_us = 3_000.0;
    props.wb_gains.r = 1.5;
    pipeline.apply_control_properties(props).unwrap();

    pipeline.start().unwrap();
    pipeline.single_capture().unwrap();
    let frame = pipeline.get_output(out, Some(Duration::from_secs(2))).unwrap();
    assert_eq!(frame.metadata().dynamic.exposure.exposure_time_us, 3_000.0);
    assert_eq!(frame.metadata().dynamic.wb_gains.r, 1.5);
    assert_eq!(frame.metadata().control.exposure.exposure_time_us, 3_000.0);
    pipeline.return_output(frame);
    pipeline.stop();
}

#[test]
fn plugin_output_only_reaches_later_frames() {
    let manager = PipelineManager::new(ManagerConfig::default());
    let pipeline = manager.create_pipeline(PipelineConfig::default()).unwrap();
    let sensor = sensor_with_delay(1);

    let cap = pipeline.add_component(ComponentSpec::capture(sensor.source(settings()))).unwrap();
    let isp = pipeline.add_component(ComponentSpec::isp()).unwrap();
    let alg = pipeline
        .add_component(ComponentSpec::control_algorithm(GrayWorldPlugin::default().factory()))
        .unwrap();
    let sc = pipeline.add_component(ComponentSpec::sensor_control(sensor.isc(), 1)).unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(cap, isp, PortType::Image).unwrap();
    pipeline.attach(isp, out, PortType::Image).unwrap();
    pipeline.attach(isp, alg, PortType::Stats).unwrap();
    pipeline.attach(cap, sc, PortType::SensorControl).unwrap();
    pipeline.start().unwrap();

    let mut fed_back = 0;
    for _ in 0..40 {
        let frame = pipeline.get_output(out, Some(Duration::from_secs(2))).unwrap();
        let sequence = frame.sequence();
        let dynamic = &frame.metadata().dynamic;
        if let Some(source) = dynamic.algorithm_source {
            assert!(source < sequence, "frame {sequence} carries settings from frame {source}");
            assert!(dynamic.effective_from <= sequence);
            fed_back += 1;
        }
        pipeline.return_output(frame);
    }
    pipeline.stop();
    assert!(fed_back > 0, "no frame carried control algorithm output");
}
