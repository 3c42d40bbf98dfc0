//! Demo: simulated sensor -> capture -> ISP -> output with a gray-world 3A loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ipp::capture::SimulatedSensor;
use ipp::plugin::GrayWorldPlugin;
use ipp::{ComponentSpec, Config, Event, PipelineManager, PortType, Severity};

const FRAMES: u64 = 90;

fn main() -> Result<()> {
    color_eyre::install()?;

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.manager.log_filter))
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("IPP demo launching...");

    let sensor = SimulatedSensor::with_settings_delay(
        config.sensor.attributes(config.capture.frame_rate),
        config.sensor.settings_delay,
    );
    let manager = PipelineManager::new(config.manager.clone());
    // The dispatcher already logs every event; the demo only tallies faults.
    let faults = Arc::new(AtomicU64::new(0));
    let tally = Arc::clone(&faults);
    manager.register_event_handler(move |event: &Event| {
        if event.severity() >= Severity::Warning {
            tally.fetch_add(1, Ordering::Relaxed);
        }
    });

    let pipeline = manager.create_pipeline(config.pipeline.clone())?;
    let capture = pipeline.add_component(ComponentSpec::capture(sensor.source(config.capture.clone())))?;
    let isp = pipeline.add_component(ComponentSpec::isp())?;
    let control = pipeline.add_component(ComponentSpec::control_algorithm(GrayWorldPlugin::default().factory()))?;
    let sensor_control = pipeline.add_component(ComponentSpec::sensor_control(sensor.isc(), config.sensor.settings_delay))?;
    let output = pipeline.add_component(ComponentSpec::output())?;

    pipeline.attach(capture, isp, PortType::Image)?;
    pipeline.attach(isp, output, PortType::Image)?;
    pipeline.attach(isp, control, PortType::Stats)?;
    pipeline.attach(capture, sensor_control, PortType::SensorControl)?;

    let statics = pipeline.get_static_properties()?;
    info!(
        sensor = %statics.sensor.name,
        width = statics.active_array.width,
        height = statics.active_array.height,
        settings_delay = statics.settings_delay,
        "Static properties"
    );

    pipeline.start()?;
    let trigger = pipeline.config().capture_mode == ipp::CaptureMode::Trigger;

    for _ in 0..FRAMES {
        if trigger {
            pipeline.single_capture()?;
        }
        let frame = pipeline.get_output(output, Some(Duration::from_secs(1)))?;
        let meta = frame.metadata();
        let blob = frame.metadata_blob()?;
        info!(
            sequence = frame.sequence(),
            exposure_us = meta.dynamic.exposure.exposure_time_us,
            gain = meta.dynamic.exposure.analog_gain,
            wb_r = meta.dynamic.wb_gains.r,
            wb_b = meta.dynamic.wb_gains.b,
            ae = ?meta.dynamic.ae_state,
            metadata_bytes = blob.as_bytes().len(),
            "Frame"
        );
        pipeline.return_output(frame);
    }

    pipeline.stop();
    for pool in pipeline.pool_snapshots() {
        info!(
            pool = %pool.name,
            acquired = pool.acquired,
            timeouts = pool.timeouts,
            "Pool"
        );
    }
    let faults = faults.load(Ordering::Relaxed);
    if faults > 0 {
        warn!(faults, "Faults reported during the run");
    }
    manager.shutdown();
    info!("IPP demo shutting down");
    Ok(())
}
