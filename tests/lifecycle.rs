mod common;

use std::time::Duration;

use common::{sensor, settings, Recorder};
use ipp::{ComponentSpec, ComponentState, EventType, IppError, ManagerConfig, PipelineConfig, PipelineManager, PortType};

#[test]
fn stop_returns_every_buffer_and_restarts() {
    let manager = PipelineManager::new(ManagerConfig::default());
    let events = Recorder::install(&manager);
    let pipeline = manager.create_pipeline(PipelineConfig::default()).unwrap();
    let sensor = sensor();

    let cap = pipeline.add_component(ComponentSpec::capture(sensor.source(settings()))).unwrap();
    let isp = pipeline.add_component(ComponentSpec::isp()).unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(cap, isp, PortType::Image).unwrap();
    pipeline.attach(isp, out, PortType::Image).unwrap();

    for round in 0..2 {
        pipeline.start().unwrap();
        assert!(matches!(pipeline.start(), Err(IppError::AlreadyRunning)));
        for _ in 0..5 {
            let frame = pipeline.get_output(out, Some(Duration::from_secs(2))).unwrap();
            assert_eq!(frame.image().desc().width, 16, "round {round}");
            pipeline.return_output(frame);
        }
        pipeline.stop();
        pipeline.stop();

        for (_, _, state) in pipeline.components() {
            assert_eq!(state, ComponentState::Stopped);
        }
        for pool in pipeline.pool_snapshots() {
            assert_eq!(pool.outstanding, 0, "{} leaked", pool.name);
        }
    }
    assert_eq!(events.count(EventType::BufferLeak), 0);
    assert_eq!(events.count(EventType::ComponentFailure), 0);
    assert!(matches!(pipeline.get_output(out, Some(Duration::from_millis(10))), Err(IppError::NotRunning)));
}

#[test]
fn frames_held_across_stop_are_not_leaks() {
    let manager = PipelineManager::new(ManagerConfig::default());
    let events = Recorder::install(&manager);
    let pipeline = manager.create_pipeline(PipelineConfig::default()).unwrap();
    let sensor = sensor();

    let cap = pipeline.add_component(ComponentSpec::capture(sensor.source(settings()))).unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(cap, out, PortType::Image).unwrap();
    pipeline.start().unwrap();

    let held = pipeline.get_output(out, Some(Duration::from_secs(2))).unwrap();
    pipeline.stop();
    assert_eq!(events.count(EventType::BufferLeak), 0);

    let capture_pool = pipeline
        .pool_snapshots()
        .into_iter()
        .find(|p| p.name.contains("image"))
        .unwrap();
    assert_eq!(capture_pool.outstanding, 1);
    drop(held);
    let capture_pool = pipeline
        .pool_snapshots()
        .into_iter()
        .find(|p| p.name.contains("image"))
        .unwrap();
    assert_eq!(capture_pool.outstanding, 0);
}

#[test]
fn running_components_cannot_be_rewired_or_destroyed() {
    let manager = PipelineManager::new(ManagerConfig::default());
    let pipeline = manager.create_pipeline(PipelineConfig::default()).unwrap();
    let sensor = sensor();

    let cap = pipeline.add_component(ComponentSpec::capture(sensor.source(settings()))).unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(cap, out, PortType::Image).unwrap();
    pipeline.start().unwrap();

    assert!(matches!(pipeline.add_component(ComponentSpec::output()), Err(IppError::AlreadyRunning)));
    assert!(matches!(
        pipeline.destroy_component(out),
        Err(IppError::InvalidState { operation: "destroy", .. })
    ));
    assert_eq!(pipeline.component_state(cap).unwrap(), ComponentState::Running);

    pipeline.stop();
    pipeline.destroy_component(out).unwrap();
    assert!(matches!(pipeline.start(), Err(IppError::GraphIncomplete(_))));
}

#[test]
fn panicking_plugin_is_contained() {
    use ipp::plugin::{ControlPlugin, PluginError, PluginInput};
    use ipp::control::AlgorithmOutput;

    struct Explodes;

    impl ControlPlugin for Explodes {
        fn process_ex(&mut self, _input: &PluginInput<'_>) -> Result<AlgorithmOutput, PluginError> {
            panic!("boom");
        }
    }

    let manager = PipelineManager::new(ManagerConfig::default());
    let events = Recorder::install(&manager);
    let pipeline = manager.create_pipeline(PipelineConfig::default()).unwrap();
    let sensor = sensor();

    let cap = pipeline.add_component(ComponentSpec::capture(sensor.source(settings()))).unwrap();
    let isp = pipeline.add_component(ComponentSpec::isp()).unwrap();
    let alg = pipeline
        .add_component(ComponentSpec::control_algorithm(
            |_: &ipp::StaticProperties| -> Result<Box<dyn ControlPlugin>, PluginError> { Ok(Box::new(Explodes)) },
        ))
        .unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(cap, isp, PortType::Image).unwrap();
    pipeline.attach(isp, out, PortType::Image).unwrap();
    pipeline.attach(isp, alg, PortType::Stats).unwrap();
    pipeline.start().unwrap();

    assert!(common::pump_until(&pipeline, out, Duration::from_secs(3), || {
        events.count(EventType::ControlAlgorithmFailure) >= 3
    }));
    pipeline.stop();
    assert_eq!(events.count(EventType::BufferLeak), 0);
}

#[test]
fn plugin_create_failure_fails_start() {
    use ipp::plugin::{ControlPlugin, PluginError};

    let manager = PipelineManager::new(ManagerConfig::default());
    let pipeline = manager.create_pipeline(PipelineConfig::default()).unwrap();
    let sensor = sensor();

    let cap = pipeline.add_component(ComponentSpec::capture(sensor.source(settings()))).unwrap();
    let isp = pipeline.add_component(ComponentSpec::isp()).unwrap();
    let alg = pipeline
        .add_component(ComponentSpec::control_algorithm(
            |_: &ipp::StaticProperties| -> Result<Box<dyn ControlPlugin>, PluginError> {
                Err(PluginError::Create("no tuning file".into()))
            },
        ))
        .unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(cap, isp, PortType::Image).unwrap();
    pipeline.attach(isp, out, PortType::Image).unwrap();
    pipeline.attach(isp, alg, PortType::Stats).unwrap();

    assert!(matches!(pipeline.start(), Err(IppError::Plugin(_))));
    assert!(!pipeline.is_running());
}

#[test]
fn worker_missing_the_grace_period_stays_stopping_until_it_exits() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use crossbeam::channel::{self, Receiver};
    use ipp::control::AlgorithmOutput;
    use ipp::plugin::{ControlPlugin, PluginError, PluginInput};

    struct Stuck {
        gate: Receiver<()>,
        entered: Arc<AtomicBool>,
    }

    impl ControlPlugin for Stuck {
        fn process_ex(&mut self, _input: &PluginInput<'_>) -> Result<AlgorithmOutput, PluginError> {
            self.entered.store(true, Ordering::Release);
            let _ = self.gate.recv_timeout(Duration::from_secs(10));
            Err(PluginError::Other("released".into()))
        }
    }

    let manager = PipelineManager::new(ManagerConfig::default());
    let events = Recorder::install(&manager);
    let pipeline = manager
        .create_pipeline(PipelineConfig {
            stop_grace_ms: 100,
            ..PipelineConfig::default()
        })
        .unwrap();
    let sensor = sensor();
    let (open, gate) = channel::bounded::<()>(0);
    let entered = Arc::new(AtomicBool::new(false));

    let cap = pipeline.add_component(ComponentSpec::capture(sensor.source(settings()))).unwrap();
    let isp = pipeline.add_component(ComponentSpec::isp()).unwrap();
    let alg = pipeline
        .add_component(ComponentSpec::control_algorithm({
            let entered = Arc::clone(&entered);
            move |_: &ipp::StaticProperties| -> Result<Box<dyn ControlPlugin>, PluginError> {
                Ok(Box::new(Stuck {
                    gate: gate.clone(),
                    entered: Arc::clone(&entered),
                }))
            }
        }))
        .unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(cap, isp, PortType::Image).unwrap();
    pipeline.attach(isp, out, PortType::Image).unwrap();
    pipeline.attach(isp, alg, PortType::Stats).unwrap();
    pipeline.start().unwrap();

    assert!(common::pump_until(&pipeline, out, Duration::from_secs(3), || {
        entered.load(Ordering::Acquire)
    }));
    let started = Instant::now();
    pipeline.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!pipeline.is_running());
    assert_eq!(events.count(EventType::ComponentFailure), 1);

    // The stuck worker is still running: no destroy, no restart.
    assert_eq!(pipeline.component_state(alg).unwrap(), ComponentState::Stopping);
    assert_eq!(pipeline.component_state(cap).unwrap(), ComponentState::Stopped);
    assert!(matches!(
        pipeline.destroy_component(alg),
        Err(IppError::InvalidState { operation: "destroy", .. })
    ));
    assert!(matches!(
        pipeline.start(),
        Err(IppError::InvalidState { operation: "start", .. })
    ));

    drop(open);
    let deadline = Instant::now() + Duration::from_secs(5);
    while pipeline.component_state(alg).unwrap() != ComponentState::Stopped && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(pipeline.component_state(alg).unwrap(), ComponentState::Stopped);
    pipeline.destroy_component(alg).unwrap();
}
