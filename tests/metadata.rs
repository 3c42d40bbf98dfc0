mod common;

use std::time::Duration;

use common::{sensor, settings};
use ipp::{ComponentSpec, IppError, ManagerConfig, MetadataBlob, MetadataKind, PipelineConfig, PipelineManager, PortType};

#[test]
fn output_metadata_round_trips_through_the_accessor() {
    let manager = PipelineManager::new(ManagerConfig::default());
    let pipeline = manager.create_pipeline(PipelineConfig::default()).unwrap();
    let sensor = sensor();

    let cap = pipeline.add_component(ComponentSpec::capture(sensor.source(settings()))).unwrap();
    let isp = pipeline.add_component(ComponentSpec::isp()).unwrap();
    let out = pipeline.add_component(ComponentSpec::output()).unwrap();
    pipeline.attach(cap, isp, PortType::Image).unwrap();
    pipeline.attach(isp, out, PortType::Image).unwrap();
    pipeline.start().unwrap();

    let frame = pipeline.get_output(out, Some(Duration::from_secs(2))).unwrap();
    let blob = frame.metadata_blob().unwrap();

    for kind in MetadataKind::ALL {
        assert!(blob.contains(kind), "{kind:?} missing");
        let size = blob.get_size(kind).unwrap();
        let mut copy = vec![0u8; size];
        assert_eq!(blob.get(kind, &mut copy).unwrap(), size);
        assert_eq!(blob.get_address(kind).unwrap(), copy.as_slice());

        let mut short = vec![0u8; size.saturating_sub(1)];
        if size > 0 {
            assert!(matches!(blob.get(kind, &mut short), Err(IppError::BufferTooSmall { .. })));
        }
    }

    assert_eq!(&blob.decode().unwrap(), frame.metadata());
    assert_eq!(blob.image_info().unwrap().sequence, frame.sequence());
    assert_eq!(blob.image_info().unwrap().width, frame.image().desc().width);
    assert_eq!(
        blob.get_address(MetadataKind::EmbeddedDataTop).unwrap(),
        frame.metadata().embedded_top.as_slice()
    );

    // Survives a trip through raw bytes.
    let reparsed = MetadataBlob::from_bytes(blob.clone().into_bytes()).unwrap();
    assert_eq!(reparsed.dynamic_properties().unwrap(), frame.metadata().dynamic);

    pipeline.return_output(frame);
    pipeline.stop();
}
