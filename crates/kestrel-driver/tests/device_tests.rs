//! Device-level tests: bring-up, registry, liveness counters, and the
//! staged profiling swap.

use std::sync::Arc;

use kestrel_driver::backends::SimBus;
use kestrel_driver::{
    BufferHandle, BufferSpec, Device, DeviceConfig, DeviceRegistry, InferenceStatus,
    KestrelError, NetworkDescriptor, ProfilingConfig, ProfilingCursor,
};

fn bring_up(cores: usize) -> (Arc<SimBus>, Arc<Device>) {
    let bus = SimBus::new(cores);
    let device = Device::bring_up(DeviceConfig::default(), bus.clone()).expect("bring up");
    bus.service_all();
    device.service();
    (bus, device)
}

#[test]
fn bring_up_configures_every_core() {
    let (_bus, device) = bring_up(3);

    assert!(device.is_ready());
    assert_eq!(device.core_count(), 3);
    for core in device.cores() {
        assert!(core.is_ready());
        assert!(core.is_idle());
        assert_eq!(core.pongs_received(), 1);
        // Capability blob stored verbatim.
        let caps = core.capabilities().expect("caps after bring-up");
        assert!(caps.starts_with(b"KN200-sim"));
    }
    assert!(device.capabilities().is_some());
}

#[test]
fn capabilities_absent_before_firmware_replies() {
    let bus = SimBus::new(1);
    let device = Device::bring_up(DeviceConfig::default(), bus.clone()).expect("bring up");

    // Firmware has not answered yet.
    assert!(device.capabilities().is_none());
    assert!(!device.is_ready());

    bus.service_all();
    device.service();
    assert!(device.capabilities().is_some());
}

#[test]
fn invalid_config_is_rejected_at_bring_up() {
    let bus = SimBus::new(1);
    let config = DeviceConfig {
        queue_capacity: 100,
        ..DeviceConfig::default()
    };
    assert!(matches!(
        Device::bring_up(config, bus),
        Err(KestrelError::Config { .. })
    ));

    let empty_bus = SimBus::new(0);
    assert!(Device::bring_up(DeviceConfig::default(), empty_bus).is_err());
}

#[test]
fn registry_tracks_most_recent_live_device() {
    let registry = DeviceRegistry::new();
    assert!(registry.most_recent().is_none());

    let (_bus_a, device_a) = bring_up(1);
    registry.register(&device_a);

    let (_bus_b, device_b) = bring_up(1);
    registry.register(&device_b);

    assert!(Arc::ptr_eq(&registry.most_recent().unwrap(), &device_b));
    assert_eq!(registry.devices().len(), 2);

    drop(device_b);
    assert!(Arc::ptr_eq(&registry.most_recent().unwrap(), &device_a));
    assert_eq!(registry.devices().len(), 1);
}

#[test]
fn ping_counts_pongs_per_core() {
    let (bus, device) = bring_up(2);

    device.ping(1).unwrap();
    device.ping(1).unwrap();
    bus.service_all();
    device.service();

    assert_eq!(device.core(0).unwrap().pongs_received(), 1); // bring-up only
    assert_eq!(device.core(1).unwrap().pongs_received(), 3);
}

#[test]
fn profiling_swap_commits_only_on_ack() {
    let (bus, device) = bring_up(1);

    let config = ProfilingConfig {
        enabled: true,
        buffer_entries: 16,
        hw_counters: vec![2, 5],
    };
    device.configure_profiling(0, config).unwrap();

    // Announced but not acknowledged: nothing committed yet.
    assert!(device.profiling_ring(0).unwrap().is_none());

    // A second reconfiguration is refused while the ack is outstanding.
    let again = ProfilingConfig {
        enabled: false,
        ..ProfilingConfig::default()
    };
    assert!(matches!(
        device.configure_profiling(0, again),
        Err(KestrelError::InvalidState { .. })
    ));

    bus.service_all();
    device.service();

    let ring = device.profiling_ring(0).unwrap().expect("committed ring");
    assert_eq!(ring.capacity(), 16);
    let fw_config = bus.profiling_config(0).expect("firmware saw the config");
    assert_eq!(fw_config.enabled, 1);
    assert_eq!(fw_config.num_hw_counters, 2);
}

#[test]
fn profiling_ring_records_inference_entries() {
    let (bus, device) = bring_up(1);

    device
        .configure_profiling(
            0,
            ProfilingConfig {
                enabled: true,
                buffer_entries: 8,
                hw_counters: vec![],
            },
        )
        .unwrap();
    bus.service_all();
    device.service();

    let network = device
        .register_network(NetworkDescriptor {
            inputs: vec![BufferSpec { id: 0, size: 64 }],
            outputs: vec![BufferSpec { id: 1, size: 64 }],
            buffer_table: 0x6000_0000,
        })
        .unwrap();
    let buffer = BufferHandle {
        address: 0x1_0000,
        size: 64,
    };
    let inference = device
        .schedule_inference(&network, vec![buffer], vec![buffer])
        .unwrap();
    bus.service_all();
    device.service();
    assert_eq!(inference.status(), InferenceStatus::Completed);

    let ring = device.profiling_ring(0).unwrap().expect("active ring");
    let mut cursor = ProfilingCursor::new();
    let drained = ring.drain(&mut cursor);
    assert_eq!(drained.lost, 0);
    // Begin + end entries for the one inference.
    assert_eq!(drained.entries.len(), 2);
    assert_eq!(drained.entries[0].kind, 0);
    assert_eq!(drained.entries[1].kind, 1);
    assert!(drained.entries[0].timestamp < drained.entries[1].timestamp);
}

#[test]
fn message_counters_advance_with_traffic() {
    let (bus, device) = bring_up(1);
    let core = device.core(0).unwrap();

    // Bring-up: 3 region requests + ping + caps request out,
    // 3 region acks + pong + caps blob in.
    let (sent, received) = core.message_counts();
    assert_eq!(sent, 5);
    assert_eq!(received, 5);

    device.ping(0).unwrap();
    bus.service_all();
    device.service();

    let (sent_after, received_after) = core.message_counts();
    assert_eq!(sent_after, 6);
    assert_eq!(received_after, 6);
}
