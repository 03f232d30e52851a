//! Scheduling tests: FIFO order, validation, cancellation, mutual
//! exclusion, transmit failure, and liveness under a concurrent pump.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kestrel_driver::backends::SimBus;
use kestrel_driver::chip::fw::ResponseStatus;
use kestrel_driver::{
    BufferHandle, BufferSpec, Device, DeviceConfig, InferenceStatus, KestrelError, Network,
    NetworkDescriptor,
};

fn bring_up(cores: usize) -> (Arc<SimBus>, Arc<Device>) {
    let bus = SimBus::new(cores);
    let device = Device::bring_up(DeviceConfig::default(), bus.clone()).expect("bring up");
    bus.service_all();
    device.service();
    assert!(device.is_ready());
    (bus, device)
}

fn test_network(device: &Device) -> Arc<Network> {
    device
        .register_network(NetworkDescriptor {
            inputs: vec![BufferSpec { id: 0, size: 1024 }],
            outputs: vec![BufferSpec { id: 1, size: 256 }],
            buffer_table: 0x6000_0000,
        })
        .unwrap()
}

fn buffers() -> (Vec<BufferHandle>, Vec<BufferHandle>) {
    (
        vec![BufferHandle {
            address: 0x1_0000,
            size: 1024,
        }],
        vec![BufferHandle {
            address: 0x2_0000,
            size: 256,
        }],
    )
}

#[test]
fn single_inference_runs_to_completion() {
    let (bus, device) = bring_up(1);
    let network = test_network(&device);
    let (inputs, outputs) = buffers();

    let inference = device
        .schedule_inference(&network, inputs, outputs)
        .unwrap();
    assert_eq!(inference.status(), InferenceStatus::Running);

    bus.service_all();
    device.service();

    assert_eq!(inference.status(), InferenceStatus::Completed);
    assert_eq!(inference.assigned_core(), Some(0));
    assert_eq!(device.pending_count(), 0);
}

#[test]
fn buffer_mismatch_fails_synchronously_and_queues_nothing() {
    let (_bus, device) = bring_up(1);
    let network = test_network(&device);

    // Wrong input count.
    let (_, outputs) = buffers();
    let err = device
        .schedule_inference(&network, vec![], outputs)
        .unwrap_err();
    assert!(matches!(err, KestrelError::Validation { .. }));

    // Undersized output buffer.
    let (inputs, _) = buffers();
    let err = device
        .schedule_inference(
            &network,
            inputs,
            vec![BufferHandle {
                address: 0x2_0000,
                size: 16,
            }],
        )
        .unwrap_err();
    assert!(matches!(err, KestrelError::Validation { .. }));

    assert_eq!(device.pending_count(), 0);
}

#[test]
fn strict_fifo_on_a_single_core() {
    // Spec worked example: 3 inferences, 1 core. #1 dispatches
    // immediately; #2 and #3 stay scheduled; after #1 finishes, #2
    // dispatches next — never #3.
    let (bus, device) = bring_up(1);
    bus.set_auto_complete(0, false);
    let network = test_network(&device);

    let schedule = || {
        let (inputs, outputs) = buffers();
        device.schedule_inference(&network, inputs, outputs).unwrap()
    };
    let first = schedule();
    let second = schedule();
    let third = schedule();

    assert_eq!(first.status(), InferenceStatus::Running);
    assert_eq!(second.status(), InferenceStatus::Scheduled);
    assert_eq!(third.status(), InferenceStatus::Scheduled);
    assert_eq!(device.pending_count(), 2);

    bus.service_all();
    assert!(bus.complete_next(0, ResponseStatus::Ok));
    device.service();

    assert_eq!(first.status(), InferenceStatus::Completed);
    assert_eq!(second.status(), InferenceStatus::Running);
    assert_eq!(third.status(), InferenceStatus::Scheduled);

    bus.service_all();
    assert!(bus.complete_next(0, ResponseStatus::Ok));
    device.service();

    assert_eq!(second.status(), InferenceStatus::Completed);
    assert_eq!(third.status(), InferenceStatus::Running);
}

#[test]
fn at_most_one_inference_per_core() {
    let (bus, device) = bring_up(2);
    bus.set_auto_complete(0, false);
    bus.set_auto_complete(1, false);
    let network = test_network(&device);

    let inferences: Vec<_> = (0..5)
        .map(|_| {
            let (inputs, outputs) = buffers();
            device.schedule_inference(&network, inputs, outputs).unwrap()
        })
        .collect();
    bus.service_all();

    let running: Vec<usize> = inferences
        .iter()
        .filter(|inference| inference.status() == InferenceStatus::Running)
        .map(|inference| inference.assigned_core().unwrap())
        .collect();

    assert_eq!(running.len(), 2, "exactly one running inference per core");
    assert!(running.contains(&0) && running.contains(&1));
    assert_eq!(bus.parked_count(0), 1);
    assert_eq!(bus.parked_count(1), 1);
    assert_eq!(device.pending_count(), 3);
}

#[test]
fn cancelling_scheduled_inference_sends_no_message() {
    let (bus, device) = bring_up(1);
    bus.set_auto_complete(0, false);
    let network = test_network(&device);

    let (inputs, outputs) = buffers();
    let running = device.schedule_inference(&network, inputs, outputs).unwrap();
    let (inputs, outputs) = buffers();
    let queued = device.schedule_inference(&network, inputs, outputs).unwrap();
    assert_eq!(queued.status(), InferenceStatus::Scheduled);

    device.cancel(&queued).unwrap();
    assert_eq!(queued.status(), InferenceStatus::Error);
    assert_eq!(device.pending_count(), 0);

    // Finish the running one; the cancelled one must never reach the
    // firmware.
    bus.service_all();
    bus.complete_next(0, ResponseStatus::Ok);
    device.service();
    bus.service_all();

    assert_eq!(running.status(), InferenceStatus::Completed);
    assert_eq!(bus.inference_requests_seen(0), 1);
}

#[test]
fn cancelling_running_inference_resets_its_core() {
    let (bus, device) = bring_up(1);
    bus.set_auto_complete(0, false);
    let network = test_network(&device);

    let (inputs, outputs) = buffers();
    let inference = device.schedule_inference(&network, inputs, outputs).unwrap();
    bus.service_all();
    assert_eq!(inference.status(), InferenceStatus::Running);

    device.cancel(&inference).unwrap();
    assert_eq!(inference.status(), InferenceStatus::Error);

    // The core comes back through the normal bring-up handshake and keeps
    // serving.
    bus.set_auto_complete(0, true);
    bus.service_all();
    device.service();
    assert!(device.is_ready());

    let (inputs, outputs) = buffers();
    let next = device.schedule_inference(&network, inputs, outputs).unwrap();
    bus.service_all();
    device.service();
    assert_eq!(next.status(), InferenceStatus::Completed);
}

#[test]
fn transmit_failure_fails_inference_and_frees_the_core() {
    let config = DeviceConfig {
        queue_capacity: 128,
        ..DeviceConfig::default()
    };
    let bus = SimBus::new(1);
    let device = Device::bring_up(config, bus.clone()).expect("bring up");
    bus.service_all();
    device.service();
    assert!(device.is_ready());

    // Stop the firmware from draining, then stuff the request queue until
    // an inference request (24 bytes) can no longer fit.
    bus.set_silent(0, true);
    for _ in 0..15 {
        device.ping(0).unwrap();
    }

    let network = test_network(&device);
    let (inputs, outputs) = buffers();
    let first = device.schedule_inference(&network, inputs, outputs).unwrap();
    assert_eq!(first.status(), InferenceStatus::Error);
    assert_eq!(first.wait(), InferenceStatus::Error);

    // The scheduler moved on instead of blocking on a retry, and the core
    // holds no stale binding.
    let (inputs, outputs) = buffers();
    let second = device.schedule_inference(&network, inputs, outputs).unwrap();
    assert_eq!(second.status(), InferenceStatus::Error);
    assert_eq!(device.pending_count(), 0);
    assert!(device.core(0).unwrap().is_idle());
}

#[test]
fn all_inferences_complete_under_concurrent_pump() {
    let (bus, device) = bring_up(2);
    let network = test_network(&device);

    let stop = Arc::new(AtomicBool::new(false));
    let pump = {
        let bus = bus.clone();
        let device = device.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                bus.service_all();
                device.service();
                std::thread::yield_now();
            }
        })
    };

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let device = device.clone();
            let network = network.clone();
            std::thread::spawn(move || {
                for _ in 0..10 {
                    let (inputs, outputs) = buffers();
                    let inference = device
                        .schedule_inference(&network, inputs, outputs)
                        .unwrap();
                    let status = inference
                        .wait_timeout(Duration::from_secs(5))
                        .expect("inference should finish with an always-available core");
                    assert_eq!(status, InferenceStatus::Completed);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    pump.join().unwrap();

    assert_eq!(device.pending_count(), 0);
    assert_eq!(device.counters().protocol_violations, 0);
}
