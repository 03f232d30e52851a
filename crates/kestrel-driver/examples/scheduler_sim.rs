//! End-to-end scheduling demo on the simulated firmware
//!
//! Brings up a two-core device, schedules a burst of inferences, injects a
//! hardware fault on core 0 mid-burst, and shows that core 1 keeps
//! serving while core 0 recovers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kestrel_driver::backends::SimBus;
use kestrel_driver::{
    BufferHandle, BufferSpec, Device, DeviceConfig, DeviceRegistry, InferenceStatus,
    NetworkDescriptor,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("kestrel_driver=debug")
        .init();

    println!("🦅 Kestrel scheduler demo (simulated firmware)\n");

    let bus = SimBus::new(2);
    let device = Device::bring_up(DeviceConfig::default(), bus.clone())?;

    let registry = DeviceRegistry::new();
    registry.register(&device);

    // Drive the interrupt path from a background thread, the way the
    // platform integration would from its IRQ worker.
    let stop = Arc::new(AtomicBool::new(false));
    let pump = {
        let bus = bus.clone();
        let device = device.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                bus.service_all();
                device.service();
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    };

    while !device.is_ready() {
        std::thread::sleep(Duration::from_millis(1));
    }
    println!("✅ Device ready: {} core(s)", device.core_count());
    if let Some(caps) = device.capabilities() {
        println!("   Capabilities: {}", String::from_utf8_lossy(&caps));
    }

    let network = device.register_network(NetworkDescriptor {
        inputs: vec![BufferSpec { id: 0, size: 1024 }],
        outputs: vec![BufferSpec { id: 1, size: 256 }],
        buffer_table: 0x6000_0000,
    })?;

    println!("\n📤 Scheduling 8 inferences...");
    let inferences: Vec<_> = (0..8)
        .map(|i| {
            device.schedule_inference(
                &network,
                vec![BufferHandle {
                    address: 0x1_0000 + i * 0x1000,
                    size: 1024,
                }],
                vec![BufferHandle {
                    address: 0x8_0000 + i * 0x1000,
                    size: 256,
                }],
            )
        })
        .collect::<Result<_, _>>()?;

    println!("💥 Injecting hardware fault on core 0");
    bus.inject_fault(0);

    for (i, inference) in inferences.iter().enumerate() {
        let status = inference.wait_timeout(Duration::from_secs(2))?;
        let mark = if status == InferenceStatus::Completed {
            "✅"
        } else {
            "❌"
        };
        println!(
            "{mark} inference {i}: {:?} on core {:?}",
            status,
            inference.assigned_core()
        );
    }

    stop.store(true, Ordering::Relaxed);
    pump.join().expect("pump thread");

    let counters = device.counters();
    println!("\n📊 Counters: {counters:?}");
    println!("✅ Demo complete");

    Ok(())
}
