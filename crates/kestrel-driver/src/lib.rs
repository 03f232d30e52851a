//! Host-side coordination layer for the Kestrel KN200 multi-core NPU.
//!
//! This crate schedules inference work across physical cores and exchanges
//! asynchronous messages with the firmware running on each of them, over
//! shared-memory ring buffers. It is deliberately hardware-agnostic: every
//! register touch goes through the [`CoreBus`] trait, and the crate ships a
//! firmware simulator backend so the full stack runs without silicon.
//!
//! # Architecture
//!
//! ```text
//! caller threads                     interrupt path
//!      │                                  │
//!      ▼                                  ▼
//! Device::schedule_inference     Device::handle_interrupt (top half)
//!      │                                  │
//!      ▼                                  ▼
//!  pending FIFO ──► idle core ──►  Device::process_events (deferred)
//!      │              │                   │
//!      │         Mailbox::send       drain mailbox ──► dispatch
//!      │              │                   │
//!      │              ▼                   ├── completions ──► wake waiters
//!      │         ring buffers             └── error bits ──► fault recovery
//!      ▼              ▲
//!   Inference ◄───────┘ firmware (per core)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use kestrel_driver::backends::SimBus;
//! use kestrel_driver::{
//!     BufferHandle, BufferSpec, Device, DeviceConfig, NetworkDescriptor,
//! };
//!
//! # fn main() -> kestrel_driver::Result<()> {
//! let bus = SimBus::new(2);
//! let device = Device::bring_up(DeviceConfig::default(), bus.clone())?;
//!
//! // Let the simulated firmware answer bring-up, then dispatch.
//! bus.service_all();
//! device.service();
//!
//! let network = device.register_network(NetworkDescriptor {
//!     inputs: vec![BufferSpec { id: 0, size: 1024 }],
//!     outputs: vec![BufferSpec { id: 1, size: 256 }],
//!     buffer_table: 0x6000_0000,
//! })?;
//!
//! let inference = device.schedule_inference(
//!     &network,
//!     vec![BufferHandle { address: 0x1_0000, size: 1024 }],
//!     vec![BufferHandle { address: 0x2_0000, size: 256 }],
//! )?;
//!
//! bus.service_all();
//! device.service();
//! println!("{:?}", inference.status());
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency model
//!
//! Multiple caller threads may create, cancel, poll, and wait on
//! inferences concurrently with the interrupt path. Three locks exist: the
//! pending FIFO, one mutex per core, and the in-flight token table. The
//! acquisition order is fixed (FIFO released before any core lock; token
//! table is a leaf) and no lock is ever held across a blocking hardware
//! call, which rules out lock-ordering deadlocks and priority inversion
//! across cores by construction.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

pub mod backends;
mod bus;
mod config;
mod core;
mod device;
mod dispatch;
mod error;
mod inference;
mod mailbox;
mod network;
mod profiling;
mod queue;
mod recovery;
mod registry;
mod scheduler;

pub use bus::{CoreBus, CoreDiagnostics};
pub use config::{DeviceConfig, ProfilingConfig, MIN_QUEUE_CAPACITY};
pub use self::core::{CoreHealth, NpuCore};
pub use device::{Device, DeviceCounters};
pub use error::{KestrelError, Result};
pub use inference::{Inference, InferenceStatus};
pub use mailbox::{FirmwareChannel, Mailbox, ReceivedMessage};
pub use network::{BufferHandle, BufferSpec, Network, NetworkDescriptor};
pub use profiling::{ProfilingCursor, ProfilingDrain, ProfilingRing};
pub use queue::{MessageQueue, QueueReader, QueueWriter};
pub use registry::DeviceRegistry;

/// Re-export of the silicon model this driver is built against.
pub use kestrel_chip as chip;

/// Commonly used types.
pub mod prelude {
    pub use crate::backends::SimBus;
    pub use crate::{
        BufferHandle, BufferSpec, CoreBus, Device, DeviceConfig, DeviceRegistry, Inference,
        InferenceStatus, KestrelError, Network, NetworkDescriptor, Result,
    };
}
