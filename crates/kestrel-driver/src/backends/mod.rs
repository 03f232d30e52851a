//! Bus backends
//!
//! Implementations of the [`crate::bus::CoreBus`] seam. Only the simulator
//! ships in this crate: the memory-mapped silicon backend lives with the
//! platform integration, while the simulator makes the full coordination
//! stack runnable in CI and on developer machines with no hardware.

pub mod sim;

pub use sim::SimBus;
