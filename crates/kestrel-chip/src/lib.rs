//! Silicon model for the Kestrel KN200 multi-core NPU.
//!
//! This crate has **no dependencies** and **no hardware access** — it is a
//! pure model of the silicon-facing contracts: the per-core register window,
//! interrupt bits, and the mailbox wire format the host exchanges with the
//! control-unit firmware.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | Per-core register window — offsets, IRQ bits, GP registers |
//! | [`fw`] | Host↔firmware interface — message types, header, payloads, ring layout |
//!
//! Everything in [`fw`] is ABI: the firmware binary is built against the
//! same definitions, so message type codes and payload layouts must not be
//! reordered or resized without a firmware version bump.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod fw;
pub mod regs;

pub use fw::{
    ErrorReport, InferenceRequest, InferenceResponse, LogSeverity, MessageHeader, MessageType,
    ProfilingConfigPayload, ProfilingEntry, RegionId, RegionRequest, RegionResponse,
    ResponseStatus, HEADER_SIZE, MAX_HW_COUNTERS, QUEUE_ALIGN,
};
pub use regs::IrqStatus;
