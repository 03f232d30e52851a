//! Hardware seam
//!
//! Everything the coordination layer needs from the register-access and
//! memory layers, behind one trait. The driver never touches registers
//! directly — on silicon a memory-mapped implementation backs this trait;
//! in tests and CI the simulator backend does.

use std::fmt::Debug;
use std::sync::Arc;

use kestrel_chip::regs::{IrqStatus, GP_COUNT};

use crate::error::Result;
use crate::mailbox::FirmwareChannel;
use crate::profiling::ProfilingRing;

/// Snapshot of a core's general-purpose registers, captured for postmortem
/// analysis when the core faults.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreDiagnostics {
    /// GP register values, `gp[kestrel_chip::regs::GP_MAILBOX]` carries the
    /// mailbox hand-off word.
    pub gp: [u32; GP_COUNT],
}

/// Register-access seam for one device's cores.
///
/// Implementations must tolerate concurrent calls for *different* cores;
/// the driver serializes calls for any single core itself.
pub trait CoreBus: Send + Sync + Debug {
    /// Number of physical cores behind this bus.
    fn core_count(&self) -> usize;

    /// Grant the firmware ends of a freshly initialized mailbox to a core.
    ///
    /// On hardware this writes the mailbox descriptor address into the
    /// core's `GP_MAILBOX` register; the firmware picks it up during boot.
    ///
    /// # Errors
    ///
    /// Returns an error if the core index is out of range.
    fn attach_mailbox(&self, core: usize, channel: FirmwareChannel) -> Result<()>;

    /// Load the firmware image and release the core's MCU from boot-wait.
    ///
    /// # Errors
    ///
    /// Returns an error if the firmware cannot be started.
    fn boot_core(&self, core: usize) -> Result<()>;

    /// Ring the core's doorbell: new messages are waiting in the request
    /// queue. Never blocks.
    fn notify(&self, core: usize);

    /// Capture and clear the core's interrupt status. This is the only
    /// call the top-half interrupt handler makes.
    fn read_irq_status(&self, core: usize) -> IrqStatus;

    /// Fully reset one core: stop the MCU, reset the hardware unit, drop
    /// all firmware-held state. Blocking and core-exclusive; other cores
    /// keep running throughout.
    ///
    /// # Errors
    ///
    /// Returns an error if the core does not come back from reset — the
    /// scheduler permanently excludes such a core.
    fn reset_core(&self, core: usize) -> Result<()>;

    /// Snapshot the core's GP registers for postmortem logging.
    fn diagnostics(&self, core: usize) -> CoreDiagnostics;

    /// Grant (or revoke, with `None`) the profiling ring the firmware
    /// should write entries into once the matching reconfiguration message
    /// is acknowledged.
    fn attach_profiling(&self, core: usize, ring: Option<Arc<ProfilingRing>>);
}
