//! Fault recovery
//!
//! A hardware-error interrupt is scoped to one core. Recovery captures the
//! core's GP registers for postmortem, reinitializes the core completely
//! (reset, fresh mailbox, firmware boot, region grants, profiling
//! restore), fails the core's in-flight inference, and resumes serving the
//! pending queue. Other cores keep running throughout.
//!
//! A core that fails its own reset is marked [`CoreHealth::Failed`] and
//! permanently excluded from scheduling for the life of the device; the
//! remaining cores carry the load.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use kestrel_chip::regs::IrqStatus;
use tracing::{error, info, warn};

use crate::core::{CoreHealth, NpuCore};
use crate::device::Device;
use crate::error::Result;
use crate::inference::InferenceStatus;
use crate::mailbox::Mailbox;

impl Device {
    /// Recover a core after an error interrupt.
    pub(crate) fn recover_core(&self, core: &Arc<NpuCore>, status: IrqStatus) {
        self.counters
            .faults_recovered
            .fetch_add(1, Ordering::Relaxed);
        core.record_fault_recovered();

        warn!(
            "Hardware fault on core {}. irq_status={:#010x}",
            core.id(),
            status.0
        );
        self.dump_diagnostics(core);

        self.reset_and_resume(core, "error interrupt");
    }

    /// Snapshot and log the core's GP registers before they are wiped by
    /// the reset.
    fn dump_diagnostics(&self, core: &Arc<NpuCore>) {
        let diagnostics = self.bus().diagnostics(core.id());
        for (index, value) in diagnostics.gp.iter().enumerate() {
            info!("core {} GP{index}={value:#010x}", core.id());
        }
    }

    /// Reset a core, fail its in-flight inference, and resume scheduling.
    ///
    /// Shared by fault recovery and running-inference cancellation (there
    /// is no graceful abort — a running inference dies with its core).
    pub(crate) fn reset_and_resume(&self, core: &Arc<NpuCore>, reason: &str) {
        warn!("Reset core {} due to {reason}", core.id());

        // Take the in-flight inference and gate the scheduler off this
        // core, then release the lock: the reset below blocks, and no
        // per-core lock may be held across a blocking hardware call.
        let current = {
            let mut state = core.state.lock();
            state.health = CoreHealth::Resetting;
            state.current.take()
        };

        match self.reinit_core(core) {
            Ok(()) => {
                core.state.lock().health = CoreHealth::Ready;
                info!("Core {} reinitialized", core.id());
            }
            Err(e) => {
                self.counters.resets_failed.fetch_add(1, Ordering::Relaxed);
                core.state.lock().health = CoreHealth::Failed;
                error!(
                    "Core {} failed its reset and is excluded from scheduling: {e}",
                    core.id()
                );
            }
        }

        // The in-flight inference dies with the fault, exactly once, and
        // its waiters wake now.
        if let Some(inference) = current {
            self.inflight.lock().remove(&inference.token());
            inference.complete(InferenceStatus::Error);
        }

        // Other cores were untouched; serve whatever is queued.
        self.schedule_pending();
    }

    /// Fully reinitialize one core: hardware reset, fresh mailbox, boot,
    /// and the bring-up message sequence. The same path bring-up uses,
    /// minus core creation.
    fn reinit_core(&self, core: &Arc<NpuCore>) -> Result<()> {
        // Blocking, core-exclusive. No locks held.
        self.bus().reset_core(core.id())?;

        let (mailbox, firmware) = Mailbox::new(
            self.config().queue_capacity,
            self.config().log_severity,
        )?;
        self.bus().attach_mailbox(core.id(), firmware)?;
        self.bus().boot_core(core.id())?;

        {
            let mut state = core.state.lock();
            state.mailbox = mailbox;
            state.regions_configured = Default::default();
            state.caps = None;
            // The firmware restarted: any staged or active profiling ring
            // is stale. The committed config survives and is re-announced
            // below.
            state.profiling.abandon_pending();
            state.profiling.active = None;
        }
        self.bus().attach_profiling(core.id(), None);

        self.send_bringup(core)
    }
}
