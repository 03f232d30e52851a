//! Per-core state
//!
//! One `NpuCore` per physical accelerator unit. Each core owns its mailbox
//! and at most one in-flight inference; everything mutable sits behind the
//! core's own mutex so cores never contend with each other. The pending
//! FIFO lock (device-level) is always released before this lock is taken,
//! and this lock is always released before any blocking hardware call.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use kestrel_chip::fw::RegionId;
use kestrel_chip::regs::IrqStatus;
use parking_lot::Mutex;

use crate::inference::Inference;
use crate::mailbox::Mailbox;
use crate::profiling::ProfilingState;

/// Scheduling health of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreHealth {
    /// Normal operation; schedulable once bring-up completes.
    Ready,
    /// Fault recovery is reinitializing this core; not schedulable.
    Resetting,
    /// The core failed its own reset and is permanently excluded from
    /// scheduling for the life of the device.
    Failed,
}

/// Mutable state of one core, guarded by [`NpuCore::state`].
#[derive(Debug)]
pub(crate) struct CoreState {
    /// Host ends of the core's message queues. Replaced wholesale when the
    /// core is reset.
    pub mailbox: Mailbox,
    /// The one inference this core is executing, if any.
    pub current: Option<Arc<Inference>>,
    /// Scheduling health.
    pub health: CoreHealth,
    /// Which memory regions the firmware has acknowledged.
    pub regions_configured: [bool; RegionId::ALL.len()],
    /// Capability blob from the firmware, stored verbatim. `None` until
    /// the firmware replies — callers must not see caps before then.
    pub caps: Option<Bytes>,
    /// Staged/committed profiling state.
    pub profiling: ProfilingState,
}

impl CoreState {
    pub(crate) fn new(mailbox: Mailbox) -> Self {
        Self {
            mailbox,
            current: None,
            health: CoreHealth::Ready,
            regions_configured: [false; RegionId::ALL.len()],
            caps: None,
            profiling: ProfilingState::default(),
        }
    }

    /// All bring-up acknowledgements received.
    pub(crate) fn is_configured(&self) -> bool {
        self.regions_configured.iter().all(|&c| c) && self.caps.is_some()
    }
}

/// One physical accelerator core.
#[derive(Debug)]
pub struct NpuCore {
    id: usize,
    pub(crate) state: Mutex<CoreState>,
    /// IRQ bits captured by the top half, consumed by the deferred worker.
    irq_pending: AtomicU32,
    pongs: AtomicU64,
    faults_recovered: AtomicU64,
}

impl NpuCore {
    pub(crate) fn new(id: usize, mailbox: Mailbox) -> Self {
        Self {
            id,
            state: Mutex::new(CoreState::new(mailbox)),
            irq_pending: AtomicU32::new(0),
            pongs: AtomicU64::new(0),
            faults_recovered: AtomicU64::new(0),
        }
    }

    /// Core id, stable for the life of the device.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Whether bring-up finished and the core is schedulable.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.health == CoreHealth::Ready && state.is_configured()
    }

    /// Whether the core is ready and has no inference in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.health == CoreHealth::Ready && state.is_configured() && state.current.is_none()
    }

    /// Scheduling health.
    #[must_use]
    pub fn health(&self) -> CoreHealth {
        self.state.lock().health
    }

    /// Capability blob, verbatim as the firmware sent it. `None` until the
    /// firmware has replied to the bring-up request.
    #[must_use]
    pub fn capabilities(&self) -> Option<Bytes> {
        self.state.lock().caps.clone()
    }

    /// Liveness: pongs received from this core's firmware.
    #[must_use]
    pub fn pongs_received(&self) -> u64 {
        self.pongs.load(Ordering::Relaxed)
    }

    /// Hardware faults recovered on this core.
    #[must_use]
    pub fn faults_recovered(&self) -> u64 {
        self.faults_recovered.load(Ordering::Relaxed)
    }

    /// Mailbox message counters: `(sent, received)`.
    #[must_use]
    pub fn message_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (
            state.mailbox.messages_sent(),
            state.mailbox.messages_received(),
        )
    }

    /// Top half: merge freshly captured IRQ bits into the pending word.
    pub(crate) fn accumulate_irq(&self, status: IrqStatus) {
        self.irq_pending.fetch_or(status.0, Ordering::AcqRel);
    }

    /// Deferred worker: take and clear the pending IRQ bits.
    pub(crate) fn take_irq(&self) -> IrqStatus {
        IrqStatus(self.irq_pending.swap(0, Ordering::AcqRel))
    }

    pub(crate) fn record_pong(&self) {
        self.pongs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault_recovered(&self) {
        self.faults_recovered.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_chip::fw::LogSeverity;
    use kestrel_chip::regs::irq;

    fn core() -> NpuCore {
        let (mailbox, _fw) = Mailbox::new(256, LogSeverity::Info).unwrap();
        NpuCore::new(0, mailbox)
    }

    #[test]
    fn not_ready_until_configured() {
        let core = core();
        assert!(!core.is_ready());

        let mut state = core.state.lock();
        state.regions_configured = [true; RegionId::ALL.len()];
        state.caps = Some(Bytes::from_static(b"caps"));
        drop(state);

        assert!(core.is_ready());
        assert!(core.is_idle());
    }

    #[test]
    fn irq_bits_accumulate_and_clear() {
        let core = core();
        core.accumulate_irq(IrqStatus(irq::JOB));
        core.accumulate_irq(IrqStatus(irq::ERROR_RECOVERABLE));

        let taken = core.take_irq();
        assert!(taken.has_job());
        assert!(taken.has_error());
        assert!(core.take_irq().is_empty());
    }
}
