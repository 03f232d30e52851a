//! Device bring-up and interrupt plumbing
//!
//! The `Device` owns every core, the pending-inference FIFO, the token
//! table that maps in-flight completions back to their `Inference`
//! objects, and the diagnostic counters the telemetry layer reads.
//!
//! Interrupt handling is split the way the kernel driver splits it: a
//! minimal top half ([`Device::handle_interrupt`]) only captures and
//! clears the hardware status word; all decisions happen in the per-core
//! deferred worker ([`Device::process_events`]), which drains the mailbox
//! *before* acting on error bits so the maximum amount of firmware debug
//! output survives a crash.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use kestrel_chip::fw::{MessageType, RegionId, RegionRequest};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bus::CoreBus;
use crate::config::{DeviceConfig, ProfilingConfig};
use crate::core::{CoreHealth, NpuCore};
use crate::error::{KestrelError, Result};
use crate::inference::Inference;
use crate::mailbox::Mailbox;
use crate::network::{Network, NetworkDescriptor};
use crate::profiling::ProfilingRing;

/// Byte size announced for each memory region during bring-up. The actual
/// allocation is owned by the memory layer; these are the extents the
/// firmware programs its protection unit with.
const fn region_size(region: RegionId) -> u32 {
    match region {
        RegionId::Firmware => 0x4_0000,
        RegionId::WorkingData => 0x10_0000,
        RegionId::CommandStream => 0x20_0000,
    }
}

/// Base of the address range handed out for profiling rings.
const PROFILING_ADDR_BASE: u64 = 0x7000_0000;

#[derive(Debug, Default)]
pub(crate) struct DiagCounters {
    pub wrong_core_completions: AtomicU64,
    pub concurrent_inferences: AtomicU64,
    pub protocol_violations: AtomicU64,
    pub unknown_messages: AtomicU64,
    pub faults_recovered: AtomicU64,
    pub resets_failed: AtomicU64,
}

/// Snapshot of the device's diagnostic counters.
///
/// These are anomaly telemetry, never correctness gates — a misbehaving
/// firmware increments them, it does not crash the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    /// Completions for an inference bound to a different core.
    pub wrong_core_completions: u64,
    /// Completions for a core already bound to another inference.
    pub concurrent_inferences: u64,
    /// Malformed or unexpected messages.
    pub protocol_violations: u64,
    /// Messages with a type code this driver does not know.
    pub unknown_messages: u64,
    /// Hardware faults taken through recovery.
    pub faults_recovered: u64,
    /// Core resets that failed, excluding the core from scheduling.
    pub resets_failed: u64,
}

/// A Kestrel device: all cores, the pending queue, and the completion
/// token table.
#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    bus: Arc<dyn CoreBus>,
    cores: Vec<Arc<NpuCore>>,
    /// FIFO of inferences awaiting an idle core. Lock discipline: always
    /// released before any per-core lock is taken.
    pub(crate) pending: Mutex<VecDeque<Arc<Inference>>>,
    /// Token → in-flight inference. Leaf lock: never held across a call
    /// that takes any other lock.
    pub(crate) inflight: Mutex<HashMap<u64, Arc<Inference>>>,
    /// Serializes dispatch passes so concurrent scheduling events cannot
    /// reorder the FIFO. Outermost in the lock order; never held by
    /// anything that already holds another lock.
    pub(crate) scheduling: Mutex<()>,
    next_token: AtomicU64,
    next_network_id: AtomicU64,
    next_profiling_addr: AtomicU64,
    pub(crate) counters: DiagCounters,
}

impl Device {
    /// Bring up a device on the given bus: create, boot, and configure one
    /// core per physical unit the bus reports.
    ///
    /// Bring-up is asynchronous on the firmware side — the device becomes
    /// [`Self::is_ready`] once every core's region acknowledgements and
    /// capability blob have arrived through the normal interrupt path.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid configuration, a bus without cores, or
    /// a failure to boot any core.
    pub fn bring_up(config: DeviceConfig, bus: Arc<dyn CoreBus>) -> Result<Arc<Self>> {
        config.validate()?;

        let core_count = bus.core_count();
        if core_count == 0 {
            return Err(KestrelError::config("bus reports zero cores"));
        }

        info!("Bringing up Kestrel device with {core_count} core(s)");

        let mut cores = Vec::with_capacity(core_count);
        for id in 0..core_count {
            let (mailbox, firmware) = Mailbox::new(config.queue_capacity, config.log_severity)?;
            bus.attach_mailbox(id, firmware)?;
            bus.boot_core(id)?;
            let core = NpuCore::new(id, mailbox);
            core.state.lock().profiling.config = config.profiling.clone();
            cores.push(Arc::new(core));
        }

        let device = Arc::new(Self {
            config,
            bus,
            cores,
            pending: Mutex::new(VecDeque::new()),
            inflight: Mutex::new(HashMap::new()),
            scheduling: Mutex::new(()),
            next_token: AtomicU64::new(1),
            next_network_id: AtomicU64::new(1),
            next_profiling_addr: AtomicU64::new(PROFILING_ADDR_BASE),
            counters: DiagCounters::default(),
        });

        for core in &device.cores {
            device.send_bringup(core)?;
        }

        Ok(device)
    }

    /// Device configuration, fixed at bring-up.
    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Number of cores on this device.
    #[must_use]
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// All cores.
    #[must_use]
    pub fn cores(&self) -> &[Arc<NpuCore>] {
        &self.cores
    }

    /// Core by id.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::CoreUnavailable` if the id is out of range.
    pub fn core(&self, id: usize) -> Result<&Arc<NpuCore>> {
        self.cores.get(id).ok_or(KestrelError::CoreUnavailable {
            core: id,
            count: self.cores.len(),
        })
    }

    /// Whether every non-excluded core has finished bring-up. At least one
    /// core must be schedulable.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let mut schedulable = 0;
        for core in &self.cores {
            match core.health() {
                CoreHealth::Failed => {}
                _ if core.is_ready() => schedulable += 1,
                _ => return false,
            }
        }
        schedulable > 0
    }

    /// Capability blob of the first core that has one. Stored verbatim as
    /// the firmware sent it; `None` until bring-up completes.
    #[must_use]
    pub fn capabilities(&self) -> Option<Bytes> {
        self.cores.iter().find_map(|core| core.capabilities())
    }

    /// Snapshot the diagnostic counters.
    #[must_use]
    pub fn counters(&self) -> DeviceCounters {
        DeviceCounters {
            wrong_core_completions: self.counters.wrong_core_completions.load(Ordering::Relaxed),
            concurrent_inferences: self.counters.concurrent_inferences.load(Ordering::Relaxed),
            protocol_violations: self.counters.protocol_violations.load(Ordering::Relaxed),
            unknown_messages: self.counters.unknown_messages.load(Ordering::Relaxed),
            faults_recovered: self.counters.faults_recovered.load(Ordering::Relaxed),
            resets_failed: self.counters.resets_failed.load(Ordering::Relaxed),
        }
    }

    /// Number of inferences waiting for a core.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Register a network. The returned handle is what schedule requests
    /// reference; inferences keep it alive while in flight.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::Validation` on a malformed descriptor.
    pub fn register_network(&self, descriptor: NetworkDescriptor) -> Result<Arc<Network>> {
        let id = self.next_network_id.fetch_add(1, Ordering::Relaxed);
        let network = Network::new(id, descriptor)?;
        debug!("Registered network. id={id}");
        Ok(Arc::new(network))
    }

    /// The bus this device drives.
    pub(crate) fn bus(&self) -> &Arc<dyn CoreBus> {
        &self.bus
    }

    pub(crate) fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Top-half interrupt handler for one core: capture and clear the
    /// status word, nothing else. Decision-making is deferred to
    /// [`Self::process_events`].
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::CoreUnavailable` for an out-of-range core.
    pub fn handle_interrupt(&self, core_id: usize) -> Result<()> {
        let core = self.core(core_id)?;
        let status = self.bus.read_irq_status(core_id);
        if !status.is_empty() {
            core.accumulate_irq(status);
        }
        Ok(())
    }

    /// Deferred per-core worker: drain the mailbox, then run fault
    /// recovery if the captured status carries an error bit.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::CoreUnavailable` for an out-of-range core,
    /// or `KestrelError::HardwareFault` after a fault was recovered — the
    /// fault never propagates into any caller's unrelated operation, this
    /// is telemetry for the interrupt worker's own log.
    pub fn process_events(&self, core_id: usize) -> Result<()> {
        let core = self.core(core_id)?.clone();
        let status = core.take_irq();

        // Messages first: collect as much firmware debug output as
        // possible before a reset wipes the queues.
        self.drain_core(&core);

        if status.has_error() {
            self.recover_core(&core, status);
            return Err(KestrelError::HardwareFault {
                core: core_id,
                status: status.0,
            });
        }
        Ok(())
    }

    /// Convenience for polling loops and tests: run the top and bottom
    /// halves for every core.
    pub fn service(&self) {
        for id in 0..self.cores.len() {
            let _ = self.handle_interrupt(id);
            let _ = self.process_events(id);
        }
    }

    /// Send a liveness ping to one core. The firmware's pong increments
    /// that core's [`NpuCore::pongs_received`] counter.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown core or a full request queue.
    pub fn ping(&self, core_id: usize) -> Result<()> {
        let core = self.core(core_id)?.clone();
        self.send_on_core(&core, MessageType::Ping, &[])
    }

    /// Reconfigure profiling on one core. The change is staged: it takes
    /// effect (and the previous ring is released) only when the firmware
    /// acknowledges the announce message.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown core, an invalid configuration, an
    /// outstanding unacknowledged reconfiguration, or a send failure.
    pub fn configure_profiling(&self, core_id: usize, config: ProfilingConfig) -> Result<()> {
        let core = self.core(core_id)?.clone();

        let (payload, pending) = {
            let mut state = core.state.lock();
            let addr = self.next_profiling_addr.fetch_add(0x1000, Ordering::Relaxed);
            let payload = state.profiling.stage(config, addr)?;
            (payload, state.profiling.pending.clone())
        };

        self.bus.attach_profiling(core_id, pending);

        let send = {
            let mut state = core.state.lock();
            state
                .mailbox
                .send(MessageType::ConfigureProfiling, &payload.encode())
        };
        match send {
            Ok(()) => {
                self.bus.notify(core_id);
                Ok(())
            }
            Err(e) => {
                // Roll the stage back; the firmware never saw it.
                let mut state = core.state.lock();
                state.profiling.abandon_pending();
                self.bus.attach_profiling(core_id, None);
                Err(e)
            }
        }
    }

    /// The committed profiling ring of a core, if profiling is active.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::CoreUnavailable` for an out-of-range core.
    pub fn profiling_ring(&self, core_id: usize) -> Result<Option<Arc<ProfilingRing>>> {
        let core = self.core(core_id)?;
        Ok(core.state.lock().profiling.active.clone())
    }

    /// Send one message on a core's mailbox and ring its doorbell.
    pub(crate) fn send_on_core(
        &self,
        core: &NpuCore,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<()> {
        {
            let mut state = core.state.lock();
            state.mailbox.send(msg_type, payload)?;
        }
        self.bus.notify(core.id());
        Ok(())
    }

    /// Send the bring-up message sequence to a core: region announcements,
    /// a liveness ping, the capability request, and the core's committed
    /// profiling state (restored on every reboot in case the firmware
    /// crashed).
    pub(crate) fn send_bringup(&self, core: &Arc<NpuCore>) -> Result<()> {
        for region in RegionId::ALL {
            let request = RegionRequest {
                region: region as u32,
                size: region_size(region),
            };
            self.send_on_core(core, MessageType::RegionRequest, &request.encode())?;
        }

        self.send_on_core(core, MessageType::Ping, &[])?;
        self.send_on_core(core, MessageType::CapsRequest, &[])?;

        let profiling = core.state.lock().profiling.config.clone();
        if profiling.enabled {
            self.configure_profiling(core.id(), profiling)?;
        }

        debug!("Sent bring-up sequence to core {}", core.id());
        Ok(())
    }
}
