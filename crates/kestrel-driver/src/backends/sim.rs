// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated firmware backend
//!
//! Implements [`CoreBus`] with a software model of the control-unit
//! firmware: each simulated core reads its request queue, produces the
//! responses the real firmware would, and raises interrupt bits. This
//! enables:
//!
//! 1. **CI without hardware**: the full transport / dispatch / scheduling /
//!    recovery stack runs and is asserted on in plain `cargo test`.
//! 2. **Fault injection**: hardware-error interrupts, failed resets,
//!    firmware-reported inference errors, and silent cores are one method
//!    call each — states that are hard to provoke on silicon.
//! 3. **Deterministic scheduling tests**: with auto-completion off, an
//!    inference finishes exactly when the test says so.
//!
//! The simulator is driven explicitly: [`SimBus::service`] processes one
//! core's request queue. Tests either call it inline for lock-step
//! determinism or spin it on a thread for the concurrency tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use kestrel_chip::fw::{
    InferenceRequest, InferenceResponse, LogSeverity, MessageHeader, MessageType,
    ProfilingConfigPayload, ProfilingEntry, RegionRequest, RegionResponse, ResponseStatus,
    HEADER_SIZE,
};
use kestrel_chip::regs::{irq, IrqStatus, GP_COUNT, GP_MAILBOX};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::bus::{CoreBus, CoreDiagnostics};
use crate::error::{KestrelError, Result};
use crate::mailbox::FirmwareChannel;
use crate::profiling::ProfilingRing;

/// Capability blob the simulated firmware reports. Contents are opaque to
/// the driver; tests only assert it is stored verbatim.
const SIM_CAPS: &[u8] = b"KN200-sim caps v2: 4 NPU clusters, 8 MB SRAM";

#[derive(Debug, Default)]
struct SimCoreState {
    channel: Option<FirmwareChannel>,
    booted: bool,
    regions: [Option<u32>; 3],
    profiling_ring: Option<Arc<ProfilingRing>>,
    profiling_config: Option<ProfilingConfigPayload>,
    /// Inference requests parked when auto-completion is off.
    parked: VecDeque<InferenceRequest>,
    auto_complete: bool,
    fail_next_inference: bool,
    fail_resets: bool,
    silent: bool,
    timestamp: u64,
}

#[derive(Debug)]
struct SimCore {
    state: Mutex<SimCoreState>,
    irq: AtomicU32,
    inference_requests_seen: AtomicU64,
}

impl Default for SimCore {
    fn default() -> Self {
        Self {
            state: Mutex::new(SimCoreState {
                auto_complete: true,
                ..SimCoreState::default()
            }),
            irq: AtomicU32::new(0),
            inference_requests_seen: AtomicU64::new(0),
        }
    }
}

/// Software model of a multi-core Kestrel device.
#[derive(Debug)]
pub struct SimBus {
    cores: Vec<SimCore>,
}

impl SimBus {
    /// Create a simulator with the given number of cores.
    #[must_use]
    pub fn new(core_count: usize) -> Arc<Self> {
        Arc::new(Self {
            cores: (0..core_count).map(|_| SimCore::default()).collect(),
        })
    }

    fn core(&self, core: usize) -> Result<&SimCore> {
        self.cores.get(core).ok_or(KestrelError::CoreUnavailable {
            core,
            count: self.cores.len(),
        })
    }

    /// Process every request currently readable on one core. Returns the
    /// number of messages the firmware model handled.
    pub fn service(&self, core: usize) -> usize {
        let Ok(sim) = self.core(core) else { return 0 };
        let mut state = sim.state.lock();
        if state.silent || !state.booted {
            return 0;
        }

        let mut handled = 0;
        let mut raise_job = false;
        while let Some((header, payload)) = read_request(&mut state) {
            handled += 1;
            raise_job |= Self::handle_request(core, sim, &mut state, header, &payload);
        }
        drop(state);

        if raise_job {
            sim.irq.fetch_or(irq::JOB, Ordering::AcqRel);
        }
        handled
    }

    /// Service every core once.
    pub fn service_all(&self) {
        for core in 0..self.cores.len() {
            self.service(core);
        }
    }

    /// Handle one host message. Returns true if a response was written.
    fn handle_request(
        core: usize,
        sim: &SimCore,
        state: &mut SimCoreState,
        header: MessageHeader,
        payload: &[u8],
    ) -> bool {
        match header.message_type() {
            Some(MessageType::RegionRequest) => {
                let Some(request) = RegionRequest::parse(payload) else {
                    return false;
                };
                trace!("sim[{core}]: region {} size {:#x}", request.region, request.size);
                if let Some(slot) = state.regions.get_mut(request.region as usize) {
                    *slot = Some(request.size);
                }
                let response = RegionResponse {
                    region: request.region,
                    status: ResponseStatus::Ok as u32,
                };
                write_response(state, MessageType::RegionResponse, &response.encode())
            }
            Some(MessageType::Ping) => {
                trace!("sim[{core}]: ping");
                write_response(state, MessageType::Pong, &[])
            }
            Some(MessageType::CapsRequest) => {
                write_response(state, MessageType::CapsResponse, SIM_CAPS)
            }
            Some(MessageType::ConfigureProfiling) => {
                state.profiling_config = ProfilingConfigPayload::parse(payload);
                write_response(state, MessageType::ConfigureProfilingAck, &[])
            }
            Some(MessageType::InferenceRequest) => {
                sim.inference_requests_seen.fetch_add(1, Ordering::Relaxed);
                let Some(request) = InferenceRequest::parse(payload) else {
                    return false;
                };
                debug!("sim[{core}]: inference token={:#x}", request.token);

                if state.fail_next_inference {
                    state.fail_next_inference = false;
                    let response = InferenceResponse {
                        token: request.token,
                        status: ResponseStatus::Error as u32,
                    };
                    return write_response(
                        state,
                        MessageType::InferenceResponse,
                        &response.encode(),
                    );
                }

                if state.auto_complete {
                    Self::execute_inference(state, request)
                } else {
                    state.parked.push_back(request);
                    false
                }
            }
            _ => {
                // The real firmware reports unknown host messages; the
                // model just ignores them.
                false
            }
        }
    }

    /// Run one inference to completion: profiling entries, then the
    /// response.
    fn execute_inference(state: &mut SimCoreState, request: InferenceRequest) -> bool {
        let profiling_on = state
            .profiling_config
            .as_ref()
            .is_some_and(|config| config.enabled != 0);
        if profiling_on {
            if let Some(ring) = &state.profiling_ring {
                state.timestamp += 1;
                ring.push(ProfilingEntry {
                    timestamp: state.timestamp,
                    id: (request.token & 0xffff_ffff) as u32,
                    kind: 0, // begin
                });
                state.timestamp += 1;
                ring.push(ProfilingEntry {
                    timestamp: state.timestamp,
                    id: (request.token & 0xffff_ffff) as u32,
                    kind: 1, // end
                });
            }
        }

        let response = InferenceResponse {
            token: request.token,
            status: ResponseStatus::Ok as u32,
        };
        write_response(state, MessageType::InferenceResponse, &response.encode())
    }

    /// Complete the oldest parked inference (auto-completion off) with the
    /// given status. Returns false if nothing is parked.
    pub fn complete_next(&self, core: usize, status: ResponseStatus) -> bool {
        let Ok(sim) = self.core(core) else { return false };
        let mut state = sim.state.lock();
        let Some(request) = state.parked.pop_front() else {
            return false;
        };
        let response = InferenceResponse {
            token: request.token,
            status: status as u32,
        };
        let written = write_response(&mut state, MessageType::InferenceResponse, &response.encode());
        drop(state);
        if written {
            sim.irq.fetch_or(irq::JOB, Ordering::AcqRel);
        }
        written
    }

    /// Park incoming inferences instead of completing them immediately.
    pub fn set_auto_complete(&self, core: usize, auto: bool) {
        if let Ok(sim) = self.core(core) {
            sim.state.lock().auto_complete = auto;
        }
    }

    /// Number of inferences parked on a core.
    #[must_use]
    pub fn parked_count(&self, core: usize) -> usize {
        self.core(core).map_or(0, |sim| sim.state.lock().parked.len())
    }

    /// Fail the next inference request with a firmware error status.
    pub fn fail_next_inference(&self, core: usize) {
        if let Ok(sim) = self.core(core) {
            sim.state.lock().fail_next_inference = true;
        }
    }

    /// Make future resets of this core fail (permanent-exclusion tests).
    pub fn set_fail_resets(&self, core: usize, fail: bool) {
        if let Ok(sim) = self.core(core) {
            sim.state.lock().fail_resets = fail;
        }
    }

    /// Stop (or resume) servicing a core's request queue.
    pub fn set_silent(&self, core: usize, silent: bool) {
        if let Ok(sim) = self.core(core) {
            sim.state.lock().silent = silent;
        }
    }

    /// Raise a hardware-error interrupt on one core.
    pub fn inject_fault(&self, core: usize) {
        if let Ok(sim) = self.core(core) {
            sim.irq
                .fetch_or(irq::ERROR_RECOVERABLE, Ordering::AcqRel);
        }
    }

    /// Emit a firmware log line, honoring the negotiated severity.
    pub fn emit_log(&self, core: usize, severity: LogSeverity, text: &str) {
        let Ok(sim) = self.core(core) else { return };
        let mut state = sim.state.lock();
        let threshold = match &state.channel {
            Some(channel) => channel.severity,
            None => return,
        };
        if severity > threshold {
            return;
        }

        let mut payload = Vec::with_capacity(4 + text.len());
        payload.extend_from_slice(&(severity as u32).to_ne_bytes());
        payload.extend_from_slice(text.as_bytes());
        let written = write_response(&mut state, MessageType::Text, &payload);
        drop(state);
        if written {
            sim.irq.fetch_or(irq::JOB, Ordering::AcqRel);
        }
    }

    /// Write a response with an arbitrary raw type code (protocol tests).
    pub fn send_raw(&self, core: usize, raw_type: u32, payload: &[u8]) {
        let Ok(sim) = self.core(core) else { return };
        let mut state = sim.state.lock();
        let Some(channel) = state.channel.as_mut() else {
            return;
        };
        let header = MessageHeader {
            msg_type: raw_type,
            length: payload.len() as u32,
        };
        let _ = channel.response.write(&[&header.encode()]);
        if !payload.is_empty() {
            let _ = channel.response.write(&[payload]);
        }
        drop(state);
        sim.irq.fetch_or(irq::JOB, Ordering::AcqRel);
    }

    /// Commit only the header of a response; the payload follows via
    /// [`Self::send_partial_payload`]. Exercises the host's deferred-read
    /// path exactly as the real firmware's two-phase commit does.
    pub fn send_partial_header(&self, core: usize, msg_type: MessageType, length: u32) {
        let Ok(sim) = self.core(core) else { return };
        let mut state = sim.state.lock();
        if let Some(channel) = state.channel.as_mut() {
            let header = MessageHeader::new(msg_type, length);
            let _ = channel.response.write(&[&header.encode()]);
        }
        drop(state);
        sim.irq.fetch_or(irq::JOB, Ordering::AcqRel);
    }

    /// Commit payload bytes for an earlier [`Self::send_partial_header`].
    pub fn send_partial_payload(&self, core: usize, payload: &[u8]) {
        let Ok(sim) = self.core(core) else { return };
        let mut state = sim.state.lock();
        if let Some(channel) = state.channel.as_mut() {
            let _ = channel.response.write(&[payload]);
        }
        drop(state);
        sim.irq.fetch_or(irq::JOB, Ordering::AcqRel);
    }

    /// Inference requests this core's firmware has ever seen.
    #[must_use]
    pub fn inference_requests_seen(&self, core: usize) -> u64 {
        self.core(core)
            .map_or(0, |sim| sim.inference_requests_seen.load(Ordering::Relaxed))
    }

    /// The profiling configuration the firmware last received.
    #[must_use]
    pub fn profiling_config(&self, core: usize) -> Option<ProfilingConfigPayload> {
        self.core(core)
            .ok()
            .and_then(|sim| sim.state.lock().profiling_config)
    }
}

impl CoreBus for SimBus {
    fn core_count(&self) -> usize {
        self.cores.len()
    }

    fn attach_mailbox(&self, core: usize, channel: FirmwareChannel) -> Result<()> {
        let sim = self.core(core)?;
        sim.state.lock().channel = Some(channel);
        Ok(())
    }

    fn boot_core(&self, core: usize) -> Result<()> {
        let sim = self.core(core)?;
        let mut state = sim.state.lock();
        if state.channel.is_none() {
            return Err(KestrelError::invalid_state(format!(
                "core {core} booted without a mailbox"
            )));
        }
        state.booted = true;
        Ok(())
    }

    fn notify(&self, _core: usize) {
        // The model is serviced explicitly; the doorbell is a no-op.
    }

    fn read_irq_status(&self, core: usize) -> IrqStatus {
        self.core(core)
            .map_or(IrqStatus::EMPTY, |sim| {
                IrqStatus(sim.irq.swap(0, Ordering::AcqRel))
            })
    }

    fn reset_core(&self, core: usize) -> Result<()> {
        let sim = self.core(core)?;
        let mut state = sim.state.lock();
        if state.fail_resets {
            return Err(KestrelError::reset_failed(core, "simulated reset failure"));
        }

        // Everything firmware-held dies with the reset.
        state.channel = None;
        state.booted = false;
        state.regions = [None; 3];
        state.parked.clear();
        state.profiling_ring = None;
        state.profiling_config = None;
        drop(state);
        sim.irq.store(0, Ordering::Release);
        debug!("sim[{core}]: reset");
        Ok(())
    }

    fn diagnostics(&self, core: usize) -> CoreDiagnostics {
        let mut gp = [0u32; GP_COUNT];
        if let Ok(sim) = self.core(core) {
            let state = sim.state.lock();
            // GP_MAILBOX reads zero once the firmware consumed the
            // descriptor, like the real boot handshake.
            gp[GP_MAILBOX] = u32::from(!state.booted);
            gp[0] = sim.irq.load(Ordering::Relaxed);
        }
        CoreDiagnostics { gp }
    }

    fn attach_profiling(&self, core: usize, ring: Option<Arc<ProfilingRing>>) {
        if let Ok(sim) = self.core(core) {
            sim.state.lock().profiling_ring = ring;
        }
    }
}

/// Read one fully visible message from the request queue, firmware-side.
fn read_request(state: &mut SimCoreState) -> Option<(MessageHeader, Vec<u8>)> {
    let channel = state.channel.as_mut()?;
    let used = channel.request.used_size();
    if used < HEADER_SIZE as u32 {
        return None;
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    channel.request.peek(&mut header_bytes).ok()?;
    let header = MessageHeader::parse(&header_bytes)?;
    if used - (HEADER_SIZE as u32) < header.length {
        return None;
    }

    channel.request.skip(HEADER_SIZE as u32).ok()?;
    let mut payload = vec![0u8; header.length as usize];
    channel.request.read(&mut payload).ok()?;
    Some((header, payload))
}

/// Write one response the way the firmware does: header commit first,
/// payload commit second.
fn write_response(state: &mut SimCoreState, msg_type: MessageType, payload: &[u8]) -> bool {
    let Some(channel) = state.channel.as_mut() else {
        return false;
    };
    let header = MessageHeader::new(msg_type, payload.len() as u32);
    if channel.response.write(&[&header.encode()]).is_err() {
        return false;
    }
    if !payload.is_empty() && channel.response.write(&[payload]).is_err() {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::Mailbox;

    #[test]
    fn answers_ping_with_pong() {
        let bus = SimBus::new(1);
        let (mut mailbox, firmware) = Mailbox::new(1024, LogSeverity::Info).unwrap();
        bus.attach_mailbox(0, firmware).unwrap();
        bus.boot_core(0).unwrap();

        mailbox.send(MessageType::Ping, &[]).unwrap();
        assert_eq!(bus.service(0), 1);

        assert!(bus.read_irq_status(0).has_job());
        let msg = mailbox.receive().unwrap().unwrap();
        assert_eq!(msg.header.message_type(), Some(MessageType::Pong));
    }

    #[test]
    fn unbooted_core_stays_quiet() {
        let bus = SimBus::new(1);
        let (mut mailbox, firmware) = Mailbox::new(1024, LogSeverity::Info).unwrap();
        bus.attach_mailbox(0, firmware).unwrap();

        mailbox.send(MessageType::Ping, &[]).unwrap();
        assert_eq!(bus.service(0), 0);
    }

    #[test]
    fn log_above_threshold_is_suppressed() {
        let bus = SimBus::new(1);
        let (mut mailbox, firmware) = Mailbox::new(1024, LogSeverity::Warning).unwrap();
        bus.attach_mailbox(0, firmware).unwrap();
        bus.boot_core(0).unwrap();

        bus.emit_log(0, LogSeverity::Debug, "too detailed");
        assert!(mailbox.receive().unwrap().is_none());

        bus.emit_log(0, LogSeverity::Error, "kept");
        let msg = mailbox.receive().unwrap().unwrap();
        assert_eq!(msg.header.message_type(), Some(MessageType::Text));
    }

    #[test]
    fn reset_failure_can_be_injected() {
        let bus = SimBus::new(1);
        bus.set_fail_resets(0, true);
        assert!(bus.reset_core(0).is_err());
        bus.set_fail_resets(0, false);
        assert!(bus.reset_core(0).is_ok());
    }
}
