//! Message dispatch
//!
//! The deferred worker drains a core's response queue and routes each
//! message by type. Anything malformed, unexpected, or unknown is counted
//! and discarded — firmware misbehavior must never corrupt host state or
//! crash the host.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use kestrel_chip::fw::{
    ErrorReport, InferenceResponse, LogSeverity, MessageType, RegionId, RegionResponse,
    ResponseStatus,
};
use tracing::{debug, error, info, trace, warn};

use crate::core::NpuCore;
use crate::device::Device;
use crate::inference::InferenceStatus;
use crate::mailbox::ReceivedMessage;

impl Device {
    /// Drain every fully visible message from a core's response queue.
    /// Returns the number of messages handled. A message whose payload is
    /// not yet visible stays queued for the next pass.
    pub(crate) fn drain_core(&self, core: &Arc<NpuCore>) -> usize {
        let mut handled = 0;
        loop {
            // Hold the core lock only for the receive itself; handlers
            // reacquire it as needed.
            let received = {
                let mut state = core.state.lock();
                state.mailbox.receive()
            };

            match received {
                Ok(Some(message)) => {
                    handled += 1;
                    self.handle_message(core, message);
                }
                Ok(None) => break,
                Err(e) => {
                    self.counters
                        .protocol_violations
                        .fetch_add(1, Ordering::Relaxed);
                    warn!("Discarded malformed mailbox data on core {}: {e}", core.id());
                }
            }
        }
        handled
    }

    fn handle_message(&self, core: &Arc<NpuCore>, message: ReceivedMessage) {
        let Some(msg_type) = message.header.message_type() else {
            self.counters
                .unknown_messages
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                "Unsupported message type. core={}, type={}, length={}",
                core.id(),
                message.header.msg_type,
                message.header.length
            );
            return;
        };

        match msg_type {
            MessageType::RegionResponse => self.handle_region_response(core, &message.payload),
            MessageType::CapsResponse => {
                debug!(
                    "<- Capabilities. core={}, size={}",
                    core.id(),
                    message.payload.len()
                );
                core.state.lock().caps = Some(message.payload);
                // This may have completed bring-up; serve anything queued.
                self.schedule_pending();
            }
            MessageType::InferenceResponse => self.handle_completion(core, &message.payload),
            MessageType::Pong => {
                debug!("<- Pong. core={}", core.id());
                core.record_pong();
            }
            MessageType::Text => self.handle_text(core, &message.payload),
            MessageType::ConfigureProfilingAck => self.handle_profiling_ack(core),
            MessageType::ErrorReport => {
                match ErrorReport::parse(&message.payload) {
                    Some(report) => warn!(
                        "<- Firmware error report. core={}, code={:#x}, detail={:#x}",
                        core.id(),
                        report.code,
                        report.detail
                    ),
                    None => self.count_protocol_violation(core, "short error report"),
                }
            }
            MessageType::InferenceRequest
            | MessageType::RegionRequest
            | MessageType::ConfigureProfiling
            | MessageType::Ping
            | MessageType::CapsRequest => {
                self.count_protocol_violation(core, "host-bound message type from firmware");
            }
        }
    }

    fn handle_region_response(&self, core: &Arc<NpuCore>, payload: &Bytes) {
        let Some(response) = RegionResponse::parse(payload) else {
            self.count_protocol_violation(core, "short region response");
            return;
        };
        let Some(region) = RegionId::from_raw(response.region) else {
            self.count_protocol_violation(core, "unknown region id in response");
            return;
        };

        let configured = ResponseStatus::from_raw(response.status) == ResponseStatus::Ok;
        debug!(
            "<- Region {:?} on core {}: {}",
            region,
            core.id(),
            if configured { "configured" } else { "failed" }
        );
        core.state.lock().regions_configured[region as usize] = configured;
        // The last acknowledgement makes the core schedulable.
        self.schedule_pending();
    }

    /// An inference completion: recover the inference from the token, do
    /// the binding bookkeeping, move it to its terminal state, and serve
    /// the next queued inference.
    fn handle_completion(&self, core: &Arc<NpuCore>, payload: &Bytes) {
        let Some(response) = InferenceResponse::parse(payload) else {
            self.count_protocol_violation(core, "short inference response");
            return;
        };

        debug!(
            "<- Inference. core={}, token={:#x}, status={}",
            core.id(),
            response.token,
            response.status
        );

        // Leaf lock: take and release before touching the core lock.
        let inference = self.inflight.lock().remove(&response.token);
        let Some(inference) = inference else {
            // Unknown or duplicate token — possibly a completion replayed
            // by a misbehaving firmware. Count it, touch nothing.
            self.count_protocol_violation(core, "completion with unknown token");
            return;
        };

        let bound_core = inference.assigned_core();
        if bound_core != Some(core.id()) {
            self.counters
                .wrong_core_completions
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                "Completion arrived on core {} for inference bound to core {bound_core:?}",
                core.id()
            );
            // Release the binding on the core that actually carries it so
            // a confused firmware cannot wedge that core busy forever.
            if let Some(bound) = bound_core.and_then(|id| self.core(id).ok()) {
                let mut state = bound.state.lock();
                if state
                    .current
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &inference))
                {
                    state.current = None;
                }
            }
        }

        {
            let mut state = core.state.lock();
            match &state.current {
                Some(current) if Arc::ptr_eq(current, &inference) => {
                    state.current = None;
                }
                Some(_) => {
                    // This core is bound to a different inference — the
                    // firmware reported a completion for work this core
                    // was never given.
                    self.counters
                        .concurrent_inferences
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Concurrent inference detected on core {}. token={:#x}",
                        core.id(),
                        response.token
                    );
                }
                None => {}
            }
        }

        let status = if ResponseStatus::from_raw(response.status) == ResponseStatus::Ok {
            InferenceStatus::Completed
        } else {
            InferenceStatus::Error
        };
        if !inference.complete(status) {
            self.count_protocol_violation(core, "completion for terminal inference");
        }

        // A core just went idle: serve the next pending inference.
        self.schedule_pending();
    }

    /// Firmware text line: re-emit through the host log at the wire
    /// severity, trailing newlines trimmed.
    fn handle_text(&self, core: &Arc<NpuCore>, payload: &Bytes) {
        if payload.len() < 4 {
            self.count_protocol_violation(core, "short text message");
            return;
        }

        let mut severity_bytes = [0u8; 4];
        severity_bytes.copy_from_slice(&payload[0..4]);
        let severity = LogSeverity::from_raw(u32::from_ne_bytes(severity_bytes));
        let text = String::from_utf8_lossy(&payload[4..]);
        let text = text.trim_end_matches('\n');
        let id = core.id();

        match severity {
            LogSeverity::Panic | LogSeverity::Error => error!("fw[{id}]: {text}"),
            LogSeverity::Warning => warn!("fw[{id}]: {text}"),
            LogSeverity::Info => info!("fw[{id}]: {text}"),
            LogSeverity::Debug => debug!("fw[{id}]: {text}"),
            LogSeverity::Verbose => trace!("fw[{id}]: {text}"),
        }
    }

    /// Profiling ack: commit the staged buffer swap. The old ring is
    /// released only now — the firmware has confirmed it switched.
    fn handle_profiling_ack(&self, core: &Arc<NpuCore>) {
        debug!("<- Profiling ack. core={}", core.id());
        let committed = {
            let mut state = core.state.lock();
            state
                .profiling
                .commit_ack()
                .map(|()| state.profiling.active.clone())
        };
        match committed {
            Ok(active) => self.bus().attach_profiling(core.id(), active),
            Err(e) => {
                self.counters
                    .protocol_violations
                    .fetch_add(1, Ordering::Relaxed);
                warn!("core {}: {e}", core.id());
            }
        }
    }

    fn count_protocol_violation(&self, core: &Arc<NpuCore>, what: &str) {
        self.counters
            .protocol_violations
            .fetch_add(1, Ordering::Relaxed);
        warn!("Protocol violation on core {}: {what}", core.id());
    }
}
