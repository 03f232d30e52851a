//! Multi-core inference scheduling
//!
//! One device-wide FIFO of `Scheduled` inferences, strict
//! earliest-enqueued-first with no priorities. On every "core became idle"
//! or "inference enqueued" event the head of the queue is bound to the
//! first idle core and the request message is transmitted. A failed
//! transmit fails that inference immediately and moves on to the next —
//! the scheduler never blocks retrying one request.
//!
//! Lock discipline: the FIFO lock is always released before a per-core
//! lock is taken, and the token table is a leaf lock. That fixed order
//! makes lock-ordering deadlocks impossible by construction.

use std::sync::Arc;

use kestrel_chip::fw::{InferenceRequest, MessageType};
use tracing::{debug, warn};

use crate::core::{CoreHealth, NpuCore};
use crate::device::Device;
use crate::error::{KestrelError, Result};
use crate::inference::{Inference, InferenceStatus};
use crate::network::{BufferHandle, Network};

enum DispatchOutcome {
    /// Core is busy, resetting, excluded, or not yet configured.
    Busy,
    /// Request transmitted; inference is `Running` on this core.
    Sent,
    /// Transmit failed; inference is `Error`, core remains free.
    Failed,
    /// Inference was cancelled while queued; nothing was sent.
    Cancelled,
}

impl Device {
    /// Validate and enqueue an inference, then try to dispatch it.
    ///
    /// Never blocks on hardware: the caller gets the handle immediately
    /// and waits on it separately. If no core is idle the inference stays
    /// queued until a completion or recovery event frees one.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::Validation` if the supplied buffers do not
    /// match the network's declared table; nothing is queued in that case.
    pub fn schedule_inference(
        &self,
        network: &Arc<Network>,
        inputs: Vec<BufferHandle>,
        outputs: Vec<BufferHandle>,
    ) -> Result<Arc<Inference>> {
        network.validate_request(&inputs, &outputs)?;

        let token = self.next_token();
        let inference = Inference::new(token, network.clone(), inputs, outputs);

        // The queue entry is the scheduler's own strong reference.
        self.pending.lock().push_back(inference.clone());
        debug!(
            "Queued inference. token={:#x}, network={}",
            token,
            network.id()
        );

        self.schedule_pending();
        Ok(inference)
    }

    /// Cancel an inference.
    ///
    /// A `Scheduled` inference is dequeued synchronously — no request
    /// message is ever sent for it. A `Running` inference has no graceful
    /// abort: its core is reset, which forces the inference to `Error`.
    /// Cancelling an already-terminal inference is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::CoreUnavailable` if the bound core vanished,
    /// which indicates a bookkeeping bug.
    pub fn cancel(&self, inference: &Arc<Inference>) -> Result<()> {
        loop {
            if inference.cancel_if_scheduled() {
                self.pending
                    .lock()
                    .retain(|queued| !Arc::ptr_eq(queued, inference));
                debug!("Cancelled queued inference. token={:#x}", inference.token());
                return Ok(());
            }

            match inference.status() {
                InferenceStatus::Running => {
                    // The binding is recorded before the status flips to
                    // Running, but read both again to close the race.
                    let Some(core_id) = inference.assigned_core() else {
                        continue;
                    };
                    warn!(
                        "Resetting core {core_id} to abort running inference. token={:#x}",
                        inference.token()
                    );
                    let core = self.core(core_id)?.clone();
                    self.reset_and_resume(&core, "inference abort");
                    return Ok(());
                }
                InferenceStatus::Completed | InferenceStatus::Error => return Ok(()),
                InferenceStatus::Scheduled => {
                    // Lost a race with the dispatcher; retry.
                }
            }
        }
    }

    /// Serve the pending FIFO: bind queued inferences to idle cores until
    /// the queue is empty or no core is idle.
    ///
    /// Called on every enqueue, every completion, and at the end of fault
    /// recovery. Safe to call from multiple threads.
    pub(crate) fn schedule_pending(&self) {
        // One dispatch pass at a time: two concurrent passes could pop
        // adjacent queue entries and bind them out of order.
        let _pass = self.scheduling.lock();
        loop {
            // Pop under the FIFO lock only; it is released before any
            // core lock is touched.
            let Some(inference) = self.pending.lock().pop_front() else {
                return;
            };

            if inference.status() != InferenceStatus::Scheduled {
                // Cancelled while queued; drop the scheduler reference.
                continue;
            }

            let mut placed = false;
            for core in self.cores() {
                match self.try_dispatch(core, &inference) {
                    DispatchOutcome::Busy => {}
                    DispatchOutcome::Sent
                    | DispatchOutcome::Failed
                    | DispatchOutcome::Cancelled => {
                        placed = true;
                        break;
                    }
                }
            }

            if !placed {
                // No idle core: put it back at the head so FIFO order is
                // preserved for the next scheduling event.
                self.pending.lock().push_front(inference);
                return;
            }
        }
    }

    fn try_dispatch(&self, core: &Arc<NpuCore>, inference: &Arc<Inference>) -> DispatchOutcome {
        let mut state = core.state.lock();
        if state.health != CoreHealth::Ready || !state.is_configured() || state.current.is_some()
        {
            return DispatchOutcome::Busy;
        }

        if !inference.bind(core.id()) {
            return DispatchOutcome::Cancelled;
        }

        // Invariant: at most one current inference per core, established
        // under the core lock.
        state.current = Some(inference.clone());
        self.inflight
            .lock()
            .insert(inference.token(), inference.clone());

        let request = InferenceRequest {
            token: inference.token(),
            buffer_table: inference.network().buffer_table(),
        };

        match state
            .mailbox
            .send(MessageType::InferenceRequest, &request.encode())
        {
            Ok(()) => {
                drop(state);
                self.bus().notify(core.id());
                debug!(
                    "Dispatched inference. token={:#x}, core={}",
                    inference.token(),
                    core.id()
                );
                DispatchOutcome::Sent
            }
            Err(e) => {
                state.current = None;
                drop(state);
                self.inflight.lock().remove(&inference.token());
                let failure = KestrelError::mailbox_send(core.id(), e.to_string());
                warn!("Failing inference {:#x}: {failure}", inference.token());
                inference.complete(InferenceStatus::Error);
                DispatchOutcome::Failed
            }
        }
    }
}
