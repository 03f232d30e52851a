//! Inference lifecycle
//!
//! One `Inference` is one scheduled execution of a network. Its life is a
//! small state machine:
//!
//! ```text
//! Scheduled ──► Running ──► Completed
//!     │            │
//!     │            └──────► Error
//!     └─────────(cancel / send failure)──► Error
//! ```
//!
//! `Scheduled → Running` happens only when the scheduler successfully
//! transmits the request message; a failed transmit goes straight to
//! `Error` without ever reaching `Running`. `Running` ends when the
//! matching response arrives, or when fault recovery forcibly fails it.
//!
//! Ownership is plain `Arc`: the caller's handle is one strong reference,
//! and the scheduler holds its own from enqueue until the terminal state
//! (pending-queue entry, then token table). The object is freed exactly
//! once, when the last reference drops — which cannot happen before a
//! terminal state while the scheduler still holds its reference.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{KestrelError, Result};
use crate::network::{BufferHandle, Network};

/// Lifecycle states of an [`Inference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceStatus {
    /// Queued, waiting for an idle core.
    Scheduled,
    /// Request transmitted to a core's firmware.
    Running,
    /// Firmware reported success.
    Completed,
    /// Failed: validation-passed work that could not complete (send
    /// failure, hardware fault, firmware-reported error, or cancellation).
    Error,
}

impl InferenceStatus {
    /// Whether this is a final state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug)]
struct LifecycleState {
    status: InferenceStatus,
    assigned_core: Option<usize>,
}

/// One scheduled unit of work.
#[derive(Debug)]
pub struct Inference {
    token: u64,
    network: Arc<Network>,
    inputs: Vec<BufferHandle>,
    outputs: Vec<BufferHandle>,
    state: Mutex<LifecycleState>,
    terminal: Condvar,
}

impl Inference {
    pub(crate) fn new(
        token: u64,
        network: Arc<Network>,
        inputs: Vec<BufferHandle>,
        outputs: Vec<BufferHandle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            token,
            network,
            inputs,
            outputs,
            state: Mutex::new(LifecycleState {
                status: InferenceStatus::Scheduled,
                assigned_core: None,
            }),
            terminal: Condvar::new(),
        })
    }

    /// Opaque token carried in the request message and echoed back in the
    /// completion response.
    #[must_use]
    pub const fn token(&self) -> u64 {
        self.token
    }

    /// The network this inference executes.
    #[must_use]
    pub const fn network(&self) -> &Arc<Network> {
        &self.network
    }

    /// Supplied input buffers.
    #[must_use]
    pub fn inputs(&self) -> &[BufferHandle] {
        &self.inputs
    }

    /// Supplied output buffers.
    #[must_use]
    pub fn outputs(&self) -> &[BufferHandle] {
        &self.outputs
    }

    /// Current status, non-blocking.
    #[must_use]
    pub fn status(&self) -> InferenceStatus {
        self.state.lock().status
    }

    /// Core this inference is (or was last) bound to.
    #[must_use]
    pub fn assigned_core(&self) -> Option<usize> {
        self.state.lock().assigned_core
    }

    /// Block until the inference reaches a terminal state.
    ///
    /// Purely event-driven — the completing thread signals the condvar.
    /// This layer imposes no deadline; use [`Self::wait_timeout`] to apply
    /// one.
    #[must_use]
    pub fn wait(&self) -> InferenceStatus {
        let mut state = self.state.lock();
        while !state.status.is_terminal() {
            self.terminal.wait(&mut state);
        }
        state.status
    }

    /// Block until terminal or the deadline passes.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::Timeout` if the inference is still in flight
    /// when the deadline expires.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<InferenceStatus> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.status.is_terminal() {
            if self
                .terminal
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(KestrelError::Timeout {
                    duration_ms: timeout.as_millis() as u64,
                });
            }
        }
        Ok(state.status)
    }

    /// Transition `Scheduled → Running` and record the core binding.
    /// Returns `false` if the inference is no longer `Scheduled` (lost a
    /// race with cancellation) — the caller must not transmit for it.
    pub(crate) fn bind(&self, core: usize) -> bool {
        let mut state = self.state.lock();
        if state.status != InferenceStatus::Scheduled {
            return false;
        }
        state.status = InferenceStatus::Running;
        state.assigned_core = Some(core);
        true
    }

    /// Atomically cancel if (and only if) still `Scheduled`. Exactly one
    /// of this and [`Self::bind`] wins any race, so a cancelled inference
    /// is never transmitted and a transmitted one is never half-cancelled.
    pub(crate) fn cancel_if_scheduled(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != InferenceStatus::Scheduled {
            return false;
        }
        state.status = InferenceStatus::Error;
        drop(state);
        self.terminal.notify_all();
        true
    }

    /// Move to a terminal state and wake every waiter. Returns `false` if
    /// the inference was already terminal (duplicate completion — the
    /// caller counts it, nothing else changes).
    pub(crate) fn complete(&self, status: InferenceStatus) -> bool {
        debug_assert!(status.is_terminal());
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        debug!(
            "Inference terminal. token={:#x}, status={:?}",
            self.token, status
        );
        state.status = status;
        drop(state);
        self.terminal.notify_all();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{BufferSpec, NetworkDescriptor};

    fn network() -> Arc<Network> {
        Arc::new(
            Network::new(
                1,
                NetworkDescriptor {
                    inputs: vec![BufferSpec { id: 0, size: 64 }],
                    outputs: vec![BufferSpec { id: 1, size: 64 }],
                    buffer_table: 0x6000_0000,
                },
            )
            .unwrap(),
        )
    }

    fn inference() -> Arc<Inference> {
        let buf = BufferHandle {
            address: 0x1000,
            size: 64,
        };
        Inference::new(42, network(), vec![buf], vec![buf])
    }

    #[test]
    fn starts_scheduled() {
        let inf = inference();
        assert_eq!(inf.status(), InferenceStatus::Scheduled);
        assert_eq!(inf.assigned_core(), None);
    }

    #[test]
    fn bind_moves_to_running_once() {
        let inf = inference();
        assert!(inf.bind(3));
        assert_eq!(inf.status(), InferenceStatus::Running);
        assert_eq!(inf.assigned_core(), Some(3));
        // Already running: a second bind must be refused.
        assert!(!inf.bind(4));
    }

    #[test]
    fn duplicate_completion_is_detected() {
        let inf = inference();
        assert!(inf.bind(0));
        assert!(inf.complete(InferenceStatus::Completed));
        assert!(!inf.complete(InferenceStatus::Error));
        assert_eq!(inf.status(), InferenceStatus::Completed);
    }

    #[test]
    fn wait_wakes_on_completion() {
        let inf = inference();
        let waiter = {
            let inf = inf.clone();
            std::thread::spawn(move || inf.wait())
        };
        assert!(inf.bind(0));
        assert!(inf.complete(InferenceStatus::Completed));
        assert_eq!(waiter.join().unwrap(), InferenceStatus::Completed);
    }

    #[test]
    fn wait_timeout_expires_in_flight() {
        let inf = inference();
        let err = inf.wait_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, KestrelError::Timeout { .. }));
    }

    #[test]
    fn cancelled_scheduled_never_binds() {
        let inf = inference();
        assert!(inf.complete(InferenceStatus::Error));
        assert!(!inf.bind(0));
    }
}
