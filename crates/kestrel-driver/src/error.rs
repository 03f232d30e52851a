//! Error types for Kestrel driver operations

use thiserror::Error;

/// Result type alias for Kestrel operations
pub type Result<T> = std::result::Result<T, KestrelError>;

/// Errors that can occur during Kestrel operations
#[derive(Debug, Error)]
pub enum KestrelError {
    /// Not enough free space in a message queue for the whole write
    #[error("Queue overflow: need {needed} bytes, {free} free")]
    QueueFull {
        /// Bytes the write needed
        needed: u32,
        /// Bytes currently free
        free: u32,
    },

    /// Not enough readable bytes in a message queue for the whole read
    #[error("Queue underflow: need {needed} bytes, {available} available")]
    QueueEmpty {
        /// Bytes the read needed
        needed: u32,
        /// Bytes currently readable
        available: u32,
    },

    /// Message can never fit in the queue, even when empty
    #[error("Message too large: {length} bytes exceeds queue maximum {max}")]
    MessageTooLarge {
        /// Requested message length including header
        length: u32,
        /// Largest message the queue can ever carry
        max: u32,
    },

    /// Request rejected at creation time
    #[error("Validation failed: {reason}")]
    Validation {
        /// Why the request was rejected
        reason: String,
    },

    /// Sending a mailbox message failed
    #[error("Mailbox send failed on core {core}: {reason}")]
    MailboxSend {
        /// Core whose mailbox rejected the message
        core: usize,
        /// Why the send failed
        reason: String,
    },

    /// Asynchronous hardware error reported by one core
    #[error("Hardware fault on core {core}: status {status:#010x}")]
    HardwareFault {
        /// Faulting core
        core: usize,
        /// Captured interrupt status word
        status: u32,
    },

    /// Unexpected or malformed message from firmware
    #[error("Protocol violation: {reason}")]
    Protocol {
        /// What was violated
        reason: String,
    },

    /// Operation not valid in the current state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// A core failed to complete its own reset
    #[error("Core {core} reset failed: {reason}")]
    ResetFailed {
        /// Core that failed to reset
        core: usize,
        /// Why the reset failed
        reason: String,
    },

    /// Core index out of range or permanently excluded from scheduling
    #[error("Core {core} is not available (have {count} cores)")]
    CoreUnavailable {
        /// Requested core
        core: usize,
        /// Number of cores on the device
        count: usize,
    },

    /// Rejected device configuration
    #[error("Invalid configuration: {reason}")]
    Config {
        /// What is wrong with the configuration
        reason: String,
    },

    /// Operation timeout
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },
}

impl KestrelError {
    /// Create a validation error
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Create a mailbox send error
    pub fn mailbox_send(core: usize, reason: impl Into<String>) -> Self {
        Self::MailboxSend {
            core,
            reason: reason.into(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a reset failed error
    pub fn reset_failed(core: usize, reason: impl Into<String>) -> Self {
        Self::ResetFailed {
            core,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}
