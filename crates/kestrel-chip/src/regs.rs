//! Per-core register window for the KN200.
//!
//! Each physical core exposes an identical 4 KB window of control registers.
//! The host only ever touches the handful below; everything else in the
//! window belongs to the firmware. Offsets are relative to the start of the
//! core's window.

// ── Identity ─────────────────────────────────────────────────────────────────

/// Core ID / stepping register. Reads `0x4b4e_0200` ("KN", 2.0) on KN200.
pub const CORE_ID: usize = 0x0000;

/// Firmware version register, written by the firmware during boot.
pub const FW_VERSION: usize = 0x0004;

// ── Control ──────────────────────────────────────────────────────────────────

/// System control register — reset request bits.
pub const SYSCTRL: usize = 0x0010;

/// Power control register.
pub const PWRCTRL: usize = 0x0014;

/// System control bit definitions.
pub mod sysctrl {
    /// Request a soft reset (firmware restart, state preserved in SRAM).
    pub const SOFT_RESET: u32 = 1 << 0;
    /// Request a hard reset (full core power cycle).
    pub const HARD_RESET: u32 = 1 << 1;
    /// Release the MCU from its boot-wait loop.
    pub const CPU_RUN: u32 = 1 << 2;
}

// ── Interrupts ───────────────────────────────────────────────────────────────

/// Interrupt status register (read in the top-half handler).
pub const IRQ_STATUS: usize = 0x0020;

/// Interrupt clear register (write-1-to-clear, mirrors `IRQ_STATUS` bits).
pub const IRQ_CLEAR: usize = 0x0024;

/// Doorbell register — writing [`irq::DOORBELL`] raises the firmware's
/// mailbox event.
pub const IRQ_SET: usize = 0x0028;

/// Interrupt status bit definitions.
pub mod irq {
    /// Firmware wrote one or more messages to the response queue.
    pub const JOB: u32 = 1 << 0;
    /// Firmware debug event (text message pending).
    pub const DEBUG: u32 = 1 << 1;
    /// Host-to-firmware doorbell (only meaningful in `IRQ_SET`).
    pub const DOORBELL: u32 = 1 << 4;
    /// Recoverable hardware error — core needs a reset.
    pub const ERROR_RECOVERABLE: u32 = 1 << 8;
    /// Functional unit error (MAC array lockstep mismatch).
    pub const ERROR_FUNCTIONAL: u32 = 1 << 9;
    /// Unrecoverable hardware error.
    pub const ERROR_UNRECOVERABLE: u32 = 1 << 10;

    /// Mask of every error bit.
    pub const ERROR_MASK: u32 = ERROR_RECOVERABLE | ERROR_FUNCTIONAL | ERROR_UNRECOVERABLE;
}

// ── General-purpose registers ────────────────────────────────────────────────
//
// Used for special-purpose communication between the host driver and the
// firmware, and dumped wholesale when a core faults.

/// Number of general-purpose registers per core.
pub const GP_COUNT: usize = 8;

/// Offset of general-purpose register `n` (0..[`GP_COUNT`]).
#[must_use]
pub const fn gp(n: usize) -> usize {
    0x0040 + n * 4
}

/// GP register carrying the mailbox address during boot. The firmware
/// clears it to zero once it has consumed the mailbox descriptor, which is
/// how the host knows the core has booted.
pub const GP_MAILBOX: usize = 2;

/// Captured `IRQ_STATUS` word with typed accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqStatus(pub u32);

impl IrqStatus {
    /// An empty (no bits set) status word.
    pub const EMPTY: Self = Self(0);

    /// True if no bits are set (the interrupt was not for us).
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if the firmware signalled pending response messages.
    #[must_use]
    pub const fn has_job(self) -> bool {
        self.0 & irq::JOB != 0
    }

    /// True if any hardware-error bit is set.
    #[must_use]
    pub const fn has_error(self) -> bool {
        self.0 & irq::ERROR_MASK != 0
    }

    /// True if the unrecoverable-error bit is set.
    #[must_use]
    pub const fn is_unrecoverable(self) -> bool {
        self.0 & irq::ERROR_UNRECOVERABLE != 0
    }

    /// Merge another captured status into this one.
    #[must_use]
    pub const fn merged(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}
