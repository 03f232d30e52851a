// SPDX-License-Identifier: AGPL-3.0-only

//! Firmware profiling plumbing
//!
//! The firmware writes profiling entries into a ring the host allocates.
//! Unlike the mailbox queues this ring is deliberately **lossy**: the
//! firmware overwrites unread entries rather than ever stalling on the
//! host (nobody may even be reading). The read side resynchronizes to the
//! firmware's write index and reports how many entries were lost.
//!
//! Reconfiguration is staged: the new ring is allocated and announced to
//! the firmware, but the old one stays live until the firmware acknowledges
//! the switch — it may still be writing into it. Only the ack commits the
//! swap. A second reconfiguration while an ack is outstanding is refused.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use kestrel_chip::fw::{ProfilingConfigPayload, ProfilingEntry, MAX_HW_COUNTERS};

use crate::config::ProfilingConfig;
use crate::error::{KestrelError, Result};

/// One slot of the ring. Entry fields are split across two atomics so a
/// concurrent overwrite can tear an entry but never produce undefined
/// behavior — torn entries are acceptable in a lossy channel.
#[derive(Debug, Default)]
struct Slot {
    timestamp: AtomicU64,
    /// `id` in the low 32 bits, `kind` in the high 32 bits.
    meta: AtomicU64,
}

/// The firmware-written profiling ring.
///
/// The write index is monotonically increasing (not masked); the slot for
/// index `i` is `i % capacity`. Overwrite of unread slots is allowed.
#[derive(Debug)]
pub struct ProfilingRing {
    device_addr: u64,
    slots: Box<[Slot]>,
    write_index: AtomicU32,
}

impl ProfilingRing {
    /// Allocate a ring with the given number of entries at the given
    /// device address.
    #[must_use]
    pub fn new(device_addr: u64, entries: u32) -> Arc<Self> {
        let slots = (0..entries.max(1)).map(|_| Slot::default()).collect();
        Arc::new(Self {
            device_addr,
            slots,
            write_index: AtomicU32::new(0),
        })
    }

    /// Device address announced to the firmware.
    #[must_use]
    pub const fn device_addr(&self) -> u64 {
        self.device_addr
    }

    /// Ring capacity in entries.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Writer side: append an entry, overwriting the oldest if full.
    ///
    /// Called by the firmware (the simulator, in tests). Never blocks,
    /// never fails.
    pub fn push(&self, entry: ProfilingEntry) {
        let index = self.write_index.load(Ordering::Relaxed);
        let slot = &self.slots[(index as usize) % self.slots.len()];
        slot.timestamp.store(entry.timestamp, Ordering::Relaxed);
        slot.meta.store(
            u64::from(entry.id) | (u64::from(entry.kind) << 32),
            Ordering::Relaxed,
        );
        self.write_index
            .store(index.wrapping_add(1), Ordering::Release);
    }

    /// Reader side: collect entries produced since the cursor's last call.
    ///
    /// Returns the entries still present and the number lost to overwrite.
    /// Entries being overwritten concurrently may be torn; that is inherent
    /// to the lossy contract.
    pub fn drain(&self, cursor: &mut ProfilingCursor) -> ProfilingDrain {
        let write = self.write_index.load(Ordering::Acquire);
        let produced = write.wrapping_sub(cursor.last);
        if produced == 0 {
            return ProfilingDrain::default();
        }

        let capacity = self.capacity();
        let lost = produced.saturating_sub(capacity);
        let start = cursor.last.wrapping_add(lost);

        let mut entries = Vec::with_capacity((write.wrapping_sub(start)) as usize);
        let mut index = start;
        while index != write {
            let slot = &self.slots[(index as usize) % self.slots.len()];
            let meta = slot.meta.load(Ordering::Relaxed);
            entries.push(ProfilingEntry {
                timestamp: slot.timestamp.load(Ordering::Relaxed),
                id: (meta & 0xffff_ffff) as u32,
                kind: (meta >> 32) as u32,
            });
            index = index.wrapping_add(1);
        }

        cursor.last = write;
        ProfilingDrain { entries, lost }
    }
}

/// Reader position in a [`ProfilingRing`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ProfilingCursor {
    last: u32,
}

impl ProfilingCursor {
    /// Cursor starting at the beginning of the stream.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: 0 }
    }
}

/// Result of one [`ProfilingRing::drain`] call.
#[derive(Debug, Default)]
pub struct ProfilingDrain {
    /// Entries still present, oldest first.
    pub entries: Vec<ProfilingEntry>,
    /// Entries overwritten before they could be read.
    pub lost: u32,
}

/// Per-core staged profiling state.
#[derive(Debug, Default)]
pub(crate) struct ProfilingState {
    /// Last committed configuration, restored after a core reset.
    pub config: ProfilingConfig,
    /// Ring the firmware currently writes into.
    pub active: Option<Arc<ProfilingRing>>,
    /// Ring announced but not yet acknowledged.
    pub pending: Option<Arc<ProfilingRing>>,
    /// An announce is outstanding; no further reconfiguration allowed.
    pub waiting_ack: bool,
}

impl ProfilingState {
    /// Stage a reconfiguration: allocate the pending ring (if enabling) and
    /// build the wire payload. The active ring is untouched — the firmware
    /// may still be writing into it.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::InvalidState` if an earlier reconfiguration
    /// has not been acknowledged yet.
    pub fn stage(
        &mut self,
        config: ProfilingConfig,
        device_addr: u64,
    ) -> Result<ProfilingConfigPayload> {
        if self.waiting_ack {
            return Err(KestrelError::invalid_state(
                "waiting for firmware to acknowledge previous profiling config",
            ));
        }
        config.validate()?;

        let pending = if config.enabled && config.buffer_entries > 0 {
            Some(ProfilingRing::new(device_addr, config.buffer_entries))
        } else {
            None
        };

        let mut hw_counters = [0u32; MAX_HW_COUNTERS];
        for (dst, src) in hw_counters.iter_mut().zip(config.hw_counters.iter()) {
            *dst = *src;
        }

        let payload = ProfilingConfigPayload {
            enabled: u32::from(config.enabled),
            buffer_addr: pending.as_ref().map_or(0, |r| r.device_addr()),
            buffer_entries: pending.as_ref().map_or(0, |r| r.capacity()),
            num_hw_counters: config.hw_counters.len() as u32,
            hw_counters,
        };

        self.pending = pending;
        self.config = config;
        self.waiting_ack = true;
        Ok(payload)
    }

    /// Commit the staged swap on firmware acknowledgement. The old ring is
    /// dropped — the firmware has confirmed it no longer writes there.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::Protocol` on an unexpected ack.
    pub fn commit_ack(&mut self) -> Result<()> {
        if !self.waiting_ack {
            return Err(KestrelError::protocol(
                "unexpected profiling ack from firmware",
            ));
        }
        self.active = self.pending.take();
        self.waiting_ack = false;
        Ok(())
    }

    /// Drop staged state without committing (core reset path).
    pub fn abandon_pending(&mut self) {
        self.pending = None;
        self.waiting_ack = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u32) -> ProfilingEntry {
        ProfilingEntry {
            timestamp: u64::from(id) * 10,
            id,
            kind: 1,
        }
    }

    #[test]
    fn drain_returns_entries_in_order() {
        let ring = ProfilingRing::new(0x7000_0000, 8);
        let mut cursor = ProfilingCursor::new();

        for i in 0..5 {
            ring.push(entry(i));
        }

        let drained = ring.drain(&mut cursor);
        assert_eq!(drained.lost, 0);
        let ids: Vec<u32> = drained.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);

        // Nothing new.
        assert!(ring.drain(&mut cursor).entries.is_empty());
    }

    #[test]
    fn overwrite_loses_oldest_entries() {
        let ring = ProfilingRing::new(0x7000_0000, 4);
        let mut cursor = ProfilingCursor::new();

        for i in 0..10 {
            ring.push(entry(i));
        }

        let drained = ring.drain(&mut cursor);
        assert_eq!(drained.lost, 6);
        let ids: Vec<u32> = drained.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![6, 7, 8, 9]);
    }

    #[test]
    fn stage_then_ack_commits_swap() {
        let mut state = ProfilingState::default();
        let config = ProfilingConfig {
            enabled: true,
            buffer_entries: 16,
            hw_counters: vec![2, 5],
        };

        let payload = state.stage(config, 0x7000_1000).unwrap();
        assert_eq!(payload.enabled, 1);
        assert_eq!(payload.buffer_addr, 0x7000_1000);
        assert!(state.active.is_none());
        assert!(state.waiting_ack);

        state.commit_ack().unwrap();
        assert!(state.active.is_some());
        assert!(!state.waiting_ack);
    }

    #[test]
    fn second_stage_refused_until_ack() {
        let mut state = ProfilingState::default();
        let config = ProfilingConfig {
            enabled: true,
            buffer_entries: 16,
            hw_counters: vec![],
        };

        state.stage(config.clone(), 1).unwrap();
        let err = state.stage(config, 2).unwrap_err();
        assert!(matches!(err, KestrelError::InvalidState { .. }));
    }

    #[test]
    fn unexpected_ack_is_protocol_violation() {
        let mut state = ProfilingState::default();
        assert!(matches!(
            state.commit_ack(),
            Err(KestrelError::Protocol { .. })
        ));
    }
}
