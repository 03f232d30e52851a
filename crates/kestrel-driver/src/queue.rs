//! Shared-memory message queues
//!
//! One queue per mailbox direction: a fixed-capacity circular byte buffer
//! written by exactly one side and read by exactly the other. The layout
//! matches the firmware's view (see `kestrel_chip::fw`): power-of-two
//! capacity, wrapping read/write indices, and one slot permanently
//! sacrificed so that `read == write` always means *empty*, never *full*.
//!
//! # Visibility model
//!
//! On hardware the two sides are non-coherent, so the original driver
//! flushes payload bytes before publishing the write index and invalidates
//! before reading. Here that publish/acquire pairing is expressed directly:
//! payload bytes are copied **before** the write index is stored with
//! `Release`, and the reader loads the write index with `Acquire` before
//! touching data. A reader can therefore never observe a partially written
//! message.
//!
//! # Single-producer, single-consumer
//!
//! The roles are fixed by construction: [`MessageQueue::pair`] returns
//! exactly one [`QueueWriter`] and one [`QueueReader`], neither of which is
//! cloneable. All mutation goes through `&mut self` on those handles.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{KestrelError, Result};

/// Shared ring state, owned jointly by one writer and one reader handle.
pub struct MessageQueue {
    /// Capacity in bytes, power of two, fixed at creation.
    capacity: u32,
    /// Read index, advanced only by the reader. Always `< capacity`.
    read: AtomicU32,
    /// Write index, advanced only by the writer. Always `< capacity`.
    write: AtomicU32,
    /// Data bytes. `UnsafeCell` because the writer fills unpublished slots
    /// while the reader holds a shared reference to the ring.
    data: Box<[UnsafeCell<u8>]>,
}

// SAFETY: Sync - the only unsynchronized storage is `data`. The writer
// mutates only bytes in the free region (between `write` and `read - 1`),
// and publishes them with a Release store of `write` before the reader's
// Acquire load can expose them; the reader reads only published bytes.
// Exclusive roles are enforced by the non-clonable handle types.
unsafe impl Sync for MessageQueue {}

// SAFETY: Send - `data` is plain bytes with no thread affinity.
unsafe impl Send for MessageQueue {}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("capacity", &self.capacity)
            .field("read", &self.read.load(Ordering::Relaxed))
            .field("write", &self.write.load(Ordering::Relaxed))
            .finish()
    }
}

impl MessageQueue {
    /// Create a queue and split it into its writer and reader ends.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::Config` if `capacity` is zero or not a power
    /// of two.
    pub fn pair(capacity: u32) -> Result<(QueueWriter, QueueReader)> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(KestrelError::config(format!(
                "queue capacity {capacity} is not a power of two"
            )));
        }

        let data = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect();
        let ring = Arc::new(Self {
            capacity,
            read: AtomicU32::new(0),
            write: AtomicU32::new(0),
            data,
        });

        Ok((
            QueueWriter { ring: ring.clone() },
            QueueReader { ring },
        ))
    }

    const fn mask(&self) -> u32 {
        self.capacity - 1
    }

    /// Bytes available to read right now.
    fn used_size(&self) -> u32 {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        write.wrapping_sub(read) & self.mask()
    }

    /// Bytes that can be written right now. One slot is reserved so the
    /// queue can never become completely full.
    fn free_space(&self) -> u32 {
        self.capacity - self.used_size() - 1
    }

    /// Whether `size` bytes could ever fit, even in an empty queue.
    const fn can_ever_fit(&self, size: u32) -> bool {
        size < self.capacity
    }

    fn data_ptr(&self) -> *mut u8 {
        // UnsafeCell<u8> is repr(transparent), so the slice of cells is
        // layout-identical to a byte buffer.
        UnsafeCell::raw_get(self.data.as_ptr())
    }

    /// Copy `src` into the ring starting at logical index `at`, wrapping.
    ///
    /// # Safety
    ///
    /// Caller must be the sole writer and the target region
    /// `[at, at + src.len())` (mod capacity) must lie in the free region.
    unsafe fn copy_in(&self, at: u32, src: &[u8]) {
        let at = at as usize;
        let cap = self.capacity as usize;
        let first = src.len().min(cap - at);
        // SAFETY: `at + first <= capacity` and the region is unpublished,
        // so no reader observes these bytes until the index store.
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr().add(at), first);
        if first < src.len() {
            // SAFETY: remainder wraps to the start of the buffer, still in
            // the free region.
            std::ptr::copy_nonoverlapping(
                src.as_ptr().add(first),
                self.data_ptr(),
                src.len() - first,
            );
        }
    }

    /// Copy `dst.len()` bytes out of the ring starting at logical index
    /// `at`, wrapping.
    ///
    /// # Safety
    ///
    /// Caller must be the sole reader and the source region must have been
    /// published by the writer (checked against an Acquire load of `write`).
    unsafe fn copy_out(&self, at: u32, dst: &mut [u8]) {
        let at = at as usize;
        let cap = self.capacity as usize;
        let first = dst.len().min(cap - at);
        // SAFETY: region was published with Release before our Acquire load
        // of `write`, and the writer never mutates published bytes.
        std::ptr::copy_nonoverlapping(self.data_ptr().add(at), dst.as_mut_ptr(), first);
        if first < dst.len() {
            // SAFETY: remainder wraps to the start of the buffer, also
            // published.
            std::ptr::copy_nonoverlapping(
                self.data_ptr(),
                dst.as_mut_ptr().add(first),
                dst.len() - first,
            );
        }
    }
}

/// Writing end of a [`MessageQueue`]. Exactly one exists per queue.
#[derive(Debug)]
pub struct QueueWriter {
    ring: Arc<MessageQueue>,
}

impl QueueWriter {
    /// Queue capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.ring.capacity
    }

    /// Bytes that can be written right now.
    #[must_use]
    pub fn free_space(&self) -> u32 {
        self.ring.free_space()
    }

    /// Bytes currently readable by the other side.
    #[must_use]
    pub fn used_size(&self) -> u32 {
        self.ring.used_size()
    }

    /// Whether a write of `size` bytes could ever succeed.
    #[must_use]
    pub fn can_ever_fit(&self, size: u32) -> bool {
        self.ring.can_ever_fit(size)
    }

    /// Current `(read, write)` indices, for diagnostics.
    #[must_use]
    pub fn indices(&self) -> (u32, u32) {
        (
            self.ring.read.load(Ordering::Relaxed),
            self.ring.write.load(Ordering::Relaxed),
        )
    }

    /// Write the gathered buffers as one atomic unit.
    ///
    /// All bytes are copied into the ring before the write index is
    /// published, so the reader observes either none or all of them. If the
    /// total does not fit, nothing is written at all.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::QueueFull` if the total length exceeds the
    /// current free space.
    pub fn write(&mut self, bufs: &[&[u8]]) -> Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let total = u32::try_from(total).map_err(|_| KestrelError::QueueFull {
            needed: u32::MAX,
            free: self.ring.free_space(),
        })?;

        let free = self.ring.free_space();
        if total > free {
            return Err(KestrelError::QueueFull {
                needed: total,
                free,
            });
        }

        let mask = self.ring.mask();
        let mut at = self.ring.write.load(Ordering::Relaxed);
        for buf in bufs {
            // SAFETY: sole writer (non-clonable handle, &mut self); the
            // free-space check above guarantees the target region is free.
            unsafe { self.ring.copy_in(at, buf) };
            at = at.wrapping_add(buf.len() as u32) & mask;
        }

        // Publish: payload first, index after. Pairs with the reader's
        // Acquire load.
        self.ring.write.store(at, Ordering::Release);
        Ok(())
    }
}

/// Reading end of a [`MessageQueue`]. Exactly one exists per queue.
#[derive(Debug)]
pub struct QueueReader {
    ring: Arc<MessageQueue>,
}

impl QueueReader {
    /// Queue capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.ring.capacity
    }

    /// Bytes available to read right now.
    #[must_use]
    pub fn used_size(&self) -> u32 {
        self.ring.used_size()
    }

    /// Bytes of free space the writer sees.
    #[must_use]
    pub fn free_space(&self) -> u32 {
        self.ring.free_space()
    }

    /// Whether a message of `size` bytes could ever be present.
    #[must_use]
    pub fn can_ever_fit(&self, size: u32) -> bool {
        self.ring.can_ever_fit(size)
    }

    /// Current `(read, write)` indices, for diagnostics.
    #[must_use]
    pub fn indices(&self) -> (u32, u32) {
        (
            self.ring.read.load(Ordering::Relaxed),
            self.ring.write.load(Ordering::Relaxed),
        )
    }

    /// Read exactly `dst.len()` bytes, consuming them.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::QueueEmpty` if fewer than `dst.len()` bytes
    /// are available; nothing is consumed in that case.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<()> {
        self.peek(dst)?;
        let mask = self.ring.mask();
        let read = self.ring.read.load(Ordering::Relaxed);
        let next = read.wrapping_add(dst.len() as u32) & mask;
        // Release: the writer's Acquire load of `read` must also see our
        // copies as done before it reuses the region.
        self.ring.read.store(next, Ordering::Release);
        Ok(())
    }

    /// Read exactly `dst.len()` bytes without consuming them.
    ///
    /// Used to inspect a message header before deciding whether the full
    /// message is present yet.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::QueueEmpty` if fewer than `dst.len()` bytes
    /// are available.
    pub fn peek(&self, dst: &mut [u8]) -> Result<()> {
        let needed = dst.len() as u32;
        let available = self.ring.used_size();
        if needed > available {
            return Err(KestrelError::QueueEmpty { needed, available });
        }

        let read = self.ring.read.load(Ordering::Relaxed);
        // SAFETY: sole reader; `used_size` Acquire-loaded `write`, so the
        // `needed` bytes from `read` are published.
        unsafe { self.ring.copy_out(read, dst) };
        Ok(())
    }

    /// Skip `size` bytes, equivalent to reading and discarding them.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::QueueEmpty` if fewer than `size` bytes are
    /// available; nothing is consumed in that case.
    pub fn skip(&mut self, size: u32) -> Result<()> {
        let available = self.ring.used_size();
        if size > available {
            return Err(KestrelError::QueueEmpty {
                needed: size,
                available,
            });
        }

        let mask = self.ring.mask();
        let read = self.ring.read.load(Ordering::Relaxed);
        self.ring
            .read
            .store(read.wrapping_add(size) & mask, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two_capacity() {
        assert!(MessageQueue::pair(100).is_err());
        assert!(MessageQueue::pair(0).is_err());
        assert!(MessageQueue::pair(64).is_ok());
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let (mut w, mut r) = MessageQueue::pair(64).unwrap();
        w.write(&[b"hello", b" world"]).unwrap();

        let mut buf = [0u8; 11];
        r.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn free_plus_used_is_capacity_minus_one() {
        let (mut w, mut r) = MessageQueue::pair(64).unwrap();
        assert_eq!(w.free_space() + w.used_size(), 63);

        w.write(&[&[0u8; 20]]).unwrap();
        assert_eq!(w.free_space() + w.used_size(), 63);

        r.skip(5).unwrap();
        assert_eq!(r.free_space() + r.used_size(), 63);
    }

    #[test]
    fn overflow_write_mutates_nothing() {
        let (mut w, mut r) = MessageQueue::pair(64).unwrap();
        w.write(&[&[0xAAu8; 40]]).unwrap();

        // 40 used, 23 free: a 30-byte write must fail without any effect.
        let err = w.write(&[&[0xBBu8; 30]]).unwrap_err();
        assert!(matches!(err, KestrelError::QueueFull { needed: 30, free: 23 }));
        assert_eq!(w.used_size(), 40);

        let mut buf = [0u8; 40];
        r.read(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn can_never_fit_capacity_sized_message() {
        let (w, _r) = MessageQueue::pair(64).unwrap();
        assert!(w.can_ever_fit(63));
        assert!(!w.can_ever_fit(64));
    }

    #[test]
    fn underflow_read_consumes_nothing() {
        let (mut w, mut r) = MessageQueue::pair(64).unwrap();
        w.write(&[&[1u8, 2, 3]]).unwrap();

        let mut buf = [0u8; 8];
        let err = r.read(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            KestrelError::QueueEmpty {
                needed: 8,
                available: 3
            }
        ));

        let mut buf = [0u8; 3];
        r.read(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn wraparound_preserves_order() {
        let (mut w, mut r) = MessageQueue::pair(16).unwrap();

        // Push the indices near the end, then wrap.
        w.write(&[&[0u8; 12]]).unwrap();
        r.skip(12).unwrap();

        let payload: Vec<u8> = (0u8..10).collect();
        w.write(&[&payload]).unwrap();

        let mut buf = [0u8; 10];
        r.read(&mut buf).unwrap();
        assert_eq!(&buf[..], &payload[..]);
    }

    #[test]
    fn peek_does_not_consume() {
        let (mut w, mut r) = MessageQueue::pair(64).unwrap();
        w.write(&[&[7u8; 4]]).unwrap();

        let mut buf = [0u8; 4];
        r.peek(&mut buf).unwrap();
        assert_eq!(r.used_size(), 4);
        r.read(&mut buf).unwrap();
        assert_eq!(r.used_size(), 0);
    }

    #[test]
    fn spec_example_offsets() {
        // capacity 64, 12-byte then 20-byte message: read index ends at 32.
        let (mut w, mut r) = MessageQueue::pair(64).unwrap();
        let a: Vec<u8> = (0u8..12).collect();
        let b: Vec<u8> = (100u8..120).collect();
        w.write(&[&a]).unwrap();
        w.write(&[&b]).unwrap();

        let mut buf_a = [0u8; 12];
        r.read(&mut buf_a).unwrap();
        assert_eq!(&buf_a[..], &a[..]);

        let mut buf_b = [0u8; 20];
        r.read(&mut buf_b).unwrap();
        assert_eq!(&buf_b[..], &b[..]);

        assert_eq!(r.indices().0, 32);
    }

    #[test]
    fn spsc_across_threads() {
        let (mut w, mut r) = MessageQueue::pair(256).unwrap();
        let total = 10_000u32;

        let producer = std::thread::spawn(move || {
            for i in 0..total {
                let bytes = i.to_ne_bytes();
                loop {
                    match w.write(&[&bytes]) {
                        Ok(()) => break,
                        Err(KestrelError::QueueFull { .. }) => std::thread::yield_now(),
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            }
        });

        let mut next = 0u32;
        while next < total {
            let mut buf = [0u8; 4];
            match r.read(&mut buf) {
                Ok(()) => {
                    assert_eq!(u32::from_ne_bytes(buf), next);
                    next += 1;
                }
                Err(KestrelError::QueueEmpty { .. }) => std::thread::yield_now(),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        producer.join().unwrap();
    }
}
