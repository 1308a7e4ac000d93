//! The ring of write buffers.
//!
//! Buffers are used in ring order, each lap of the ring giving a buffer a
//! new `seq`. Buffer `seq % n` holds the log bytes of generation `seq`:
//!
//! `Free -> Active -> Draining -> Flushing -> Free`
//!
//! Exactly one buffer is `Active` at a time, the one holding the log
//! horizon. A `Draining` buffer is full (or was closed early) and waits for
//! its in-flight copies to land. Buffers reach disk in `seq` order.

use std::{cell::UnsafeCell, cell::Cell, time::Duration};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::translog::Lsn;

const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferState {
    Free,
    Active,
    Draining,
    Flushing,
}

#[derive(Debug)]
pub(crate) struct BufferMeta {
    pub state: BufferState,
    pub seq: u64,
    pub file: u32,
    /// Log address of the first byte of the buffer. Always a page start.
    pub offset: Lsn,
    /// Bytes of log data in the buffer, set when it is closed.
    pub size: usize,
    /// Copies into the buffer that are still in flight.
    pub writers: usize,
    /// Rewrite counter of the first page, non-zero when the page was
    /// carried over from the previous buffer by a forced flush.
    pub first_page_counter: u8,
    /// Set on the last buffer of a file: the address of the last record
    /// starting in the file, stored in the file header once written.
    pub closes_file: Option<Lsn>,
}

pub(crate) struct IoBuf {
    pub index: usize,
    buf: UnsafeCell<Vec<u8>>,
    meta: Mutex<BufferMeta>,
    cv: Condvar,
}

#[allow(unsafe_code)]
unsafe impl Sync for IoBuf {}

impl IoBuf {
    fn new(index: usize, size: usize) -> IoBuf {
        IoBuf {
            index,
            buf: UnsafeCell::new(vec![0; size]),
            meta: Mutex::new(BufferMeta {
                state: BufferState::Free,
                seq: 0,
                file: 0,
                offset: Lsn::IMPOSSIBLE,
                size: 0,
                writers: 0,
                first_page_counter: 0,
                closes_file: None,
            }),
            cv: Condvar::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        unsafe { (*self.buf.get()).len() }
    }

    pub(crate) fn lock(&self) -> BufferGuard<'_> {
        BufferGuard { _order: RingOrder::enter(self.index), meta: self.meta.lock() }
    }

    /// Copies `src` into the buffer at `at`.
    ///
    /// # Safety
    ///
    /// The range must have been reserved by the caller under the log
    /// lock, and the buffer must not be `Free`, so no other thread touches
    /// these bytes until the caller decreases the writer count.
    pub(crate) unsafe fn write_at(&self, at: usize, src: &[u8]) {
        let data = unsafe { (*self.buf.get()).as_mut_slice() };
        assert!(at + src.len() <= data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), data.as_mut_ptr().add(at), src.len());
        }
    }

    /// Fills `len` bytes at `at` with `byte`. Same contract as `write_at`.
    pub(crate) unsafe fn fill_at(&self, at: usize, len: usize, byte: u8) {
        let data = unsafe { (*self.buf.get()).as_mut_slice() };
        data[at..at + len].fill(byte);
    }

    /// Reads bytes of a buffer whose writers have drained.
    ///
    /// # Safety
    ///
    /// No copy may be in flight into the range.
    pub(crate) unsafe fn read(&self, at: usize, len: usize) -> &[u8] {
        let data = unsafe { &*self.buf.get() };
        &data[at..at + len]
    }

    pub(crate) fn notify_all(&self) {
        let _notified = self.cv.notify_all();
    }
}

pub(crate) struct BufferGuard<'a> {
    _order: RingOrder,
    meta: MutexGuard<'a, BufferMeta>,
}

impl std::ops::Deref for BufferGuard<'_> {
    type Target = BufferMeta;

    fn deref(&self) -> &BufferMeta {
        &self.meta
    }
}

impl std::ops::DerefMut for BufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut BufferMeta {
        &mut self.meta
    }
}

impl BufferGuard<'_> {
    /// Waits on the buffer's condvar for at most a slice of time, so the
    /// caller can re-check the global error.
    pub(crate) fn wait(&mut self, buf: &IoBuf) {
        let _timed_out = buf.cv.wait_for(&mut self.meta, WAIT_SLICE);
    }
}

thread_local! {
    static HELD_BUFFER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Asserts that a thread never holds two buffer locks at once. Buffer
/// locks are taken after the log lock and never nested, which keeps the
/// ring free of lock order cycles.
struct RingOrder {
    index: usize,
}

impl RingOrder {
    fn enter(index: usize) -> RingOrder {
        HELD_BUFFER.with(|held| {
            debug_assert!(
                held.get().is_none(),
                "buffer {} locked while holding buffer {:?}",
                index,
                held.get()
            );
            held.set(Some(index));
        });
        RingOrder { index }
    }
}

impl Drop for RingOrder {
    fn drop(&mut self) {
        HELD_BUFFER.with(|held| {
            debug_assert_eq!(held.get(), Some(self.index));
            held.set(None);
        });
    }
}

/// Progress of buffers through to the OS.
#[derive(Debug)]
pub(crate) struct Sent {
    /// Highest buffer `seq` whose bytes have been written out.
    pub last_seq: u64,
}

pub(crate) struct Ring {
    pub buffers: Vec<IoBuf>,
    pub sent: Mutex<Sent>,
    pub sent_cv: Condvar,
}

impl Ring {
    pub(crate) fn new(buffers: usize, buffer_size: usize) -> Ring {
        Ring {
            buffers: (0..buffers).map(|index| IoBuf::new(index, buffer_size)).collect(),
            sent: Mutex::new(Sent { last_seq: 0 }),
            sent_cv: Condvar::new(),
        }
    }

    pub(crate) fn buffer_for(&self, seq: u64) -> &IoBuf {
        &self.buffers[(seq % self.buffers.len() as u64) as usize]
    }

    pub(crate) fn last_sent(&self) -> u64 {
        self.sent.lock().last_seq
    }

    pub(crate) fn mark_sent(&self, seq: u64) {
        let mut sent = self.sent.lock();
        debug_assert_eq!(sent.last_seq + 1, seq);
        sent.last_seq = seq;

        // having held the mutex makes this linearized
        // with the notify below.
        drop(sent);

        let _notified = self.sent_cv.notify_all();
    }

    /// Wakes every thread blocked on the ring, used once the log has
    /// failed so waiters can observe the error.
    pub(crate) fn notify_all(&self) {
        drop(self.sent.lock());
        let _notified = self.sent_cv.notify_all();
        for buf in &self.buffers {
            drop(buf.lock());
            buf.notify_all();
        }
    }
}
