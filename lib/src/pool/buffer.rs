use crate::lock;
use crate::memory::AlignedRegion;

use std::fmt;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

/// Represents the current ownership state of a pooled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// The buffer can be claimed.
    Free,
    /// The buffer has been claimed by a producer but not submitted to a device yet.
    Allocated,
    /// The buffer has been submitted to a device and awaits completion.
    Queued,
    /// The device is done with the buffer; its content is ready to be read.
    Done,
    /// A consumer is reading the buffer. It goes back to `Free` once released.
    Active,
}

impl BufferState {
    /// Whether moving from `self` to `to` is a legal named transition.
    /// Releasing (moving to `Free`) is always legal and not covered here.
    pub(super) fn can_become(self, to: BufferState) -> bool {
        matches!(
            (self, to),
            (BufferState::Allocated, BufferState::Queued)
                | (BufferState::Queued, BufferState::Done)
                | (BufferState::Done, BufferState::Active)
                | (BufferState::Allocated, BufferState::Active)
        )
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Structure that allows a pool and its users to keep track of how many
/// buffers are available for use and currently queued.
#[derive(Default)]
pub(super) struct BufferStats {
    num_free: AtomicUsize,
    num_queued: AtomicUsize,
}

impl BufferStats {
    /// Create a new tracker for buffer stats. The stats are initially empty,
    /// so this structure must be passed to `BufferInfo::new` for the buffer to
    /// be initially registered.
    pub fn new() -> Self {
        Self {
            num_free: AtomicUsize::new(0),
            num_queued: AtomicUsize::new(0),
        }
    }

    pub fn num_free(&self) -> usize {
        self.num_free.load(Ordering::Relaxed)
    }

    pub fn num_queued(&self) -> usize {
        self.num_queued.load(Ordering::Relaxed)
    }
}

pub(super) struct BufferInfo {
    /// Position of the buffer in its pool.
    pub(super) index: usize,
    /// Usable size of the buffer.
    pub(super) capacity: usize,
    /// Amount of valid data currently in the buffer.
    pub(super) bytes_used: AtomicUsize,
    /// Backing memory.
    pub(super) memory: Mutex<AlignedRegion>,
    /// Current state of the buffer.
    state: Mutex<BufferState>,
    /// Link to the pool's buffer stats, so we can update them as the buffer
    /// state changes.
    stats: Arc<BufferStats>,
}

impl Drop for BufferInfo {
    fn drop(&mut self) {
        if *lock(&self.state) == BufferState::Free {
            self.stats.num_free.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl BufferInfo {
    pub(super) fn new(index: usize, memory: AlignedRegion, stats: Arc<BufferStats>) -> Self {
        stats.num_free.fetch_add(1, Ordering::Relaxed);
        Self {
            index,
            capacity: memory.len(),
            bytes_used: AtomicUsize::new(0),
            memory: Mutex::new(memory),
            state: Mutex::new(BufferState::Free),
            stats: Arc::clone(&stats),
        }
    }

    /// Do something with the buffer's state. The state is provided read-only
    /// and thus cannot be modified.
    pub(super) fn do_with_state<R, F: FnOnce(&BufferState) -> R>(&self, f: F) -> R {
        f(&lock(&self.state))
    }

    /// Update the buffer's state. The pool's stats will be updated to reflect
    /// the new state decided by `f`.
    pub(super) fn update_state<R, F: FnOnce(&mut BufferState) -> R>(&self, f: F) -> R {
        let mut state = lock(&self.state);
        match *state {
            BufferState::Free => self.stats.num_free.fetch_sub(1, Ordering::Relaxed),
            BufferState::Queued => self.stats.num_queued.fetch_sub(1, Ordering::Relaxed),
            _ => 0,
        };

        // Let the provided closure decide the new state.
        let res = f(&mut state);

        match *state {
            BufferState::Free => self.stats.num_free.fetch_add(1, Ordering::Relaxed),
            BufferState::Queued => self.stats.num_queued.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };

        res
    }
}
