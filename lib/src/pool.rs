//! Fixed-size pools of equally-sized buffers.
//!
//! A `BufferPool` exclusively owns the memory of its buffers. Callers only
//! ever hold `BufferHandle`s, which identify a buffer by its stable index and
//! give access to its memory within a borrow scope. Each buffer follows the
//! state machine described by `BufferState`:
//!
//! ```text
//! Free -> Allocated -> Queued -> Done -> Active -> Free
//!              \__________________________/
//! ```
//!
//! Any state can go back to `Free` through `BufferHandle::release`, which is
//! the only way for a buffer to re-enter circulation.
mod buffer;

pub use buffer::BufferState;

use buffer::{BufferInfo, BufferStats};

use crate::error::ErrorKind;
use crate::lock;
use crate::memory::{AlignedRegion, AllocError, MemoryType, Placement};

use log::{debug, error, warn};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{atomic::Ordering, Arc, MutexGuard};
use thiserror::Error;

/// Minimum number of buffers of a pool.
pub const MIN_BUFFER_COUNT: usize = 2;
/// Maximum number of buffers of a pool.
pub const MAX_BUFFER_COUNT: usize = 6;
/// Alignment used for buffers that are accessed by DMA engines: one cache line.
pub const DEFAULT_ALIGNMENT: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CreatePoolError {
    #[error("invalid buffer count {0}, must be between {MIN_BUFFER_COUNT} and {MAX_BUFFER_COUNT}")]
    InvalidCount(usize),
    #[error("buffers cannot be empty")]
    ZeroSize,
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("out of memory while allocating buffer {index} ({size} bytes)")]
    OutOfMemory { index: usize, size: usize },
}

impl CreatePoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CreatePoolError::OutOfMemory { .. } => ErrorKind::ResourceExhausted,
            _ => ErrorKind::InvalidArgument,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClaimError {
    #[error("all buffers are currently being used")]
    NoFreeBuffer,
    #[error("buffer with provided index {0} does not exist")]
    InvalidIndex(usize),
    #[error("buffer is already in use")]
    AlreadyUsed,
}

impl ClaimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClaimError::InvalidIndex(_) => ErrorKind::InvalidArgument,
            _ => ErrorKind::ResourceExhausted,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal transition of buffer {index} from {from} to {to}")]
pub struct TransitionError {
    pub index: usize,
    pub from: BufferState,
    pub to: BufferState,
}

/// A fixed set of buffers sharing the same size, alignment and memory type.
pub struct BufferPool {
    buffers: Vec<Arc<BufferInfo>>,
    stats: Arc<BufferStats>,
    buffer_size: usize,
    alignment: usize,
    placement: Placement,
    memory_type: MemoryType,
}

impl BufferPool {
    /// Allocate `count` buffers of `size` bytes each. Either all buffers are
    /// allocated, or none is and an error is returned.
    pub fn new(
        count: usize,
        size: usize,
        alignment: usize,
        placement: Placement,
        memory_type: MemoryType,
    ) -> Result<Self, CreatePoolError> {
        if !(MIN_BUFFER_COUNT..=MAX_BUFFER_COUNT).contains(&count) {
            return Err(CreatePoolError::InvalidCount(count));
        }
        if size == 0 {
            return Err(CreatePoolError::ZeroSize);
        }
        if !alignment.is_power_of_two() {
            return Err(CreatePoolError::InvalidAlignment(alignment));
        }

        let stats = Arc::new(BufferStats::new());
        let mut buffers = Vec::with_capacity(count);
        for index in 0..count {
            // On failure, the buffers allocated so far are dropped along with
            // `buffers`.
            let memory = AlignedRegion::new(size, alignment).map_err(|e| match e {
                AllocError::InvalidAlignment(a) => CreatePoolError::InvalidAlignment(a),
                AllocError::OutOfMemory(_) => {
                    warn!("Allocation of buffer {} ({} bytes) failed", index, size);
                    CreatePoolError::OutOfMemory { index, size }
                }
            })?;
            buffers.push(Arc::new(BufferInfo::new(index, memory, Arc::clone(&stats))));
        }

        debug!(
            "Created pool of {} {:?} buffers of {} bytes ({:?} memory, {}-byte aligned)",
            count, memory_type, size, placement, alignment
        );

        Ok(BufferPool {
            buffers,
            stats,
            buffer_size: size,
            alignment,
            placement,
            memory_type,
        })
    }

    /// Number of buffers in the pool.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn num_free(&self) -> usize {
        self.stats.num_free()
    }

    pub fn num_queued(&self) -> usize {
        self.stats.num_queued()
    }

    /// Returns the current state of buffer `index`.
    pub fn state(&self, index: usize) -> Option<BufferState> {
        self.buffers
            .get(index)
            .map(|b| b.do_with_state(|state| *state))
    }

    /// Returns a handle to buffer `index` without claiming it.
    pub fn buffer(&self, index: usize) -> Option<BufferHandle> {
        self.buffers.get(index).map(|info| BufferHandle {
            info: Arc::clone(info),
        })
    }

    /// Claim the first free buffer, in ascending index order, and move it to
    /// the `Allocated` state.
    pub fn claim_free(&self) -> Result<BufferHandle, ClaimError> {
        self.buffers
            .iter()
            .find(|info| {
                info.update_state(|state| match state {
                    BufferState::Free => {
                        *state = BufferState::Allocated;
                        true
                    }
                    _ => false,
                })
            })
            .map(|info| BufferHandle {
                info: Arc::clone(info),
            })
            .ok_or(ClaimError::NoFreeBuffer)
    }

    /// Claim buffer `index` specifically, if it is free.
    pub fn try_claim(&self, index: usize) -> Result<BufferHandle, ClaimError> {
        let info = self
            .buffers
            .get(index)
            .ok_or(ClaimError::InvalidIndex(index))?;

        info.update_state(|state| match state {
            BufferState::Free => {
                *state = BufferState::Allocated;
                Ok(())
            }
            _ => Err(ClaimError::AlreadyUsed),
        })?;

        Ok(BufferHandle {
            info: Arc::clone(info),
        })
    }

    /// Whether `handle` refers to one of the buffers of this pool.
    pub fn owns(&self, handle: &BufferHandle) -> bool {
        self.buffers
            .get(handle.index())
            .map(|info| Arc::ptr_eq(info, &handle.info))
            .unwrap_or(false)
    }

    /// Force all buffers back to the `Free` state. Returns the number of
    /// buffers that were still in use.
    pub fn reclaim_all(&self) -> usize {
        self.buffers
            .iter()
            .filter(|info| {
                info.update_state(|state| {
                    let was_used = *state != BufferState::Free;
                    if was_used {
                        warn!(
                            "Forcibly reclaiming buffer {} in state {}",
                            info.index, state
                        );
                    }
                    *state = BufferState::Free;
                    was_used
                })
            })
            .count()
    }

    /// Release all the memory of the pool. Buffers that are still in use are
    /// forcibly reclaimed first.
    pub fn destroy(self) {
        drop(self)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let reclaimed = self.reclaim_all();
        if reclaimed > 0 {
            warn!(
                "Pool destroyed while {} of its {} buffers were still in use",
                reclaimed,
                self.buffers.len()
            );
        } else {
            debug!("Destroyed pool of {} buffers", self.buffers.len());
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("len", &self.buffers.len())
            .field("buffer_size", &self.buffer_size)
            .field("num_free", &self.num_free())
            .field("num_queued", &self.num_queued())
            .finish()
    }
}

/// Handle to a buffer of a pool.
///
/// Cloning a handle does not claim the buffer again: ownership is tracked by
/// the state of the buffer, not by the number of handles.
#[derive(Clone)]
pub struct BufferHandle {
    info: Arc<BufferInfo>,
}

impl BufferHandle {
    pub fn index(&self) -> usize {
        self.info.index
    }

    pub fn capacity(&self) -> usize {
        self.info.capacity
    }

    /// Amount of valid data in the buffer.
    pub fn bytes_used(&self) -> usize {
        self.info.bytes_used.load(Ordering::Acquire)
    }

    /// Set the amount of valid data, clamped to the capacity of the buffer.
    /// Returns the value actually stored.
    pub fn set_bytes_used(&self, bytes_used: usize) -> usize {
        let bytes_used = bytes_used.min(self.capacity());
        self.info.bytes_used.store(bytes_used, Ordering::Release);
        bytes_used
    }

    pub fn state(&self) -> BufferState {
        self.info.do_with_state(|state| *state)
    }

    /// Borrow the valid data of the buffer.
    pub fn data(&self) -> BufferData<'_> {
        BufferData {
            memory: lock(&self.info.memory),
            len: self.bytes_used(),
        }
    }

    /// Borrow the whole memory of the buffer for writing.
    pub fn data_mut(&self) -> BufferDataMut<'_> {
        BufferDataMut {
            memory: lock(&self.info.memory),
        }
    }

    /// Copy `src` into the buffer, truncated to the buffer's capacity, and
    /// record the copied length as the valid data length.
    pub fn write_clamped(&self, src: &[u8]) -> usize {
        let len = src.len().min(self.capacity());
        if len < src.len() {
            debug!(
                "Truncating {} bytes to the {} bytes of buffer {}",
                src.len(),
                len,
                self.index()
            );
        }
        self.data_mut()[..len].copy_from_slice(&src[..len]);
        self.set_bytes_used(len)
    }

    fn transition(&self, to: BufferState) -> Result<(), TransitionError> {
        let index = self.index();
        self.info
            .update_state(|state| {
                if state.can_become(to) {
                    *state = to;
                    Ok(())
                } else {
                    Err(TransitionError {
                        index,
                        from: *state,
                        to,
                    })
                }
            })
            .map_err(|e| {
                error!("{}", e);
                e
            })
    }

    /// Record that the buffer has been submitted to a device.
    pub fn mark_queued(&self) -> Result<(), TransitionError> {
        self.transition(BufferState::Queued)
    }

    /// Record that the device is done with the buffer.
    pub fn mark_done(&self) -> Result<(), TransitionError> {
        self.transition(BufferState::Done)
    }

    /// Record that a consumer is now reading the buffer.
    pub fn mark_active(&self) -> Result<(), TransitionError> {
        self.transition(BufferState::Active)
    }

    /// Return the buffer to the `Free` state, whatever its current state.
    pub fn release(&self) {
        self.info.update_state(|state| *state = BufferState::Free);
    }

    /// Whether both handles refer to the same buffer.
    pub fn ptr_eq(&self, other: &BufferHandle) -> bool {
        Arc::ptr_eq(&self.info, &other.info)
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("index", &self.index())
            .field("capacity", &self.capacity())
            .field("bytes_used", &self.bytes_used())
            .field("state", &self.state())
            .finish()
    }
}

/// Read access to the valid data of a buffer.
pub struct BufferData<'a> {
    memory: MutexGuard<'a, AlignedRegion>,
    len: usize,
}

impl Deref for BufferData<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.memory.as_slice()[..self.len]
    }
}

/// Write access to the whole memory of a buffer.
pub struct BufferDataMut<'a> {
    memory: MutexGuard<'a, AlignedRegion>,
}

impl Deref for BufferDataMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.memory.as_slice()
    }
}

impl DerefMut for BufferDataMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.memory.as_mut_slice()
    }
}

/// Guard that releases a claimed buffer when dropped, unless `disarm()` has
/// been called. Used to make sure every exit path of a function that claimed
/// a buffer gives it back.
pub struct BufferGuard {
    handle: BufferHandle,
    armed: bool,
}

impl BufferGuard {
    pub fn new(handle: BufferHandle) -> Self {
        BufferGuard {
            handle,
            armed: true,
        }
    }

    /// Disarm the guard and return the buffer, which will be left untouched.
    pub fn disarm(mut self) -> BufferHandle {
        self.armed = false;
        self.handle.clone()
    }
}

impl Deref for BufferGuard {
    type Target = BufferHandle;

    fn deref(&self) -> &BufferHandle {
        &self.handle
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!("Guard releasing buffer {}", self.handle.index());
            self.handle.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn new_pool(count: usize, size: usize) -> BufferPool {
        BufferPool::new(
            count,
            size,
            DEFAULT_ALIGNMENT,
            Placement::External,
            MemoryType::UserPtr,
        )
        .unwrap()
    }

    #[test]
    fn test_create_pool() {
        let pool = new_pool(4, 1000);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.num_free(), 4);
        assert_eq!(pool.buffer_size(), 1000);
        for i in 0..4 {
            let buffer = pool.buffer(i).unwrap();
            assert_eq!(buffer.capacity(), 1000);
            assert_eq!(buffer.data_mut().as_ptr() as usize % DEFAULT_ALIGNMENT, 0);
            assert_eq!(pool.state(i), Some(BufferState::Free));
        }
        assert!(pool.buffer(4).is_none());
    }

    #[test]
    fn test_create_pool_invalid() {
        let create = |count, size, alignment| {
            BufferPool::new(
                count,
                size,
                alignment,
                Placement::Internal,
                MemoryType::Mmap,
            )
        };
        assert_eq!(create(1, 16, 16).unwrap_err(), CreatePoolError::InvalidCount(1));
        assert_eq!(create(7, 16, 16).unwrap_err(), CreatePoolError::InvalidCount(7));
        assert_eq!(create(2, 0, 16).unwrap_err(), CreatePoolError::ZeroSize);
        assert_eq!(
            create(2, 16, 24).unwrap_err(),
            CreatePoolError::InvalidAlignment(24)
        );
    }

    #[test]
    fn test_create_pool_out_of_memory() {
        let err = BufferPool::new(
            2,
            isize::MAX as usize,
            DEFAULT_ALIGNMENT,
            Placement::External,
            MemoryType::UserPtr,
        )
        .unwrap_err();
        assert_eq!(
            err,
            CreatePoolError::OutOfMemory {
                index: 0,
                size: isize::MAX as usize
            }
        );
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        const NUM_BUFFERS: usize = 3;
        let pool = new_pool(NUM_BUFFERS, 64);

        let claimed = (0..NUM_BUFFERS)
            .map(|i| {
                let buffer = pool.claim_free().unwrap();
                // Claims are served in ascending index order.
                assert_eq!(buffer.index(), i);
                assert_eq!(buffer.state(), BufferState::Allocated);
                buffer
            })
            .collect::<Vec<_>>();
        assert_eq!(pool.num_free(), 0);
        assert_eq!(pool.claim_free().unwrap_err(), ClaimError::NoFreeBuffer);

        claimed[1].release();
        assert_eq!(pool.num_free(), 1);
        let again = pool.claim_free().unwrap();
        assert_eq!(again.index(), 1);
        assert_eq!(pool.claim_free().unwrap_err(), ClaimError::NoFreeBuffer);
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = new_pool(2, 64);
        let buffer = pool.claim_free().unwrap();
        buffer.release();
        buffer.release();
        assert_eq!(pool.num_free(), 2);
        assert_eq!(buffer.state(), BufferState::Free);
    }

    #[test]
    fn test_try_claim() {
        let pool = new_pool(2, 64);
        let buffer = pool.try_claim(1).unwrap();
        assert_eq!(buffer.index(), 1);
        assert_eq!(pool.try_claim(1).unwrap_err(), ClaimError::AlreadyUsed);
        assert_eq!(pool.try_claim(5).unwrap_err(), ClaimError::InvalidIndex(5));
        assert_eq!(pool.claim_free().unwrap().index(), 0);
    }

    #[test]
    fn test_state_machine() {
        let pool = new_pool(2, 64);
        let buffer = pool.claim_free().unwrap();

        // Cannot be done before being queued.
        assert_eq!(
            buffer.mark_done().unwrap_err(),
            TransitionError {
                index: 0,
                from: BufferState::Allocated,
                to: BufferState::Done
            }
        );

        buffer.mark_queued().unwrap();
        assert_eq!(pool.num_queued(), 1);
        assert!(buffer.mark_active().is_err());
        buffer.mark_done().unwrap();
        assert_eq!(pool.num_queued(), 0);
        buffer.mark_active().unwrap();
        assert_eq!(pool.state(0), Some(BufferState::Active));
        assert!(buffer.mark_queued().is_err());

        buffer.release();
        assert!(buffer.mark_queued().is_err());
        assert_eq!(pool.num_free(), 2);
    }

    #[test]
    fn test_write_clamped() {
        let pool = new_pool(2, 8);
        let buffer = pool.claim_free().unwrap();

        assert_eq!(buffer.write_clamped(&[1, 2, 3]), 3);
        assert_eq!(&*buffer.data(), &[1, 2, 3]);

        let big = (0u8..32).collect::<Vec<_>>();
        assert_eq!(buffer.write_clamped(&big), 8);
        assert_eq!(&*buffer.data(), &big[..8]);
        assert_eq!(buffer.bytes_used(), 8);

        assert_eq!(buffer.set_bytes_used(100), 8);
    }

    #[test]
    fn test_guard() {
        let pool = new_pool(2, 8);

        {
            let _guard = BufferGuard::new(pool.claim_free().unwrap());
            assert_eq!(pool.num_free(), 1);
        }
        assert_eq!(pool.num_free(), 2);

        let guard = BufferGuard::new(pool.claim_free().unwrap());
        let buffer = guard.disarm();
        assert_eq!(pool.num_free(), 1);
        assert_eq!(buffer.state(), BufferState::Allocated);
    }

    #[test]
    fn test_owns() {
        let pool = new_pool(2, 8);
        let other = new_pool(2, 8);
        let buffer = other.claim_free().unwrap();
        assert!(other.owns(&buffer));
        assert!(!pool.owns(&buffer));
    }

    #[test]
    fn test_reclaim_on_destroy() {
        let pool = new_pool(3, 8);
        let a = pool.claim_free().unwrap();
        let b = pool.claim_free().unwrap();
        b.mark_queued().unwrap();

        assert_eq!(pool.reclaim_all(), 2);
        assert_eq!(pool.num_free(), 3);
        assert_eq!(pool.num_queued(), 0);

        a.mark_active().unwrap_err();
        let _c = pool.claim_free().unwrap();
        pool.destroy();
        // Handles outlive the pool without touching freed memory.
        assert_eq!(a.capacity(), 8);
    }

    #[test]
    fn test_no_double_ownership() {
        const NUM_THREADS: usize = 4;
        const NUM_ITERATIONS: usize = 1000;
        let pool = new_pool(MAX_BUFFER_COUNT, 16);
        let owned = (0..MAX_BUFFER_COUNT)
            .map(|_| AtomicBool::new(false))
            .collect::<Vec<_>>();

        std::thread::scope(|s| {
            for _ in 0..NUM_THREADS {
                s.spawn(|| {
                    for _ in 0..NUM_ITERATIONS {
                        if let Ok(buffer) = pool.claim_free() {
                            let was_owned = owned[buffer.index()].swap(true, Ordering::SeqCst);
                            assert!(!was_owned, "buffer {} claimed twice", buffer.index());
                            owned[buffer.index()].store(false, Ordering::SeqCst);
                            buffer.release();
                        }
                    }
                });
            }
        });

        assert_eq!(pool.num_free(), MAX_BUFFER_COUNT);
    }
}
