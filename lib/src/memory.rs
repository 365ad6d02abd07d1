//! Backing memory of video buffers.
//!
//! Buffers are either provided by the device itself (`MemoryType::Mmap`), in
//! which case clients map them by index, or supplied by the client
//! (`MemoryType::UserPtr`), in which case the client hands a buffer of its own
//! pool to the device every time it queues it.
//!
//! In both cases the memory is an `AlignedRegion`: a fallibly allocated block
//! whose usable part starts on the requested alignment, so that DMA engines
//! and cache maintenance operate on whole lines.
use enumn::N;
use thiserror::Error;

/// All the supported memory types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum MemoryType {
    Mmap = 1,
    UserPtr = 2,
}

/// Where the memory of a pool should preferably live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// Fast, scarce on-chip memory.
    Internal,
    /// Large, slower external memory.
    #[default]
    External,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("failed to allocate {0} bytes")]
    OutOfMemory(usize),
}

/// A block of memory whose usable part starts on a given alignment.
///
/// The backing storage is never resized after allocation, so the aligned
/// start remains valid for the lifetime of the region.
pub struct AlignedRegion {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedRegion {
    /// Allocate a zeroed region of `len` usable bytes aligned on `alignment`.
    /// Allocation failure is reported instead of aborting.
    pub fn new(len: usize, alignment: usize) -> Result<Self, AllocError> {
        if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(alignment));
        }

        let total = len
            .checked_add(alignment - 1)
            .ok_or(AllocError::OutOfMemory(len))?;
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(total)
            .map_err(|_| AllocError::OutOfMemory(total))?;
        storage.resize(total, 0);

        let offset = storage.as_ptr().align_offset(alignment);
        if offset + len > total {
            return Err(AllocError::OutOfMemory(total));
        }

        Ok(AlignedRegion {
            storage,
            offset,
            len,
        })
    }

    /// Number of usable bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }

    /// Address of the first usable byte.
    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }
}

impl std::fmt::Debug for AlignedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedRegion")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_alignment() {
        for alignment in [1, 16, 64, 4096] {
            let region = AlignedRegion::new(1000, alignment).unwrap();
            assert_eq!(region.len(), 1000);
            assert_eq!(region.as_ptr() as usize % alignment, 0);
            assert!(region.as_slice().iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_region_invalid_alignment() {
        assert_eq!(
            AlignedRegion::new(16, 3).unwrap_err(),
            AllocError::InvalidAlignment(3)
        );
        assert_eq!(
            AlignedRegion::new(16, 0).unwrap_err(),
            AllocError::InvalidAlignment(0)
        );
    }

    #[test]
    fn test_region_out_of_memory() {
        assert!(matches!(
            AlignedRegion::new(isize::MAX as usize, 64),
            Err(AllocError::OutOfMemory(_))
        ));
    }
}
