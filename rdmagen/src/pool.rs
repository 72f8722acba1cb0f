//! The frame buffers of a receive pipeline.
//!
//! One contiguous allocation, divided into equally sized frames. The hardware writes into it
//! through the addresses handed out here, which is why the memory sits behind an `UnsafeCell`
//! and is only ever read through [`Pool::frame`] after the completion of the frame was observed.
//!
//! [`Pool::frame`]: struct.Pool.html#method.frame
use core::{cell, slice};

use crate::error::ConfigError;
use crate::setup::Span;

/// Fixed-size receive buffers in one allocation.
pub struct Pool {
    /// The entirety of memory.
    /// Inside an `UnsafeCell` since the device writes to it through raw addresses.
    memory: Box<cell::UnsafeCell<[u8]>>,

    /// The size of each frame.
    frame_size: usize,

    /// The number of frames.
    frame_count: usize,
}

impl Pool {
    /// Allocate `count` zeroed frames of `size` bytes each.
    pub fn with_size_and_count(size: usize, count: usize) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::ZeroFrameSize);
        }

        let total_len = size.checked_mul(count)
            .filter(|&len| len <= isize::MAX as usize)
            .ok_or(ConfigError::PoolTooLarge { frames: count, frame_size: size })?;

        let slice = vec![0u8; total_len].into_boxed_slice();
        // SAFETY: `UnsafeCell<[u8]>` has the same layout as `[u8]`.
        let memory = unsafe {
            Box::from_raw(Box::into_raw(slice) as *mut cell::UnsafeCell<[u8]>)
        };

        Ok(Pool {
            memory,
            frame_size: size,
            frame_count: count,
        })
    }

    /// The size of each frame.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// The number of frames.
    pub fn len(&self) -> usize {
        self.frame_count
    }

    /// Whether the pool has no frames at all.
    pub fn is_empty(&self) -> bool {
        self.frame_count == 0
    }

    /// The whole allocation, to be registered as a memory region.
    pub fn span(&self) -> Span {
        Span {
            addr: self.mem_ptr() as usize as u64,
            len: self.frame_size * self.frame_count,
        }
    }

    /// The address of the frame with index `idx`.
    ///
    /// # Panics
    /// This function panics if `idx` is not smaller than the number of frames.
    pub fn frame_addr(&self, idx: usize) -> u64 {
        assert!(idx < self.frame_count);
        self.span().addr + (idx * self.frame_size) as u64
    }

    /// The contents of the frame with index `idx`.
    ///
    /// # Safety
    /// No receive request for this frame may be outstanding: its completion must have been
    /// observed and it must not have been posted again.
    pub unsafe fn frame(&self, idx: usize) -> &[u8] {
        assert!(idx < self.frame_count);
        #[allow(unused_unsafe)]
        unsafe {
            slice::from_raw_parts(self.mem_ptr().add(idx * self.frame_size), self.frame_size)
        }
    }

    fn mem_ptr(&self) -> *mut u8 {
        cell::UnsafeCell::get(&*self.memory) as *mut u8
    }
}

impl core::fmt::Debug for Pool {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Pool")
            .field("frame_size", &self.frame_size)
            .field("frame_count", &self.frame_count)
            .finish()
    }
}
