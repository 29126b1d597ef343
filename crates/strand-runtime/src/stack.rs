//! Fiber stack mapping
//!
//! Stacks come from anonymous mmap. The lowest page of every mapping
//! stays `PROT_NONE` so an overflowing fiber faults instead of
//! corrupting a neighbour. The control block of a fiber lives at the
//! high end of the same mapping, so one allocation covers both.

use core::ptr::NonNull;

use strand_core::error::StackError;
use strand_core::fwarn;

/// Page size assumed for guard and rounding
pub const PAGE_SIZE: usize = 4096;

/// Guard region at the low end of every stack
pub const GUARD_SIZE: usize = PAGE_SIZE;

/// A mapped stack, guard page included
#[derive(Clone, Copy, Debug)]
pub struct StackRegion {
    base: NonNull<u8>,
    size: usize,
}

impl StackRegion {
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the highest usable byte; stacks grow down from here
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.size) }
    }

    /// Lowest usable address, just above the guard page
    #[inline]
    pub fn floor(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(GUARD_SIZE) }
    }
}

/// Source of fiber stacks
///
/// The scheduler core only consumes this contract; embedders may pool
/// or pre-map stacks behind it.
pub trait StackSource {
    /// Map a region with at least `size` usable bytes above the guard
    fn allocate(&self, size: usize) -> Result<StackRegion, StackError>;

    /// Release a region previously returned by [`Self::allocate`].
    ///
    /// # Safety
    ///
    /// No context may still live on the region.
    unsafe fn deallocate(&self, region: StackRegion);
}

/// Default source: anonymous private mmap with a low guard page
pub struct MmapStacks;

/// Shared instance used when no custom source is configured
pub static MMAP_STACKS: MmapStacks = MmapStacks;

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl StackSource for MmapStacks {
    fn allocate(&self, size: usize) -> Result<StackRegion, StackError> {
        if size == 0 {
            return Err(StackError::TooSmall);
        }
        let usable = size
            .checked_add(PAGE_SIZE - 1)
            .ok_or(StackError::SizeOverflow)?
            & !(PAGE_SIZE - 1);
        let total = usable.checked_add(GUARD_SIZE).ok_or(StackError::SizeOverflow)?;

        // Reserve the whole span inaccessible, then open everything
        // above the guard page.
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::MapFailed(last_errno()));
        }

        let ret = unsafe {
            libc::mprotect(
                (base as *mut u8).add(GUARD_SIZE) as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            let errno = last_errno();
            unsafe { libc::munmap(base, total) };
            return Err(StackError::ProtectFailed(errno));
        }

        Ok(StackRegion {
            base: NonNull::new(base as *mut u8).ok_or(StackError::MapFailed(0))?,
            size: total,
        })
    }

    unsafe fn deallocate(&self, region: StackRegion) {
        let ret = libc::munmap(region.base() as *mut libc::c_void, region.size());
        if ret != 0 {
            fwarn!(
                "failed to unmap fiber stack at {:p} (errno {})",
                region.base(),
                last_errno()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_to_pages() {
        let region = MMAP_STACKS.allocate(1000).unwrap();
        assert_eq!(region.size(), PAGE_SIZE + GUARD_SIZE);
        assert_eq!(region.base() as usize % PAGE_SIZE, 0);
        unsafe { MMAP_STACKS.deallocate(region) };
    }

    #[test]
    fn test_usable_span_is_writable() {
        let region = MMAP_STACKS.allocate(64 * 1024).unwrap();
        unsafe {
            region.floor().write(0xAB);
            region.top().sub(1).write(0xCD);
            assert_eq!(region.floor().read(), 0xAB);
            assert_eq!(region.top().sub(1).read(), 0xCD);
            MMAP_STACKS.deallocate(region);
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(MMAP_STACKS.allocate(0), Err(StackError::TooSmall)));
    }
}
