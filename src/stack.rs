//! Machine stacks for greenlets.
//!
//! Each stack is an anonymous private mapping with a `PROT_NONE` guard page at
//! its low end, so running off the bottom faults instead of silently
//! overwriting whatever lives below it.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_STACK;
#[cfg(not(target_os = "linux"))]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

/// System page size, queried once.
pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    })
}

/// Keeps a per-thread count of live stacks accurate.
struct Gauge(Arc<AtomicUsize>);

impl Gauge {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Gauge(Arc::clone(counter))
    }
}

impl Drop for Gauge {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// An owned, guarded stack region.
pub(crate) struct Stack {
    base: NonNull<u8>,
    /// Whole mapping, guard page included
    len: usize,
    guard: usize,
    _gauge: Gauge,
}

// The mapping is plain memory owned by this value; it is only executed on
// by the owning thread.
unsafe impl Send for Stack {}

impl Stack {
    /// Maps a stack with at least `size` usable bytes.
    ///
    /// Fails with [`Error::StackExhausted`] without side effects when the
    /// kernel refuses the mapping.
    pub(crate) fn allocate(size: usize, gauge: &Arc<AtomicUsize>) -> Result<Stack> {
        let page = page_size();
        let len = size
            .max(page)
            .checked_next_multiple_of(page)
            .and_then(|usable| usable.checked_add(page))
            .ok_or(Error::StackExhausted { size })?;

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::StackExhausted { size });
        }

        // Stacks grow downward: the guard goes at the lowest address
        if unsafe { libc::mprotect(addr, page, libc::PROT_NONE) } != 0 {
            unsafe { libc::munmap(addr, len) };
            return Err(Error::StackExhausted { size });
        }

        let base = NonNull::new(addr as *mut u8).ok_or(Error::StackExhausted { size })?;
        Ok(Stack {
            base,
            len,
            guard: page,
            _gauge: Gauge::new(gauge),
        })
    }

    /// Highest usable address, aligned to 16 bytes (required by ABI)
    pub(crate) fn top(&self) -> usize {
        (self.base.as_ptr() as usize + self.len) & !0xF
    }

    /// Usable bytes, guard page excluded
    pub(crate) fn size(&self) -> usize {
        self.len - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("top", &format_args!("{:#x}", self.top()))
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stacks_are_page_rounded_and_aligned() {
        let gauge = Arc::new(AtomicUsize::new(0));
        let stack = Stack::allocate(10_000, &gauge).unwrap();
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.size() >= 10_000);
        assert_eq!(stack.top() % 16, 0);

        // the usable region is writable right up to the top
        unsafe {
            let top = stack.top() as *mut u64;
            top.sub(1).write(0xfeed);
            assert_eq!(top.sub(1).read(), 0xfeed);
        }
    }

    #[test]
    fn gauge_tracks_live_stacks() {
        let gauge = Arc::new(AtomicUsize::new(0));
        let a = Stack::allocate(16 * 1024, &gauge).unwrap();
        let b = Stack::allocate(16 * 1024, &gauge).unwrap();
        assert_eq!(gauge.load(Ordering::Relaxed), 2);
        drop(a);
        assert_eq!(gauge.load(Ordering::Relaxed), 1);
        drop(b);
        assert_eq!(gauge.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn absurd_sizes_fail_cleanly() {
        let gauge = Arc::new(AtomicUsize::new(0));
        let err = Stack::allocate(usize::MAX - 1, &gauge).unwrap_err();
        assert!(matches!(err, Error::StackExhausted { .. }));
        assert_eq!(gauge.load(Ordering::Relaxed), 0);
    }
}
