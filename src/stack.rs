//! `mmap`-backed stack memory: a fixed region with a leading guard page,
//! used for run stacks, light-weight cothread stacks, and the group's
//! control stack alike.

use std::io;
use std::ptr;

/// Stacks below this size are rejected; matches the smallest sane guard-page
/// + usable-page allocation.
pub const MIN_STACK_SIZE: usize = 4096;

/// A single anonymous-mmap stack region with a `PROT_NONE` guard page at its
/// low address. Growth is downward, from `high()` toward `low()`.
pub struct StackRegion {
    high: *mut u8,
    mmap_len: usize,
}

impl StackRegion {
    /// Allocates a region with at least `size` usable bytes above a guard
    /// page.
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .expect("integer overflow while sizing a stack region")
            & !(page_size - 1);

        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        unsafe {
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            let region = Self {
                high: mmap.cast::<u8>().add(mmap_len),
                mmap_len,
            };

            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                let err = io::Error::last_os_error();
                // `region`'s Drop still runs and munmaps what we reserved.
                drop(region);
                return Err(err);
            }

            log::debug!(
                "mapped stack region: {} usable bytes, {} mapped bytes",
                size,
                mmap_len
            );

            Ok(region)
        }
    }

    /// The highest usable address: where a fresh stack's growth begins.
    pub fn high(&self) -> *mut u8 {
        self.high
    }

    /// The lowest usable address (immediately above the guard page).
    pub fn low(&self) -> *mut u8 {
        unsafe { self.high.sub(self.mmap_len - page_size()) }
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        unsafe {
            let mmap = self.high.sub(self.mmap_len);
            let ret = libc::munmap(mmap.cast(), self.mmap_len);
            debug_assert_eq!(ret, 0, "munmap of a stack region failed");
        }
    }
}

fn page_size() -> usize {
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}
