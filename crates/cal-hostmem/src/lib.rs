//! Host memory for GPU-visible buffers
//!
//! Remote resources are only useful if the host side of the transfer is laid out the way
//! the device DMA engine likes it. This crate provides the two allocation flavors the
//! runtime and its callers rely on:
//!
//! - [`PageAlignedBuffer`]: zeroed, page-aligned heap memory (`posix_memalign`)
//! - [`HugePages`]: shared mappings of an unlinked file in a `hugetlbfs` mount
//!
//! Huge pages are Linux only. On other targets [`has_huge_pages`] reports `false`
//! and [`HugePages::allocate`] fails with [`HostMemError::HugePagesUnavailable`].
//!
//! # Example
//!
//! ```
//! use cal_hostmem::{page_size, PageAlignedBuffer};
//!
//! let mut buf = PageAlignedBuffer::zeroed(3 * 4096).unwrap();
//! assert_eq!(buf.as_ptr() as usize % page_size(), 0);
//! buf.as_mut_slice()[0] = 7;
//! ```

mod aligned;
mod error;
mod huge;

pub use aligned::PageAlignedBuffer;
pub use error::{HostMemError, Result};
pub use huge::{has_huge_pages, huge_page_size, HugePages, DEFAULT_HUGE_PAGE_SIZE};

/// System page size in bytes
pub fn page_size() -> usize {
    // Safety: sysconf has no memory-safety preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }
}
