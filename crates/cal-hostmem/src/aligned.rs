//! Page-aligned heap buffers

use std::ptr::{self, NonNull};

use crate::error::{HostMemError, Result};
use crate::page_size;

/// Zeroed heap allocation aligned to the system page size
///
/// Owns its memory; freed on drop. Zero-length requests allocate one byte so the
/// pointer is always valid and unique.
pub struct PageAlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl PageAlignedBuffer {
    /// Allocate `len` zeroed bytes on a page boundary
    pub fn zeroed(len: usize) -> Result<Self> {
        let alignment = page_size();
        let size = len.max(1);
        let mut raw: *mut libc::c_void = ptr::null_mut();

        // Safety: `raw` is a valid out-pointer and `alignment` is a power of two
        let ret = unsafe { libc::posix_memalign(&mut raw, alignment, size) };
        if ret != 0 {
            let message = match ret {
                libc::ENOMEM => "out of memory".to_string(),
                libc::EINVAL => format!("invalid alignment {alignment}"),
                _ => format!("posix_memalign returned {ret}"),
            };
            return Err(HostMemError::Allocation { size, message });
        }

        let ptr = NonNull::new(raw.cast::<u8>()).ok_or_else(|| HostMemError::Allocation {
            size,
            message: "posix_memalign returned null".into(),
        })?;

        // Safety: freshly allocated block of `size` bytes
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };

        tracing::trace!(len, alignment, "allocated page-aligned buffer");
        Ok(Self { ptr, len })
    }

    /// Allocate a new buffer of `new_len`, carrying over the common prefix
    pub fn resize(self, new_len: usize) -> Result<Self> {
        let mut next = Self::zeroed(new_len)?;
        let keep = self.len.min(new_len);
        next.as_mut_slice()[..keep].copy_from_slice(&self.as_slice()[..keep]);
        Ok(next)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Start of the allocation as a non-null pointer
    pub fn non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: `ptr` is valid for `len` initialized bytes for the buffer's lifetime
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: unique borrow of a live allocation of `len` bytes
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PageAlignedBuffer {
    fn drop(&mut self) {
        // Safety: allocated by posix_memalign and freed exactly once
        unsafe { libc::free(self.ptr.as_ptr().cast()) };
    }
}

impl std::fmt::Debug for PageAlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageAlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

// Safety: the buffer exclusively owns its allocation
unsafe impl Send for PageAlignedBuffer {}
unsafe impl Sync for PageAlignedBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_aligned_and_zeroed() {
        let buf = PageAlignedBuffer::zeroed(10_000).unwrap();
        assert_eq!(buf.as_ptr() as usize % page_size(), 0);
        assert_eq!(buf.len(), 10_000);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_length_is_valid() {
        let buf = PageAlignedBuffer::zeroed(0).unwrap();
        assert!(buf.is_empty());
        assert!(buf.as_slice().is_empty());
    }

    #[test]
    fn resize_keeps_common_prefix() {
        let mut buf = PageAlignedBuffer::zeroed(8).unwrap();
        buf.as_mut_slice().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let grown = buf.resize(16).unwrap();
        assert_eq!(&grown.as_slice()[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(grown.as_slice()[8..].iter().all(|&b| b == 0));

        let shrunk = grown.resize(3).unwrap();
        assert_eq!(shrunk.as_slice(), &[1, 2, 3]);
    }
}
