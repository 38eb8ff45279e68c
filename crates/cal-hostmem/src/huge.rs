//! Huge-page backed host memory
//!
//! Huge pages come from a `hugetlbfs` mount: a temporary file is created in the mount,
//! unlinked immediately, and mapped shared. The mapping and descriptor live until the
//! [`HugePages`] value is dropped.

use std::ptr::NonNull;

#[cfg(target_os = "linux")]
use std::path::PathBuf;

use crate::error::{HostMemError, Result};

/// Huge page size assumed when the kernel does not report one
pub const DEFAULT_HUGE_PAGE_SIZE: usize = 16 * 1024 * 1024;

#[cfg(target_os = "linux")]
const MOUNT_TABLE_RETRIES: u32 = 512;

#[cfg(target_os = "linux")]
const MOUNT_TABLE_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

#[cfg(target_os = "linux")]
lazy_static::lazy_static! {
    // Only successful discovery is cached; a failed lookup is retried on the next call
    static ref HUGETLBFS_MOUNT: parking_lot::Mutex<Option<PathBuf>> = parking_lot::Mutex::new(None);
}

/// True when a `hugetlbfs` mount is available
pub fn has_huge_pages() -> bool {
    #[cfg(target_os = "linux")]
    {
        hugetlbfs_mount().is_ok()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Huge page size in bytes
///
/// Read from the `Hugepagesize` line of `/proc/meminfo`, falling back to
/// [`DEFAULT_HUGE_PAGE_SIZE`]. Returns 0 where huge pages are unsupported.
pub fn huge_page_size() -> usize {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| parse_huge_page_size(&meminfo))
            .unwrap_or(DEFAULT_HUGE_PAGE_SIZE)
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

/// Shared mapping of an unlinked `hugetlbfs` file
#[derive(Debug)]
pub struct HugePages {
    addr: NonNull<u8>,
    len: usize,
    mapped_len: usize,
    fd: i32,
}

impl HugePages {
    /// Map `len` bytes of huge-page memory
    ///
    /// The mapping itself is rounded up to a whole number of huge pages; slices
    /// still expose exactly `len` bytes.
    #[cfg(target_os = "linux")]
    pub fn allocate(len: usize) -> Result<Self> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        if len == 0 {
            return Err(HostMemError::Allocation {
                size: len,
                message: "huge page mapping of zero bytes".into(),
            });
        }

        let mount = hugetlbfs_mount()?;
        let mapped_len =
            round_to_huge_page(len, huge_page_size()).ok_or_else(|| HostMemError::Allocation {
                size: len,
                message: "huge page mapping length overflows".into(),
            })?;
        let template = mount.join("XXXXXX");
        let template = CString::new(template.as_os_str().as_bytes()).map_err(|_| {
            HostMemError::HugePagesUnavailable(format!("mount path {} contains NUL", mount.display()))
        })?;
        let mut path = template.into_bytes_with_nul();

        // Safety: `path` is a writable NUL-terminated template ending in XXXXXX
        let fd = unsafe { libc::mkstemp(path.as_mut_ptr().cast()) };
        if fd == -1 {
            return Err(HostMemError::last_os_error("mkstemp"));
        }

        // Safety: mkstemp filled in a NUL-terminated file name
        unsafe { libc::unlink(path.as_ptr().cast()) };

        // Safety: fresh descriptor, no address hint
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = HostMemError::last_os_error("mmap");
            // Safety: descriptor owned here and not yet wrapped
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let addr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| HostMemError::Allocation {
            size: len,
            message: "mmap returned null".into(),
        })?;

        tracing::debug!(len, mapped_len, fd, "mapped huge-page memory");
        Ok(Self {
            addr,
            len,
            mapped_len,
            fd,
        })
    }

    /// Huge pages are unsupported on this target
    #[cfg(not(target_os = "linux"))]
    pub fn allocate(_len: usize) -> Result<Self> {
        Err(HostMemError::HugePagesUnavailable("huge pages are only supported on Linux".into()))
    }

    /// Map a new region of `new_len`, copy the common prefix and release `self`
    pub fn resize(self, new_len: usize) -> Result<Self> {
        let mut next = Self::allocate(new_len)?;
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

    /// Length of the underlying mapping, a multiple of the huge page size
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.addr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: mapping is live and `len` bytes long
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: unique borrow of a live mapping
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), self.len) }
    }
}

impl Drop for HugePages {
    fn drop(&mut self) {
        // Safety: mapping and descriptor are owned and released exactly once
        let unmapped = unsafe { libc::munmap(self.addr.as_ptr().cast(), self.mapped_len) };
        if unmapped != 0 {
            tracing::warn!(
                mapped_len = self.mapped_len,
                error = %std::io::Error::last_os_error(),
                "munmap of huge-page memory failed"
            );
        }
        // Safety: see above
        unsafe { libc::close(self.fd) };
    }
}

// Safety: the mapping is exclusively owned
unsafe impl Send for HugePages {}
unsafe impl Sync for HugePages {}

// ================================================================================================
// Mount and meminfo discovery
// ================================================================================================

#[cfg(target_os = "linux")]
fn hugetlbfs_mount() -> Result<PathBuf> {
    let mut cached = HUGETLBFS_MOUNT.lock();
    if let Some(path) = cached.as_ref() {
        return Ok(path.clone());
    }

    let table = read_mount_table()?;
    let path = find_hugetlbfs(&table)
        .ok_or_else(|| HostMemError::HugePagesUnavailable("no hugetlbfs entry in the mount table".into()))?;

    tracing::debug!(mount = %path.display(), "found hugetlbfs mount");
    *cached = Some(path.clone());
    Ok(path)
}

/// Read the mount table, retrying while the kernel reports it as transiently unavailable
#[cfg(target_os = "linux")]
fn read_mount_table() -> Result<String> {
    let mut attempts = 0;
    loop {
        match std::fs::read_to_string("/proc/self/mounts") {
            Ok(table) => return Ok(table),
            Err(err) => {
                let transient = matches!(
                    err.raw_os_error(),
                    Some(libc::EACCES) | Some(libc::EAGAIN) | Some(libc::ENFILE)
                );
                attempts += 1;
                if !transient || attempts >= MOUNT_TABLE_RETRIES {
                    tracing::warn!(attempts, error = %err, "could not read mount table");
                    return Err(HostMemError::Io {
                        operation: "read mount table",
                        source: err,
                    });
                }
                std::thread::sleep(MOUNT_TABLE_RETRY_DELAY);
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn find_hugetlbfs(table: &str) -> Option<PathBuf> {
    table.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let _source = fields.next()?;
        let dir = fields.next()?;
        let fstype = fields.next()?;
        (fstype == "hugetlbfs").then(|| PathBuf::from(unescape_mount_path(dir)))
    })
}

/// Decode the octal escapes (`\040` etc.) the kernel uses in mount paths
#[cfg(target_os = "linux")]
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Round `len` up to a multiple of `page`; `page` of 0 leaves `len` unchanged
#[cfg(target_os = "linux")]
fn round_to_huge_page(len: usize, page: usize) -> Option<usize> {
    if page == 0 {
        return Some(len);
    }
    len.checked_add(page - 1).map(|padded| padded / page * page)
}

#[cfg(target_os = "linux")]
fn parse_huge_page_size(meminfo: &str) -> Option<usize> {
    let line = meminfo.lines().find(|line| line.starts_with("Hugepagesize:"))?;
    let mut fields = line.split_whitespace().skip(1);
    let value: usize = fields.next()?.parse().ok()?;
    let scale = match fields.next() {
        Some("kB") | Some("KB") => 1024,
        Some("MB") => 1024 * 1024,
        _ => 1,
    };
    Some(value * scale)
}
