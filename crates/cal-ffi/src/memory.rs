//! Remote and local resource handles

use cal_runtime::{AllocFlags, Format, RemoteResource, Shape};

use crate::error::{FfiError, FfiResult, ResultExt};
use crate::handles::{lock_registry, register, LOCAL_REGISTRY, REMOTE_REGISTRY};
use crate::runtime::runtime;

/// Host-visible description of a remote resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteInfo {
    pub width: u32,
    pub height: u32,
    /// Row stride in elements
    pub pitch: u32,
    /// Bytes reachable through the mapping (pitch × height × element size)
    pub length: u64,
    pub format: u32,
    /// Host address, 0 while unmapped
    pub pointer: u64,
}

fn format(operation: &str, code: u32) -> FfiResult<Format> {
    Format::from_code(code).ok_or_else(|| FfiError::invalid_argument(operation, format!("unknown format code {code}")))
}

pub(crate) fn remote(operation: &str, handle: u64) -> FfiResult<RemoteResource> {
    lock_registry(&REMOTE_REGISTRY)
        .get(&handle)
        .cloned()
        .ok_or_else(|| FfiError::unknown_handle(operation, "remote", handle))
}

/// Allocate and map a host-remote resource
pub fn alloc_remote(device: u32, width: u32, height: u32, format_code: u32, flags: u32) -> FfiResult<u64> {
    let rt = runtime("alloc_remote")?;
    let device = rt.device(device).within("alloc_remote")?;
    let fmt = format("alloc_remote", format_code)?;
    let resource = rt
        .allocate_remote(&device, Shape::new(width, height), fmt, AllocFlags::from_bits(flags))
        .within("alloc_remote")?;
    Ok(register(&REMOTE_REGISTRY, resource))
}

/// Unmap and free a remote resource
pub fn free_remote(handle: u64) -> FfiResult<()> {
    let rt = runtime("free_remote")?;
    let resource = remote("free_remote", handle)?;
    rt.free_remote(&resource).within("free_remote")?;
    lock_registry(&REMOTE_REGISTRY).remove(&handle);
    Ok(())
}

/// Shape, pitch and current host address of a remote resource
pub fn remote_info(handle: u64) -> FfiResult<RemoteInfo> {
    let resource = remote("remote_info", handle)?;
    let pointer = resource.host_ptr().map(|ptr| ptr.as_ptr() as u64).unwrap_or(0);
    Ok(RemoteInfo {
        width: resource.width(),
        height: resource.height(),
        pitch: resource.pitch(),
        length: resource.len() as u64,
        format: resource.format().code(),
        pointer,
    })
}

/// Copy the mapped contents of a remote resource out
pub fn remote_read(handle: u64) -> FfiResult<Vec<u8>> {
    remote("remote_read", handle)?
        .with_bytes(<[u8]>::to_vec)
        .within("remote_read")
}

/// Overwrite the start of a remote resource with `data`
pub fn remote_write(handle: u64, data: &[u8]) -> FfiResult<()> {
    let resource = remote("remote_write", handle)?;
    if data.len() > resource.len() {
        return Err(FfiError::invalid_argument(
            "remote_write",
            format!("{} bytes do not fit in {} mapped bytes", data.len(), resource.len()),
        ));
    }
    resource
        .with_bytes_mut(|bytes| bytes[..data.len()].copy_from_slice(data))
        .within("remote_write")
}

/// Allocate a device-local resource
pub fn alloc_local(device: u32, width: u32, height: u32, format_code: u32, flags: u32) -> FfiResult<u64> {
    let rt = runtime("alloc_local")?;
    let device = rt.device(device).within("alloc_local")?;
    let fmt = format("alloc_local", format_code)?;
    let resource = rt
        .allocate_local(&device, Shape::new(width, height), fmt, AllocFlags::from_bits(flags))
        .within("alloc_local")?;
    Ok(register(&LOCAL_REGISTRY, resource))
}

/// Free a device-local resource
pub fn free_local(handle: u64) -> FfiResult<()> {
    let rt = runtime("free_local")?;
    let resource = lock_registry(&LOCAL_REGISTRY)
        .remove(&handle)
        .ok_or_else(|| FfiError::unknown_handle("free_local", "local", handle))?;
    rt.free_local(resource).within("free_local")
}
