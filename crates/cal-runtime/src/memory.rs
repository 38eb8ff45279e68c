//! Device-local and host-remote memory resources
//!
//! # Dimensionality
//!
//! A [`Shape`] with `height == 1` is allocated as a 1-D resource; any other height
//! selects a 2-D allocation. Shapes are checked against the device limits before the
//! driver is called, so a rejected shape never consumes a handle.
//!
//! # Remote resources
//!
//! [`RemoteResource`] is a shared, caller-visible record. Cloning it is cheap and every
//! clone observes the same state:
//!
//! ```text
//!             map                      bind (unmap)
//!   Unmapped ─────▶ Mapped { ptr, pitch } ─────────▶ Unmapped + in flight
//!       ▲              │  ▲                                 │
//!       └── unmap ─────┘  └──────── finalize (remap) ───────┘
//! ```
//!
//! Host bytes are reachable only through [`RemoteResource::with_bytes`] and
//! [`RemoteResource::with_bytes_mut`], which fail with a typed error while the resource is
//! unmapped, bound to an in-flight execution, or freed. A re-map may return a different
//! host address; the record always holds the latest one.
//!
//! Pitch is the row stride in elements as reported by the runtime. It may exceed the
//! requested width; index rows with [`RemoteResource::row_bytes`], not the width.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{Device, Runtime};
use crate::driver::{AllocFlags, DeviceId, DeviceInfo, Driver, DriverResult, Format, HostMapping, ResourceId};
use crate::error::{CalError, Result};

/// Extent of a resource in elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub width: u32,
    pub height: u32,
}

impl Shape {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// One-row shape, allocated as a 1-D resource
    pub const fn linear(width: u32) -> Self {
        Self::new(width, 1)
    }

    pub const fn is_1d(&self) -> bool {
        self.height == 1
    }

    pub const fn elements(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Check this shape against a device's resource limits
    pub fn validate(&self, info: &DeviceInfo) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CalError::invalid_shape(format!("{self} has a zero extent")));
        }
        if self.is_1d() {
            if self.width > info.max_resource_1d_width {
                return Err(CalError::invalid_shape(format!(
                    "1-D width {} exceeds device limit {}",
                    self.width, info.max_resource_1d_width
                )));
            }
        } else if self.width > info.max_resource_2d_width || self.height > info.max_resource_2d_height {
            return Err(CalError::invalid_shape(format!(
                "2-D shape {self} exceeds device limit {}x{}",
                info.max_resource_2d_width, info.max_resource_2d_height
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Allocate a local or remote resource, picking 1-D or 2-D from the shape
pub(crate) fn alloc_resource(
    driver: &dyn Driver,
    device: DeviceId,
    shape: Shape,
    format: Format,
    flags: AllocFlags,
    remote: bool,
) -> DriverResult<ResourceId> {
    match (remote, shape.is_1d()) {
        (false, true) => driver.alloc_local_1d(device, shape.width, format, flags),
        (false, false) => driver.alloc_local_2d(device, shape.width, shape.height, format, flags),
        (true, true) => driver.alloc_remote_1d(device, shape.width, format, flags),
        (true, false) => driver.alloc_remote_2d(device, shape.width, shape.height, format, flags),
    }
}

// ================================================================================================
// Remote resources
// ================================================================================================

struct RemoteState {
    mapping: Option<HostMapping>,
    /// Pitch from the most recent mapping
    pitch: u32,
    in_flight: bool,
    freed: bool,
}

struct RemoteInner {
    id: ResourceId,
    device: DeviceId,
    shape: Shape,
    format: Format,
    flags: AllocFlags,
    state: Mutex<RemoteState>,
}

/// Host-visible resource shared between the caller and in-flight executions
#[derive(Clone)]
pub struct RemoteResource {
    inner: Arc<RemoteInner>,
}

impl RemoteResource {
    pub(crate) fn new(
        id: ResourceId,
        device: DeviceId,
        shape: Shape,
        format: Format,
        flags: AllocFlags,
        mapping: HostMapping,
    ) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                id,
                device,
                shape,
                format,
                flags,
                state: Mutex::new(RemoteState {
                    pitch: mapping.pitch,
                    mapping: Some(mapping),
                    in_flight: false,
                    freed: false,
                }),
            }),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn device(&self) -> DeviceId {
        self.inner.device
    }

    pub fn shape(&self) -> Shape {
        self.inner.shape
    }

    pub fn width(&self) -> u32 {
        self.inner.shape.width
    }

    pub fn height(&self) -> u32 {
        self.inner.shape.height
    }

    pub fn format(&self) -> Format {
        self.inner.format
    }

    pub fn flags(&self) -> AllocFlags {
        self.inner.flags
    }

    /// Row stride in elements from the most recent mapping
    pub fn pitch(&self) -> u32 {
        self.inner.state.lock().pitch
    }

    /// Row stride in bytes
    pub fn row_bytes(&self) -> usize {
        self.pitch() as usize * self.inner.format.element_size()
    }

    /// Host-visible length in bytes: pitch × height × element size
    pub fn len(&self) -> usize {
        self.row_bytes() * self.inner.shape.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        self.inner.state.lock().mapping.is_some()
    }

    /// True while bound to an execution that has not been joined
    pub fn is_in_flight(&self) -> bool {
        self.inner.state.lock().in_flight
    }

    pub fn is_freed(&self) -> bool {
        self.inner.state.lock().freed
    }

    /// Current host address, for handing to foreign code
    ///
    /// Valid only until the next unmap or launch involving this resource.
    pub fn host_ptr(&self) -> Result<NonNull<u8>> {
        let state = self.inner.state.lock();
        self.accessible(&state).map(|mapping| mapping.ptr)
    }

    /// Read the mapped host bytes
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let state = self.inner.state.lock();
        let mapping = self.accessible(&state)?;
        let len = state.pitch as usize * self.inner.shape.height as usize * self.inner.format.element_size();
        // Safety: the mapping is live while the state lock is held; unmap and launch take the same lock
        let bytes = unsafe { std::slice::from_raw_parts(mapping.ptr.as_ptr(), len) };
        Ok(f(bytes))
    }

    /// Write the mapped host bytes
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let state = self.inner.state.lock();
        let mapping = self.accessible(&state)?;
        let len = state.pitch as usize * self.inner.shape.height as usize * self.inner.format.element_size();
        // Safety: as in `with_bytes`; the state lock serializes host access across clones
        let bytes = unsafe { std::slice::from_raw_parts_mut(mapping.ptr.as_ptr(), len) };
        Ok(f(bytes))
    }

    fn accessible(&self, state: &RemoteState) -> Result<HostMapping> {
        if state.freed {
            return Err(CalError::ResourceFreed { resource: self.inner.id });
        }
        if state.in_flight {
            return Err(CalError::ResourceBusy { resource: self.inner.id });
        }
        state.mapping.ok_or(CalError::NotMapped { resource: self.inner.id })
    }

    /// Claim the resource for one execution
    pub(crate) fn begin_flight(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.freed {
            return Err(CalError::ResourceFreed { resource: self.inner.id });
        }
        if state.in_flight {
            return Err(CalError::ResourceBusy { resource: self.inner.id });
        }
        state.in_flight = true;
        Ok(())
    }

    pub(crate) fn end_flight(&self) {
        self.inner.state.lock().in_flight = false;
    }

    /// Unmap through the driver if mapped; returns whether a mapping was dropped
    pub(crate) fn unmap_with(&self, driver: &dyn Driver) -> DriverResult<bool> {
        let mut state = self.inner.state.lock();
        if state.mapping.is_none() {
            return Ok(false);
        }
        driver.resource_unmap(self.inner.id)?;
        state.mapping = None;
        Ok(true)
    }

    /// Map through the driver and record the (possibly relocated) address
    pub(crate) fn remap_with(&self, driver: &dyn Driver) -> DriverResult<HostMapping> {
        let mut state = self.inner.state.lock();
        if let Some(mapping) = state.mapping {
            return Ok(mapping);
        }
        let mapping = driver.resource_map(self.inner.id)?;
        if state.pitch != mapping.pitch {
            tracing::debug!(resource = %self.inner.id, old = state.pitch, new = mapping.pitch, "pitch changed on remap");
        }
        state.pitch = mapping.pitch;
        state.mapping = Some(mapping);
        Ok(mapping)
    }

    fn mark_freed(&self) {
        let mut state = self.inner.state.lock();
        state.freed = true;
        state.in_flight = false;
        state.mapping = None;
    }
}

impl PartialEq for RemoteResource {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for RemoteResource {}

impl fmt::Debug for RemoteResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RemoteResource")
            .field("id", &self.inner.id)
            .field("shape", &self.inner.shape)
            .field("format", &self.inner.format)
            .field("pitch", &state.pitch)
            .field("mapped", &state.mapping.map(|m| m.ptr))
            .field("in_flight", &state.in_flight)
            .field("freed", &state.freed)
            .finish()
    }
}

// ================================================================================================
// Local resources
// ================================================================================================

/// Device-resident resource owned by the caller
///
/// Must be released with [`Runtime::free_local`]; dropping it leaks device memory.
#[derive(Debug)]
pub struct LocalResource {
    id: ResourceId,
    device: DeviceId,
    shape: Shape,
    format: Format,
    flags: AllocFlags,
    released: bool,
}

impl LocalResource {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn flags(&self) -> AllocFlags {
        self.flags
    }
}

impl Drop for LocalResource {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(resource = %self.id, shape = %self.shape, "local resource dropped without free");
        }
    }
}

// ================================================================================================
// Allocator
// ================================================================================================

impl Runtime {
    /// Allocate a device-local resource
    pub fn allocate_local(&self, device: &Device, shape: Shape, format: Format, flags: AllocFlags) -> Result<LocalResource> {
        self.check_device(device)?;
        shape.validate(device.info())?;

        let id = alloc_resource(self.driver.as_ref(), device.id(), shape, format, flags, false)
            .map_err(CalError::allocation)?;
        tracing::debug!(resource = %id, device = %device.id(), %shape, %format, "allocated local resource");

        Ok(LocalResource {
            id,
            device: device.id(),
            shape,
            format,
            flags,
            released: false,
        })
    }

    /// Allocate a host-remote resource and map it
    ///
    /// If the initial map fails the allocation is released before returning.
    pub fn allocate_remote(
        &self,
        device: &Device,
        shape: Shape,
        format: Format,
        flags: AllocFlags,
    ) -> Result<RemoteResource> {
        self.check_device(device)?;
        shape.validate(device.info())?;

        let driver = self.driver.as_ref();
        let id = alloc_resource(driver, device.id(), shape, format, flags, true).map_err(CalError::allocation)?;
        let mapping = match driver.resource_map(id) {
            Ok(mapping) => mapping,
            Err(err) => {
                if let Err(free_err) = driver.resource_free(id) {
                    tracing::warn!(resource = %id, error = %free_err, "failed to release unmappable resource");
                }
                return Err(CalError::allocation(err));
            }
        };

        tracing::debug!(
            resource = %id,
            device = %device.id(),
            %shape,
            %format,
            pitch = mapping.pitch,
            "allocated remote resource"
        );
        Ok(RemoteResource::new(id, device.id(), shape, format, flags, mapping))
    }

    /// Free a local resource
    pub fn free_local(&self, mut resource: LocalResource) -> Result<()> {
        resource.released = true;
        self.driver.resource_free(resource.id).map_err(CalError::allocation)?;
        tracing::debug!(resource = %resource.id, "freed local resource");
        Ok(())
    }

    /// Unmap (if mapped) and free a remote resource
    ///
    /// Every clone of the record observes the freed state afterwards.
    pub fn free_remote(&self, resource: &RemoteResource) -> Result<()> {
        // Claimed until freed; a launch binding it meanwhile gets ResourceBusy
        resource.begin_flight()?;

        let driver = self.driver.as_ref();
        let freed = resource
            .unmap_with(driver)
            .and_then(|_| driver.resource_free(resource.id()));
        if let Err(err) = freed {
            resource.end_flight();
            return Err(CalError::allocation(err));
        }
        resource.mark_freed();
        tracing::debug!(resource = %resource.id(), "freed remote resource");
        Ok(())
    }

    /// Map a remote resource for host access; a no-op when already mapped
    pub fn map(&self, resource: &RemoteResource) -> Result<()> {
        resource.begin_flight()?;
        let mapped = resource.remap_with(self.driver.as_ref());
        resource.end_flight();
        mapped.map(|_| ()).map_err(CalError::allocation)
    }

    /// Unmap a remote resource; a no-op when already unmapped
    pub fn unmap(&self, resource: &RemoteResource) -> Result<()> {
        resource.begin_flight()?;
        let unmapped = resource.unmap_with(self.driver.as_ref());
        resource.end_flight();
        unmapped.map(|_| ()).map_err(CalError::allocation)
    }
}
