//! Vendor driver over `libaticalrt` / `libaticalcl`
//!
//! Only built with the `cal` feature. Every CAL call returns a `CALresult`; anything
//! other than `CAL_RESULT_OK` becomes a [`DriverError`] carrying the runtime's own
//! error string.

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr::{self, NonNull};

use parking_lot::Mutex;

use super::{
    ops, AllocFlags, ContextId, DeviceId, DeviceInfo, Domain, Driver, DriverError, DriverResult, EventId, EventStatus,
    Format, FuncId, HostMapping, ImageId, MemId, ModuleId, NameId, ResourceId, Target,
};

// ================================================================================================
// Raw bindings
// ================================================================================================

type CalResult = u32;
type CalUint = u32;
type CalHandle = u32;
type CalObject = *mut c_void;
type CalImage = *mut c_void;

const CAL_RESULT_OK: CalResult = 0;
const CAL_RESULT_PENDING: CalResult = 8;
const CAL_LANGUAGE_IL: CalUint = 1;

#[repr(C)]
#[derive(Default)]
struct CalDeviceInfo {
    target: CalUint,
    max_resource_1d_width: CalUint,
    max_resource_2d_width: CalUint,
    max_resource_2d_height: CalUint,
}

#[repr(C)]
struct CalDomain {
    x: CalUint,
    y: CalUint,
    width: CalUint,
    height: CalUint,
}

#[link(name = "aticalrt")]
extern "C" {
    fn calInit() -> CalResult;
    fn calShutdown() -> CalResult;
    fn calGetErrorString() -> *const c_char;

    fn calDeviceGetCount(count: *mut CalUint) -> CalResult;
    fn calDeviceGetInfo(info: *mut CalDeviceInfo, ordinal: CalUint) -> CalResult;
    fn calDeviceOpen(device: *mut CalHandle, ordinal: CalUint) -> CalResult;
    fn calDeviceClose(device: CalHandle) -> CalResult;

    fn calResAllocLocal1D(res: *mut CalHandle, device: CalHandle, width: CalUint, format: CalUint, flags: CalUint)
        -> CalResult;
    fn calResAllocLocal2D(
        res: *mut CalHandle,
        device: CalHandle,
        width: CalUint,
        height: CalUint,
        format: CalUint,
        flags: CalUint,
    ) -> CalResult;
    fn calResAllocRemote1D(
        res: *mut CalHandle,
        devices: *const CalHandle,
        device_count: CalUint,
        width: CalUint,
        format: CalUint,
        flags: CalUint,
    ) -> CalResult;
    fn calResAllocRemote2D(
        res: *mut CalHandle,
        devices: *const CalHandle,
        device_count: CalUint,
        width: CalUint,
        height: CalUint,
        format: CalUint,
        flags: CalUint,
    ) -> CalResult;
    fn calResFree(res: CalHandle) -> CalResult;
    fn calResMap(ptr: *mut *mut c_void, pitch: *mut CalUint, res: CalHandle, flags: CalUint) -> CalResult;
    fn calResUnmap(res: CalHandle) -> CalResult;

    fn calCtxCreate(ctx: *mut CalHandle, device: CalHandle) -> CalResult;
    fn calCtxDestroy(ctx: CalHandle) -> CalResult;
    fn calCtxGetMem(mem: *mut CalHandle, ctx: CalHandle, res: CalHandle) -> CalResult;
    fn calCtxReleaseMem(ctx: CalHandle, mem: CalHandle) -> CalResult;
    fn calCtxSetMem(ctx: CalHandle, name: CalHandle, mem: CalHandle) -> CalResult;
    fn calCtxRunProgram(event: *mut CalHandle, ctx: CalHandle, func: CalHandle, domain: *const CalDomain) -> CalResult;
    fn calCtxIsEventDone(ctx: CalHandle, event: CalHandle) -> CalResult;
    fn calMemCopy(event: *mut CalHandle, ctx: CalHandle, src: CalHandle, dst: CalHandle, flags: CalUint) -> CalResult;

    fn calModuleLoad(module: *mut CalHandle, ctx: CalHandle, image: CalImage) -> CalResult;
    fn calModuleUnload(ctx: CalHandle, module: CalHandle) -> CalResult;
    fn calModuleGetEntry(func: *mut CalHandle, ctx: CalHandle, module: CalHandle, name: *const c_char) -> CalResult;
    fn calModuleGetName(name: *mut CalHandle, ctx: CalHandle, module: CalHandle, var: *const c_char) -> CalResult;
}

#[link(name = "aticalcl")]
extern "C" {
    fn calclCompile(obj: *mut CalObject, language: CalUint, source: *const c_char, target: CalUint) -> CalResult;
    fn calclLink(image: *mut CalImage, objects: *mut CalObject, count: CalUint) -> CalResult;
    fn calclFreeObject(obj: CalObject) -> CalResult;
    fn calclFreeImage(image: CalImage) -> CalResult;
    fn calclGetErrorString() -> *const c_char;
}

// ================================================================================================
// Conversions
// ================================================================================================

fn error_text(raw: *const c_char) -> String {
    if raw.is_null() {
        return "unknown error".to_string();
    }
    // Safety: the runtime returns a NUL-terminated static buffer
    unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned()
}

fn check(operation: &'static str, result: CalResult) -> DriverResult<()> {
    if result == CAL_RESULT_OK {
        Ok(())
    } else {
        // Safety: no preconditions
        Err(DriverError::new(operation, error_text(unsafe { calGetErrorString() })))
    }
}

fn check_cl(operation: &'static str, result: CalResult) -> DriverResult<()> {
    if result == CAL_RESULT_OK {
        Ok(())
    } else {
        // Safety: no preconditions
        Err(DriverError::new(operation, error_text(unsafe { calclGetErrorString() })))
    }
}

fn c_string(operation: &'static str, text: &str) -> DriverResult<CString> {
    CString::new(text).map_err(|_| DriverError::new(operation, format!("'{text}' contains a NUL byte")))
}

fn handle(raw: u64) -> CalHandle {
    raw as CalHandle
}

/// `CALformat` value for a format
fn format_code(format: Format) -> CalUint {
    match format {
        Format::Float32x1 => 10,
        Format::Float32x2 => 11,
        Format::Float32x4 => 12,
        Format::UnsignedInt32x1 => 29,
        Format::UnsignedInt32x2 => 30,
        Format::UnsignedInt32x4 => 31,
        Format::SignedInt32x1 => 32,
        Format::SignedInt32x2 => 33,
        Format::SignedInt32x4 => 34,
    }
}

// ================================================================================================
// Driver
// ================================================================================================

/// [`Driver`] backed by the installed CAL runtime
#[derive(Debug, Default)]
pub struct CalDriver {
    /// The compiler reports errors through a process-wide string
    compiler: Mutex<()>,
}

impl CalDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Driver for CalDriver {
    fn init(&self) -> DriverResult<()> {
        // Safety: no preconditions
        check(ops::INIT, unsafe { calInit() })
    }

    fn shutdown(&self) -> DriverResult<()> {
        check(ops::SHUTDOWN, unsafe { calShutdown() })
    }

    fn device_count(&self) -> DriverResult<u32> {
        let mut count = 0;
        check(ops::DEVICE_GET_COUNT, unsafe { calDeviceGetCount(&mut count) })?;
        Ok(count)
    }

    fn device_info(&self, ordinal: u32) -> DriverResult<DeviceInfo> {
        let mut info = CalDeviceInfo::default();
        check(ops::DEVICE_GET_INFO, unsafe { calDeviceGetInfo(&mut info, ordinal) })?;
        Ok(DeviceInfo {
            target: Target(info.target),
            max_resource_1d_width: info.max_resource_1d_width,
            max_resource_2d_width: info.max_resource_2d_width,
            max_resource_2d_height: info.max_resource_2d_height,
        })
    }

    fn device_open(&self, ordinal: u32) -> DriverResult<DeviceId> {
        let mut device = 0;
        check(ops::DEVICE_OPEN, unsafe { calDeviceOpen(&mut device, ordinal) })?;
        Ok(DeviceId::new(device.into()))
    }

    fn device_close(&self, device: DeviceId) -> DriverResult<()> {
        check(ops::DEVICE_CLOSE, unsafe { calDeviceClose(handle(device.raw())) })
    }

    fn compile(&self, source: &str, target: Target) -> DriverResult<ImageId> {
        let source = c_string(ops::COMPILE, source)?;
        let _compiler = self.compiler.lock();

        let mut object: CalObject = ptr::null_mut();
        // Safety: `source` outlives the call; `object` receives a compiler-owned handle
        check_cl(ops::COMPILE, unsafe {
            calclCompile(&mut object, CAL_LANGUAGE_IL, source.as_ptr(), target.0)
        })?;

        let mut image: CalImage = ptr::null_mut();
        let linked = check_cl(ops::LINK, unsafe { calclLink(&mut image, &mut object, 1) });
        // Safety: the object is no longer needed once linking has been attempted
        unsafe { calclFreeObject(object) };
        linked?;

        Ok(ImageId::new(image as usize as u64))
    }

    fn free_image(&self, image: ImageId) -> DriverResult<()> {
        let _compiler = self.compiler.lock();
        check_cl(ops::FREE_IMAGE, unsafe { calclFreeImage(image.raw() as usize as CalImage) })
    }

    fn context_create(&self, device: DeviceId) -> DriverResult<ContextId> {
        let mut ctx = 0;
        check(ops::CTX_CREATE, unsafe { calCtxCreate(&mut ctx, handle(device.raw())) })?;
        Ok(ContextId::new(ctx.into()))
    }

    fn context_destroy(&self, context: ContextId) -> DriverResult<()> {
        check(ops::CTX_DESTROY, unsafe { calCtxDestroy(handle(context.raw())) })
    }

    fn module_load(&self, context: ContextId, image: ImageId) -> DriverResult<ModuleId> {
        let mut module = 0;
        check(ops::MODULE_LOAD, unsafe {
            calModuleLoad(&mut module, handle(context.raw()), image.raw() as usize as CalImage)
        })?;
        Ok(ModuleId::new(module.into()))
    }

    fn module_unload(&self, context: ContextId, module: ModuleId) -> DriverResult<()> {
        check(ops::MODULE_UNLOAD, unsafe {
            calModuleUnload(handle(context.raw()), handle(module.raw()))
        })
    }

    fn module_name(&self, context: ContextId, module: ModuleId, register: &str) -> DriverResult<NameId> {
        let var = c_string(ops::MODULE_GET_NAME, register)?;
        let mut name = 0;
        check(ops::MODULE_GET_NAME, unsafe {
            calModuleGetName(&mut name, handle(context.raw()), handle(module.raw()), var.as_ptr())
        })?;
        Ok(NameId::new(name.into()))
    }

    fn module_entry(&self, context: ContextId, module: ModuleId, symbol: &str) -> DriverResult<FuncId> {
        let symbol = c_string(ops::MODULE_GET_ENTRY, symbol)?;
        let mut func = 0;
        check(ops::MODULE_GET_ENTRY, unsafe {
            calModuleGetEntry(&mut func, handle(context.raw()), handle(module.raw()), symbol.as_ptr())
        })?;
        Ok(FuncId::new(func.into()))
    }

    fn context_mem(&self, context: ContextId, resource: ResourceId) -> DriverResult<MemId> {
        let mut mem = 0;
        check(ops::CTX_GET_MEM, unsafe {
            calCtxGetMem(&mut mem, handle(context.raw()), handle(resource.raw()))
        })?;
        Ok(MemId::new(mem.into()))
    }

    fn context_release_mem(&self, context: ContextId, mem: MemId) -> DriverResult<()> {
        check(ops::CTX_RELEASE_MEM, unsafe {
            calCtxReleaseMem(handle(context.raw()), handle(mem.raw()))
        })
    }

    fn context_bind(&self, context: ContextId, name: NameId, mem: MemId) -> DriverResult<()> {
        check(ops::CTX_SET_MEM, unsafe {
            calCtxSetMem(handle(context.raw()), handle(name.raw()), handle(mem.raw()))
        })
    }

    fn alloc_local_1d(&self, device: DeviceId, width: u32, format: Format, flags: AllocFlags) -> DriverResult<ResourceId> {
        let mut res = 0;
        check(ops::RES_ALLOC_LOCAL_1D, unsafe {
            calResAllocLocal1D(&mut res, handle(device.raw()), width, format_code(format), flags.bits())
        })?;
        Ok(ResourceId::new(res.into()))
    }

    fn alloc_local_2d(
        &self,
        device: DeviceId,
        width: u32,
        height: u32,
        format: Format,
        flags: AllocFlags,
    ) -> DriverResult<ResourceId> {
        let mut res = 0;
        check(ops::RES_ALLOC_LOCAL_2D, unsafe {
            calResAllocLocal2D(&mut res, handle(device.raw()), width, height, format_code(format), flags.bits())
        })?;
        Ok(ResourceId::new(res.into()))
    }

    fn alloc_remote_1d(
        &self,
        device: DeviceId,
        width: u32,
        format: Format,
        flags: AllocFlags,
    ) -> DriverResult<ResourceId> {
        let devices = [handle(device.raw())];
        let mut res = 0;
        check(ops::RES_ALLOC_REMOTE_1D, unsafe {
            calResAllocRemote1D(&mut res, devices.as_ptr(), 1, width, format_code(format), flags.bits())
        })?;
        Ok(ResourceId::new(res.into()))
    }

    fn alloc_remote_2d(
        &self,
        device: DeviceId,
        width: u32,
        height: u32,
        format: Format,
        flags: AllocFlags,
    ) -> DriverResult<ResourceId> {
        let devices = [handle(device.raw())];
        let mut res = 0;
        check(ops::RES_ALLOC_REMOTE_2D, unsafe {
            calResAllocRemote2D(&mut res, devices.as_ptr(), 1, width, height, format_code(format), flags.bits())
        })?;
        Ok(ResourceId::new(res.into()))
    }

    fn resource_free(&self, resource: ResourceId) -> DriverResult<()> {
        check(ops::RES_FREE, unsafe { calResFree(handle(resource.raw())) })
    }

    fn resource_map(&self, resource: ResourceId) -> DriverResult<HostMapping> {
        let mut ptr: *mut c_void = ptr::null_mut();
        let mut pitch = 0;
        check(ops::RES_MAP, unsafe {
            calResMap(&mut ptr, &mut pitch, handle(resource.raw()), 0)
        })?;
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| DriverError::new(ops::RES_MAP, "runtime returned a null mapping"))?;
        Ok(HostMapping { ptr, pitch })
    }

    fn resource_unmap(&self, resource: ResourceId) -> DriverResult<()> {
        check(ops::RES_UNMAP, unsafe { calResUnmap(handle(resource.raw())) })
    }

    fn mem_copy(&self, context: ContextId, src: MemId, dst: MemId) -> DriverResult<EventId> {
        let mut event = 0;
        check(ops::MEM_COPY, unsafe {
            calMemCopy(&mut event, handle(context.raw()), handle(src.raw()), handle(dst.raw()), 0)
        })?;
        Ok(EventId::new(event.into()))
    }

    fn run_program(&self, context: ContextId, func: FuncId, domain: Domain) -> DriverResult<EventId> {
        let domain = CalDomain {
            x: domain.x,
            y: domain.y,
            width: domain.width,
            height: domain.height,
        };
        let mut event = 0;
        check(ops::CTX_RUN_PROGRAM, unsafe {
            calCtxRunProgram(&mut event, handle(context.raw()), handle(func.raw()), &domain)
        })?;
        Ok(EventId::new(event.into()))
    }

    fn event_status(&self, context: ContextId, event: EventId) -> DriverResult<EventStatus> {
        let result = unsafe { calCtxIsEventDone(handle(context.raw()), handle(event.raw())) };
        Ok(match result {
            CAL_RESULT_OK => EventStatus::Done,
            CAL_RESULT_PENDING => EventStatus::Pending,
            _ => EventStatus::Error(error_text(unsafe { calGetErrorString() })),
        })
    }
}
