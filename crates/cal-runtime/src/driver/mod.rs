//! Contract with the vendor compute runtime
//!
//! The core never talks to CAL directly. Everything it needs from the runtime is
//! expressed by the [`Driver`] trait:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  cal-runtime core                         │
//! │  DeviceRegistry · ResourceAllocator · BindingTable ·      │
//! │  ExecutionEngine · Join                                   │
//! └────────────────────────┬─────────────────────────────────┘
//!                          │ dyn Driver
//!             ┌────────────┴────────────┐
//!             ▼                         ▼
//!      ┌─────────────┐          ┌──────────────┐
//!      │  CalDriver  │          │  FakeDriver  │
//!      │ (aticalrt)  │          │ (in-process) │
//!      └─────────────┘          └──────────────┘
//! ```
//!
//! Every failing call reports the runtime operation it maps to (`calCtxCreate`,
//! `calModuleGetName`, ...) together with the runtime's own diagnostic text.

#[cfg(feature = "cal")]
pub mod cal;
pub mod fake;
pub mod types;

pub use types::{
    AllocFlags, ContextId, DeviceId, DeviceInfo, Domain, EventId, EventStatus, Format, FuncId, HostMapping, ImageId,
    MemId, ModuleId, NameId, ResourceId, Target,
};

/// Result type for driver calls
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Runtime entry point names reported in errors and used for failure injection
pub mod ops {
    pub const INIT: &str = "calInit";
    pub const SHUTDOWN: &str = "calShutdown";
    pub const DEVICE_GET_COUNT: &str = "calDeviceGetCount";
    pub const DEVICE_GET_INFO: &str = "calDeviceGetInfo";
    pub const DEVICE_OPEN: &str = "calDeviceOpen";
    pub const DEVICE_CLOSE: &str = "calDeviceClose";
    pub const COMPILE: &str = "calclCompile";
    pub const LINK: &str = "calclLink";
    pub const FREE_IMAGE: &str = "calclFreeImage";
    pub const CTX_CREATE: &str = "calCtxCreate";
    pub const CTX_DESTROY: &str = "calCtxDestroy";
    pub const MODULE_LOAD: &str = "calModuleLoad";
    pub const MODULE_UNLOAD: &str = "calModuleUnload";
    pub const MODULE_GET_NAME: &str = "calModuleGetName";
    pub const MODULE_GET_ENTRY: &str = "calModuleGetEntry";
    pub const CTX_GET_MEM: &str = "calCtxGetMem";
    pub const CTX_RELEASE_MEM: &str = "calCtxReleaseMem";
    pub const CTX_SET_MEM: &str = "calCtxSetMem";
    pub const RES_ALLOC_LOCAL_1D: &str = "calResAllocLocal1D";
    pub const RES_ALLOC_LOCAL_2D: &str = "calResAllocLocal2D";
    pub const RES_ALLOC_REMOTE_1D: &str = "calResAllocRemote1D";
    pub const RES_ALLOC_REMOTE_2D: &str = "calResAllocRemote2D";
    pub const RES_FREE: &str = "calResFree";
    pub const RES_MAP: &str = "calResMap";
    pub const RES_UNMAP: &str = "calResUnmap";
    pub const MEM_COPY: &str = "calMemCopy";
    pub const CTX_RUN_PROGRAM: &str = "calCtxRunProgram";
    pub const CTX_IS_EVENT_DONE: &str = "calCtxIsEventDone";
}

/// Failure reported by the vendor runtime
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct DriverError {
    /// Runtime entry point that failed
    pub operation: &'static str,
    /// Diagnostic text reported by the runtime
    pub message: String,
}

impl DriverError {
    /// Create a driver error for `operation`
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// Vendor runtime contract
///
/// Implementations must be thread-safe: separate launches may drive separate contexts
/// from separate threads. A single context is only ever driven by one thread at a time.
pub trait Driver: Send + Sync {
    // ============================================================================================
    // Runtime and devices
    // ============================================================================================

    /// Initialize the runtime (`calInit`)
    fn init(&self) -> DriverResult<()>;

    /// Shut the runtime down (`calShutdown`)
    fn shutdown(&self) -> DriverResult<()>;

    /// Number of devices (`calDeviceGetCount`)
    fn device_count(&self) -> DriverResult<u32>;

    /// Capability info for device `ordinal` (`calDeviceGetInfo`)
    fn device_info(&self, ordinal: u32) -> DriverResult<DeviceInfo>;

    /// Open device `ordinal` (`calDeviceOpen`)
    fn device_open(&self, ordinal: u32) -> DriverResult<DeviceId>;

    /// Close an opened device (`calDeviceClose`)
    fn device_close(&self, device: DeviceId) -> DriverResult<()>;

    // ============================================================================================
    // Kernel images
    // ============================================================================================

    /// Compile IL source for `target` and link it into an image (`calclCompile` + `calclLink`)
    fn compile(&self, source: &str, target: Target) -> DriverResult<ImageId>;

    /// Release a compiled image (`calclFreeImage`)
    fn free_image(&self, image: ImageId) -> DriverResult<()>;

    // ============================================================================================
    // Contexts and modules
    // ============================================================================================

    /// Create an execution context on `device` (`calCtxCreate`)
    fn context_create(&self, device: DeviceId) -> DriverResult<ContextId>;

    /// Destroy a context (`calCtxDestroy`)
    fn context_destroy(&self, context: ContextId) -> DriverResult<()>;

    /// Load a compiled image into a context (`calModuleLoad`)
    fn module_load(&self, context: ContextId, image: ImageId) -> DriverResult<ModuleId>;

    /// Unload a module (`calModuleUnload`)
    fn module_unload(&self, context: ContextId, module: ModuleId) -> DriverResult<()>;

    /// Resolve a named register in a module (`calModuleGetName`)
    fn module_name(&self, context: ContextId, module: ModuleId, register: &str) -> DriverResult<NameId>;

    /// Resolve an entry point in a module (`calModuleGetEntry`)
    fn module_entry(&self, context: ContextId, module: ModuleId, symbol: &str) -> DriverResult<FuncId>;

    // ============================================================================================
    // Memory objects
    // ============================================================================================

    /// Create a context memory object for a resource (`calCtxGetMem`)
    fn context_mem(&self, context: ContextId, resource: ResourceId) -> DriverResult<MemId>;

    /// Release a context memory object (`calCtxReleaseMem`)
    fn context_release_mem(&self, context: ContextId, mem: MemId) -> DriverResult<()>;

    /// Bind a memory object to a resolved register (`calCtxSetMem`)
    fn context_bind(&self, context: ContextId, name: NameId, mem: MemId) -> DriverResult<()>;

    // ============================================================================================
    // Resources
    // ============================================================================================

    /// Allocate a 1-D device-local resource (`calResAllocLocal1D`)
    fn alloc_local_1d(&self, device: DeviceId, width: u32, format: Format, flags: AllocFlags)
        -> DriverResult<ResourceId>;

    /// Allocate a 2-D device-local resource (`calResAllocLocal2D`)
    fn alloc_local_2d(
        &self,
        device: DeviceId,
        width: u32,
        height: u32,
        format: Format,
        flags: AllocFlags,
    ) -> DriverResult<ResourceId>;

    /// Allocate a 1-D host-remote resource (`calResAllocRemote1D`)
    fn alloc_remote_1d(
        &self,
        device: DeviceId,
        width: u32,
        format: Format,
        flags: AllocFlags,
    ) -> DriverResult<ResourceId>;

    /// Allocate a 2-D host-remote resource (`calResAllocRemote2D`)
    fn alloc_remote_2d(
        &self,
        device: DeviceId,
        width: u32,
        height: u32,
        format: Format,
        flags: AllocFlags,
    ) -> DriverResult<ResourceId>;

    /// Free a resource (`calResFree`)
    fn resource_free(&self, resource: ResourceId) -> DriverResult<()>;

    /// Map a remote resource into host memory (`calResMap`)
    ///
    /// The returned pointer is not guaranteed to match the one from a previous mapping.
    fn resource_map(&self, resource: ResourceId) -> DriverResult<HostMapping>;

    /// Unmap a remote resource (`calResUnmap`)
    fn resource_unmap(&self, resource: ResourceId) -> DriverResult<()>;

    // ============================================================================================
    // Asynchronous work
    // ============================================================================================

    /// Start an asynchronous copy from `src` to `dst` (`calMemCopy`)
    fn mem_copy(&self, context: ContextId, src: MemId, dst: MemId) -> DriverResult<EventId>;

    /// Start running `func` over `domain` (`calCtxRunProgram`)
    fn run_program(&self, context: ContextId, func: FuncId, domain: Domain) -> DriverResult<EventId>;

    /// Query a completion token (`calCtxIsEventDone`)
    fn event_status(&self, context: ContextId, event: EventId) -> DriverResult<EventStatus>;
}
