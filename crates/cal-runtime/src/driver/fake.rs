//! In-process simulation of the vendor runtime
//!
//! [`FakeDriver`] implements the full [`Driver`] contract without hardware. It is what the
//! runtime's own tests run against and is exported so downstream crates can test their
//! launch code the same way.
//!
//! Besides behaving like a device it is an observer:
//!
//! - every accepted call is appended to an ordered log ([`DriverCall`])
//! - live contexts, modules, memory objects and resources are counted
//! - any runtime entry point can be made to fail on its Nth call
//! - completion tokens stay `Pending` for a configurable number of polls
//! - a re-map can hand back a different host address than the previous mapping
//! - a one-shot hook can run arbitrary code just before a given call is handled
//!
//! Remote resources are backed by page-aligned host memory; local resources are plain
//! byte vectors. `calMemCopy` performs a real copy and an optional [`FakeProgram`] runs
//! over the bound registers on submission.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cal_hostmem::PageAlignedBuffer;
use parking_lot::Mutex;

use super::{
    ops, AllocFlags, ContextId, DeviceId, DeviceInfo, Domain, Driver, DriverError, DriverResult, EventId,
    EventStatus, Format, FuncId, HostMapping, ImageId, MemId, ModuleId, NameId, ResourceId, Target,
};

/// Kernel body executed by the fake on `calCtxRunProgram`
pub type FakeProgram = Arc<dyn Fn(&mut FakeKernel<'_>) + Send + Sync>;

/// Callback run once before the next call of an operation, outside the fake's lock
pub type FakeHook = Box<dyn FnOnce() + Send>;

/// One recorded driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Init,
    Shutdown,
    DeviceCount,
    DeviceInfo(u32),
    DeviceOpen(u32),
    DeviceClose(DeviceId),
    Compile,
    FreeImage(ImageId),
    ContextCreate(DeviceId),
    ContextDestroy(ContextId),
    ModuleLoad { context: ContextId, image: ImageId },
    ModuleUnload { context: ContextId, module: ModuleId },
    ModuleName { context: ContextId, register: String },
    ModuleEntry { context: ContextId, symbol: String },
    ContextMem { context: ContextId, resource: ResourceId },
    ContextReleaseMem { context: ContextId, mem: MemId },
    ContextBind { context: ContextId, register: String, mem: MemId },
    AllocLocal1D { width: u32, format: Format, flags: AllocFlags },
    AllocLocal2D { width: u32, height: u32, format: Format, flags: AllocFlags },
    AllocRemote1D { width: u32, format: Format, flags: AllocFlags },
    AllocRemote2D { width: u32, height: u32, format: Format, flags: AllocFlags },
    ResourceFree(ResourceId),
    ResourceMap(ResourceId),
    ResourceUnmap(ResourceId),
    MemCopy { context: ContextId, src: ResourceId, dst: ResourceId },
    RunProgram { context: ContextId, domain: Domain },
    EventStatus { context: ContextId, event: EventId },
}

impl DriverCall {
    /// Runtime entry point this call corresponds to
    pub fn operation(&self) -> &'static str {
        match self {
            DriverCall::Init => ops::INIT,
            DriverCall::Shutdown => ops::SHUTDOWN,
            DriverCall::DeviceCount => ops::DEVICE_GET_COUNT,
            DriverCall::DeviceInfo(_) => ops::DEVICE_GET_INFO,
            DriverCall::DeviceOpen(_) => ops::DEVICE_OPEN,
            DriverCall::DeviceClose(_) => ops::DEVICE_CLOSE,
            DriverCall::Compile => ops::COMPILE,
            DriverCall::FreeImage(_) => ops::FREE_IMAGE,
            DriverCall::ContextCreate(_) => ops::CTX_CREATE,
            DriverCall::ContextDestroy(_) => ops::CTX_DESTROY,
            DriverCall::ModuleLoad { .. } => ops::MODULE_LOAD,
            DriverCall::ModuleUnload { .. } => ops::MODULE_UNLOAD,
            DriverCall::ModuleName { .. } => ops::MODULE_GET_NAME,
            DriverCall::ModuleEntry { .. } => ops::MODULE_GET_ENTRY,
            DriverCall::ContextMem { .. } => ops::CTX_GET_MEM,
            DriverCall::ContextReleaseMem { .. } => ops::CTX_RELEASE_MEM,
            DriverCall::ContextBind { .. } => ops::CTX_SET_MEM,
            DriverCall::AllocLocal1D { .. } => ops::RES_ALLOC_LOCAL_1D,
            DriverCall::AllocLocal2D { .. } => ops::RES_ALLOC_LOCAL_2D,
            DriverCall::AllocRemote1D { .. } => ops::RES_ALLOC_REMOTE_1D,
            DriverCall::AllocRemote2D { .. } => ops::RES_ALLOC_REMOTE_2D,
            DriverCall::ResourceFree(_) => ops::RES_FREE,
            DriverCall::ResourceMap(_) => ops::RES_MAP,
            DriverCall::ResourceUnmap(_) => ops::RES_UNMAP,
            DriverCall::MemCopy { .. } => ops::MEM_COPY,
            DriverCall::RunProgram { .. } => ops::CTX_RUN_PROGRAM,
            DriverCall::EventStatus { .. } => ops::CTX_IS_EVENT_DONE,
        }
    }
}

/// Register contents visible to a [`FakeProgram`]
pub struct FakeKernel<'a> {
    domain: Domain,
    registers: &'a mut HashMap<String, Vec<u8>>,
}

impl FakeKernel<'_> {
    /// Domain the program was submitted over
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Bytes bound to `register`
    pub fn register(&self, register: &str) -> Option<&[u8]> {
        self.registers.get(register).map(Vec::as_slice)
    }

    /// Mutable bytes bound to `register`
    pub fn register_mut(&mut self, register: &str) -> Option<&mut [u8]> {
        self.registers.get_mut(register).map(Vec::as_mut_slice)
    }

    /// Names of all bound registers, sorted
    pub fn register_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registers.keys().cloned().collect();
        names.sort();
        names
    }
}

// ================================================================================================
// Internal state
// ================================================================================================

enum Storage {
    /// Host-visible memory of a remote resource
    Host(PageAlignedBuffer),
    /// Device-resident memory of a local resource
    Device(Vec<u8>),
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Host(buf) => buf.as_slice(),
            Storage::Device(bytes) => bytes,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Storage::Host(buf) => buf.as_mut_slice(),
            Storage::Device(bytes) => bytes,
        }
    }
}

struct FakeResource {
    pitch: u32,
    storage: Storage,
    mapped: bool,
    ever_mapped: bool,
}

struct FakeEvent {
    context: ContextId,
    pending_polls: u32,
    error: Option<String>,
}

struct Injection {
    operation: &'static str,
    /// 1-based call number to fail on; 0 fails every call
    on_call: usize,
    message: String,
}

struct FakeState {
    next_id: u64,
    initialized: bool,
    calls: Vec<DriverCall>,
    call_counts: HashMap<&'static str, usize>,
    injections: Vec<Injection>,
    completion_errors: Vec<(&'static str, String)>,
    open_devices: HashMap<DeviceId, u32>,
    images: HashMap<ImageId, String>,
    contexts: HashMap<ContextId, DeviceId>,
    modules: HashMap<ModuleId, (ContextId, ImageId)>,
    names: HashMap<NameId, String>,
    funcs: HashMap<FuncId, ModuleId>,
    mems: HashMap<MemId, (ContextId, ResourceId)>,
    bindings: HashMap<ContextId, HashMap<String, MemId>>,
    resources: HashMap<ResourceId, FakeResource>,
    events: HashMap<EventId, FakeEvent>,
}

impl FakeState {
    fn new() -> Self {
        Self {
            next_id: 1,
            initialized: false,
            calls: Vec::new(),
            call_counts: HashMap::new(),
            injections: Vec::new(),
            completion_errors: Vec::new(),
            open_devices: HashMap::new(),
            images: HashMap::new(),
            contexts: HashMap::new(),
            modules: HashMap::new(),
            names: HashMap::new(),
            funcs: HashMap::new(),
            mems: HashMap::new(),
            bindings: HashMap::new(),
            resources: HashMap::new(),
            events: HashMap::new(),
        }
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Log the call and apply any failure injected for its operation
    fn enter(&mut self, call: DriverCall) -> DriverResult<()> {
        let operation = call.operation();
        self.calls.push(call);
        let count = self.call_counts.entry(operation).or_insert(0);
        *count += 1;
        let count = *count;

        let injected = self
            .injections
            .iter()
            .find(|inj| inj.operation == operation && (inj.on_call == 0 || inj.on_call == count));
        match injected {
            Some(inj) => Err(DriverError::new(operation, inj.message.clone())),
            None => Ok(()),
        }
    }

    fn require_init(&self, operation: &'static str) -> DriverResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(DriverError::new(operation, "runtime not initialized"))
        }
    }

    fn require_context(&self, operation: &'static str, context: ContextId) -> DriverResult<()> {
        if self.contexts.contains_key(&context) {
            Ok(())
        } else {
            Err(DriverError::new(operation, format!("invalid context {context}")))
        }
    }

    fn resource(&self, operation: &'static str, resource: ResourceId) -> DriverResult<&FakeResource> {
        self.resources
            .get(&resource)
            .ok_or_else(|| DriverError::new(operation, format!("invalid resource {resource}")))
    }

    fn mem_resource(&self, operation: &'static str, context: ContextId, mem: MemId) -> DriverResult<ResourceId> {
        match self.mems.get(&mem) {
            Some((owner, resource)) if *owner == context => Ok(*resource),
            _ => Err(DriverError::new(operation, format!("invalid memory object {mem}"))),
        }
    }

    fn new_event(&mut self, context: ContextId, operation: &'static str, pending_polls: u32) -> EventId {
        let error = self
            .completion_errors
            .iter()
            .position(|(op, _)| *op == operation)
            .map(|idx| self.completion_errors.remove(idx).1);
        let event = EventId::new(self.next());
        self.events.insert(
            event,
            FakeEvent {
                context,
                pending_polls,
                error,
            },
        );
        event
    }
}

// ================================================================================================
// FakeDriver
// ================================================================================================

/// Simulated vendor runtime
pub struct FakeDriver {
    device_info: DeviceInfo,
    device_count: u32,
    capacity: usize,
    pending_polls: u32,
    pitch_alignment: u32,
    relocate_on_remap: bool,
    program: Option<FakeProgram>,
    hooks: Mutex<Vec<(&'static str, FakeHook)>>,
    state: Mutex<FakeState>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FakeDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeDriver")
            .field("device_count", &self.device_count)
            .field("capacity", &self.capacity)
            .field("pending_polls", &self.pending_polls)
            .field("live_resources", &self.live_resources())
            .finish()
    }
}

impl FakeDriver {
    /// Default capacity: resources that can be live at once across all devices
    pub const DEFAULT_CAPACITY: usize = 64;

    /// One device, 8192-element limits, 64-element remote pitch alignment, no pending polls
    pub fn new() -> Self {
        Self {
            device_info: DeviceInfo {
                target: Target(5),
                max_resource_1d_width: 8192,
                max_resource_2d_width: 8192,
                max_resource_2d_height: 8192,
            },
            device_count: 1,
            capacity: Self::DEFAULT_CAPACITY,
            pending_polls: 0,
            pitch_alignment: 64,
            relocate_on_remap: false,
            program: None,
            hooks: Mutex::new(Vec::new()),
            state: Mutex::new(FakeState::new()),
        }
    }

    pub fn with_devices(mut self, count: u32) -> Self {
        self.device_count = count;
        self
    }

    pub fn with_device_info(mut self, info: DeviceInfo) -> Self {
        self.device_info = info;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Completion tokens report `Pending` this many times before `Done`
    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    /// Remote pitch is the width rounded up to this many elements
    pub fn with_pitch_alignment(mut self, elements: u32) -> Self {
        self.pitch_alignment = elements.max(1);
        self
    }

    /// Every map after the first moves the host backing to a fresh allocation
    pub fn with_relocate_on_remap(mut self, relocate: bool) -> Self {
        self.relocate_on_remap = relocate;
        self
    }

    /// Run `program` over the bound registers on every `calCtxRunProgram`
    pub fn with_program<F>(mut self, program: F) -> Self
    where
        F: Fn(&mut FakeKernel<'_>) + Send + Sync + 'static,
    {
        self.program = Some(Arc::new(program));
        self
    }

    /// Fail the `occurrence`-th call (1-based) of `operation`
    pub fn fail_on(&self, operation: &'static str, occurrence: usize) {
        self.state.lock().injections.push(Injection {
            operation,
            on_call: occurrence.max(1),
            message: format!("injected failure on call {occurrence}"),
        });
    }

    /// Fail every call of `operation`
    pub fn fail_always(&self, operation: &'static str) {
        self.state.lock().injections.push(Injection {
            operation,
            on_call: 0,
            message: "injected failure".to_string(),
        });
    }

    /// Run `hook` once, right before the next call of `operation` is handled
    ///
    /// The hook runs on the calling thread without the fake's state lock held, so it may
    /// re-enter the driver.
    pub fn before_next<F>(&self, operation: &'static str, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.lock().push((operation, Box::new(hook)));
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        self.state.lock().injections.clear();
    }

    /// The next event created by `operation` completes with an error status
    pub fn complete_with_error(&self, operation: &'static str, message: impl Into<String>) {
        self.state.lock().completion_errors.push((operation, message.into()));
    }

    /// Ordered log of every call made so far
    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    /// Operation names of every call made so far
    pub fn operations(&self) -> Vec<&'static str> {
        self.state.lock().calls.iter().map(DriverCall::operation).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of times `operation` has been called
    pub fn call_count(&self, operation: &str) -> usize {
        self.state.lock().call_counts.get(operation).copied().unwrap_or(0)
    }

    /// Resources that can still be allocated
    pub fn available_resources(&self) -> usize {
        self.capacity.saturating_sub(self.live_resources())
    }

    pub fn live_resources(&self) -> usize {
        self.state.lock().resources.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn live_modules(&self) -> usize {
        self.state.lock().modules.len()
    }

    pub fn live_mems(&self) -> usize {
        self.state.lock().mems.len()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    /// True when `resource` exists and is currently mapped
    pub fn is_mapped(&self, resource: ResourceId) -> bool {
        self.state.lock().resources.get(&resource).is_some_and(|res| res.mapped)
    }

    /// Snapshot of a resource's bytes
    pub fn resource_bytes(&self, resource: ResourceId) -> Option<Vec<u8>> {
        self.state
            .lock()
            .resources
            .get(&resource)
            .map(|res| res.storage.bytes().to_vec())
    }

    /// Fire pending hooks for `operation`, then take the state lock
    fn lock_for(&self, operation: &'static str) -> parking_lot::MutexGuard<'_, FakeState> {
        let due: Vec<FakeHook> = {
            let mut hooks = self.hooks.lock();
            let (due, rest): (Vec<_>, Vec<_>) = hooks.drain(..).partition(|(op, _)| *op == operation);
            *hooks = rest;
            due.into_iter().map(|(_, hook)| hook).collect()
        };
        for hook in due {
            hook();
        }
        self.state.lock()
    }

    fn alloc(
        &self,
        call: DriverCall,
        device: DeviceId,
        width: u32,
        height: u32,
        format: Format,
        remote: bool,
    ) -> DriverResult<ResourceId> {
        let operation = call.operation();
        let mut state = self.lock_for(operation);
        state.enter(call)?;
        state.require_init(operation)?;
        if !state.open_devices.contains_key(&device) {
            return Err(DriverError::new(operation, format!("invalid device {device}")));
        }
        if width == 0 || height == 0 {
            return Err(DriverError::new(operation, "zero-sized resource"));
        }
        if state.resources.len() >= self.capacity {
            return Err(DriverError::new(operation, "out of device memory"));
        }

        let pitch = if remote {
            width.div_ceil(self.pitch_alignment) * self.pitch_alignment
        } else {
            width
        };
        let len = pitch as usize * height as usize * format.element_size();
        let storage = if remote {
            let buf = PageAlignedBuffer::zeroed(len).map_err(|err| DriverError::new(operation, err.to_string()))?;
            Storage::Host(buf)
        } else {
            Storage::Device(vec![0; len])
        };

        let id = ResourceId::new(state.next());
        state.resources.insert(
            id,
            FakeResource {
                pitch,
                storage,
                mapped: false,
                ever_mapped: false,
            },
        );
        Ok(id)
    }
}

impl Driver for FakeDriver {
    fn init(&self) -> DriverResult<()> {
        let mut state = self.lock_for(ops::INIT);
        state.enter(DriverCall::Init)?;
        state.initialized = true;
        Ok(())
    }

    fn shutdown(&self) -> DriverResult<()> {
        let mut state = self.lock_for(ops::SHUTDOWN);
        state.enter(DriverCall::Shutdown)?;
        state.require_init(ops::SHUTDOWN)?;
        state.initialized = false;
        Ok(())
    }

    fn device_count(&self) -> DriverResult<u32> {
        let mut state = self.lock_for(ops::DEVICE_GET_COUNT);
        state.enter(DriverCall::DeviceCount)?;
        state.require_init(ops::DEVICE_GET_COUNT)?;
        Ok(self.device_count)
    }

    fn device_info(&self, ordinal: u32) -> DriverResult<DeviceInfo> {
        let mut state = self.lock_for(ops::DEVICE_GET_INFO);
        state.enter(DriverCall::DeviceInfo(ordinal))?;
        state.require_init(ops::DEVICE_GET_INFO)?;
        if ordinal >= self.device_count {
            return Err(DriverError::new(ops::DEVICE_GET_INFO, format!("no device {ordinal}")));
        }
        Ok(self.device_info)
    }

    fn device_open(&self, ordinal: u32) -> DriverResult<DeviceId> {
        let mut state = self.lock_for(ops::DEVICE_OPEN);
        state.enter(DriverCall::DeviceOpen(ordinal))?;
        state.require_init(ops::DEVICE_OPEN)?;
        if ordinal >= self.device_count {
            return Err(DriverError::new(ops::DEVICE_OPEN, format!("no device {ordinal}")));
        }
        let device = DeviceId::new(state.next());
        state.open_devices.insert(device, ordinal);
        Ok(device)
    }

    fn device_close(&self, device: DeviceId) -> DriverResult<()> {
        let mut state = self.lock_for(ops::DEVICE_CLOSE);
        state.enter(DriverCall::DeviceClose(device))?;
        state
            .open_devices
            .remove(&device)
            .map(|_| ())
            .ok_or_else(|| DriverError::new(ops::DEVICE_CLOSE, format!("invalid device {device}")))
    }

    fn compile(&self, source: &str, _target: Target) -> DriverResult<ImageId> {
        let mut state = self.lock_for(ops::COMPILE);
        state.enter(DriverCall::Compile)?;
        if source.trim().is_empty() {
            return Err(DriverError::new(ops::COMPILE, "empty kernel source"));
        }
        if let Some(inj) = state.injections.iter().find(|inj| inj.operation == ops::LINK) {
            return Err(DriverError::new(ops::LINK, inj.message.clone()));
        }
        let image = ImageId::new(state.next());
        state.images.insert(image, source.to_string());
        Ok(image)
    }

    fn free_image(&self, image: ImageId) -> DriverResult<()> {
        let mut state = self.lock_for(ops::FREE_IMAGE);
        state.enter(DriverCall::FreeImage(image))?;
        state
            .images
            .remove(&image)
            .map(|_| ())
            .ok_or_else(|| DriverError::new(ops::FREE_IMAGE, format!("invalid image {image}")))
    }

    fn context_create(&self, device: DeviceId) -> DriverResult<ContextId> {
        let mut state = self.lock_for(ops::CTX_CREATE);
        state.enter(DriverCall::ContextCreate(device))?;
        state.require_init(ops::CTX_CREATE)?;
        if !state.open_devices.contains_key(&device) {
            return Err(DriverError::new(ops::CTX_CREATE, format!("invalid device {device}")));
        }
        let context = ContextId::new(state.next());
        state.contexts.insert(context, device);
        state.bindings.insert(context, HashMap::new());
        Ok(context)
    }

    fn context_destroy(&self, context: ContextId) -> DriverResult<()> {
        let mut state = self.lock_for(ops::CTX_DESTROY);
        state.enter(DriverCall::ContextDestroy(context))?;
        state.require_context(ops::CTX_DESTROY, context)?;
        state.contexts.remove(&context);
        state.bindings.remove(&context);
        state.events.retain(|_, event| event.context != context);
        Ok(())
    }

    fn module_load(&self, context: ContextId, image: ImageId) -> DriverResult<ModuleId> {
        let mut state = self.lock_for(ops::MODULE_LOAD);
        state.enter(DriverCall::ModuleLoad { context, image })?;
        state.require_context(ops::MODULE_LOAD, context)?;
        if !state.images.contains_key(&image) {
            return Err(DriverError::new(ops::MODULE_LOAD, format!("invalid image {image}")));
        }
        let module = ModuleId::new(state.next());
        state.modules.insert(module, (context, image));
        Ok(module)
    }

    fn module_unload(&self, context: ContextId, module: ModuleId) -> DriverResult<()> {
        let mut state = self.lock_for(ops::MODULE_UNLOAD);
        state.enter(DriverCall::ModuleUnload { context, module })?;
        match state.modules.get(&module) {
            Some((owner, _)) if *owner == context => {
                state.modules.remove(&module);
                state.funcs.retain(|_, owner| *owner != module);
                Ok(())
            }
            _ => Err(DriverError::new(ops::MODULE_UNLOAD, format!("invalid module {module}"))),
        }
    }

    fn module_name(&self, context: ContextId, module: ModuleId, register: &str) -> DriverResult<NameId> {
        let mut state = self.lock_for(ops::MODULE_GET_NAME);
        state.enter(DriverCall::ModuleName {
            context,
            register: register.to_string(),
        })?;
        let image = match state.modules.get(&module) {
            Some((owner, image)) if *owner == context => *image,
            _ => return Err(DriverError::new(ops::MODULE_GET_NAME, format!("invalid module {module}"))),
        };
        // A register resolves when the kernel source mentions it
        let declared = state
            .images
            .get(&image)
            .is_some_and(|source| source.contains(register));
        if !declared {
            return Err(DriverError::new(
                ops::MODULE_GET_NAME,
                format!("symbol '{register}' not found in module"),
            ));
        }
        let name = NameId::new(state.next());
        state.names.insert(name, register.to_string());
        Ok(name)
    }

    fn module_entry(&self, context: ContextId, module: ModuleId, symbol: &str) -> DriverResult<FuncId> {
        let mut state = self.lock_for(ops::MODULE_GET_ENTRY);
        state.enter(DriverCall::ModuleEntry {
            context,
            symbol: symbol.to_string(),
        })?;
        match state.modules.get(&module) {
            Some((owner, _)) if *owner == context => {}
            _ => return Err(DriverError::new(ops::MODULE_GET_ENTRY, format!("invalid module {module}"))),
        }
        let func = FuncId::new(state.next());
        state.funcs.insert(func, module);
        Ok(func)
    }

    fn context_mem(&self, context: ContextId, resource: ResourceId) -> DriverResult<MemId> {
        let mut state = self.lock_for(ops::CTX_GET_MEM);
        state.enter(DriverCall::ContextMem { context, resource })?;
        state.require_context(ops::CTX_GET_MEM, context)?;
        if state.resource(ops::CTX_GET_MEM, resource)?.mapped {
            return Err(DriverError::new(
                ops::CTX_GET_MEM,
                format!("resource {resource} is mapped to the host"),
            ));
        }
        let mem = MemId::new(state.next());
        state.mems.insert(mem, (context, resource));
        Ok(mem)
    }

    fn context_release_mem(&self, context: ContextId, mem: MemId) -> DriverResult<()> {
        let mut state = self.lock_for(ops::CTX_RELEASE_MEM);
        state.enter(DriverCall::ContextReleaseMem { context, mem })?;
        state.mem_resource(ops::CTX_RELEASE_MEM, context, mem)?;
        state.mems.remove(&mem);
        if let Some(bound) = state.bindings.get_mut(&context) {
            bound.retain(|_, bound_mem| *bound_mem != mem);
        }
        Ok(())
    }

    fn context_bind(&self, context: ContextId, name: NameId, mem: MemId) -> DriverResult<()> {
        let mut state = self.lock_for(ops::CTX_SET_MEM);
        let register = state.names.get(&name).cloned().unwrap_or_else(|| name.to_string());
        state.enter(DriverCall::ContextBind {
            context,
            register: register.clone(),
            mem,
        })?;
        state.require_context(ops::CTX_SET_MEM, context)?;
        state.mem_resource(ops::CTX_SET_MEM, context, mem)?;
        if !state.names.contains_key(&name) {
            return Err(DriverError::new(ops::CTX_SET_MEM, format!("invalid name {name}")));
        }
        state.bindings.entry(context).or_default().insert(register, mem);
        Ok(())
    }

    fn alloc_local_1d(
        &self,
        device: DeviceId,
        width: u32,
        format: Format,
        flags: AllocFlags,
    ) -> DriverResult<ResourceId> {
        self.alloc(DriverCall::AllocLocal1D { width, format, flags }, device, width, 1, format, false)
    }

    fn alloc_local_2d(
        &self,
        device: DeviceId,
        width: u32,
        height: u32,
        format: Format,
        flags: AllocFlags,
    ) -> DriverResult<ResourceId> {
        let call = DriverCall::AllocLocal2D {
            width,
            height,
            format,
            flags,
        };
        self.alloc(call, device, width, height, format, false)
    }

    fn alloc_remote_1d(
        &self,
        device: DeviceId,
        width: u32,
        format: Format,
        flags: AllocFlags,
    ) -> DriverResult<ResourceId> {
        self.alloc(DriverCall::AllocRemote1D { width, format, flags }, device, width, 1, format, true)
    }

    fn alloc_remote_2d(
        &self,
        device: DeviceId,
        width: u32,
        height: u32,
        format: Format,
        flags: AllocFlags,
    ) -> DriverResult<ResourceId> {
        let call = DriverCall::AllocRemote2D {
            width,
            height,
            format,
            flags,
        };
        self.alloc(call, device, width, height, format, true)
    }

    fn resource_free(&self, resource: ResourceId) -> DriverResult<()> {
        let mut state = self.lock_for(ops::RES_FREE);
        state.enter(DriverCall::ResourceFree(resource))?;
        state
            .resources
            .remove(&resource)
            .map(|_| ())
            .ok_or_else(|| DriverError::new(ops::RES_FREE, format!("invalid resource {resource}")))
    }

    fn resource_map(&self, resource: ResourceId) -> DriverResult<HostMapping> {
        let mut state = self.lock_for(ops::RES_MAP);
        state.enter(DriverCall::ResourceMap(resource))?;
        let res = state
            .resources
            .get_mut(&resource)
            .ok_or_else(|| DriverError::new(ops::RES_MAP, format!("invalid resource {resource}")))?;
        if res.mapped {
            return Err(DriverError::new(ops::RES_MAP, format!("resource {resource} already mapped")));
        }

        let relocate = self.relocate_on_remap && res.ever_mapped;
        let buf = match &mut res.storage {
            Storage::Host(buf) => buf,
            Storage::Device(_) => {
                return Err(DriverError::new(
                    ops::RES_MAP,
                    format!("resource {resource} is not host-mappable"),
                ))
            }
        };
        if relocate {
            let mut moved =
                PageAlignedBuffer::zeroed(buf.len()).map_err(|err| DriverError::new(ops::RES_MAP, err.to_string()))?;
            moved.as_mut_slice().copy_from_slice(buf.as_slice());
            *buf = moved;
        }
        let ptr = buf.non_null();

        res.mapped = true;
        res.ever_mapped = true;
        Ok(HostMapping { ptr, pitch: res.pitch })
    }

    fn resource_unmap(&self, resource: ResourceId) -> DriverResult<()> {
        let mut state = self.lock_for(ops::RES_UNMAP);
        state.enter(DriverCall::ResourceUnmap(resource))?;
        let res = state
            .resources
            .get_mut(&resource)
            .ok_or_else(|| DriverError::new(ops::RES_UNMAP, format!("invalid resource {resource}")))?;
        if !res.mapped {
            return Err(DriverError::new(ops::RES_UNMAP, format!("resource {resource} is not mapped")));
        }
        res.mapped = false;
        Ok(())
    }

    fn mem_copy(&self, context: ContextId, src: MemId, dst: MemId) -> DriverResult<EventId> {
        let mut state = self.lock_for(ops::MEM_COPY);
        let src_res = state.mem_resource(ops::MEM_COPY, context, src)?;
        let dst_res = state.mem_resource(ops::MEM_COPY, context, dst)?;
        state.enter(DriverCall::MemCopy {
            context,
            src: src_res,
            dst: dst_res,
        })?;

        let data = state.resource(ops::MEM_COPY, src_res)?.storage.bytes().to_vec();
        let target = state
            .resources
            .get_mut(&dst_res)
            .ok_or_else(|| DriverError::new(ops::MEM_COPY, format!("invalid resource {dst_res}")))?;
        let bytes = target.storage.bytes_mut();
        let len = bytes.len().min(data.len());
        bytes[..len].copy_from_slice(&data[..len]);

        Ok(state.new_event(context, ops::MEM_COPY, self.pending_polls))
    }

    fn run_program(&self, context: ContextId, func: FuncId, domain: Domain) -> DriverResult<EventId> {
        let mut state = self.lock_for(ops::CTX_RUN_PROGRAM);
        state.enter(DriverCall::RunProgram { context, domain })?;
        state.require_context(ops::CTX_RUN_PROGRAM, context)?;
        if !state.funcs.contains_key(&func) {
            return Err(DriverError::new(ops::CTX_RUN_PROGRAM, format!("invalid function {func}")));
        }

        if let Some(program) = &self.program {
            let bound: Vec<(String, ResourceId)> = state
                .bindings
                .get(&context)
                .map(|regs| {
                    regs.iter()
                        .filter_map(|(name, mem)| state.mems.get(mem).map(|(_, res)| (name.clone(), *res)))
                        .collect()
                })
                .unwrap_or_default();

            let mut registers: HashMap<String, Vec<u8>> = bound
                .iter()
                .filter_map(|(name, res)| {
                    state
                        .resources
                        .get(res)
                        .map(|r| (name.clone(), r.storage.bytes().to_vec()))
                })
                .collect();

            program(&mut FakeKernel {
                domain,
                registers: &mut registers,
            });

            for (name, res) in bound {
                if let (Some(data), Some(target)) = (registers.get(&name), state.resources.get_mut(&res)) {
                    target.storage.bytes_mut().copy_from_slice(data);
                }
            }
        }

        Ok(state.new_event(context, ops::CTX_RUN_PROGRAM, self.pending_polls))
    }

    fn event_status(&self, context: ContextId, event: EventId) -> DriverResult<EventStatus> {
        let mut state = self.lock_for(ops::CTX_IS_EVENT_DONE);
        state.enter(DriverCall::EventStatus { context, event })?;
        let ev = match state.events.get_mut(&event) {
            Some(ev) if ev.context == context => ev,
            _ => return Err(DriverError::new(ops::CTX_IS_EVENT_DONE, format!("invalid event {event}"))),
        };
        if ev.pending_polls > 0 {
            ev.pending_polls -= 1;
            return Ok(EventStatus::Pending);
        }
        Ok(match &ev.error {
            Some(message) => EventStatus::Error(message.clone()),
            None => EventStatus::Done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(fake: &FakeDriver) -> DeviceId {
        fake.init().unwrap();
        fake.device_open(0).unwrap()
    }

    #[test]
    fn remote_pitch_is_aligned_and_mappable() {
        let fake = FakeDriver::new().with_pitch_alignment(64);
        let dev = opened(&fake);
        let res = fake.alloc_remote_2d(dev, 100, 3, Format::Float32x1, AllocFlags::NONE).unwrap();
        let mapping = fake.resource_map(res).unwrap();
        assert_eq!(mapping.pitch, 128);
        assert_eq!(fake.resource_bytes(res).unwrap().len(), 128 * 3 * 4);
        assert!(fake.resource_map(res).is_err());
    }

    #[test]
    fn injected_failure_hits_requested_occurrence() {
        let fake = FakeDriver::new();
        let dev = opened(&fake);
        fake.fail_on(ops::CTX_CREATE, 2);
        assert!(fake.context_create(dev).is_ok());
        let err = fake.context_create(dev).unwrap_err();
        assert_eq!(err.operation, ops::CTX_CREATE);
        assert!(fake.context_create(dev).is_ok());
    }

    #[test]
    fn events_stay_pending_for_configured_polls() {
        let fake = FakeDriver::new().with_pending_polls(2);
        let dev = opened(&fake);
        let ctx = fake.context_create(dev).unwrap();
        let a = fake.alloc_local_1d(dev, 16, Format::Float32x1, AllocFlags::NONE).unwrap();
        let b = fake.alloc_local_1d(dev, 16, Format::Float32x1, AllocFlags::NONE).unwrap();
        let ma = fake.context_mem(ctx, a).unwrap();
        let mb = fake.context_mem(ctx, b).unwrap();
        let event = fake.mem_copy(ctx, ma, mb).unwrap();

        assert_eq!(fake.event_status(ctx, event).unwrap(), EventStatus::Pending);
        assert_eq!(fake.event_status(ctx, event).unwrap(), EventStatus::Pending);
        assert_eq!(fake.event_status(ctx, event).unwrap(), EventStatus::Done);
    }

    #[test]
    fn relocation_only_after_first_map() {
        let fake = FakeDriver::new().with_relocate_on_remap(true);
        let dev = opened(&fake);
        let res = fake.alloc_remote_1d(dev, 32, Format::SignedInt32x1, AllocFlags::NONE).unwrap();
        let first = fake.resource_map(res).unwrap();
        // Safety: mapping is live and at least one byte long
        unsafe { first.ptr.as_ptr().write(0x5A) };
        fake.resource_unmap(res).unwrap();
        let second = fake.resource_map(res).unwrap();
        assert_ne!(first.ptr, second.ptr);
        assert_eq!(fake.resource_bytes(res).unwrap()[0], 0x5A);
    }

    #[test]
    fn capacity_limits_live_resources() {
        let fake = FakeDriver::new().with_capacity(1);
        let dev = opened(&fake);
        let res = fake.alloc_local_1d(dev, 4, Format::Float32x1, AllocFlags::NONE).unwrap();
        assert_eq!(fake.available_resources(), 0);
        assert!(fake.alloc_local_1d(dev, 4, Format::Float32x1, AllocFlags::NONE).is_err());
        fake.resource_free(res).unwrap();
        assert_eq!(fake.available_resources(), 1);
    }

    #[test]
    fn hook_fires_once_and_may_reenter() {
        let fake = Arc::new(FakeDriver::new());
        let dev = opened(&fake);
        let res = fake.alloc_local_1d(dev, 4, Format::Float32x1, AllocFlags::NONE).unwrap();

        let inner = fake.clone();
        fake.before_next(ops::RES_FREE, move || {
            assert_eq!(inner.live_resources(), 1);
            inner.device_count().unwrap();
        });
        fake.resource_free(res).unwrap();
        assert_eq!(fake.call_count(ops::DEVICE_GET_COUNT), 1);

        let other = fake.alloc_local_1d(dev, 4, Format::Float32x1, AllocFlags::NONE).unwrap();
        fake.resource_free(other).unwrap();
        assert_eq!(fake.call_count(ops::DEVICE_GET_COUNT), 1);
    }
}
