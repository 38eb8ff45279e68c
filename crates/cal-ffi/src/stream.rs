//! Kernel launches over handles
//!
//! A [`StreamRequest`] carries the three binding maps a host language naturally
//! builds: register name to local shape, to remote handle bound directly, and to remote
//! handle bound through a device-local copy. Copy directions follow the register naming
//! convention (`g[]` both ways, `i*` in, `o*` out).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use cal_runtime::{BindingTable, CalError, Completion, Domain, JoinOutcome, KernelImage, LaunchRequest, Shape};

use crate::error::{FfiError, FfiResult, ResultExt};
use crate::handles::{lock_registry, register, ExecutionSlot, EXECUTION_REGISTRY, IMAGE_REGISTRY};
use crate::memory::remote;
use crate::runtime::runtime;

/// Local-only register: shape and format code of a scratch allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSpec {
    pub width: u32,
    pub height: u32,
    pub format: u32,
}

/// One kernel launch described with handles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRequest {
    pub image: u64,
    pub device: u32,
    /// `(x, y, width, height)`
    pub domain: (u32, u32, u32, u32),
    pub local: BTreeMap<String, LocalSpec>,
    pub remote: BTreeMap<String, u64>,
    pub copy: BTreeMap<String, u64>,
}

impl StreamRequest {
    pub fn new(image: u64, device: u32, domain: (u32, u32, u32, u32)) -> Self {
        Self {
            image,
            device,
            domain,
            ..Self::default()
        }
    }

    pub fn with_local(mut self, register: impl Into<String>, width: u32, height: u32, format: u32) -> Self {
        self.local.insert(register.into(), LocalSpec { width, height, format });
        self
    }

    pub fn with_remote(mut self, register: impl Into<String>, remote: u64) -> Self {
        self.remote.insert(register.into(), remote);
        self
    }

    pub fn with_copy(mut self, register: impl Into<String>, remote: u64) -> Self {
        self.copy.insert(register.into(), remote);
        self
    }
}

/// Outcome of a finished launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub polls: u64,
    pub duration_us: u64,
    pub copied_out: Vec<String>,
    pub remapped: Vec<String>,
}

impl From<Completion> for StreamStats {
    fn from(completion: Completion) -> Self {
        Self {
            polls: completion.polls,
            duration_us: completion.duration.as_micros() as u64,
            copied_out: completion.copied_out,
            remapped: completion.remapped,
        }
    }
}

fn image(operation: &str, handle: u64) -> FfiResult<Arc<KernelImage>> {
    lock_registry(&IMAGE_REGISTRY)
        .get(&handle)
        .cloned()
        .ok_or_else(|| FfiError::unknown_handle(operation, "image", handle))
}

fn bindings(operation: &str, request: &StreamRequest) -> FfiResult<BindingTable> {
    let mut table = BindingTable::new();
    for (register, spec) in &request.local {
        let format = cal_runtime::Format::from_code(spec.format)
            .ok_or_else(|| FfiError::invalid_argument(operation, format!("unknown format code {}", spec.format)))?;
        table
            .bind_local(register.as_str(), Shape::new(spec.width, spec.height), format)
            .within(operation)?;
    }
    for (register, handle) in &request.remote {
        table
            .bind_remote(register.as_str(), &remote(operation, *handle)?)
            .within(operation)?;
    }
    for (register, handle) in &request.copy {
        table
            .bind_copy_conventional(register.as_str(), &remote(operation, *handle)?)
            .within(operation)?;
    }
    Ok(table)
}

fn launch(operation: &str, request: &StreamRequest) -> FfiResult<cal_runtime::ExecutionHandle> {
    let rt = runtime(operation)?;
    let image = image(operation, request.image)?;
    let device = rt.device(request.device).within(operation)?;
    let (x, y, width, height) = request.domain;
    let launch_request =
        LaunchRequest::new(device, Domain::new(x, y, width, height)).with_bindings(bindings(operation, request)?);
    rt.launch(&image, launch_request).within(operation)
}

/// Launch and wait for completion, copying results back
pub fn run_stream(request: &StreamRequest) -> FfiResult<StreamStats> {
    let handle = launch("run_stream", request)?;
    handle.join().map(StreamStats::from).within("run_stream")
}

/// Launch and return an execution handle immediately
pub fn run_stream_async(request: &StreamRequest) -> FfiResult<u64> {
    let execution = launch("run_stream_async", request)?;
    let id = execution.id();
    let handle = register(&EXECUTION_REGISTRY, Arc::new(Mutex::new(Some(execution))));
    tracing::debug!(handle, execution = %id, "registered execution");
    Ok(handle)
}

/// Check once whether an execution has finished, without finalizing it
pub fn poll_stream(handle: u64) -> FfiResult<bool> {
    let slot = slot("poll_stream", handle)?;
    let guard = lock_registry(&slot);
    let execution = guard.as_ref().ok_or_else(|| join_misuse("poll_stream", handle))?;
    execution.is_complete().within("poll_stream")
}

/// Wait for an execution and finalize it; a handle can be joined once
///
/// Blocks behind a bounded join of the same handle that is still waiting.
pub fn join_stream(handle: u64) -> FfiResult<StreamStats> {
    let slot = slot("join_stream", handle)?;
    let execution = lock_registry(&slot)
        .take()
        .ok_or_else(|| join_misuse("join_stream", handle))?;
    retire(handle);
    execution.join().map(StreamStats::from).within("join_stream")
}

/// Wait at most `timeout_us`; `None` means still running and the handle stays valid
///
/// The handle stays registered for the whole wait.
pub fn join_stream_timeout(handle: u64, timeout_us: u64) -> FfiResult<Option<StreamStats>> {
    let slot = slot("join_stream_timeout", handle)?;
    let mut guard = lock_registry(&slot);
    let execution = guard
        .take()
        .ok_or_else(|| join_misuse("join_stream_timeout", handle))?;
    let outcome = execution.join_timeout(std::time::Duration::from_micros(timeout_us));
    match outcome {
        Ok(JoinOutcome::Pending(execution)) => {
            *guard = Some(execution);
            Ok(None)
        }
        Ok(JoinOutcome::Completed(completion)) => {
            retire(handle);
            Ok(Some(completion.into()))
        }
        Err(err) => {
            retire(handle);
            Err(FfiError::from_runtime("join_stream_timeout", err))
        }
    }
}

fn slot(operation: &str, handle: u64) -> FfiResult<ExecutionSlot> {
    lock_registry(&EXECUTION_REGISTRY)
        .get(&handle)
        .cloned()
        .ok_or_else(|| join_misuse(operation, handle))
}

/// Drop the registry entry of a joined execution
fn retire(handle: u64) {
    lock_registry(&EXECUTION_REGISTRY).remove(&handle);
}

fn join_misuse(operation: &str, handle: u64) -> FfiError {
    FfiError::from_runtime(
        operation,
        CalError::JoinMisuse(format!("execution handle {handle} is unknown or already joined")),
    )
}
