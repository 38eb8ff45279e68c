//! Process-wide runtime, device queries and kernel images

use std::sync::Arc;

use cal_runtime::{Driver, Runtime, RuntimeConfig};
use cal_tracing::TracingConfig;

use crate::error::{FfiError, FfiErrorKind, FfiResult, ResultExt};
use crate::handles::{lock_registry, register, EXECUTION_REGISTRY, IMAGE_REGISTRY, LOCAL_REGISTRY, REMOTE_REGISTRY, RUNTIME};

/// Install the runtime every later call goes through
///
/// Replaces any previous runtime; callers shut the previous one down first.
pub fn install_driver(driver: Arc<dyn Driver>, config: RuntimeConfig) {
    let runtime = Arc::new(Runtime::new(driver, config));
    let mut slot = RUNTIME.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    if slot.replace(runtime).is_some() {
        tracing::warn!("replaced an installed runtime");
    }
}

/// Install the vendor driver with configuration from the environment
#[cfg(feature = "cal")]
pub fn init() -> FfiResult<()> {
    install_driver(Arc::new(cal_runtime::driver::cal::CalDriver::new()), RuntimeConfig::from_env());
    Ok(())
}

/// Without the `cal` feature a driver must be installed explicitly
#[cfg(not(feature = "cal"))]
pub fn init() -> FfiResult<()> {
    Err(FfiError::misuse(
        "init",
        FfiErrorKind::NotInitialized,
        "built without the vendor runtime; call install_driver",
    ))
}

/// Install a global tracing subscriber configured from the environment
pub fn init_tracing() -> FfiResult<()> {
    cal_tracing::init_global_tracing(&TracingConfig::from_env()).map_err(|err| FfiError {
        operation: "init_tracing".into(),
        message: err.to_string(),
        kind: FfiErrorKind::Tracing,
        misuse: false,
    })
}

pub(crate) fn runtime(operation: &str) -> FfiResult<Arc<Runtime>> {
    RUNTIME
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
        .ok_or_else(|| FfiError::misuse(operation, FfiErrorKind::NotInitialized, "runtime not initialized"))
}

/// Number of compute devices
pub fn get_num_gpus() -> FfiResult<u32> {
    runtime("get_num_gpus")?.device_count().within("get_num_gpus")
}

/// Compile IL source for device 0, returning an image handle
pub fn compile(source: &str) -> FfiResult<u64> {
    let image = runtime("compile")?.compile(source).within("compile")?;
    let handle = register(&IMAGE_REGISTRY, Arc::new(image));
    tracing::debug!(handle, "registered kernel image");
    Ok(handle)
}

/// Release a compiled image
pub fn free_image(handle: u64) -> FfiResult<()> {
    let rt = runtime("free_image")?;
    let mut images = lock_registry(&IMAGE_REGISTRY);
    let entry = images
        .remove(&handle)
        .ok_or_else(|| FfiError::unknown_handle("free_image", "image", handle))?;
    match Arc::try_unwrap(entry) {
        Ok(image) => {
            drop(images);
            rt.free_image(image).within("free_image")
        }
        // A launch is still being set up from this image
        Err(entry) => {
            images.insert(handle, entry);
            Err(FfiError::misuse("free_image", FfiErrorKind::ResourceBusy, "image is in use by a launch"))
        }
    }
}

/// Release every registered object and shut the runtime down
///
/// Fails without releasing anything while executions are still unjoined.
pub fn shutdown() -> FfiResult<()> {
    let pending = lock_registry(&EXECUTION_REGISTRY).len();
    if pending > 0 {
        return Err(FfiError::misuse(
            "shutdown",
            FfiErrorKind::ResourceBusy,
            format!("{pending} executions have not been joined"),
        ));
    }
    let Some(rt) = RUNTIME.write().unwrap_or_else(|poisoned| poisoned.into_inner()).take() else {
        return Ok(());
    };

    let mut first_error: Option<FfiError> = None;
    let mut note = |result: cal_runtime::Result<()>, operation: &str| {
        if let Err(err) = result {
            tracing::warn!(operation, error = %err, "release during shutdown failed");
            first_error.get_or_insert(FfiError::from_runtime(operation, err));
        }
    };

    let locals: Vec<_> = lock_registry(&LOCAL_REGISTRY).drain().map(|(_, local)| local).collect();
    for local in locals {
        note(rt.free_local(local), "free_local");
    }
    let remotes: Vec<_> = lock_registry(&REMOTE_REGISTRY).drain().map(|(_, remote)| remote).collect();
    for remote in remotes {
        if !remote.is_freed() {
            note(rt.free_remote(&remote), "free_remote");
        }
    }
    let images: Vec<_> = lock_registry(&IMAGE_REGISTRY).drain().map(|(_, image)| image).collect();
    for image in images {
        if let Ok(image) = Arc::try_unwrap(image) {
            note(rt.free_image(image), "free_image");
        }
    }
    note(rt.shutdown(), "shutdown");

    tracing::info!("runtime shut down");
    first_error.map_or(Ok(()), Err)
}
