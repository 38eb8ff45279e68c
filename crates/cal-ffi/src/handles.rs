//! Handle-based object management for FFI
//!
//! Every runtime object handed to the host language lives in a process-wide registry
//! keyed by an opaque `u64`. Handles start at 1; 0 is never issued.
//!
//! ## Thread Safety
//!
//! Registries are `Arc<Mutex<HashMap>>`; handle generation is a single atomic counter.
//! Driver calls are never made while a registry lock is held. Executions sit in their own
//! [`ExecutionSlot`] so that polling or waiting on one locks only that execution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use cal_runtime::{ExecutionHandle, KernelImage, LocalResource, RemoteResource, Runtime};

static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

lazy_static::lazy_static! {
    /// Runtime every exported call goes through
    pub(crate) static ref RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

    /// Compiled kernel images
    pub(crate) static ref IMAGE_REGISTRY: Arc<Mutex<HashMap<u64, Arc<KernelImage>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    /// Host-remote resources
    pub(crate) static ref REMOTE_REGISTRY: Arc<Mutex<HashMap<u64, RemoteResource>>> =
        Arc::new(Mutex::new(HashMap::new()));

    /// Device-local resources
    pub(crate) static ref LOCAL_REGISTRY: Arc<Mutex<HashMap<u64, LocalResource>>> =
        Arc::new(Mutex::new(HashMap::new()));

    /// Launched, not yet joined executions
    pub(crate) static ref EXECUTION_REGISTRY: Arc<Mutex<HashMap<u64, ExecutionSlot>>> =
        Arc::new(Mutex::new(HashMap::new()));
}

/// One registered execution; `None` once a joiner has taken it
pub(crate) type ExecutionSlot = Arc<Mutex<Option<ExecutionHandle>>>;

pub(crate) fn generate_handle() -> u64 {
    HANDLE_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Lock a registry, recovering the data if a previous holder panicked
pub(crate) fn lock_registry<T>(mutex: &Arc<Mutex<T>>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("registry mutex was poisoned, recovering data");
            poisoned.into_inner()
        }
    }
}

/// Store `value` under a fresh handle
pub(crate) fn register<T>(registry: &Arc<Mutex<HashMap<u64, T>>>, value: T) -> u64 {
    let handle = generate_handle();
    lock_registry(registry).insert(handle, value);
    handle
}

/// Number of live objects per registry: images, remotes, locals, executions
pub fn registry_counts() -> (usize, usize, usize, usize) {
    (
        lock_registry(&IMAGE_REGISTRY).len(),
        lock_registry(&REMOTE_REGISTRY).len(),
        lock_registry(&LOCAL_REGISTRY).len(),
        lock_registry(&EXECUTION_REGISTRY).len(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn handles_are_unique_and_nonzero() {
        let h1 = generate_handle();
        let h2 = generate_handle();
        assert!(h1 > 0);
        assert!(h2 > h1);
    }

    #[test]
    #[serial]
    fn poisoned_registry_is_recovered() {
        let registry: Arc<Mutex<HashMap<u64, u32>>> = Arc::new(Mutex::new(HashMap::new()));
        let handle = register(&registry, 7);

        let poisoner = Arc::clone(&registry);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the registry");
        })
        .join();

        assert!(registry.is_poisoned());
        assert_eq!(lock_registry(&registry).get(&handle), Some(&7));
    }
}
