//! Kernel launch
//!
//! [`Runtime::launch`] performs, in order: context creation, module load, binding
//! (copy-through, then remote-direct, then local-only), entry-point resolution and
//! asynchronous submission. Each step is a hard failure point. A failure tears down
//! whatever was acquired (bindings in reverse, then module, then context) before the
//! error is returned. On success the call returns as soon as the program is submitted.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::binding::{BindArena, BindingTable};
use crate::device::{Device, Runtime};
use crate::driver::{ContextId, Domain, ModuleId};
use crate::error::{CalError, Result};
use crate::image::KernelImage;
use crate::join::{Completion, ExecutionHandle, ExecutionId};
use crate::wait::Waiter;

/// Everything needed to launch one kernel besides the image
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub device: Device,
    pub domain: Domain,
    pub bindings: BindingTable,
}

impl LaunchRequest {
    pub fn new(device: Device, domain: Domain) -> Self {
        Self {
            device,
            domain,
            bindings: BindingTable::new(),
        }
    }

    pub fn with_bindings(mut self, bindings: BindingTable) -> Self {
        self.bindings = bindings;
        self
    }
}

impl Runtime {
    /// Launch `image` and return without waiting for it to finish
    pub fn launch(&self, image: &KernelImage, request: LaunchRequest) -> Result<ExecutionHandle> {
        let LaunchRequest {
            device,
            domain,
            bindings,
        } = request;
        self.check_device(&device)?;
        bindings.preflight(device.info())?;

        let id = ExecutionId::new(self.next_execution.fetch_add(1, Ordering::Relaxed));
        let _span = cal_tracing::perf_span!("launch", execution = id.raw(), registers = bindings.len());
        let driver = self.driver.as_ref();
        let waiter = Waiter::from_config(&self.config);

        let context = driver.context_create(device.id()).map_err(CalError::execution)?;
        let module = match driver.module_load(context, image.id()) {
            Ok(module) => module,
            Err(err) => {
                self.abort(context, None);
                return Err(CalError::execution(err));
            }
        };

        let mut arena = BindArena::new(driver, context);
        if let Err(err) = arena.apply(&bindings, device.id(), module, &self.config, &waiter) {
            tracing::debug!(execution = %id, error = %err, "binding failed; rolling back");
            arena.rollback();
            self.abort(context, Some(module));
            return Err(err);
        }

        let submitted = driver
            .module_entry(context, module, &self.config.entry_point)
            .and_then(|func| driver.run_program(context, func, domain));
        let event = match submitted {
            Ok(event) => event,
            Err(err) => {
                arena.rollback();
                self.abort(context, Some(module));
                return Err(CalError::execution(err));
            }
        };

        tracing::debug!(
            execution = %id,
            device = %device,
            context = %context,
            event = %event,
            %domain,
            registers = %bindings,
            "kernel submitted"
        );

        let (acquired, copies) = arena.into_parts();
        Ok(ExecutionHandle::new(
            id,
            Arc::clone(&self.driver),
            context,
            module,
            event,
            acquired,
            copies,
            waiter,
        ))
    }

    /// Launch `image` and finalize it before returning
    pub fn run(&self, image: &KernelImage, request: LaunchRequest) -> Result<Completion> {
        self.launch(image, request)?.join()
    }

    fn abort(&self, context: ContextId, module: Option<ModuleId>) {
        if let Some(module) = module {
            if let Err(err) = self.driver.module_unload(context, module) {
                tracing::warn!(%context, %module, error = %err, "failed to unload module after launch failure");
            }
        }
        if let Err(err) = self.driver.context_destroy(context) {
            tracing::warn!(%context, error = %err, "failed to destroy context after launch failure");
        }
    }
}
