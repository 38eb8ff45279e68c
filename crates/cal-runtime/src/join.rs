//! In-flight executions and the join protocol
//!
//! An [`ExecutionHandle`] is the only owner of a launch's context, module and transient
//! resources. Joining consumes it, so a handle cannot be joined twice. Finalization
//! runs in a fixed order once the runtime reports the program done:
//!
//! 1. copy local results back into remote resources bound as `Out` / `InOut`
//! 2. release every context memory object
//! 3. unload the module
//! 4. destroy the context
//! 5. free transient local resources
//! 6. re-map every remote resource unmapped at bind time, updating its record
//!
//! Every step is attempted even after a failure; the first failure is returned.
//!
//! Dropping a handle without joining leaks its device resources and logs a warning.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::binding::{copy_and_wait, Acquired, CopyRecord};
use crate::driver::{ops, ContextId, Driver, EventId, ModuleId};
use crate::error::{CalError, Result};
use crate::wait::{CompletionChecker, EventChecker, WaitOutcome, WaitStats, Waiter};

/// Process-unique identifier of one launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(u64);

impl ExecutionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec{}", self.0)
    }
}

/// Summary of a finished execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub execution: ExecutionId,
    /// Status queries issued on the program's completion token
    pub polls: u64,
    /// Time from submission to the end of finalization
    pub duration: Duration,
    /// Registers whose remote resource was re-mapped
    pub remapped: Vec<String>,
    /// Registers whose local copy was written back
    pub copied_out: Vec<String>,
}

/// Result of a bounded join
#[derive(Debug)]
pub enum JoinOutcome {
    Completed(Completion),
    /// Still running; nothing was released
    Pending(ExecutionHandle),
}

/// One launched, not yet joined kernel execution
pub struct ExecutionHandle {
    id: ExecutionId,
    driver: Arc<dyn Driver>,
    context: ContextId,
    module: ModuleId,
    event: EventId,
    acquired: Vec<Acquired>,
    copies: Vec<CopyRecord>,
    waiter: Waiter,
    launched_at: Instant,
    polls: Cell<u64>,
    done: Cell<bool>,
    finished: bool,
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("module", &self.module)
            .field("event", &self.event)
            .field("polls", &self.polls.get())
            .finish()
    }
}

impl ExecutionHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ExecutionId,
        driver: Arc<dyn Driver>,
        context: ContextId,
        module: ModuleId,
        event: EventId,
        acquired: Vec<Acquired>,
        copies: Vec<CopyRecord>,
        waiter: Waiter,
    ) -> Self {
        Self {
            id,
            driver,
            context,
            module,
            event,
            acquired,
            copies,
            waiter,
            launched_at: Instant::now(),
            polls: Cell::new(0),
            done: Cell::new(false),
            finished: false,
        }
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Poll the completion token once
    pub fn is_complete(&self) -> Result<bool> {
        if self.done.get() {
            return Ok(true);
        }
        self.polls.set(self.polls.get() + 1);
        let done = self.checker().is_complete().map_err(CalError::execution)?;
        self.done.set(done);
        Ok(done)
    }

    /// Block until the program finishes, then finalize
    pub fn join(self) -> Result<Completion> {
        match self.join_inner(None)? {
            JoinOutcome::Completed(completion) => Ok(completion),
            JoinOutcome::Pending(handle) => Err(CalError::WaitTimeout {
                operation: ops::CTX_RUN_PROGRAM,
                elapsed: handle.launched_at.elapsed(),
            }),
        }
    }

    /// Wait at most `timeout`; a timeout hands the handle back untouched
    pub fn join_timeout(self, timeout: Duration) -> Result<JoinOutcome> {
        self.join_inner(Some(timeout))
    }

    fn join_inner(self, timeout: Option<Duration>) -> Result<JoinOutcome> {
        if self.done.get() {
            return self.finalize(None).map(JoinOutcome::Completed);
        }

        let outcome = {
            let _span = cal_tracing::perf_span!("join_wait", execution = self.id.raw());
            self.waiter.wait_until(&self.checker(), timeout)
        };
        match outcome {
            Ok(WaitOutcome::Completed(stats)) => {
                self.record_polls(stats);
                self.done.set(true);
                self.finalize(None).map(JoinOutcome::Completed)
            }
            Ok(WaitOutcome::TimedOut(stats)) => {
                self.record_polls(stats);
                tracing::debug!(execution = %self.id, polls = self.polls.get(), "join timed out");
                Ok(JoinOutcome::Pending(self))
            }
            Err(err) => {
                tracing::warn!(execution = %self.id, error = %err, "execution failed");
                self.finalize(Some(CalError::execution(err))).map(JoinOutcome::Completed)
            }
        }
    }

    fn checker(&self) -> EventChecker<'_> {
        EventChecker::new(self.driver.as_ref(), self.context, self.event, ops::CTX_RUN_PROGRAM)
    }

    fn record_polls(&self, stats: WaitStats) {
        self.polls.set(self.polls.get() + stats.polls);
    }

    /// Tear the execution down; `failure` skips copy-out and is returned after cleanup
    fn finalize(mut self, failure: Option<CalError>) -> Result<Completion> {
        let driver = Arc::clone(&self.driver);
        let driver = driver.as_ref();
        let run_failed = failure.is_some();
        let mut first_error = failure;
        let mut note = |err: CalError| {
            tracing::warn!(error = %err, "finalize step failed");
            first_error.get_or_insert(err);
        };

        let copies = std::mem::take(&mut self.copies);
        let acquired = std::mem::take(&mut self.acquired);

        let mut copied_out = Vec::new();
        if !run_failed {
            for record in copies.iter().filter(|r| r.direction.copies_out()) {
                let _span = cal_tracing::perf_span!("copy_out", register = record.register.as_str());
                match copy_and_wait(driver, self.context, record.local_mem, record.remote_mem, &self.waiter) {
                    Ok(stats) => {
                        cal_tracing::performance::record_transfer(
                            record.remote.len(),
                            "D2H",
                            stats.elapsed.as_micros() as u64,
                        );
                        tracing::debug!(
                            register = %record.register,
                            local = %record.local,
                            remote = %record.remote.id(),
                            "copied register back to host"
                        );
                        copied_out.push(record.register.clone());
                    }
                    Err(err) => note(CalError::execution(err)),
                }
            }
        }

        for acquired in &acquired {
            if let Acquired::Mem(mem) = acquired {
                if let Err(err) = driver.context_release_mem(self.context, *mem) {
                    note(CalError::execution(err));
                }
            }
        }

        if let Err(err) = driver.module_unload(self.context, self.module) {
            note(CalError::execution(err));
        }
        if let Err(err) = driver.context_destroy(self.context) {
            note(CalError::execution(err));
        }

        for acquired in &acquired {
            if let Acquired::Local { register, resource } = acquired {
                if let Err(err) = driver.resource_free(*resource) {
                    note(CalError::binding(register.as_str(), err));
                }
            }
        }

        let mut remapped = Vec::new();
        for acquired in &acquired {
            if let Acquired::Unmapped { register, resource } = acquired {
                match resource.remap_with(driver) {
                    Ok(mapping) => {
                        tracing::debug!(register = register.as_str(), remote = %resource.id(), ptr = ?mapping.ptr, "re-mapped remote resource");
                        remapped.push(register.clone());
                    }
                    Err(err) => note(CalError::binding(register.as_str(), err)),
                }
            }
        }

        for acquired in &acquired {
            if let Acquired::Flight(resource) = acquired {
                resource.end_flight();
            }
        }

        self.finished = true;
        let duration = self.launched_at.elapsed();
        tracing::debug!(
            execution = %self.id,
            polls = self.polls.get(),
            duration_us = duration.as_micros() as u64,
            "execution finalized"
        );

        match first_error {
            Some(err) => Err(err),
            None => Ok(Completion {
                execution: self.id,
                polls: self.polls.get(),
                duration,
                remapped,
                copied_out,
            }),
        }
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                execution = %self.id,
                context = %self.context,
                resources = self.acquired.len(),
                "execution handle dropped without join; device resources leaked"
            );
        }
    }
}
