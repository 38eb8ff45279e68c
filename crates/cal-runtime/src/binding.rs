//! Register binding tables
//!
//! A [`BindingTable`] maps kernel register names to memory for one launch. Each entry
//! uses one of three strategies:
//!
//! | Strategy      | Device memory                       | Host traffic                    |
//! |---------------|-------------------------------------|---------------------------------|
//! | remote-direct | the caller's remote resource        | none; unmapped while in flight  |
//! | local-only    | fresh local resource (scratch)      | none                            |
//! | copy-through  | fresh local sized to remote's pitch | copy in before, out after run   |
//!
//! Copy direction is explicit ([`CopyDirection`]). The legacy naming convention
//! (`g[]` both ways, `i*` in, `o*` out) is available through
//! [`BindingTable::bind_copy_conventional`].
//!
//! Applying a table inside a launch is all-or-nothing. Every acquired runtime object is
//! pushed onto an ordered arena; if any entry fails, everything acquired so far is
//! released in reverse order before the error is returned.

use std::collections::btree_map::{self, BTreeMap};
use std::fmt;

use crate::config::RuntimeConfig;
use crate::driver::{AllocFlags, ContextId, DeviceId, Driver, DriverError, Format, MemId, ModuleId, ResourceId};
use crate::error::{CalError, Result};
use crate::memory::{alloc_resource, RemoteResource, Shape};
use crate::wait::{EventChecker, WaitStats, Waiter};

/// Register name of the kernel's global buffer
pub const GLOBAL_BUFFER_REGISTER: &str = "g[]";

/// Which copies a copy-through binding performs around the kernel run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyDirection {
    /// Remote to local before the run
    In,
    /// Local to remote after the run
    Out,
    InOut,
    /// Neither; the local copy starts uninitialized and is discarded
    None,
}

impl CopyDirection {
    /// Direction implied by the register naming convention
    pub fn from_register_name(register: &str) -> Self {
        if register == GLOBAL_BUFFER_REGISTER {
            CopyDirection::InOut
        } else if register.starts_with('i') {
            CopyDirection::In
        } else if register.starts_with('o') {
            CopyDirection::Out
        } else {
            CopyDirection::None
        }
    }

    pub fn copies_in(self) -> bool {
        matches!(self, CopyDirection::In | CopyDirection::InOut)
    }

    pub fn copies_out(self) -> bool {
        matches!(self, CopyDirection::Out | CopyDirection::InOut)
    }
}

/// Role of one register in a launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Bind the caller's remote resource directly
    Remote(RemoteResource),
    /// Bind a fresh scratch resource
    Local { shape: Shape, format: Format },
    /// Bind a fresh local copy of a remote resource
    Copy {
        resource: RemoteResource,
        /// `None` defers to the naming convention at launch time
        direction: Option<CopyDirection>,
    },
}

impl Binding {
    fn remote(&self) -> Option<&RemoteResource> {
        match self {
            Binding::Remote(resource) | Binding::Copy { resource, .. } => Some(resource),
            Binding::Local { .. } => None,
        }
    }
}

/// Register name to binding, unique keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingTable {
    entries: BTreeMap<String, Binding>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a fresh local resource of `shape` to `register`
    pub fn bind_local(&mut self, register: impl Into<String>, shape: Shape, format: Format) -> Result<&mut Self> {
        self.insert(register.into(), Binding::Local { shape, format })
    }

    /// Bind `resource` directly to `register`
    pub fn bind_remote(&mut self, register: impl Into<String>, resource: &RemoteResource) -> Result<&mut Self> {
        self.insert(register.into(), Binding::Remote(resource.clone()))
    }

    /// Bind a local copy of `resource` to `register`, copying per `direction`
    pub fn bind_copy(
        &mut self,
        register: impl Into<String>,
        resource: &RemoteResource,
        direction: CopyDirection,
    ) -> Result<&mut Self> {
        let binding = Binding::Copy {
            resource: resource.clone(),
            direction: Some(direction),
        };
        self.insert(register.into(), binding)
    }

    /// Bind a local copy of `resource`, with direction taken from the register name
    pub fn bind_copy_conventional(&mut self, register: impl Into<String>, resource: &RemoteResource) -> Result<&mut Self> {
        let binding = Binding::Copy {
            resource: resource.clone(),
            direction: None,
        };
        self.insert(register.into(), binding)
    }

    fn insert(&mut self, register: String, binding: Binding) -> Result<&mut Self> {
        match self.entries.entry(register) {
            btree_map::Entry::Occupied(entry) => Err(CalError::DuplicateRegister(entry.key().clone())),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(binding);
                Ok(self)
            }
        }
    }

    pub fn get(&self, register: &str) -> Option<&Binding> {
        self.entries.get(register)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Binding)> {
        self.entries.iter().map(|(name, binding)| (name.as_str(), binding))
    }

    /// Check every entry without touching the driver
    ///
    /// Rejects local shapes the device cannot allocate, remote resources that are freed
    /// or already in flight, and the same remote resource bound under two registers.
    pub(crate) fn preflight(&self, info: &crate::driver::DeviceInfo) -> Result<()> {
        let mut seen: Vec<&RemoteResource> = Vec::new();
        for (register, binding) in &self.entries {
            if let Binding::Local { shape, .. } = binding {
                shape.validate(info).map_err(|err| match err {
                    CalError::Allocation { operation, message } => CalError::Allocation {
                        operation,
                        message: format!("register '{register}': {message}"),
                    },
                    other => other,
                })?;
            }
            if let Some(resource) = binding.remote() {
                if resource.is_freed() {
                    return Err(CalError::ResourceFreed { resource: resource.id() });
                }
                if resource.is_in_flight() || seen.contains(&resource) {
                    return Err(CalError::ResourceBusy { resource: resource.id() });
                }
                seen.push(resource);
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a BindingTable {
    type Item = (&'a String, &'a Binding);
    type IntoIter = btree_map::Iter<'a, String, Binding>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl fmt::Display for BindingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

fn register_flags(register: &str) -> AllocFlags {
    if register == GLOBAL_BUFFER_REGISTER {
        AllocFlags::GLOBAL_BUFFER
    } else {
        AllocFlags::NONE
    }
}

// ================================================================================================
// Application arena
// ================================================================================================

/// One runtime object acquired while applying a table
#[derive(Debug)]
pub(crate) enum Acquired {
    /// Remote resource claimed for this launch
    Flight(RemoteResource),
    /// Remote resource unmapped for binding; re-mapped on release
    Unmapped { register: String, resource: RemoteResource },
    Mem(MemId),
    /// Transient local resource
    Local { register: String, resource: ResourceId },
}

/// Transient state of one copy-through binding, from bind until finalize
#[derive(Debug, Clone)]
pub(crate) struct CopyRecord {
    pub register: String,
    pub remote: RemoteResource,
    pub remote_mem: MemId,
    pub local: ResourceId,
    pub local_mem: MemId,
    pub direction: CopyDirection,
}

/// Ordered record of everything a launch acquired
pub(crate) struct BindArena<'a> {
    driver: &'a dyn Driver,
    context: ContextId,
    acquired: Vec<Acquired>,
    copies: Vec<CopyRecord>,
}

impl<'a> BindArena<'a> {
    pub fn new(driver: &'a dyn Driver, context: ContextId) -> Self {
        Self {
            driver,
            context,
            acquired: Vec::new(),
            copies: Vec::new(),
        }
    }

    /// Apply `table` in launch order: copy-through, remote-direct, local-only
    ///
    /// On error the arena still holds everything acquired so far; the caller releases it.
    pub fn apply(
        &mut self,
        table: &BindingTable,
        device: DeviceId,
        module: ModuleId,
        config: &RuntimeConfig,
        waiter: &Waiter,
    ) -> Result<()> {
        for (register, binding) in table {
            if let Binding::Copy { resource, direction } = binding {
                let direction = direction.unwrap_or_else(|| {
                    if config.register_conventions {
                        CopyDirection::from_register_name(register)
                    } else {
                        CopyDirection::InOut
                    }
                });
                self.bind_copy(register, resource, direction, device, module, waiter)?;
            }
        }
        for (register, binding) in table {
            if let Binding::Remote(resource) = binding {
                self.bind_remote(register, resource, module)?;
            }
        }
        for (register, binding) in table {
            if let Binding::Local { shape, format } = binding {
                self.bind_local(register, *shape, *format, device, module)?;
            }
        }
        Ok(())
    }

    fn claim(&mut self, register: &str, resource: &RemoteResource) -> Result<()> {
        resource.begin_flight()?;
        self.acquired.push(Acquired::Flight(resource.clone()));
        if resource.unmap_with(self.driver).map_err(|e| CalError::binding(register, e))? {
            self.acquired.push(Acquired::Unmapped {
                register: register.to_string(),
                resource: resource.clone(),
            });
        }
        Ok(())
    }

    fn mem(&mut self, register: &str, resource: ResourceId) -> Result<MemId> {
        let mem = self
            .driver
            .context_mem(self.context, resource)
            .map_err(|e| CalError::binding(register, e))?;
        self.acquired.push(Acquired::Mem(mem));
        Ok(mem)
    }

    fn alloc_local(
        &mut self,
        register: &str,
        device: DeviceId,
        shape: Shape,
        format: Format,
    ) -> Result<ResourceId> {
        let resource = alloc_resource(self.driver, device, shape, format, register_flags(register), false)
            .map_err(CalError::allocation)?;
        self.acquired.push(Acquired::Local {
            register: register.to_string(),
            resource,
        });
        Ok(resource)
    }

    fn set_mem(&self, register: &str, module: ModuleId, mem: MemId) -> Result<()> {
        let name = self
            .driver
            .module_name(self.context, module, register)
            .map_err(|e| CalError::binding(register, e))?;
        self.driver
            .context_bind(self.context, name, mem)
            .map_err(|e| CalError::binding(register, e))
    }

    fn bind_copy(
        &mut self,
        register: &str,
        resource: &RemoteResource,
        direction: CopyDirection,
        device: DeviceId,
        module: ModuleId,
        waiter: &Waiter,
    ) -> Result<()> {
        self.claim(register, resource)?;
        let remote_mem = self.mem(register, resource.id())?;

        // The local copy spans the remote's full pitch so rows line up byte for byte
        let shape = Shape::new(resource.pitch(), resource.height());
        let local = self.alloc_local(register, device, shape, resource.format())?;
        let local_mem = self.mem(register, local)?;
        self.set_mem(register, module, local_mem)?;

        if direction.copies_in() {
            let _span = cal_tracing::perf_span!("copy_in", register = register);
            let stats = copy_and_wait(self.driver, self.context, remote_mem, local_mem, waiter)
                .map_err(|e| CalError::binding(register, e))?;
            cal_tracing::performance::record_transfer(resource.len(), "H2D", stats.elapsed.as_micros() as u64);
        }

        tracing::debug!(register, remote = %resource.id(), %local, ?direction, "bound copy-through register");
        self.copies.push(CopyRecord {
            register: register.to_string(),
            remote: resource.clone(),
            remote_mem,
            local,
            local_mem,
            direction,
        });
        Ok(())
    }

    fn bind_remote(&mut self, register: &str, resource: &RemoteResource, module: ModuleId) -> Result<()> {
        self.claim(register, resource)?;
        let mem = self.mem(register, resource.id())?;
        self.set_mem(register, module, mem)?;
        tracing::debug!(register, remote = %resource.id(), "bound remote register");
        Ok(())
    }

    fn bind_local(
        &mut self,
        register: &str,
        shape: Shape,
        format: Format,
        device: DeviceId,
        module: ModuleId,
    ) -> Result<()> {
        let local = self.alloc_local(register, device, shape, format)?;
        let mem = self.mem(register, local)?;
        self.set_mem(register, module, mem)?;
        tracing::debug!(register, %local, %shape, "bound local register");
        Ok(())
    }

    /// Release everything in reverse acquisition order, logging failures
    pub fn rollback(self) {
        let driver = self.driver;
        for acquired in self.acquired.into_iter().rev() {
            let outcome = match &acquired {
                Acquired::Mem(mem) => driver.context_release_mem(self.context, *mem),
                Acquired::Local { resource, .. } => driver.resource_free(*resource),
                Acquired::Unmapped { resource, .. } => resource.remap_with(driver).map(|_| ()),
                Acquired::Flight(resource) => {
                    resource.end_flight();
                    Ok(())
                }
            };
            if let Err(err) = outcome {
                tracing::warn!(context = %self.context, ?acquired, error = %err, "rollback step failed");
            }
        }
    }

    /// Hand the acquisitions over to an in-flight execution
    pub fn into_parts(self) -> (Vec<Acquired>, Vec<CopyRecord>) {
        (self.acquired, self.copies)
    }
}

/// Issue one copy and poll it to completion
pub(crate) fn copy_and_wait(
    driver: &dyn Driver,
    context: ContextId,
    src: MemId,
    dst: MemId,
    waiter: &Waiter,
) -> std::result::Result<WaitStats, DriverError> {
    let event = driver.mem_copy(context, src, dst)?;
    waiter.wait(&EventChecker::new(driver, context, event, crate::driver::ops::MEM_COPY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_convention_directions() {
        assert_eq!(CopyDirection::from_register_name("g[]"), CopyDirection::InOut);
        assert_eq!(CopyDirection::from_register_name("i0"), CopyDirection::In);
        assert_eq!(CopyDirection::from_register_name("o3"), CopyDirection::Out);
        assert_eq!(CopyDirection::from_register_name("cb0"), CopyDirection::None);
        assert!(CopyDirection::InOut.copies_in() && CopyDirection::InOut.copies_out());
        assert!(!CopyDirection::None.copies_in() && !CopyDirection::None.copies_out());
    }

    #[test]
    fn duplicate_registers_are_rejected() {
        let mut table = BindingTable::new();
        table.bind_local("scratch", Shape::new(64, 64), Format::Float32x1).unwrap();
        let err = table.bind_local("scratch", Shape::linear(8), Format::Float32x1).unwrap_err();
        assert_eq!(err, CalError::DuplicateRegister("scratch".into()));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn global_buffer_flag_follows_register() {
        assert_eq!(register_flags("g[]"), AllocFlags::GLOBAL_BUFFER);
        assert_eq!(register_flags("o0"), AllocFlags::NONE);
    }
}
