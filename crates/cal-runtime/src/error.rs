//! Error types for runtime operations

use std::time::Duration;

use crate::driver::{DriverError, ResourceId};

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, CalError>;

/// Errors surfaced by the device registry, allocator, binding and execution layers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalError {
    /// Runtime or device discovery failed; nothing device-dependent can proceed
    #[error("runtime initialization failed in {operation}: {message}")]
    RuntimeInit { operation: &'static str, message: String },

    /// Resource allocation failed or the requested shape is not allocatable
    #[error("allocation failed in {operation}: {message}")]
    Allocation { operation: &'static str, message: String },

    /// A binding-table entry could not be applied
    #[error("binding register '{register}' failed in {operation}: {message}")]
    Binding {
        register: String,
        operation: &'static str,
        message: String,
    },

    /// Context setup, program submission or completion failed
    #[error("execution failed in {operation}: {message}")]
    Execution { operation: &'static str, message: String },

    /// Joining an execution that does not exist or was already joined
    #[error("invalid join: {0}")]
    JoinMisuse(String),

    /// Host access to a remote resource that is not currently mapped
    #[error("resource {resource} is not mapped")]
    NotMapped { resource: ResourceId },

    /// Use of a resource after it was freed
    #[error("resource {resource} has been freed")]
    ResourceFreed { resource: ResourceId },

    /// A resource is already bound to an in-flight execution
    #[error("resource {resource} is bound to an in-flight execution")]
    ResourceBusy { resource: ResourceId },

    /// Device ordinal out of range
    #[error("device index {index} out of range (device count {count})")]
    InvalidDevice { index: u32, count: u32 },

    /// The same register name appears twice in one binding table
    #[error("register '{0}' is bound more than once")]
    DuplicateRegister(String),

    /// A bounded wait expired before the runtime reported completion
    #[error("{operation} still pending after {elapsed:?}")]
    WaitTimeout { operation: &'static str, elapsed: Duration },
}

impl CalError {
    /// Allocation error from a driver failure
    pub fn allocation(err: DriverError) -> Self {
        Self::Allocation {
            operation: err.operation,
            message: err.message,
        }
    }

    /// Allocation error for a shape or format rejected before any driver call
    pub fn invalid_shape(message: impl Into<String>) -> Self {
        Self::Allocation {
            operation: "validate_shape",
            message: message.into(),
        }
    }

    /// Binding error for `register` from a driver failure
    pub fn binding(register: impl Into<String>, err: DriverError) -> Self {
        Self::Binding {
            register: register.into(),
            operation: err.operation,
            message: err.message,
        }
    }

    /// Execution error from a driver failure
    pub fn execution(err: DriverError) -> Self {
        Self::Execution {
            operation: err.operation,
            message: err.message,
        }
    }

    /// Runtime initialization error from a driver failure
    pub fn runtime_init(err: DriverError) -> Self {
        Self::RuntimeInit {
            operation: err.operation,
            message: err.message,
        }
    }

    /// Name of the failing runtime operation, when one is known
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Self::RuntimeInit { operation, .. }
            | Self::Allocation { operation, .. }
            | Self::Binding { operation, .. }
            | Self::Execution { operation, .. }
            | Self::WaitTimeout { operation, .. } => Some(*operation),
            _ => None,
        }
    }

    /// True for programmer errors (misuse of handles or resources) as opposed to runtime failures
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::JoinMisuse(_)
                | Self::NotMapped { .. }
                | Self::ResourceFreed { .. }
                | Self::ResourceBusy { .. }
                | Self::InvalidDevice { .. }
                | Self::DuplicateRegister(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_keep_operation_and_message() {
        let err = CalError::binding("i0", DriverError::new("calModuleGetName", "no such symbol"));
        assert_eq!(err.operation(), Some("calModuleGetName"));
        assert_eq!(
            err.to_string(),
            "binding register 'i0' failed in calModuleGetName: no such symbol"
        );
        assert!(!err.is_misuse());
    }

    #[test]
    fn misuse_classification() {
        assert!(CalError::JoinMisuse("exec7".into()).is_misuse());
        assert!(CalError::NotMapped {
            resource: ResourceId::new(1)
        }
        .is_misuse());
        assert!(!CalError::invalid_shape("zero width").is_misuse());
    }
}
