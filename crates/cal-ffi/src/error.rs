//! Structured errors returned across the host-language boundary

use cal_runtime::CalError;

/// Result type for every exported call
pub type FfiResult<T> = std::result::Result<T, FfiError>;

/// Category of a failed call, stable across the boundary
///
/// The first eleven mirror [`CalError`] one to one; the rest are raised by the
/// boundary layer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FfiErrorKind {
    RuntimeInit,
    Allocation,
    Binding,
    Execution,
    JoinMisuse,
    NotMapped,
    ResourceFreed,
    ResourceBusy,
    InvalidDevice,
    DuplicateRegister,
    WaitTimeout,
    /// No runtime is installed
    NotInitialized,
    /// Handle missing from its registry
    UnknownHandle,
    /// Argument rejected before reaching the runtime
    InvalidArgument,
    /// Tracing subscriber could not be installed
    Tracing,
}

impl From<&CalError> for FfiErrorKind {
    fn from(err: &CalError) -> Self {
        match err {
            CalError::RuntimeInit { .. } => Self::RuntimeInit,
            CalError::Allocation { .. } => Self::Allocation,
            CalError::Binding { .. } => Self::Binding,
            CalError::Execution { .. } => Self::Execution,
            CalError::JoinMisuse(_) => Self::JoinMisuse,
            CalError::NotMapped { .. } => Self::NotMapped,
            CalError::ResourceFreed { .. } => Self::ResourceFreed,
            CalError::ResourceBusy { .. } => Self::ResourceBusy,
            CalError::InvalidDevice { .. } => Self::InvalidDevice,
            CalError::DuplicateRegister(_) => Self::DuplicateRegister,
            CalError::WaitTimeout { .. } => Self::WaitTimeout,
        }
    }
}

/// Failing operation plus the runtime's diagnostic text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct FfiError {
    pub operation: String,
    pub message: String,
    pub kind: FfiErrorKind,
    /// Programmer error rather than a runtime failure
    pub misuse: bool,
}

impl FfiError {
    /// Programmer error raised by the boundary layer
    pub(crate) fn misuse(operation: &str, kind: FfiErrorKind, message: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            message: message.into(),
            kind,
            misuse: true,
        }
    }

    pub(crate) fn invalid_argument(operation: &str, message: impl Into<String>) -> Self {
        Self::misuse(operation, FfiErrorKind::InvalidArgument, message)
    }

    /// Error for a handle missing from its registry
    pub(crate) fn unknown_handle(operation: &str, kind: &str, handle: u64) -> Self {
        Self::misuse(operation, FfiErrorKind::UnknownHandle, format!("unknown {kind} handle {handle}"))
    }

    /// Attach `operation` to a runtime error that carries no driver operation of its own
    pub(crate) fn from_runtime(operation: &str, err: CalError) -> Self {
        let misuse = err.is_misuse();
        let kind = FfiErrorKind::from(&err);
        let message = match &err {
            CalError::RuntimeInit { message, .. }
            | CalError::Allocation { message, .. }
            | CalError::Execution { message, .. } => message.clone(),
            CalError::Binding { register, message, .. } => format!("register '{register}': {message}"),
            other => other.to_string(),
        };
        Self {
            operation: err.operation().unwrap_or(operation).to_string(),
            message,
            kind,
            misuse,
        }
    }
}

/// Extension for tagging runtime results with the exported call they came from
pub(crate) trait ResultExt<T> {
    fn within(self, operation: &str) -> FfiResult<T>;
}

impl<T> ResultExt<T> for cal_runtime::Result<T> {
    fn within(self, operation: &str) -> FfiResult<T> {
        self.map_err(|err| FfiError::from_runtime(operation, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cal_runtime::driver::ResourceId;

    #[test]
    fn driver_operation_wins_over_call_name() {
        let err = FfiError::from_runtime(
            "run_stream",
            CalError::Binding {
                register: "o0".into(),
                operation: "calModuleGetName",
                message: "symbol not found".into(),
            },
        );
        assert_eq!(err.operation, "calModuleGetName");
        assert_eq!(err.message, "register 'o0': symbol not found");
        assert_eq!(err.kind, FfiErrorKind::Binding);
        assert!(!err.misuse);
    }

    #[test]
    fn misuse_keeps_call_name() {
        let err = FfiError::from_runtime(
            "free_remote",
            CalError::ResourceFreed {
                resource: ResourceId::new(7),
            },
        );
        assert_eq!(err.operation, "free_remote");
        assert_eq!(err.kind, FfiErrorKind::ResourceFreed);
        assert!(err.misuse);
        assert_eq!(err.to_string(), "free_remote: resource res7 has been freed");
    }

    #[test]
    fn join_misuse_and_unknown_handles_are_distinct() {
        let joined = FfiError::from_runtime("join_stream", CalError::JoinMisuse("execution handle 3 is unknown".into()));
        let image = FfiError::unknown_handle("run_stream", "image", 3);

        assert!(joined.misuse && image.misuse);
        assert_eq!(joined.kind, FfiErrorKind::JoinMisuse);
        assert_eq!(image.kind, FfiErrorKind::UnknownHandle);
    }

    #[test]
    fn runtime_failures_keep_their_category() {
        let cases = [
            (CalError::invalid_shape("width 0"), FfiErrorKind::Allocation),
            (
                CalError::Execution {
                    operation: "calCtxRunProgram",
                    message: "fault".into(),
                },
                FfiErrorKind::Execution,
            ),
            (
                CalError::RuntimeInit {
                    operation: "calInit",
                    message: "no driver".into(),
                },
                FfiErrorKind::RuntimeInit,
            ),
            (CalError::DuplicateRegister("i0".into()), FfiErrorKind::DuplicateRegister),
        ];
        for (err, kind) in cases {
            assert_eq!(FfiError::from_runtime("run_stream", err).kind, kind);
        }
    }
}
