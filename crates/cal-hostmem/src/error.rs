//! Host allocation errors

/// Result type for host allocation
pub type Result<T> = std::result::Result<T, HostMemError>;

#[derive(Debug, thiserror::Error)]
pub enum HostMemError {
    #[error("failed to allocate {size} bytes: {message}")]
    Allocation { size: usize, message: String },

    #[error("huge pages unavailable: {0}")]
    HugePagesUnavailable(String),

    #[error("{operation} failed: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl HostMemError {
    /// Capture `errno` for a failed libc call
    pub(crate) fn last_os_error(operation: &'static str) -> Self {
        Self::Io {
            operation,
            source: std::io::Error::last_os_error(),
        }
    }
}
